//! Round-trip / laws from spec.md §8: removing a handler restores
//! `MethodNotFound`, and strict capabilities block an unadvertised method
//! without putting anything on the wire.

mod support;

use mcp_session::error::error_code;
use mcp_session::{CapabilityHooks, McpError, RequestOptions, Session, SessionError, SessionOptions};
use serde_json::{json, Value};
use std::sync::Arc;
use support::{connected_pair, TestRequest};

fn validate_identity(value: Value) -> Result<Value, McpError> {
    Ok(value)
}

#[tokio::test]
async fn setting_then_removing_handler_restores_method_not_found() -> anyhow::Result<()> {
    let (client, server) = connected_pair().await;

    server
        .set_request_handler(
            "greet",
            |v| Ok(v),
            |params: Value, _extra| async move { Ok(params) },
        )
        .await?;

    let ok = client
        .request(
            TestRequest::new("greet", json!({"name": "ferris"})),
            validate_identity,
            RequestOptions::default(),
        )
        .await?;
    assert_eq!(ok, json!({"name": "ferris"}));

    server.remove_request_handler("greet").await;

    let err = client
        .request(
            TestRequest::new("greet", Value::Null),
            validate_identity,
            RequestOptions::default(),
        )
        .await
        .expect_err("handler was removed");

    match err {
        SessionError::Mcp(e) => assert_eq!(e.code, error_code::METHOD_NOT_FOUND),
        other => panic!("expected MethodNotFound, got {other:?}"),
    }

    client.close().await;
    Ok(())
}

/// A capability hook set that only allows one specific method, used to check
/// that `strict_capabilities` refuses locally without touching the wire.
struct StrictOnly(&'static str);

impl CapabilityHooks for StrictOnly {
    fn assert_capability_for_method(&self, method: &str) -> Result<(), McpError> {
        if method == self.0 {
            Ok(())
        } else {
            Err(McpError::internal_error(format!(
                "peer did not advertise capability for {method}"
            )))
        }
    }
}

#[tokio::test]
async fn strict_capabilities_block_unadvertised_method_without_sending() -> anyhow::Result<()> {
    let (transport, peer_transport) = support::fake_transport::pair();
    let mut options = SessionOptions::default();
    options.strict_capabilities = true;
    let client = Session::<support::TestTypes>::new(options, Arc::new(StrictOnly("allowed")));
    client.connect(Box::new(transport)).await?;

    // The peer side is connected but registers no handlers: if the engine
    // sent anything for "forbidden", it would sit unanswered forever rather
    // than the call failing fast.
    let peer = Session::<support::TestTypes>::new(
        SessionOptions::default(),
        Arc::new(mcp_session::PermissiveCapabilities),
    );
    peer.connect(Box::new(peer_transport)).await?;

    let err = client
        .request(
            TestRequest::new("forbidden", Value::Null),
            validate_identity,
            RequestOptions::default().with_timeout(std::time::Duration::from_millis(200)),
        )
        .await
        .expect_err("capability hook should refuse locally");
    assert!(matches!(err, SessionError::Mcp(_)));

    client.close().await;
    peer.close().await;
    Ok(())
}
