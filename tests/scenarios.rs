//! End-to-end scenarios S1-S6 from the design (spec.md §8), run over an
//! in-process transport pair.

mod support;

use mcp_session::{McpError, NotificationOptions, RequestOptions, SessionError, SessionOptions};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use support::{connected_pair, connected_pair_with_options, TestRequest};

fn validate_identity(value: Value) -> Result<Value, McpError> {
    Ok(value)
}

/// S1 — success: echo round-trips and leaves no trace in the registries.
#[tokio::test]
async fn s1_success_roundtrip() -> anyhow::Result<()> {
    let (client, server) = connected_pair().await;

    server
        .set_request_handler(
            "echo",
            |v| Ok(v),
            |params: Value, _extra| async move { Ok(params) },
        )
        .await?;

    let result = client
        .request(
            TestRequest::new("echo", json!({"x": 1})),
            validate_identity,
            RequestOptions::default(),
        )
        .await?;

    assert_eq!(result, json!({"x": 1}));
    client.close().await;
    Ok(())
}

/// S2 — per-call timeout: no response arrives, caller rejects with
/// RequestTimeout and the engine emits exactly one `notifications/cancelled`.
#[tokio::test]
async fn s2_per_call_timeout() -> anyhow::Result<()> {
    let (client, server) = connected_pair().await;

    let cancelled_count = Arc::new(AtomicUsize::new(0));
    {
        let cancelled_count = cancelled_count.clone();
        server
            .set_notification_handler(
                "notifications/cancelled",
                |v| Ok(v),
                move |_params: Value, _extra| {
                    let cancelled_count = cancelled_count.clone();
                    async move {
                        cancelled_count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
            )
            .await;
    }
    // `slow` is never answered by the peer.
    server
        .set_request_handler(
            "slow",
            |v| Ok(v),
            |_params: Value, _extra| async move {
                std::future::pending::<()>().await;
                unreachable!()
            },
        )
        .await?;

    let err = client
        .request(
            TestRequest::new("slow", Value::Null),
            validate_identity,
            RequestOptions::default().with_timeout(Duration::from_millis(50)),
        )
        .await
        .expect_err("must time out");

    match err {
        SessionError::Timeout { timeout } => assert_eq!(timeout, Duration::from_millis(50)),
        other => panic!("expected Timeout, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cancelled_count.load(Ordering::SeqCst), 1);

    client.close().await;
    Ok(())
}

/// S3 — progress resets the timer: the request survives past the original
/// deadline because a progress event arrived and rescheduled it.
#[tokio::test]
async fn s3_progress_resets_timer() -> anyhow::Result<()> {
    let (client, server) = connected_pair().await;

    server
        .set_request_handler(
            "stream",
            |v| Ok(v),
            move |_params: Value, extra| async move {
                tokio::time::sleep(Duration::from_millis(80)).await;
                let _ = extra
                    .peer
                    .notify(
                        support::TestNotification::new(
                            "notifications/progress",
                            json!({"progressToken": 0, "value": 1}),
                        ),
                        NotificationOptions::default(),
                    )
                    .await;
                std::future::pending::<()>().await;
                unreachable!()
            },
        )
        .await?;

    let progressed = Arc::new(AtomicUsize::new(0));
    let progressed_cb = progressed.clone();

    let request_fut = client.request(
        TestRequest::new("stream", Value::Null),
        validate_identity,
        RequestOptions::default()
            .with_timeout(Duration::from_millis(100))
            .with_reset_timeout_on_progress(true)
            .with_on_progress(move |_value| {
                progressed_cb.fetch_add(1, Ordering::SeqCst);
            }),
    );

    tokio::time::sleep(Duration::from_millis(170)).await;
    assert_eq!(
        progressed.load(Ordering::SeqCst),
        1,
        "progress callback should have fired once by t=170ms"
    );

    let err = request_fut.await.expect_err("must eventually time out");
    assert!(matches!(err, SessionError::Timeout { .. }));

    client.close().await;
    Ok(())
}

/// S4 — max-total ceiling: regardless of progress cadence, the request
/// rejects no later than the configured ceiling.
#[tokio::test]
async fn s4_max_total_ceiling() -> anyhow::Result<()> {
    let (client, server) = connected_pair().await;

    server
        .set_request_handler(
            "stream",
            |v| Ok(v),
            move |_params: Value, extra| async move {
                tokio::time::sleep(Duration::from_millis(80)).await;
                let _ = extra
                    .peer
                    .notify(
                        support::TestNotification::new(
                            "notifications/progress",
                            json!({"progressToken": 0, "value": 1}),
                        ),
                        NotificationOptions::default(),
                    )
                    .await;
                std::future::pending::<()>().await;
                unreachable!()
            },
        )
        .await?;

    let started = std::time::Instant::now();
    let err = client
        .request(
            TestRequest::new("stream", Value::Null),
            validate_identity,
            RequestOptions::default()
                .with_timeout(Duration::from_millis(100))
                .with_reset_timeout_on_progress(true)
                .with_max_total_timeout(Duration::from_millis(120))
                .with_on_progress(|_| {}),
        )
        .await
        .expect_err("must reject by the ceiling");

    assert!(started.elapsed() <= Duration::from_millis(200));
    assert!(matches!(err, SessionError::Timeout { .. } | SessionError::Mcp(_)));

    client.close().await;
    Ok(())
}

/// S5 — inbound cancel: a `notifications/cancelled` for an in-flight inbound
/// request trips its cancellation handle and suppresses the response.
#[tokio::test]
async fn s5_inbound_cancel_suppresses_response() -> anyhow::Result<()> {
    let (client, server) = connected_pair().await;

    let observed_cancelled = Arc::new(AtomicUsize::new(0));
    {
        let observed_cancelled = observed_cancelled.clone();
        server
            .set_request_handler(
                "work",
                |v| Ok(v),
                move |_params: Value, extra| {
                    let observed_cancelled = observed_cancelled.clone();
                    async move {
                        extra.cancel.cancelled().await;
                        observed_cancelled.fetch_add(1, Ordering::SeqCst);
                        Ok(json!({"done": true}))
                    }
                },
            )
            .await?;
    }

    // Fire the inbound request but don't await it yet: it blocks on cancel.
    let request_fut = client.request(
        TestRequest::new("work", Value::Null),
        validate_identity,
        RequestOptions::default().with_timeout(Duration::from_millis(500)),
    );
    tokio::pin!(request_fut);

    tokio::time::sleep(Duration::from_millis(20)).await;
    // The client, having sent "work" as outbound id 0, is the one that
    // references that id when it decides it no longer wants the result.
    client
        .notify(
            support::TestNotification::new(
                "notifications/cancelled",
                json!({"requestId": 0, "reason": "user"}),
            ),
            NotificationOptions::default(),
        )
        .await?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(observed_cancelled.load(Ordering::SeqCst), 1);

    // The client never receives a response for the cancelled call; it will
    // eventually hit its own timeout since the server suppressed the reply.
    let result = tokio::time::timeout(Duration::from_millis(600), request_fut).await;
    assert!(result.is_ok(), "client's own timeout should still fire");

    client.close().await;
    Ok(())
}

/// S6 — debounce coalescing: three synchronous param-less notifications in
/// the same tick collapse into a single transport send.
#[tokio::test]
async fn s6_debounce_coalescing() -> anyhow::Result<()> {
    let mut client_options = SessionOptions::default();
    client_options
        .debounced_notification_methods
        .insert("notifications/tools/list_changed".to_owned());

    let (client, server) = connected_pair_with_options(client_options, SessionOptions::default()).await;

    let received = Arc::new(AtomicUsize::new(0));
    {
        let received = received.clone();
        server
            .set_notification_handler(
                "notifications/tools/list_changed",
                |v| Ok(v),
                move |_params: Value, _extra| {
                    let received = received.clone();
                    async move {
                        received.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
            )
            .await;
    }

    for _ in 0..3 {
        client
            .notify(
                support::TestNotification::new("notifications/tools/list_changed", Value::Null),
                NotificationOptions::default(),
            )
            .await?;
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);

    client
        .notify(
            support::TestNotification::new("notifications/tools/list_changed", Value::Null),
            NotificationOptions::default(),
        )
        .await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(received.load(Ordering::SeqCst), 2);

    client.close().await;
    Ok(())
}
