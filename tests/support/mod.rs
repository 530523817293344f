pub mod fake_transport;

use mcp_session::{HasMethod, PermissiveCapabilities, Session, SessionOptions, SessionTypes};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// A minimal capability bundle for tests: requests/notifications are a
/// method name plus an arbitrary JSON payload, good enough to exercise the
/// engine without pulling in a real MCP method catalog.
pub struct TestTypes;

impl SessionTypes for TestTypes {
    type Req = TestRequest;
    type Not = TestNotification;
    type Res = Value;
}

#[derive(Clone, Serialize)]
#[serde(transparent)]
pub struct TestRequest {
    #[serde(skip)]
    pub method: String,
    pub params: Value,
}

impl HasMethod for TestRequest {
    fn method(&self) -> &str {
        &self.method
    }
}

impl TestRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

#[derive(Clone, Serialize)]
#[serde(transparent)]
pub struct TestNotification {
    #[serde(skip)]
    pub method: String,
    pub params: Value,
}

impl HasMethod for TestNotification {
    fn method(&self) -> &str {
        &self.method
    }
}

impl TestNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Two connected sessions sharing an in-process fake transport pair.
pub async fn connected_pair() -> (Session<TestTypes>, Session<TestTypes>) {
    connected_pair_with_options(SessionOptions::default(), SessionOptions::default()).await
}

pub async fn connected_pair_with_options(
    a_options: SessionOptions,
    b_options: SessionOptions,
) -> (Session<TestTypes>, Session<TestTypes>) {
    let (a_transport, b_transport) = fake_transport::pair();
    let a = Session::<TestTypes>::new(a_options, Arc::new(PermissiveCapabilities));
    let b = Session::<TestTypes>::new(b_options, Arc::new(PermissiveCapabilities));
    a.connect(Box::new(a_transport)).await.expect("a connects");
    b.connect(Box::new(b_transport)).await.expect("b connects");
    (a, b)
}
