//! JSON-RPC 2.0 envelope types and the small set of MCP-reserved payloads
//! the engine itself understands (`ping`, `notifications/cancelled`,
//! `notifications/progress`). Concrete request/notification/result catalogs
//! belong to the specializing layer, not to this crate.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A JSON-RPC request/response id, which peers may send as either a number
/// or a string. Outbound ids allocated by this engine are always
/// [`RequestId::Number`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

/// A progress token, embedded by the sender in `params._meta.progressToken`
/// and echoed back by the peer in `notifications/progress`.
pub type ProgressToken = RequestId;

/// Free-form metadata carried in `params._meta`. Keys other than
/// `progressToken` are opaque to the engine and preserved verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta(pub serde_json::Map<String, Value>);

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress_token(&self) -> Option<ProgressToken> {
        let raw = self.0.get("progressToken")?;
        match raw {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }

    pub fn set_progress_token(&mut self, token: ProgressToken) {
        let value = match token {
            RequestId::Number(n) => Value::from(n),
            RequestId::String(s) => Value::from(s),
        };
        self.0.insert("progressToken".to_owned(), value);
    }

    pub fn extend(&mut self, other: Meta) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A JSON-RPC request or notification envelope (outbound side).
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEnvelope {
    pub jsonrpc: &'static str,
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl OutboundEnvelope {
    pub fn request(method: impl Into<String>, params: Option<Value>, id: RequestId) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method: method.into(),
            params,
        }
    }
}

/// Response envelope, success form.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundResponse {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub result: Value,
}

impl OutboundResponse {
    pub fn new(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result,
        }
    }
}

/// Response envelope, error form.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundError {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub error: JsonRpcErrorObject,
}

impl OutboundError {
    pub fn new(id: RequestId, error: JsonRpcErrorObject) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Anything the transport hands the engine, classified on shape per
/// spec.md §4.6.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        result: Value,
    },
    Error {
        id: RequestId,
        error: JsonRpcErrorObject,
    },
}

/// Raw wire shape used only to classify an incoming message before it is
/// resolved into an [`InboundMessage`]. Message serialization format beyond
/// this framing is out of scope (spec.md §1 Non-goals).
#[derive(Debug, Clone, Deserialize)]
pub struct RawEnvelope {
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

impl RawEnvelope {
    /// Classify this envelope per the dispatcher rules in spec.md §4.6.
    /// Returns `None` for shapes that match none of response/request/
    /// notification — the caller surfaces that via `on_error`.
    pub fn classify(self) -> Option<InboundMessage> {
        match (self.id, self.method, self.result, self.error) {
            (Some(id), _, Some(result), None) => Some(InboundMessage::Response { id, result }),
            (Some(id), _, None, Some(error)) => Some(InboundMessage::Error { id, error }),
            (Some(id), Some(method), None, None) => Some(InboundMessage::Request {
                id,
                method,
                params: self.params,
            }),
            (None, Some(method), _, _) => Some(InboundMessage::Notification {
                method,
                params: self.params,
            }),
            _ => None,
        }
    }
}

pub const METHOD_PING: &str = "ping";
pub const METHOD_CANCELLED: &str = "notifications/cancelled";
pub const METHOD_PROGRESS: &str = "notifications/progress";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelledParams {
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressParams {
    #[serde(rename = "progressToken")]
    pub progress_token: ProgressToken,
    #[serde(flatten)]
    pub fields: Value,
}
