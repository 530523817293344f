//! Error types. `McpError` is the payload exchanged with peers and
//! delivered to handler/request callers; `SessionError` is the engine's
//! internal error enum, `rmcp::service::ServiceError`'s analogue here.

use crate::model::JsonRpcErrorObject;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// JSON-RPC error codes the engine itself produces (spec.md §6).
pub mod error_code {
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const REQUEST_TIMEOUT: i64 = -32001;
    pub const CONNECTION_CLOSED: i64 = -32000;
}

/// An MCP-level error: what travels over the wire in the `error` field of a
/// JSON-RPC error response, and what handler callbacks and `request`
/// callers see.
#[derive(Error, Debug, Clone)]
#[error("{message} (code {code})")]
pub struct McpError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl McpError {
    pub fn new(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_code::METHOD_NOT_FOUND,
            "Method not found",
            Some(Value::String(method.to_owned())),
        )
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(error_code::INTERNAL_ERROR, message, None)
    }

    pub fn request_timeout(timeout: Duration) -> Self {
        Self::new(
            error_code::REQUEST_TIMEOUT,
            "Request timed out",
            Some(serde_json::json!({ "timeout": timeout.as_millis() })),
        )
    }

    pub fn max_total_timeout(max_total_timeout: Duration, elapsed: Duration) -> Self {
        Self::new(
            error_code::REQUEST_TIMEOUT,
            "Maximum total timeout exceeded",
            Some(serde_json::json!({
                "maxTotalTimeout": max_total_timeout.as_millis(),
                "elapsed": elapsed.as_millis(),
            })),
        )
    }

    pub fn connection_closed() -> Self {
        Self::new(error_code::CONNECTION_CLOSED, "Connection closed", None)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(-32602, message, None)
    }

    pub fn into_error_object(self) -> JsonRpcErrorObject {
        JsonRpcErrorObject {
            code: self.code,
            message: self.message,
            data: self.data,
        }
    }

    /// Safe integer check per spec.md §4.4 step 6: a handler-thrown code is
    /// preserved on the wire only if it fits JS's safe-integer range: we
    /// reuse that bound here since the wire format is JSON-RPC regardless
    /// of implementation language.
    pub fn is_safe_integer_code(code: i64) -> bool {
        const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;
        code.abs() <= MAX_SAFE_INTEGER
    }
}

/// Engine-internal error. Never sent to a peer verbatim; surfaced either to
/// the specific `request` caller that owns the failing operation, or
/// broadcast via `on_error` (spec.md §7).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum SessionError {
    #[error("mcp error: {0}")]
    Mcp(McpError),
    #[error("transport send failed: {0}")]
    TransportSend(String),
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request cancelled: {}", reason.as_deref().unwrap_or("<unknown>"))]
    Cancelled { reason: Option<String> },
    #[error("request timed out after {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("capability error: {0}")]
    Capability(String),
    #[error("result validation failed: {0}")]
    Validation(String),
}

impl SessionError {
    pub fn into_mcp_error(self) -> McpError {
        match self {
            SessionError::Mcp(e) => e,
            SessionError::ConnectionClosed => McpError::connection_closed(),
            SessionError::Timeout { timeout } => McpError::request_timeout(timeout),
            SessionError::Cancelled { reason } => McpError::new(
                error_code::REQUEST_TIMEOUT,
                reason.unwrap_or_else(|| "cancelled".to_owned()),
                None,
            ),
            SessionError::TransportSend(message) => McpError::internal_error(message),
            SessionError::NotConnected => McpError::internal_error("not connected"),
            SessionError::Capability(message) => McpError::internal_error(message),
            SessionError::Validation(message) => McpError::invalid_params(message),
        }
    }
}
