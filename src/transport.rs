//! The transport contract (spec.md §6). Any duplex message channel that can
//! `start`, `close`, `send`, and yield inbound messages satisfies this
//! trait; byte framing, auth, and concrete wire protocols are the
//! transport's own business, not the engine's.

use crate::model::{InboundMessage, RequestId};
use async_trait::async_trait;
use std::fmt;

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub related_request_id: Option<RequestId>,
    pub resumption_token: Option<String>,
}

/// Extras a transport may attach to an inbound message: auth/session
/// context supplied by an HTTP/auth layer that sits below the engine.
#[derive(Debug, Clone, Default)]
pub struct MessageExtras {
    pub auth_info: Option<String>,
    pub request_info: Option<String>,
}

#[derive(Debug)]
pub struct TransportError(pub String);

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TransportError {}

/// A single delivery from the transport: either a classified message with
/// its extras, or a signal that the transport closed/errored. Rust
/// transports are poll/receive based rather than callback-registration
/// based (§9 Design Notes, "Transport callback chaining"); `recv` is the
/// analogue of the spec's assignable `on_message` callback.
#[derive(Debug)]
pub enum TransportEvent {
    Message(InboundMessage, MessageExtras),
    Closed,
    Error(TransportError),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&mut self) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
    async fn send(
        &mut self,
        message: serde_json::Value,
        options: SendOptions,
    ) -> Result<(), TransportError>;
    /// Await the next event. Returns `TransportEvent::Closed` exactly once,
    /// after which the engine stops polling.
    async fn recv(&mut self) -> TransportEvent;
    fn session_id(&self) -> Option<String> {
        None
    }
}
