//! An in-process transport pair for exercising the session engine without a
//! real socket — the crate's analogue of the teacher's `tokio::io::duplex`
//! based test fixtures, adapted since this engine's `Transport` trait
//! already speaks `serde_json::Value` rather than raw bytes.

use mcp_session::{MessageExtras, SendOptions, Transport, TransportError, TransportEvent};
use serde_json::Value;
use tokio::sync::mpsc;

pub struct FakeTransport {
    outbound: mpsc::Sender<Value>,
    inbound: mpsc::Receiver<Value>,
    closed: bool,
}

/// Build two transports wired to each other: sends on one arrive as
/// `recv()` events on the other.
pub fn pair() -> (FakeTransport, FakeTransport) {
    let (a_tx, b_rx) = mpsc::channel(64);
    let (b_tx, a_rx) = mpsc::channel(64);
    (
        FakeTransport {
            outbound: a_tx,
            inbound: a_rx,
            closed: false,
        },
        FakeTransport {
            outbound: b_tx,
            inbound: b_rx,
            closed: false,
        },
    )
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn start(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.inbound.close();
        Ok(())
    }

    async fn send(&mut self, message: Value, _options: SendOptions) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError("transport closed".to_owned()));
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportError("peer dropped".to_owned()))
    }

    async fn recv(&mut self) -> TransportEvent {
        match self.inbound.recv().await {
            Some(raw) => match serde_json::from_value::<mcp_session::model::RawEnvelope>(raw) {
                Ok(envelope) => match envelope.classify() {
                    Some(msg) => TransportEvent::Message(msg, MessageExtras::default()),
                    None => TransportEvent::Error(TransportError("unclassifiable message".to_owned())),
                },
                Err(e) => TransportEvent::Error(TransportError(e.to_string())),
            },
            None => TransportEvent::Closed,
        }
    }

    fn session_id(&self) -> Option<String> {
        None
    }
}

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
