//! `mcp-session`: a transport-agnostic JSON-RPC 2.0 session engine —
//! request/response correlation, per-call and total timeouts, inbound and
//! outbound cancellation, notification debouncing, and a handler registry
//! generic over a capability-bundle type.
//!
//! The engine itself knows nothing about any particular set of RPC methods;
//! a specializing layer (an MCP client or server, say) supplies its request/
//! notification/result catalog through [`session::SessionTypes`] and wires a
//! concrete [`transport::Transport`] in with [`session::Session::connect`].

pub mod cancellation;
pub mod error;
pub mod model;
pub mod session;
pub mod transport;

pub use cancellation::CancellationHandle;
pub use error::{McpError, SessionError};
pub use model::{
    CancelledParams, InboundMessage, Meta, ProgressParams, ProgressToken, RequestId,
};
pub use session::{
    CapabilityHooks, HasMethod, NotificationExtra, NotificationOptions, PermissiveCapabilities,
    RequestExtra, RequestOptions, Session, SessionOptions, SessionTypes,
};
pub use transport::{MessageExtras, SendOptions, Transport, TransportError, TransportEvent};
