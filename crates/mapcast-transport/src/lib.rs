//! Transport layer for Mapcast.
//!
//! Provides [`ConnectionId`], the [`Connection`] trait that the registry and
//! server talk to, and the WebSocket upgrade path that produces concrete
//! connections.
//!
//! Sending is non-blocking: every connection owns an outbound queue drained
//! by its own writer task, so a `send_text` call only enqueues a frame.
//! Frames queued on one connection are delivered in order.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket transport via `tokio-tungstenite`,
//!   upgraded from a `hyper` HTTP/1 connection

mod error;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
#[cfg(feature = "websocket")]
pub use websocket::{
    is_upgrade_request, Frame, Handshake, WebSocketConnection, WebSocketReader,
};

use std::fmt;

/// Opaque identifier for a connection.
///
/// Ids are allocated from a process-wide counter and never reused, so two
/// connections from the same remote address never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A live peer connection that text frames can be pushed to.
pub trait Connection: Send + Sync + 'static {
    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;

    /// Queues a text frame for delivery to the remote peer.
    ///
    /// # Errors
    /// Returns [`TransportError::ConnectionClosed`] once the connection has
    /// been closed from either side.
    fn send_text(&self, text: &str) -> Result<(), TransportError>;

    /// Closes the connection.
    ///
    /// Idempotent: returns `true` only for the call that actually closed it.
    fn close(&self) -> bool;

    /// Whether the connection still accepts outgoing frames.
    fn is_open(&self) -> bool;
}
