//! Events an instance reports to its subscribers.

use std::net::SocketAddr;
use std::sync::Arc;

use mapcast_protocol::TypedMessage;
use mapcast_transport::{Connection, ConnectionId, WebSocketConnection};
use serde::Serialize;

use crate::MapcastError;

/// A peer connection as seen by event handlers.
///
/// Cheap to clone. Sending only enqueues, so it is safe to call from inside
/// a handler.
#[derive(Debug, Clone)]
pub struct ConnectionHandle(Arc<WebSocketConnection>);

impl ConnectionHandle {
    pub(crate) fn new(conn: Arc<WebSocketConnection>) -> Self {
        Self(conn)
    }

    pub fn id(&self) -> ConnectionId {
        self.0.id()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.0.remote_addr()
    }

    /// Queues a raw text frame.
    pub fn send_text(&self, text: &str) -> Result<(), MapcastError> {
        Ok(self.0.send_text(text)?)
    }

    /// Encodes `data` as a `kind` envelope and queues it.
    pub fn send_typed<T: Serialize + ?Sized>(
        &self,
        kind: &str,
        data: &T,
    ) -> Result<(), MapcastError> {
        let text = mapcast_protocol::encode(kind, data)?;
        self.send_text(&text)
    }

    /// Closes the connection. Safe to call more than once.
    pub fn close(&self) {
        self.0.close();
    }

    pub fn is_open(&self) -> bool {
        self.0.is_open()
    }
}

/// Everything an instance reports about its peers.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A peer completed the upgrade and was registered.
    Connected(ConnectionHandle),

    /// A registered peer went away (peer close, network error, or
    /// shutdown). Reported once per connection.
    Disconnected(ConnectionHandle),

    /// A text frame that is not a well-formed envelope.
    MessageReceived {
        conn: ConnectionHandle,
        text: String,
    },

    /// A text frame that decoded as an envelope.
    TypedMessageReceived {
        conn: ConnectionHandle,
        message: TypedMessage,
    },
}

impl ServerEvent {
    /// The connection the event concerns.
    pub fn connection(&self) -> &ConnectionHandle {
        match self {
            Self::Connected(conn) | Self::Disconnected(conn) => conn,
            Self::MessageReceived { conn, .. }
            | Self::TypedMessageReceived { conn, .. } => conn,
        }
    }
}

/// Receives [`ServerEvent`]s from an instance.
///
/// Handlers run on the task of the connection the event concerns, so they
/// should not block. Any `Fn(&ServerEvent)` closure is a handler.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: &ServerEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&ServerEvent) + Send + Sync + 'static,
{
    fn handle(&self, event: &ServerEvent) {
        self(event)
    }
}
