//! # Mapcast
//!
//! Server instances that serve static pages and map images over plain HTTP
//! and, on the same port, accept WebSocket peers speaking a small typed
//! envelope protocol.
//!
//! An application typically runs two instances (a display surface and a
//! control surface) and relays events between them through
//! [`InstanceHandle`]s; the instances themselves never talk to each other.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mapcast::prelude::*;
//!
//! # async fn run() -> Result<(), MapcastError> {
//! let mut map = ServerInstance::new(ServerConfig::new("map").port(8080));
//! let mut control = ServerInstance::new(ServerConfig::new("control").port(8081));
//!
//! // Relay every typed message from a control peer to all map peers.
//! let map_handle = map.handle();
//! control.on_event(move |event: &ServerEvent| {
//!     if let ServerEvent::TypedMessageReceived { message, .. } = event {
//!         let _ = map_handle.broadcast_typed(message.kind(), message.data());
//!     }
//! });
//!
//! map.run_startup().await?;
//! control.run_startup().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod event;
mod handler;
mod server;

pub use config::ServerConfig;
pub use error::MapcastError;
pub use event::{ConnectionHandle, EventHandler, ServerEvent};
pub use server::{InstanceHandle, ServerInstance, ServerStatus};

pub use mapcast_http::{FileAccess, FileSource, TokioFileAccess};
pub use mapcast_protocol::{TypedMessage, SUBPROTOCOL};
pub use mapcast_transport::ConnectionId;

pub mod prelude {
    pub use crate::{
        ConnectionHandle, ConnectionId, EventHandler, FileAccess, FileSource,
        InstanceHandle, MapcastError, ServerConfig, ServerEvent,
        ServerInstance, ServerStatus, TokioFileAccess, TypedMessage,
        SUBPROTOCOL,
    };
}
