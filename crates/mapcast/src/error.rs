//! Unified error type for Mapcast.

use mapcast_protocol::ProtocolError;
use mapcast_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The only variant a caller must treat as fatal is
/// [`TransportError::BindFailed`] out of startup; everything else concerns
/// a single send or request.
#[derive(Debug, thiserror::Error)]
pub enum MapcastError {
    /// A transport-level error (bind, handshake, send).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, invalid envelope).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl MapcastError {
    /// Whether this is the listener failing to bind at startup.
    pub fn is_bind_failure(&self) -> bool {
        matches!(self, Self::Transport(TransportError::BindFailed { .. }))
    }
}
