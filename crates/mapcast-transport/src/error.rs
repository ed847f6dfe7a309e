/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        /// The `host:port` that was requested.
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The upgrade request was refused.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The upgrade was accepted but the socket was never handed over.
    #[error("upgrade failed: {0}")]
    UpgradeFailed(String),
}
