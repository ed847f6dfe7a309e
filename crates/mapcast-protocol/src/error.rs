//! Error types for the protocol layer.

/// Errors that can occur while encoding or decoding an envelope.
///
/// None of these ever reach a peer: a text that fails to decode is
/// delivered on the untyped message path, and the error is only logged.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization of the `data` payload failed.
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// The text is not valid JSON.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// Valid JSON, but not a well-formed envelope (not an object, missing
    /// or empty `type`, missing or falsy `data`).
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
