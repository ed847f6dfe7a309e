//! Wire protocol for Mapcast.
//!
//! Peers exchange single-line JSON envelopes over text frames:
//!
//! ```text
//! {"type":"<non-empty string>","data":<any JSON value>}
//! ```
//!
//! - **Types** ([`TypedMessage`]): the envelope itself.
//! - **Codec** ([`encode`], [`decode`]): conversion to and from text.
//!   Anything that fails to decode is not an error for the caller; it is
//!   handled on the untyped (plain string) path instead.
//! - **Errors** ([`ProtocolError`]): why a text failed to decode, for logs.

mod codec;
mod error;
mod types;

pub use codec::{decode, decode_detailed, encode};
pub use error::ProtocolError;
pub use types::TypedMessage;

/// The WebSocket subprotocol a client must offer during the upgrade.
pub const SUBPROTOCOL: &str = "echo-protocol";
