//! Encoding and decoding of the `{"type", "data"}` envelope.
//!
//! Decoding follows JavaScript truthiness for `data`: a payload of `null`,
//! `false`, `0` or `""` makes the whole envelope invalid, exactly as if
//! `data` were missing. Peers rely on such messages falling through to the
//! untyped path, so this is kept as is.

use serde::Serialize;
use serde_json::Value;

use crate::{ProtocolError, TypedMessage};

#[derive(Serialize)]
struct OutgoingEnvelope<'a, T: ?Sized> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a T,
}

/// Encodes `data` under the tag `kind` as single-line JSON.
///
/// # Errors
/// Returns [`ProtocolError::InvalidMessage`] for an empty `kind`, or
/// [`ProtocolError::Encode`] if `data` cannot be represented as JSON.
pub fn encode<T: Serialize + ?Sized>(
    kind: &str,
    data: &T,
) -> Result<String, ProtocolError> {
    if kind.is_empty() {
        return Err(ProtocolError::InvalidMessage("empty type".into()));
    }
    serde_json::to_string(&OutgoingEnvelope { kind, data })
        .map_err(ProtocolError::Encode)
}

/// Decodes `text` into a [`TypedMessage`], or `None` if it is not a
/// well-formed envelope.
pub fn decode(text: &str) -> Option<TypedMessage> {
    decode_detailed(text).ok()
}

/// Like [`decode`], but reports why the text was rejected.
///
/// # Errors
/// - [`ProtocolError::Decode`]: not JSON
/// - [`ProtocolError::InvalidMessage`]: JSON, but not a usable envelope
pub fn decode_detailed(text: &str) -> Result<TypedMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(ProtocolError::Decode)?;

    let Value::Object(mut fields) = value else {
        return Err(ProtocolError::InvalidMessage(
            "envelope is not an object".into(),
        ));
    };

    let kind = match fields.remove("type") {
        Some(Value::String(kind)) if !kind.is_empty() => kind,
        Some(Value::String(_)) => {
            return Err(ProtocolError::InvalidMessage("empty type".into()));
        }
        Some(_) => {
            return Err(ProtocolError::InvalidMessage(
                "type is not a string".into(),
            ));
        }
        None => {
            return Err(ProtocolError::InvalidMessage("missing type".into()));
        }
    };

    let data = fields.remove("data").unwrap_or(Value::Null);
    if is_falsy(&data) {
        return Err(ProtocolError::InvalidMessage(format!(
            "data of `{kind}` is missing or falsy"
        )));
    }

    Ok(TypedMessage::from_parts_unchecked(kind, data))
}

/// JavaScript falsiness restricted to JSON values.
pub(crate) fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}
