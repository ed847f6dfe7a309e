//! The typed message envelope.

use serde::Serialize;
use serde_json::Value;

/// A decoded envelope: a non-empty `type` tag and a truthy `data` payload.
///
/// Values of this type only come out of [`decode`](crate::decode) or
/// [`TypedMessage::new`], so consumers never see a malformed envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypedMessage {
    #[serde(rename = "type")]
    kind: String,
    data: Value,
}

impl TypedMessage {
    /// Builds an envelope to be sent. Returns `None` if it would not survive
    /// a round trip through [`decode`](crate::decode).
    pub fn new(kind: impl Into<String>, data: Value) -> Option<Self> {
        let kind = kind.into();
        if kind.is_empty() || crate::codec::is_falsy(&data) {
            return None;
        }
        Some(Self { kind, data })
    }

    pub(crate) fn from_parts_unchecked(kind: String, data: Value) -> Self {
        Self { kind, data }
    }

    /// The `type` tag.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The `data` payload.
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Splits the envelope into `(type, data)`.
    pub fn into_parts(self) -> (String, Value) {
        (self.kind, self.data)
    }

    /// Encodes the envelope as single-line JSON.
    pub fn to_text(&self) -> String {
        // Serializing a `String` and a `Value` cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
