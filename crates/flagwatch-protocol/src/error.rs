//! Error types for the protocol layer.
//!
//! Each crate in flagwatch defines its own error enum. When you see a
//! `ProtocolError`, the problem is in the shape of a payload, not in the
//! network, the evaluation engine, or the relay.

use crate::VariationType;

/// Errors that can occur while decoding or validating protocol payloads.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: malformed JSON, wrong field types, or a
    /// payload that is not an object.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// A required identifier is empty.
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    /// The requested variation type is not one of string, boolean,
    /// number, or json.
    #[error("unsupported variation type: {0}")]
    UnsupportedVariationType(String),

    /// An identifier in the request body disagrees with the URL path.
    #[error("{field} in body ({body}) does not match path ({path})")]
    PathMismatch {
        field: &'static str,
        path: String,
        body: String,
    },

    /// A raw value could not be interpreted as the declared variation
    /// type.
    #[error("value {value} is not a valid {kind} variation")]
    InvalidValue { kind: VariationType, value: String },

    /// A connection id string is not a valid token.
    #[error("invalid connection id: {0}")]
    InvalidConnectionId(String),
}

impl ProtocolError {
    /// Returns `true` when the error was caused by the client's payload.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Encode(_))
    }
}
