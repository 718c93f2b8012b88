//! Codec trait and the JSON implementation.
//!
//! A "codec" (coder/decoder) converts between Rust types and raw bytes.
//! The HTTP routes and the watch handler don't care HOW messages are
//! serialized; they just need something that implements [`Codec`].

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// A codec that can encode Rust types to bytes and decode bytes back.
///
/// `Send + Sync + 'static` because one codec is shared by every
/// connection task for the lifetime of the server.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed,
    /// incomplete, or don't match the expected type.
    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError>;
}

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// Every flagwatch client speaks JSON, both on the one-shot endpoints
/// and on the watch socket.
///
/// ## Example
///
/// ```rust
/// use flagwatch_protocol::{Codec, FlagRequest, JsonCodec};
///
/// let codec = JsonCodec;
///
/// // `{}` is a valid request: every field has a default.
/// let request: FlagRequest = codec.decode(b"{}").unwrap();
/// assert_eq!(request, FlagRequest::default());
///
/// let bytes = codec.encode(&request).unwrap();
/// let decoded: FlagRequest = codec.decode(&bytes).unwrap();
/// assert_eq!(request, decoded);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FlagValue, Variation};

    #[test]
    fn test_decode_rejects_non_object() {
        let codec = JsonCodec;
        let result: Result<crate::FlagRequest, _> = codec.decode(b"[1, 2]");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_truncated_json() {
        let codec = JsonCodec;
        let result: Result<crate::FlagRequest, _> =
            codec.decode(b"{\"name\": ");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_encode_flag_value_field_names() {
        let codec = JsonCodec;
        let value = FlagValue {
            flag_id: "dark-mode".into(),
            flag_value: Variation::Bool(true),
            target_id: "user-1".into(),
        };
        let bytes = codec.encode(&value).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "flag_id": "dark-mode",
                "flag_value": true,
                "target_id": "user-1",
            })
        );
    }
}
