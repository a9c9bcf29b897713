//! Byte-level event payload encoding.
//!
//! A [`Codec`] turns dynamic event values into bytes and back. It is
//! deliberately schema-unaware; the event-type layer wraps it with schema
//! assertion before anything reaches the wire.

use std::sync::Arc;

use serde_json::Value;

use crate::error::CodecError;

/// Serialize and deserialize event values to and from bytes.
///
/// Implementations must round-trip: `deserialize(serialize(v)) == v` for
/// every value they accept.
pub trait Codec: Send + Sync {
    /// Encode a value into bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the value cannot be represented.
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes back into a value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the bytes are not a valid
    /// encoding.
    fn deserialize(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// The default codec: human-readable JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.into()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.into()))
    }
}

/// The codec used when callers do not supply one.
pub(crate) fn default_codec() -> Arc<dyn Codec> {
    Arc::new(JsonCodec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_codec_round_trips() {
        let codec = JsonCodec;
        let value = json!({"id": "a", "n": 4, "tags": ["x", "y"], "ok": true});
        let bytes = codec.serialize(&value).expect("serialize should succeed");
        let back = codec.deserialize(&bytes).expect("deserialize should succeed");
        assert_eq!(back, value);
    }

    #[test]
    fn json_codec_output_is_text() {
        let codec = JsonCodec;
        let bytes = codec
            .serialize(&json!({"title": "A"}))
            .expect("serialize should succeed");
        let text = std::str::from_utf8(&bytes).expect("JSON encoding is UTF-8");
        assert_eq!(text, r#"{"title":"A"}"#);
    }

    #[test]
    fn invalid_bytes_fail_to_decode() {
        let codec = JsonCodec;
        let err = codec
            .deserialize(b"{not json")
            .expect_err("garbage should not decode");
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
