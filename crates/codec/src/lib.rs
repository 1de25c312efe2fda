//! Payload serialization boundary for the bus client
//!
//! Every application-level value crossing the wire travels inside the
//! `{type, revision, data}` envelope; the data blob's internal shape is
//! produced by a [`Codec`]. Two codecs exist and are selected explicitly by
//! call site: [`JsonCodec`] for ordinary payloads, and [`TaggedDocumentCodec`]
//! for the nested tag/attribute documents used by the interoperability query
//! entry point.

pub mod document;
pub mod envelope;
pub mod error;

use bytes::Bytes;
use serde_json::Value;

pub use document::TaggedDocumentCodec;
pub use envelope::Envelope;
pub use error::CodecError;

/// Opaque byte encode/decode of application payloads.
pub trait Codec: Send + Sync + 'static {
    /// Encode a value into a data blob.
    fn encode(&self, value: &Value) -> Result<Bytes, CodecError>;

    /// Decode a data blob back into a value.
    fn decode(&self, data: &[u8]) -> Result<Value, CodecError>;
}

/// JSON codec used for ordinary payload data.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Bytes, CodecError> {
        let vec = serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Bytes::from(vec))
    }

    fn decode(&self, data: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip() {
        let codec = JsonCodec;
        let value = json!({"greeting": "Hello Ada", "count": 3});

        let encoded = codec.encode(&value).unwrap();
        let decoded = codec.decode(&encoded).unwrap();

        assert_eq!(value, decoded);
    }

    #[test]
    fn json_decode_error() {
        let codec = JsonCodec;
        assert!(codec.decode(b"{not json").is_err());
    }
}
