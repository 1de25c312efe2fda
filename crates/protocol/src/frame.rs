//! CBOR frame encoding for wire messages.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Errors while putting a message on the wire or taking it back off.
#[derive(Debug, Clone, Error)]
pub enum FrameError {
    /// The message could not be serialized.
    #[error("frame encode failed: {0}")]
    Encode(String),

    /// The frame could not be deserialized.
    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// Encode a message into a CBOR frame.
///
/// # Errors
///
/// Returns an error if the message cannot be serialized.
pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes, FrameError> {
    let mut vec = Vec::new();
    ciborium::ser::into_writer(msg, &mut vec).map_err(|e| FrameError::Encode(e.to_string()))?;
    Ok(Bytes::from(vec))
}

/// Decode a CBOR frame into a message.
///
/// # Errors
///
/// Returns an error if the frame is invalid for the expected message type.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, FrameError> {
    ciborium::de::from_reader(frame).map_err(|e| FrameError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{FlowControl, ProcessingInstruction, ProcessingKey};

    #[test]
    fn encode_decode_round_trip() {
        let msg = FlowControl {
            client_id: "1234@host".to_string(),
            permits: 500,
        };

        let encoded = encode(&msg).unwrap();
        let decoded: FlowControl = decode(&encoded).unwrap();

        assert_eq!(msg, decoded);
    }

    #[test]
    fn decode_error_on_garbage() {
        let result: Result<ProcessingInstruction, _> = decode(&[0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
    }

    #[test]
    fn decode_error_on_wrong_type() {
        let encoded = encode(&ProcessingInstruction {
            key: ProcessingKey::RoutingKey,
            value: 0,
        })
        .unwrap();
        let result: Result<FlowControl, _> = decode(&encoded);
        assert!(result.is_err());
    }
}
