//! Error types for payload codecs.

use thiserror::Error;

/// Errors produced while encoding or decoding payload data.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// The value could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The data blob could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The codec does not support the requested direction.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}
