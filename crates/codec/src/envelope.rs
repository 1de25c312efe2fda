//! The `{type, revision, data}` payload envelope.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Wire envelope wrapping every application-level value.
///
/// The data blob's internal shape is opaque at this layer; only the triple is
/// structural.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Application-level type tag of the payload.
    pub payload_type: String,
    /// Payload revision, empty when unversioned.
    pub revision: String,
    /// Encoded payload data.
    pub data: Bytes,
}

impl Envelope {
    /// Create an envelope with the given type tag and data.
    pub fn new(payload_type: impl Into<String>, revision: impl Into<String>, data: Bytes) -> Self {
        Self {
            payload_type: payload_type.into(),
            revision: revision.into(),
            data,
        }
    }
}
