//! Error types for the bus client.
//!
//! Three tiers: local precondition failures raised before any network
//! interaction, transport failures, and application-level failures carried in
//! an error payload. Callers can distinguish the tiers by variant shape.

use busline_codec::CodecError;
use busline_protocol::FrameError;
use busline_protocol::common::ErrorMessage;
use busline_transport::TransportError;
use thiserror::Error;

/// Result type for bus client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the bus client.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A handler is already registered for this name on this channel.
    #[error("a subscription for '{name}' is already registered")]
    DuplicateSubscription {
        /// The contested command/query name.
        name: String,
    },

    /// The tabular event query was given zero predicates.
    #[error("event queries require at least one predicate")]
    EmptyQuery,

    /// A call or stream failed at the transport layer.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A wire frame could not be encoded or decoded.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// A payload data blob could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The server or a remote handler reported an error payload.
    #[error("remote error: {0}")]
    Remote(ErrorMessage),

    /// The channel was closed by `close()`.
    #[error("channel is closed")]
    Closed,
}
