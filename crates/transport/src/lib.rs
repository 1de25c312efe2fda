//! Generic remote-procedure transport abstraction for the bus client
//!
//! This crate defines the transport-agnostic call shapes the bus protocol is
//! built on. Concrete transports (in-memory, gRPC, ...) are provided in
//! separate crates.
//!
//! Four call shapes are supported:
//! - unary: one request frame, one response frame
//! - client-streaming: many request frames, one response frame after finish
//! - server-streaming: one request frame, a terminated sequence of frames
//! - bidirectional: frames flowing both ways on a long-lived call

pub mod error;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

pub use error::TransportError;

/// Metadata header carrying the access token, when one is configured.
pub const ACCESS_TOKEN_HEADER: &str = "bus-access-token";

/// A service/method pair identifying a remote procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    /// Remote service name.
    pub service: &'static str,
    /// Method name within the service.
    pub method: &'static str,
}

impl Route {
    /// Create a new route.
    pub const fn new(service: &'static str, method: &'static str) -> Self {
        Self { service, method }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.method)
    }
}

/// Per-call metadata attached to every outgoing call.
#[derive(Debug, Clone, Default)]
pub struct CallMetadata {
    /// Access token sent under [`ACCESS_TOKEN_HEADER`], if configured.
    pub access_token: Option<String>,
}

impl CallMetadata {
    /// Metadata carrying the given access token.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            access_token: Some(token.into()),
        }
    }
}

/// A terminated sequence of inbound frames.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send + 'static>>;

/// Outbound half of a bidirectional call.
///
/// Sinks are shared: the owning channel writes control frames while its
/// inbound task writes responses on the same call.
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    /// Write one frame on the call.
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the outbound half of the call.
    async fn close(&self) -> Result<(), TransportError>;
}

/// An open bidirectional call.
pub struct BidiCall {
    /// Outbound frame sink.
    pub sink: Arc<dyn FrameSink>,
    /// Inbound frame sequence.
    pub inbound: FrameStream,
}

/// An open client-streaming call.
///
/// The call resolves to a single response frame once [`finish`](Self::finish)
/// is invoked after the last written frame.
#[async_trait]
pub trait ClientStreamCall: Send {
    /// Write one request frame.
    async fn write(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Signal the end of the request stream and await the single response.
    async fn finish(self: Box<Self>) -> Result<Bytes, TransportError>;
}

/// Transport trait covering the four call shapes of the bus protocol.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Issue a unary call: one request frame, one response frame.
    async fn unary(
        &self,
        route: Route,
        request: Bytes,
        metadata: &CallMetadata,
    ) -> Result<Bytes, TransportError>;

    /// Open a client-streaming call.
    async fn open_client_stream(
        &self,
        route: Route,
        metadata: &CallMetadata,
    ) -> Result<Box<dyn ClientStreamCall>, TransportError>;

    /// Issue a server-streaming call: one request frame, a frame sequence back.
    async fn server_stream(
        &self,
        route: Route,
        request: Bytes,
        metadata: &CallMetadata,
    ) -> Result<FrameStream, TransportError>;

    /// Open a bidirectional call.
    async fn open_bidi(
        &self,
        route: Route,
        metadata: &CallMetadata,
    ) -> Result<BidiCall, TransportError>;

    /// Release the transport handle. Open calls observe end-of-stream.
    async fn shutdown(&self) -> Result<(), TransportError>;
}

/// Factory producing transport handles for resolved endpoints.
///
/// Discovery may redirect the client to a different primary node, in which
/// case a fresh handle is connected against the redirected address.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    /// Connect a transport handle to the given endpoint.
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn Transport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_display() {
        let route = Route::new("event", "append");
        assert_eq!(route.to_string(), "event/append");
    }

    #[test]
    fn metadata_with_token() {
        let metadata = CallMetadata::with_token("secret");
        assert_eq!(metadata.access_token.as_deref(), Some("secret"));
        assert!(CallMetadata::default().access_token.is_none());
    }
}
