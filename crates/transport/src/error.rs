//! Error types for the transport boundary.

use thiserror::Error;

use crate::Route;

/// Errors reported by transport implementations.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Failed to establish a connection to an endpoint.
    #[error("failed to connect to {endpoint}: {reason}")]
    ConnectionFailed {
        /// The endpoint we tried to connect to.
        endpoint: String,
        /// The underlying failure.
        reason: String,
    },

    /// The endpoint does not serve the requested route.
    #[error("no handler for route {route}")]
    UnknownRoute {
        /// The requested route.
        route: Route,
    },

    /// A call failed after it was accepted.
    #[error("call on {route} failed: {reason}")]
    CallFailed {
        /// The route of the failed call.
        route: Route,
        /// The underlying failure.
        reason: String,
    },

    /// The call or transport handle was closed.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Connection failure against the given endpoint.
    pub fn connection_failed(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Call failure on the given route.
    pub fn call_failed(route: Route, reason: impl Into<String>) -> Self {
        Self::CallFailed {
            route,
            reason: reason.into(),
        }
    }
}
