//! Client identity, configuration and the resolved session.

use std::sync::Arc;

use busline_protocol::control::ClientIdentification;
use busline_transport::{CallMetadata, Connect};
use serde_json::Value;

/// Immutable client identity shared by all channels for a session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Unique client instance identifier.
    pub client_id: String,
    /// Logical component the client belongs to.
    pub component_name: String,
}

impl ClientIdentity {
    pub(crate) fn identification(&self) -> ClientIdentification {
        ClientIdentification {
            client_id: self.client_id.clone(),
            component_name: self.component_name.clone(),
        }
    }
}

/// Configuration for establishing a session against the bus.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Endpoint of the node to contact first.
    pub endpoint: String,
    /// Logical component name.
    pub component_name: String,
    /// Client instance identifier; defaults to `<pid>@<hostname>`.
    pub client_id: Option<String>,
    /// Access token attached to every outgoing call.
    pub access_token: Option<String>,
}

impl ClientConfig {
    /// Configuration with defaults for client id and token.
    pub fn new(endpoint: impl Into<String>, component_name: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            component_name: component_name.into(),
            client_id: None,
            access_token: None,
        }
    }

    /// Set an explicit client id.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set the access token attached to outgoing calls.
    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub(crate) fn identity(&self) -> ClientIdentity {
        ClientIdentity {
            client_id: self
                .client_id
                .clone()
                .unwrap_or_else(default_client_id),
            component_name: self.component_name.clone(),
        }
    }

    pub(crate) fn metadata(&self) -> CallMetadata {
        CallMetadata {
            access_token: self.access_token.clone(),
        }
    }
}

fn default_client_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{}@{}", std::process::id(), host)
}

/// The resolved session produced by discovery.
///
/// Cheap to clone; shared read-only by every channel constructed from it.
#[derive(Clone)]
pub struct Session {
    /// Resolved endpoint all channels connect to.
    pub endpoint: String,
    /// Client identity.
    pub identity: ClientIdentity,
    /// Per-call metadata (access token).
    pub metadata: CallMetadata,
    /// Factory for per-channel transport handles.
    pub connector: Arc<dyn Connect>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// A payload envelope with its data decoded through the channel codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPayload {
    /// Application-level type tag.
    pub payload_type: String,
    /// Payload revision.
    pub revision: String,
    /// Decoded payload data.
    pub data: Value,
}

/// A payload to send: type tag, revision and not-yet-encoded data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadData {
    /// Application-level type tag.
    pub payload_type: String,
    /// Payload revision, empty when unversioned.
    pub revision: String,
    /// Payload data, encoded through the channel codec on send.
    pub data: Value,
}

impl PayloadData {
    /// A payload with an empty revision.
    pub fn new(payload_type: impl Into<String>, data: Value) -> Self {
        Self {
            payload_type: payload_type.into(),
            revision: String::new(),
            data,
        }
    }

    pub(crate) fn into_envelope(
        self,
        codec: &dyn busline_codec::Codec,
    ) -> crate::error::Result<busline_codec::Envelope> {
        let data = codec.encode(&self.data)?;
        Ok(busline_codec::Envelope::new(
            self.payload_type,
            self.revision,
            data,
        ))
    }
}

pub(crate) fn decode_payload(
    codec: &dyn busline_codec::Codec,
    envelope: Option<busline_codec::Envelope>,
) -> crate::error::Result<Option<DecodedPayload>> {
    envelope
        .map(|p| {
            Ok(DecodedPayload {
                payload_type: p.payload_type,
                revision: p.revision,
                data: codec.decode(&p.data)?,
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_client_id_carries_pid() {
        let config = ClientConfig::new("localhost:8124", "ordering");
        let identity = config.identity();
        assert!(identity.client_id.starts_with(&std::process::id().to_string()));
        assert!(identity.client_id.contains('@'));
    }

    #[test]
    fn explicit_client_id_wins() {
        let config = ClientConfig::new("localhost:8124", "ordering").with_client_id("client-1");
        assert_eq!(config.identity().client_id, "client-1");
    }

    #[test]
    fn token_lands_in_metadata() {
        let config = ClientConfig::new("localhost:8124", "ordering").with_access_token("secret");
        assert_eq!(config.metadata().access_token.as_deref(), Some("secret"));
    }
}
