//! Control service messages: identity registration and node discovery.

use serde::{Deserialize, Serialize};

/// Client identity registered with the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentification {
    /// Unique client instance identifier.
    pub client_id: String,
    /// Logical component the client belongs to.
    pub component_name: String,
}

/// A node of the server cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Host the node listens on.
    pub host_name: String,
    /// Port of the node's rpc endpoint.
    pub port: u16,
    /// Cluster-unique node name.
    pub node_name: String,
}

impl NodeInfo {
    /// The `host:port` endpoint string for this node.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host_name, self.port)
    }
}

/// Discovery response naming the node the client should talk to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    /// Primary node for this client, absent when the current connection holds.
    pub primary: Option<NodeInfo>,
    /// True when the current connection is already authoritative.
    pub same_connection: bool,
}

/// Frames the client writes on the control stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlOutbound {
    /// One-time identity registration, first frame on the stream.
    Register(ClientIdentification),
}

/// Reference to a named event processor on this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventProcessorReference {
    /// Name of the processor the instruction targets.
    pub processor_name: String,
}

/// Server-pushed instructions arriving on the control stream.
///
/// None of these are currently acted upon; they are surfaced to the
/// observability hook only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlInbound {
    /// Cluster topology changed.
    NodeNotification(NodeInfo),
    /// The server asks the client to reconnect elsewhere.
    RequestReconnect,
    /// Pause a tracking event processor.
    PauseEventProcessor(EventProcessorReference),
    /// Start a tracking event processor.
    StartEventProcessor(EventProcessorReference),
}
