//! Message types shared across the bus services.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Processing instruction keys understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingKey {
    /// Routing hint for load distribution.
    RoutingKey,
    /// Advisory timeout in milliseconds.
    Timeout,
    /// Scheduling priority.
    Priority,
    /// Desired number of results for a query.
    NrOfResults,
}

/// A `{key, value}` routing/processing hint attached to outgoing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingInstruction {
    /// Instruction key.
    pub key: ProcessingKey,
    /// Numeric instruction value.
    pub value: i64,
}

impl ProcessingInstruction {
    /// Create a processing instruction.
    pub fn new(key: ProcessingKey, value: i64) -> Self {
        Self { key, value }
    }

    /// The routing-key instruction the client attaches to every request.
    pub fn routing_key() -> Self {
        Self::new(ProcessingKey::RoutingKey, 0)
    }
}

/// Error payload carried by error-tagged responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Human-readable failure text.
    pub message: String,
    /// Server-assigned error code, empty for handler failures.
    #[serde(default)]
    pub error_code: String,
    /// Additional detail lines.
    #[serde(default)]
    pub details: Vec<String>,
}

impl ErrorMessage {
    /// An error message with only failure text.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.error_code.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "[{}] {}", self.error_code, self.message)
        }
    }
}

/// Flow-control frame advertising buffer capacity to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowControl {
    /// The advertising client.
    pub client_id: String,
    /// Number of frames the client is prepared to buffer.
    pub permits: u64,
}

/// Acknowledgement of a control frame; carries no data the client acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionAck {
    /// Identifier of the acknowledged frame.
    pub message_identifier: String,
    /// Whether the instruction was accepted.
    pub success: bool,
}
