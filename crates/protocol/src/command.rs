//! Command service messages.

use busline_codec::Envelope;
use serde::{Deserialize, Serialize};

use crate::common::{ErrorMessage, FlowControl, InstructionAck, ProcessingInstruction};

/// A command request, either dispatched by this client or delivered to one of
/// its subscribed handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Fresh identifier correlating the response.
    pub message_identifier: String,
    /// Command name; routing key for handler lookup.
    pub name: String,
    /// Dispatch time, unix milliseconds.
    pub timestamp: i64,
    /// Optional command payload.
    pub payload: Option<Envelope>,
    /// Routing/processing hints.
    pub processing_instructions: Vec<ProcessingInstruction>,
    /// Dispatching client.
    pub client_id: String,
    /// Dispatching component.
    pub component_name: String,
}

/// Response to a command, correlated by the request's message identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Identifier of this response message, may be empty.
    #[serde(default)]
    pub message_identifier: String,
    /// Message identifier of the command this responds to.
    pub request_identifier: String,
    /// Result payload, absent for value-less handlers.
    pub payload: Option<Envelope>,
    /// Set when the handler or server failed.
    pub error_message: Option<ErrorMessage>,
}

/// Registration of a command handler with the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSubscription {
    /// Command name being (un)subscribed.
    pub command: String,
    /// Owning client.
    pub client_id: String,
    /// Owning component.
    pub component_name: String,
}

/// Frames the client writes on the command provider stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandProviderOutbound {
    /// Declare the permit budget; first frame on the stream.
    FlowControl(FlowControl),
    /// Register a handler for a command name.
    Subscribe(CommandSubscription),
    /// Remove a handler registration.
    Unsubscribe(CommandSubscription),
    /// Result of a remotely-invoked handler.
    CommandResponse(CommandResponse),
}

/// Frames the server delivers on the command provider stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandProviderInbound {
    /// Invoke a subscribed handler.
    Command(Command),
    /// Acknowledge a control frame; ignored by the client.
    Ack(InstructionAck),
}
