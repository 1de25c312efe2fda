//! Query service messages.

use busline_codec::Envelope;
use serde::{Deserialize, Serialize};

use crate::common::{ErrorMessage, FlowControl, InstructionAck, ProcessingInstruction};

/// A query request, either issued by this client or delivered to one of its
/// subscribed handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Fresh identifier correlating responses and completion.
    pub message_identifier: String,
    /// Query name; routing key for handler lookup.
    pub query: String,
    /// Issue time, unix milliseconds.
    pub timestamp: i64,
    /// Optional query payload.
    pub payload: Option<Envelope>,
    /// Declared response-type envelope.
    pub response_type: Option<Envelope>,
    /// Routing/processing hints.
    pub processing_instructions: Vec<ProcessingInstruction>,
    /// Issuing client.
    pub client_id: String,
    /// Issuing component.
    pub component_name: String,
}

/// One response frame for a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Identifier of this response message.
    #[serde(default)]
    pub message_identifier: String,
    /// Message identifier of the query this responds to.
    pub request_identifier: String,
    /// Result payload, absent for value-less handlers.
    pub payload: Option<Envelope>,
    /// Set when the handler or server failed.
    pub error_message: Option<ErrorMessage>,
}

/// Completion frame closing a handled query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryComplete {
    /// Message identifier of the completed query.
    pub request_id: String,
    /// Identifier of the response message this completion follows.
    pub message_id: String,
}

/// Registration of a query handler with the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySubscription {
    /// Query name being (un)subscribed.
    pub query: String,
    /// Declared response type name, empty on unsubscribe.
    #[serde(default)]
    pub result_name: String,
    /// Owning client.
    pub client_id: String,
    /// Owning component.
    pub component_name: String,
}

/// Frames the client writes on the query provider stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryProviderOutbound {
    /// Declare the permit budget; first frame on the stream.
    FlowControl(FlowControl),
    /// Register a handler for a query name.
    Subscribe(QuerySubscription),
    /// Remove a handler registration.
    Unsubscribe(QuerySubscription),
    /// Response produced by a remotely-invoked handler.
    QueryResponse(QueryResponse),
    /// Completion following a successful response.
    QueryComplete(QueryComplete),
}

/// Frames the server delivers on the query provider stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryProviderInbound {
    /// Invoke a subscribed handler.
    Query(QueryRequest),
    /// Acknowledge a control frame; ignored by the client.
    Ack(InstructionAck),
}
