//! Event store messages: append, replay, tracking and tabular query.

use std::collections::BTreeMap;

use busline_codec::Envelope;
use serde::{Deserialize, Serialize};

/// A persisted domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique event identifier.
    pub message_identifier: String,
    /// Aggregate this event belongs to.
    pub aggregate_identifier: String,
    /// Position within the aggregate, strictly increasing.
    pub aggregate_sequence_number: u64,
    /// Aggregate type name.
    pub aggregate_type: String,
    /// Persist time, unix milliseconds.
    pub timestamp: i64,
    /// Whether this event is a snapshot.
    #[serde(default)]
    pub snapshot: bool,
    /// Optional event payload.
    pub payload: Option<Envelope>,
}

/// An event paired with its global log position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventWithToken {
    /// Global log position, strictly increasing across the log.
    pub token: i64,
    /// The event at that position; heartbeat frames carry none.
    pub event: Option<Event>,
}

/// Confirmation of an append call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    /// Whether the events were persisted.
    pub success: bool,
}

/// Request a replay of one aggregate's events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAggregateEventsRequest {
    /// Aggregate to replay.
    pub aggregate_id: String,
    /// First sequence number to deliver.
    #[serde(default)]
    pub initial_sequence: u64,
    /// Last sequence number to deliver, -1 for no bound.
    #[serde(default)]
    pub max_sequence: i64,
    /// Whether snapshots may substitute earlier events.
    #[serde(default)]
    pub allow_snapshots: bool,
    /// Minimum global token to replay from.
    #[serde(default)]
    pub min_token: i64,
}

/// Request a replay of one aggregate's snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAggregateSnapshotsRequest {
    /// Aggregate to replay.
    pub aggregate_id: String,
    /// First sequence number to deliver.
    #[serde(default)]
    pub initial_sequence: u64,
    /// Last sequence number to deliver, -1 for no bound.
    #[serde(default)]
    pub max_sequence: i64,
}

/// Payload type reference used in tracking-stream blacklists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadDescription {
    /// Payload type tag.
    pub payload_type: String,
    /// Payload revision, empty when unversioned.
    #[serde(default)]
    pub revision: String,
}

/// Request frame for the global tracking stream.
///
/// Also re-sent as-is to replenish permits once half the budget is consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetEventsRequest {
    /// Global token to start from.
    #[serde(default)]
    pub tracking_token: i64,
    /// Permit budget advertised to the server.
    pub number_of_permits: u64,
    /// Client identity override.
    #[serde(default)]
    pub client_id: String,
    /// Component identity override.
    #[serde(default)]
    pub component_name: String,
    /// Owning event processor name.
    #[serde(default)]
    pub processor: String,
    /// Payload types the server should not deliver.
    #[serde(default)]
    pub blacklist: Vec<PayloadDescription>,
    /// Read from the cluster leader even when a follower is closer.
    #[serde(default)]
    pub force_read_from_leader: bool,
}

/// Unary requests for log positions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetFirstTokenRequest {}

/// See [`GetFirstTokenRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetLastTokenRequest {}

/// Request the token of the first event at or past an instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTokenAtRequest {
    /// Instant, unix milliseconds.
    pub instant: i64,
}

/// A single log position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingToken {
    /// The position.
    pub token: i64,
}

/// Request frame for the ad-hoc tabular query stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryEventsRequest {
    /// Textual filter expression, predicates joined with AND.
    pub query: String,
    /// Permit budget advertised to the server.
    pub number_of_permits: u64,
}

/// One cell of a tabular query row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    /// Textual cell.
    Text(String),
    /// Numeric cell.
    Number(i64),
}

/// A generic key/value row projection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRow {
    /// Cell values keyed by column name.
    pub values: BTreeMap<String, ColumnValue>,
}

/// Frames delivered on the tabular query stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryEventsResponse {
    /// Column names for subsequent rows; carries no data itself.
    Columns(Vec<String>),
    /// One result row.
    Row(QueryRow),
    /// The historic portion of the query is complete.
    FilesCompleted,
}
