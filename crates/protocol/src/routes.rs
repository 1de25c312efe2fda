//! Route table for the bus services.

use busline_transport::Route;

/// Unary identity registration / primary-node discovery.
pub const CONTROL_DISCOVER: Route = Route::new("control", "discover");
/// Long-lived control instruction stream.
pub const CONTROL_STREAM: Route = Route::new("control", "open_stream");

/// Unary command dispatch.
pub const COMMAND_DISPATCH: Route = Route::new("command", "dispatch");
/// Command provider stream for remote-invoked handlers.
pub const COMMAND_STREAM: Route = Route::new("command", "open_stream");

/// Server-streamed query issuance.
pub const QUERY_RUN: Route = Route::new("query", "run");
/// Query provider stream for remote-invoked handlers.
pub const QUERY_STREAM: Route = Route::new("query", "open_stream");

/// Client-streamed event append.
pub const EVENT_APPEND: Route = Route::new("event", "append");
/// First token of the global log.
pub const EVENT_FIRST_TOKEN: Route = Route::new("event", "first_token");
/// Last token of the global log.
pub const EVENT_LAST_TOKEN: Route = Route::new("event", "last_token");
/// Token at a given instant.
pub const EVENT_TOKEN_AT: Route = Route::new("event", "token_at");
/// Server-streamed aggregate replay.
pub const EVENT_LIST_AGGREGATE: Route = Route::new("event", "list_aggregate_events");
/// Server-streamed snapshot replay.
pub const EVENT_LIST_SNAPSHOTS: Route = Route::new("event", "list_aggregate_snapshots");
/// Flow-controlled global tracking stream.
pub const EVENT_STREAM: Route = Route::new("event", "stream");
/// Flow-controlled tabular query stream.
pub const EVENT_QUERY: Route = Route::new("event", "query");
