//! Client library for a command/query/event message-bus server
//!
//! An application establishes a [`ConnectionSession`] against the bus, calls
//! [`ConnectionSession::discover`] once to resolve the primary node, and then
//! constructs the channels it needs from the returned [`Session`]:
//!
//! - [`CommandChannel`]: dispatch commands and serve remote-invoked handlers
//! - [`QueryChannel`]: issue queries and serve remote-invoked handlers with
//!   the two-phase response/completion protocol
//! - [`EventChannel`]: append to the ordered event log, replay aggregates,
//!   follow the flow-controlled global tracking stream and run ad-hoc tabular
//!   queries
//!
//! Channels are independent of one another and share only the immutable
//! session. There is no automatic reconnection or retry at this layer; a
//! failed session is recreated by the embedding application.

pub mod command;
pub mod connection;
pub mod error;
pub mod event;
pub mod flow;
pub mod handler;
pub mod query;
pub mod session;

pub use command::{CommandChannel, DispatchOptions, DispatchResponse};
pub use connection::{ConnectionSession, ControlEvent, InstructionObserver};
pub use error::{Error, Result};
pub use event::{
    AggregateEvent, EventChannel, EventStream, ListAggregateEventsOptions,
    ListAggregateSnapshotsOptions, ListEventsOptions, NewEvent, NumericPredicate, PositionedEvent,
    QueryEventsOptions, QueryItem, QueryItemStream,
};
pub use flow::FlowController;
pub use handler::{Handler, HandlerError, handler_fn};
pub use query::{QueryChannel, QueryExpectingOptions, QueryOptions, QueryReply};
pub use session::{ClientConfig, ClientIdentity, DecodedPayload, PayloadData, Session};
