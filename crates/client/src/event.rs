//! Event channel: append, aggregate replay, log positions, the global
//! tracking stream and the ad-hoc tabular query stream.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use busline_codec::{Codec, JsonCodec};
use busline_protocol::event::{
    Confirmation, Event, EventWithToken, GetAggregateEventsRequest, GetAggregateSnapshotsRequest,
    GetEventsRequest, GetFirstTokenRequest, GetLastTokenRequest, GetTokenAtRequest,
    PayloadDescription, QueryEventsRequest, QueryEventsResponse, QueryRow, TrackingToken,
};
use busline_protocol::{frame, routes};
use busline_transport::Transport;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::flow::FlowController;
use crate::session::{DecodedPayload, PayloadData, Session, decode_payload};

pub use busline_protocol::event::ColumnValue;

/// Flow-controlled stream of tracked events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<PositionedEvent>> + Send>>;

/// Flow-controlled stream of tabular query rows.
pub type QueryItemStream = Pin<Box<dyn Stream<Item = Result<QueryItem>> + Send>>;

/// Default permit budget for the global tracking stream.
pub const DEFAULT_STREAM_PERMITS: u64 = 10;

/// Default permit budget for the tabular query stream.
pub const DEFAULT_QUERY_PERMITS: u64 = 100;

/// An event to append, identity and timestamp assigned on submission.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Aggregate the event belongs to.
    pub aggregate_identifier: String,
    /// Aggregate type name.
    pub aggregate_type: String,
    /// Position within the aggregate, strictly increasing.
    pub aggregate_sequence_number: u64,
    /// Optional event payload.
    pub payload: Option<PayloadData>,
}

/// A replayed or tracked event with its payload decoded.
#[derive(Debug, Clone)]
pub struct AggregateEvent {
    /// Globally unique event identifier.
    pub message_identifier: String,
    /// Aggregate the event belongs to.
    pub aggregate_identifier: String,
    /// Position within the aggregate.
    pub aggregate_sequence_number: u64,
    /// Aggregate type name.
    pub aggregate_type: String,
    /// Persist time, unix milliseconds.
    pub timestamp: i64,
    /// Whether this event is a snapshot.
    pub snapshot: bool,
    /// Decoded event payload, when one was persisted.
    pub payload: Option<DecodedPayload>,
}

/// An event from the global tracking stream, paired with its log position.
#[derive(Debug, Clone)]
pub struct PositionedEvent {
    /// Global log position of the event.
    pub token: i64,
    /// The event at that position.
    pub event: AggregateEvent,
}

/// Options for replaying one aggregate's events.
#[derive(Debug, Clone)]
pub struct ListAggregateEventsOptions {
    /// Aggregate to replay.
    pub aggregate_id: String,
    /// First sequence number to deliver.
    pub initial_sequence: u64,
    /// Last sequence number to deliver, -1 for no bound.
    pub max_sequence: i64,
    /// Whether snapshots may substitute earlier events.
    pub allow_snapshots: bool,
    /// Minimum global token to replay from.
    pub min_token: i64,
}

impl ListAggregateEventsOptions {
    /// Replay the full history of an aggregate.
    pub fn for_aggregate(aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            initial_sequence: 0,
            max_sequence: -1,
            allow_snapshots: false,
            min_token: 0,
        }
    }
}

/// Options for replaying one aggregate's snapshots.
#[derive(Debug, Clone)]
pub struct ListAggregateSnapshotsOptions {
    /// Aggregate to replay.
    pub aggregate_id: String,
    /// First sequence number to deliver.
    pub initial_sequence: u64,
    /// Last sequence number to deliver, -1 for no bound.
    pub max_sequence: i64,
}

impl ListAggregateSnapshotsOptions {
    /// Replay all snapshots of an aggregate.
    pub fn for_aggregate(aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            initial_sequence: 0,
            max_sequence: -1,
        }
    }
}

/// Options for the global tracking stream.
#[derive(Debug, Clone)]
pub struct ListEventsOptions {
    /// Global token to start from.
    pub tracking_token: i64,
    /// Permit budget; replenished once half of it is consumed.
    pub permits: u64,
    /// Owning event processor name, empty when untracked.
    pub processor: String,
    /// Payload types the server should not deliver.
    pub blacklist: Vec<PayloadDescription>,
    /// Read from the cluster leader even when a follower is closer.
    pub force_read_from_leader: bool,
}

impl Default for ListEventsOptions {
    fn default() -> Self {
        Self {
            tracking_token: 0,
            permits: DEFAULT_STREAM_PERMITS,
            processor: String::new(),
            blacklist: Vec::new(),
            force_read_from_leader: false,
        }
    }
}

/// Comparison against a numeric event attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericPredicate {
    /// Equal to.
    Eq(i64),
    /// Strictly less than.
    Lt(i64),
    /// Less than or equal to.
    Lte(i64),
    /// Strictly greater than.
    Gt(i64),
    /// Greater than or equal to.
    Gte(i64),
}

impl From<i64> for NumericPredicate {
    fn from(value: i64) -> Self {
        Self::Eq(value)
    }
}

impl NumericPredicate {
    fn render(&self, attribute: &str) -> String {
        let (operator, value) = match self {
            Self::Eq(v) => ("=", v),
            Self::Lt(v) => ("<", v),
            Self::Lte(v) => ("<=", v),
            Self::Gt(v) => (">", v),
            Self::Gte(v) => (">=", v),
        };
        format!("{attribute} {operator} {value}")
    }
}

/// Predicates for the tabular query stream, joined with AND.
///
/// At least one predicate must be set.
#[derive(Debug, Clone, Default)]
pub struct QueryEventsOptions {
    /// Match a single aggregate.
    pub aggregate_identifier: Option<String>,
    /// Match an aggregate type.
    pub aggregate_type: Option<String>,
    /// Match a payload revision.
    pub payload_revision: Option<String>,
    /// Match a payload type.
    pub payload_type: Option<String>,
    /// Constrain the persist time.
    pub timestamp: Option<NumericPredicate>,
    /// Constrain the position within the aggregate.
    pub aggregate_sequence_number: Option<NumericPredicate>,
    /// Constrain the global log position.
    pub token: Option<NumericPredicate>,
    /// Permit budget override; defaults to [`DEFAULT_QUERY_PERMITS`].
    pub permits: Option<u64>,
}

impl QueryEventsOptions {
    /// Render the filter expression, predicates in attribute order joined
    /// with AND.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::EmptyQuery`] when no predicate is set.
    pub fn filter_expression(&self) -> Result<String> {
        let mut clauses = Vec::new();
        if let Some(id) = &self.aggregate_identifier {
            clauses.push(format!("aggregateIdentifier = \"{id}\""));
        }
        if let Some(ty) = &self.aggregate_type {
            clauses.push(format!("aggregateType = \"{ty}\""));
        }
        if let Some(revision) = &self.payload_revision {
            clauses.push(format!("payloadRevision = \"{revision}\""));
        }
        if let Some(ty) = &self.payload_type {
            clauses.push(format!("payloadType = \"{ty}\""));
        }
        if let Some(predicate) = &self.timestamp {
            clauses.push(predicate.render("timestamp"));
        }
        if let Some(predicate) = &self.aggregate_sequence_number {
            clauses.push(predicate.render("aggregateSequenceNumber"));
        }
        if let Some(predicate) = &self.token {
            clauses.push(predicate.render("token"));
        }
        if clauses.is_empty() {
            return Err(Error::EmptyQuery);
        }
        Ok(clauses.join(" AND "))
    }
}

/// One reconstructed row of the tabular query stream.
///
/// Rows arrive as a flat column projection; they are rebuilt field by field
/// into this fixed shape, the payload columns folded into one decoded
/// payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryItem {
    /// Global log position of the event.
    pub token: i64,
    /// Aggregate the event belongs to.
    pub aggregate_identifier: String,
    /// Position within the aggregate.
    pub aggregate_sequence_number: u64,
    /// Aggregate type name.
    pub aggregate_type: String,
    /// Globally unique event identifier.
    pub event_identifier: String,
    /// Persist time, unix milliseconds.
    pub timestamp: i64,
    /// Decoded event payload, absent when the row carries no payload data.
    pub payload: Option<DecodedPayload>,
}

struct EventInner {
    session: Session,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

/// Channel for the event store operations.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<EventInner>,
}

impl EventChannel {
    /// Connect an event channel against the session's resolved endpoint.
    pub async fn connect(session: Session) -> Result<Self> {
        let transport = session.connector.connect(&session.endpoint).await?;
        Ok(Self {
            inner: Arc::new(EventInner {
                session,
                transport,
                codec: Arc::new(JsonCodec),
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Append a batch of events, one frame per event.
    pub async fn append_events(&self, events: Vec<NewEvent>) -> Result<Confirmation> {
        let inner = &self.inner;
        self.check_open()?;

        let mut call = inner
            .transport
            .open_client_stream(routes::EVENT_APPEND, &inner.session.metadata)
            .await?;

        for event in events {
            let payload = event
                .payload
                .map(|p| p.into_envelope(&*inner.codec))
                .transpose()?;
            let event = Event {
                message_identifier: Uuid::new_v4().to_string(),
                aggregate_identifier: event.aggregate_identifier,
                aggregate_sequence_number: event.aggregate_sequence_number,
                aggregate_type: event.aggregate_type,
                timestamp: chrono::Utc::now().timestamp_millis(),
                snapshot: false,
                payload,
            };
            call.write(frame::encode(&event)?).await?;
        }

        let response = call.finish().await?;
        Ok(frame::decode(&response)?)
    }

    /// Global position of the oldest event in the log.
    pub async fn first_token(&self) -> Result<i64> {
        self.token_request(routes::EVENT_FIRST_TOKEN, &GetFirstTokenRequest::default())
            .await
    }

    /// Global position of the newest event in the log.
    pub async fn last_token(&self) -> Result<i64> {
        self.token_request(routes::EVENT_LAST_TOKEN, &GetLastTokenRequest::default())
            .await
    }

    /// Global position of the first event at or past the given instant,
    /// unix milliseconds.
    pub async fn token_at(&self, instant: i64) -> Result<i64> {
        self.token_request(routes::EVENT_TOKEN_AT, &GetTokenAtRequest { instant })
            .await
    }

    async fn token_request<R: serde::Serialize>(
        &self,
        route: busline_transport::Route,
        request: &R,
    ) -> Result<i64> {
        self.check_open()?;
        let response = self
            .inner
            .transport
            .unary(route, frame::encode(request)?, &self.inner.session.metadata)
            .await?;
        let token: TrackingToken = frame::decode(&response)?;
        Ok(token.token)
    }

    /// Replay one aggregate's events in sequence order.
    ///
    /// The replay is atomic: an undecodable frame fails the whole call after
    /// the stream is drained, never a partial result.
    pub async fn list_aggregate_events(
        &self,
        options: ListAggregateEventsOptions,
    ) -> Result<Vec<AggregateEvent>> {
        let request = GetAggregateEventsRequest {
            aggregate_id: options.aggregate_id,
            initial_sequence: options.initial_sequence,
            max_sequence: options.max_sequence,
            allow_snapshots: options.allow_snapshots,
            min_token: options.min_token,
        };
        self.collect_aggregate_stream(routes::EVENT_LIST_AGGREGATE, frame::encode(&request)?)
            .await
    }

    /// Replay one aggregate's snapshots.
    ///
    /// Atomic on decode failure, like
    /// [`list_aggregate_events`](Self::list_aggregate_events).
    pub async fn list_aggregate_snapshots(
        &self,
        options: ListAggregateSnapshotsOptions,
    ) -> Result<Vec<AggregateEvent>> {
        let request = GetAggregateSnapshotsRequest {
            aggregate_id: options.aggregate_id,
            initial_sequence: options.initial_sequence,
            max_sequence: options.max_sequence,
        };
        self.collect_aggregate_stream(routes::EVENT_LIST_SNAPSHOTS, frame::encode(&request)?)
            .await
    }

    async fn collect_aggregate_stream(
        &self,
        route: busline_transport::Route,
        request: bytes::Bytes,
    ) -> Result<Vec<AggregateEvent>> {
        let inner = &self.inner;
        self.check_open()?;

        let mut stream = inner
            .transport
            .server_stream(route, request, &inner.session.metadata)
            .await?;

        let mut events = Vec::new();
        let mut deferred: Option<Error> = None;
        while let Some(item) = stream.next().await {
            // Failures are deferred until the stream is drained so the call
            // either yields the full replay or nothing.
            match item.map_err(Error::from).and_then(|bytes| {
                let event: Event = frame::decode(&bytes)?;
                decode_event(&*inner.codec, event)
            }) {
                Ok(event) => events.push(event),
                Err(e) => {
                    if deferred.is_none() {
                        deferred = Some(e);
                    }
                }
            }
        }

        match deferred {
            Some(e) => Err(e),
            None => Ok(events),
        }
    }

    /// Open the global tracking stream from a given position.
    ///
    /// The permit budget is declared with the request frame and replenished
    /// by re-sending it once half the budget is consumed. Frames without an
    /// event (heartbeats) are skipped. The stream ends when the channel is
    /// closed or the server completes it.
    pub async fn list_events(&self, options: ListEventsOptions) -> Result<EventStream> {
        let inner = self.inner.clone();
        self.check_open()?;

        let request = GetEventsRequest {
            tracking_token: options.tracking_token,
            number_of_permits: options.permits,
            client_id: inner.session.identity.client_id.clone(),
            component_name: inner.session.identity.component_name.clone(),
            processor: options.processor,
            blacklist: options.blacklist,
            force_read_from_leader: options.force_read_from_leader,
        };
        let request_frame = frame::encode(&request)?;

        let call = inner
            .transport
            .open_bidi(routes::EVENT_STREAM, &inner.session.metadata)
            .await?;
        call.sink.send(request_frame.clone()).await?;

        let mut flow = FlowController::new(options.permits);
        let sink = call.sink.clone();
        // The cancellation future is !Unpin; box it so the combined stream
        // can be polled with `next()`.
        let mut inbound = call
            .inbound
            .take_until(Box::pin(inner.cancel.clone().cancelled_owned()));

        let stream = async_stream::try_stream! {
            while let Some(item) = inbound.next().await {
                let bytes = item?;
                if flow.record_delivery() {
                    sink.send(request_frame.clone()).await?;
                }
                let with_token: EventWithToken = frame::decode(&bytes)?;
                let Some(event) = with_token.event else {
                    debug!("skipping eventless frame at token {}", with_token.token);
                    continue;
                };
                yield PositionedEvent {
                    token: with_token.token,
                    event: decode_event(&*inner.codec, event)?,
                };
            }
        };
        Ok(Box::pin(stream))
    }

    /// Run an ad-hoc tabular query over the event log.
    ///
    /// Fails locally with [`Error::EmptyQuery`] before any network call when
    /// no predicate is set. Column and historic-completion frames are
    /// consumed for flow accounting but not yielded.
    pub async fn query_events(&self, options: QueryEventsOptions) -> Result<QueryItemStream> {
        let inner = self.inner.clone();
        self.check_open()?;

        let permits = options.permits.unwrap_or(DEFAULT_QUERY_PERMITS);
        let request = QueryEventsRequest {
            query: options.filter_expression()?,
            number_of_permits: permits,
        };
        let request_frame = frame::encode(&request)?;

        let call = inner
            .transport
            .open_bidi(routes::EVENT_QUERY, &inner.session.metadata)
            .await?;
        call.sink.send(request_frame.clone()).await?;

        let mut flow = FlowController::new(permits);
        let sink = call.sink.clone();
        // The cancellation future is !Unpin; box it so the combined stream
        // can be polled with `next()`.
        let mut inbound = call
            .inbound
            .take_until(Box::pin(inner.cancel.clone().cancelled_owned()));

        let stream = async_stream::try_stream! {
            while let Some(item) = inbound.next().await {
                let bytes = item?;
                if flow.record_delivery() {
                    sink.send(request_frame.clone()).await?;
                }
                match frame::decode::<QueryEventsResponse>(&bytes)? {
                    QueryEventsResponse::Row(row) => yield into_item(&*inner.codec, row)?,
                    QueryEventsResponse::Columns(columns) => {
                        debug!("query columns: {columns:?}");
                    }
                    QueryEventsResponse::FilesCompleted => {
                        debug!("historic portion of event query complete");
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    /// End open streams and release the transport handle. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.cancel.cancel();
        if let Err(e) = inner.transport.shutdown().await {
            warn!("event transport shutdown failed: {e}");
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

fn decode_event(codec: &dyn Codec, event: Event) -> Result<AggregateEvent> {
    Ok(AggregateEvent {
        message_identifier: event.message_identifier,
        aggregate_identifier: event.aggregate_identifier,
        aggregate_sequence_number: event.aggregate_sequence_number,
        aggregate_type: event.aggregate_type,
        timestamp: event.timestamp,
        snapshot: event.snapshot,
        payload: decode_payload(codec, event.payload)?,
    })
}

fn row_text(values: &BTreeMap<String, ColumnValue>, column: &str) -> String {
    match values.get(column) {
        Some(ColumnValue::Text(value)) => value.clone(),
        _ => String::new(),
    }
}

fn row_number(values: &BTreeMap<String, ColumnValue>, column: &str) -> i64 {
    match values.get(column) {
        Some(ColumnValue::Number(value)) => *value,
        _ => 0,
    }
}

/// Rebuild a flat column projection into the fixed item shape, decoding the
/// payload columns through the channel codec.
fn into_item(codec: &dyn Codec, row: QueryRow) -> Result<QueryItem> {
    let values = row.values;
    let payload = match values.get("payloadData") {
        Some(ColumnValue::Text(data)) => Some(DecodedPayload {
            payload_type: row_text(&values, "payloadType"),
            revision: row_text(&values, "payloadRevision"),
            data: codec.decode(data.as_bytes())?,
        }),
        _ => None,
    };

    Ok(QueryItem {
        token: row_number(&values, "token"),
        aggregate_identifier: row_text(&values, "aggregateIdentifier"),
        aggregate_sequence_number: row_number(&values, "aggregateSequenceNumber") as u64,
        aggregate_type: row_text(&values, "aggregateType"),
        event_identifier: row_text(&values, "eventIdentifier"),
        timestamp: row_number(&values, "timestamp"),
        payload,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn rows_rebuild_into_typed_items() {
        let mut row = QueryRow::default();
        row.values.insert("token".to_string(), ColumnValue::Number(12));
        row.values.insert(
            "aggregateIdentifier".to_string(),
            ColumnValue::Text("A-1".to_string()),
        );
        row.values.insert(
            "aggregateSequenceNumber".to_string(),
            ColumnValue::Number(3),
        );
        row.values.insert(
            "aggregateType".to_string(),
            ColumnValue::Text("Account".to_string()),
        );
        row.values.insert(
            "eventIdentifier".to_string(),
            ColumnValue::Text("evt-3".to_string()),
        );
        row.values
            .insert("timestamp".to_string(), ColumnValue::Number(1003));
        row.values.insert(
            "payloadType".to_string(),
            ColumnValue::Text("AccountOpened".to_string()),
        );
        row.values.insert(
            "payloadRevision".to_string(),
            ColumnValue::Text("1".to_string()),
        );
        row.values.insert(
            "payloadData".to_string(),
            ColumnValue::Text(r#"{"owner":"Ada"}"#.to_string()),
        );

        let item = into_item(&JsonCodec, row).unwrap();
        assert_eq!(item.token, 12);
        assert_eq!(item.aggregate_identifier, "A-1");
        assert_eq!(item.aggregate_sequence_number, 3);
        assert_eq!(item.aggregate_type, "Account");
        assert_eq!(item.event_identifier, "evt-3");
        assert_eq!(item.timestamp, 1003);

        let payload = item.payload.unwrap();
        assert_eq!(payload.payload_type, "AccountOpened");
        assert_eq!(payload.revision, "1");
        assert_eq!(payload.data, json!({ "owner": "Ada" }));
    }

    #[test]
    fn rows_without_payload_data_have_no_payload() {
        let mut row = QueryRow::default();
        row.values.insert("token".to_string(), ColumnValue::Number(4));
        row.values.insert(
            "aggregateIdentifier".to_string(),
            ColumnValue::Text("A-2".to_string()),
        );

        let item = into_item(&JsonCodec, row).unwrap();
        assert_eq!(item.token, 4);
        assert_eq!(item.aggregate_identifier, "A-2");
        assert!(item.payload.is_none());
    }

    #[test]
    fn undecodable_payload_data_is_an_error() {
        let mut row = QueryRow::default();
        row.values.insert(
            "payloadData".to_string(),
            ColumnValue::Text("{not json".to_string()),
        );

        assert!(matches!(into_item(&JsonCodec, row), Err(Error::Codec(_))));
    }

    #[test]
    fn filter_renders_predicates_in_attribute_order() {
        let options = QueryEventsOptions {
            aggregate_identifier: Some("A-1".to_string()),
            timestamp: Some(NumericPredicate::Gte(1000)),
            ..QueryEventsOptions::default()
        };
        assert_eq!(
            options.filter_expression().ok(),
            Some("aggregateIdentifier = \"A-1\" AND timestamp >= 1000".to_string())
        );
    }

    #[test]
    fn filter_joins_all_attributes() {
        let options = QueryEventsOptions {
            aggregate_identifier: Some("A-1".to_string()),
            aggregate_type: Some("Account".to_string()),
            payload_revision: Some("2".to_string()),
            payload_type: Some("Opened".to_string()),
            timestamp: Some(NumericPredicate::Lt(5000)),
            aggregate_sequence_number: Some(NumericPredicate::Eq(3)),
            token: Some(NumericPredicate::Gt(42)),
            ..QueryEventsOptions::default()
        };
        assert_eq!(
            options.filter_expression().ok(),
            Some(
                "aggregateIdentifier = \"A-1\" AND aggregateType = \"Account\" AND \
                 payloadRevision = \"2\" AND payloadType = \"Opened\" AND timestamp < 5000 \
                 AND aggregateSequenceNumber = 3 AND token > 42"
                    .to_string()
            )
        );
    }

    #[test]
    fn filter_without_predicates_is_rejected() {
        let options = QueryEventsOptions::default();
        assert!(matches!(
            options.filter_expression(),
            Err(Error::EmptyQuery)
        ));
    }

    #[test]
    fn numeric_predicate_from_plain_value_is_equality() {
        let predicate: NumericPredicate = 7.into();
        assert_eq!(predicate, NumericPredicate::Eq(7));
    }
}
