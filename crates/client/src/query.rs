//! Query channel: subscription registry with the two-phase
//! response/completion protocol, server-streamed query issuance, and the
//! interoperability entry point for differently-typed remote runtimes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use busline_codec::{Codec, Envelope, JsonCodec, TaggedDocumentCodec};
use busline_protocol::common::{ErrorMessage, FlowControl, ProcessingInstruction, ProcessingKey};
use busline_protocol::query::{
    QueryComplete, QueryProviderInbound, QueryProviderOutbound, QueryRequest, QueryResponse,
    QuerySubscription,
};
use busline_protocol::{frame, routes};
use busline_transport::{FrameSink, FrameStream, Transport};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::command::invoke;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::session::{DecodedPayload, PayloadData, Session, decode_payload};

/// Default permit budget declared when the provider stream opens.
///
/// Declared once and never replenished on this channel.
pub const DEFAULT_PERMITS: u64 = 500;

/// Response-shape wrapper types understood by remote handlers running on a
/// differently-typed runtime.
const INSTANCE_RESPONSE_TYPE: &str =
    "org.axonframework.messaging.responsetypes.InstanceResponseType";
const COLLECTION_RESPONSE_TYPE: &str =
    "org.axonframework.messaging.responsetypes.MultipleInstancesResponseType";

/// A query to issue.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Query name.
    pub query: String,
    /// Advisory timeout in milliseconds, sent as a processing instruction.
    pub timeout: Option<i64>,
    /// Scheduling priority.
    pub priority: Option<i64>,
    /// Desired number of results.
    pub nr_of_results: Option<i64>,
    /// Optional query payload.
    pub payload: Option<PayloadData>,
    /// Declared response-type envelope, passed through verbatim.
    pub response_type: Envelope,
}

/// A query for the interoperability entry point.
#[derive(Debug, Clone)]
pub struct QueryExpectingOptions {
    /// Query name.
    pub query: String,
    /// Payload type tag; defaults to the query name.
    pub query_type: Option<String>,
    /// Advisory timeout in milliseconds.
    pub timeout: Option<i64>,
    /// Scheduling priority.
    pub priority: Option<i64>,
    /// Desired number of results.
    pub nr_of_results: Option<i64>,
    /// Query payload data.
    pub payload: serde_json::Value,
    /// Expected response type name on the remote runtime.
    pub response_type: String,
    /// Whether a collection of instances is expected rather than one.
    pub expect_collection: bool,
}

/// Aggregated result of an issued query.
#[derive(Debug, Clone)]
pub struct QueryReply {
    /// Identifier of the (last) response message.
    pub message_identifier: String,
    /// Identifier of the issued query.
    pub request_identifier: String,
    /// Decoded response payload from the last frame that carried one.
    pub payload: Option<DecodedPayload>,
}

struct SubscriptionEntry {
    handler: Arc<dyn Handler>,
    response_type: String,
}

struct QueryInner {
    session: Session,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    subscriptions: DashMap<String, SubscriptionEntry>,
    sink: tokio::sync::Mutex<Option<Arc<dyn FrameSink>>>,
    permits: u64,
    cancel: CancellationToken,
    closed: AtomicBool,
}

/// Channel for issuing queries and serving remote-invoked query handlers.
#[derive(Clone)]
pub struct QueryChannel {
    inner: Arc<QueryInner>,
}

/// Handle returned by subscribe; unsubscribes when consumed.
pub struct SubscriptionHandle {
    inner: Arc<QueryInner>,
    name: String,
}

impl SubscriptionHandle {
    /// The subscribed query name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the registration this handle stands for.
    pub async fn unsubscribe(self) -> Result<()> {
        unsubscribe_inner(&self.inner, &self.name).await
    }
}

impl QueryChannel {
    /// Connect a query channel against the session's resolved endpoint.
    pub async fn connect(session: Session) -> Result<Self> {
        Self::connect_with_permits(session, DEFAULT_PERMITS).await
    }

    /// Connect with an explicit permit budget.
    pub async fn connect_with_permits(session: Session, permits: u64) -> Result<Self> {
        let transport = session.connector.connect(&session.endpoint).await?;
        Ok(Self {
            inner: Arc::new(QueryInner {
                session,
                transport,
                codec: Arc::new(JsonCodec),
                subscriptions: DashMap::new(),
                sink: tokio::sync::Mutex::new(None),
                permits,
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// The permit budget declared when the provider stream opens.
    pub fn permits(&self) -> u64 {
        self.inner.permits
    }

    /// Register a handler for a query name.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::DuplicateSubscription`] when the name is already
    /// registered on this channel instance.
    pub async fn subscribe<H: Handler>(
        &self,
        name: &str,
        handler: H,
        response_type: &str,
    ) -> Result<SubscriptionHandle> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        match inner.subscriptions.entry(name.to_string()) {
            Entry::Occupied(_) => {
                return Err(Error::DuplicateSubscription {
                    name: name.to_string(),
                });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(SubscriptionEntry {
                    handler: Arc::new(handler),
                    response_type: response_type.to_string(),
                });
            }
        }

        let result = self.announce_subscription(name, response_type).await;
        if result.is_err() {
            inner.subscriptions.remove(name);
        }
        result?;

        Ok(SubscriptionHandle {
            inner: inner.clone(),
            name: name.to_string(),
        })
    }

    async fn announce_subscription(&self, name: &str, response_type: &str) -> Result<()> {
        let sink = ensure_sink(&self.inner).await?;
        let subscribe = QueryProviderOutbound::Subscribe(QuerySubscription {
            query: name.to_string(),
            result_name: response_type.to_string(),
            client_id: self.inner.session.identity.client_id.clone(),
            component_name: self.inner.session.identity.component_name.clone(),
        });
        sink.send(frame::encode(&subscribe)?).await?;
        debug!("subscribed query handler for '{name}'");
        Ok(())
    }

    /// Remove a handler registration. No-op when nothing is registered or
    /// the provider stream was never opened.
    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        unsubscribe_inner(&self.inner, name).await
    }

    /// Issue a query and aggregate its streamed responses.
    ///
    /// Frames are folded into one reply, later frames overriding the
    /// identifiers and, when they carry one, the payload. An error-tagged
    /// frame aborts the call with [`Error::Remote`], discarding partial
    /// results. Resolves with `None` when the stream ends without a single
    /// response frame.
    pub async fn query(&self, options: QueryOptions) -> Result<Option<QueryReply>> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let mut instructions = Vec::new();
        if let Some(timeout) = options.timeout {
            instructions.push(ProcessingInstruction::new(ProcessingKey::Timeout, timeout));
        }
        if let Some(priority) = options.priority {
            instructions.push(ProcessingInstruction::new(ProcessingKey::Priority, priority));
        }
        if let Some(nr) = options.nr_of_results {
            instructions.push(ProcessingInstruction::new(ProcessingKey::NrOfResults, nr));
        }
        instructions.push(ProcessingInstruction::routing_key());

        let payload = options
            .payload
            .map(|p| p.into_envelope(&*inner.codec))
            .transpose()?;

        let request = QueryRequest {
            message_identifier: Uuid::new_v4().to_string(),
            query: options.query,
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload,
            response_type: Some(options.response_type),
            processing_instructions: instructions,
            client_id: inner.session.identity.client_id.clone(),
            component_name: inner.session.identity.component_name.clone(),
        };

        let mut stream = inner
            .transport
            .server_stream(
                routes::QUERY_RUN,
                frame::encode(&request)?,
                &inner.session.metadata,
            )
            .await?;

        let mut reply: Option<(String, String, Option<Envelope>)> = None;
        while let Some(item) = stream.next().await {
            let bytes = item?;
            let response: QueryResponse = frame::decode(&bytes)?;
            if let Some(error) = response.error_message {
                return Err(Error::Remote(error));
            }
            let previous_payload = reply.take().and_then(|(_, _, payload)| payload);
            reply = Some((
                response.message_identifier,
                response.request_identifier,
                response.payload.or(previous_payload),
            ));
        }

        reply
            .map(|(message_identifier, request_identifier, payload)| {
                Ok(QueryReply {
                    message_identifier,
                    request_identifier,
                    payload: decode_payload(&*inner.codec, payload)?,
                })
            })
            .transpose()
    }

    /// Interoperability entry point: declares the response type as a tagged
    /// document naming an instance or collection response shape, then
    /// delegates to [`query`](Self::query).
    pub async fn query_expecting(
        &self,
        options: QueryExpectingOptions,
    ) -> Result<Option<QueryReply>> {
        let wrapper = if options.expect_collection {
            COLLECTION_RESPONSE_TYPE
        } else {
            INSTANCE_RESPONSE_TYPE
        };

        let document = json!({
            wrapper: { "expectedResponseType": options.response_type }
        });
        let data = TaggedDocumentCodec.encode(&document)?;

        let payload_type = options.query_type.unwrap_or_else(|| options.query.clone());

        self.query(QueryOptions {
            query: options.query,
            timeout: options.timeout,
            priority: options.priority,
            nr_of_results: options.nr_of_results,
            payload: Some(PayloadData::new(payload_type, options.payload)),
            response_type: Envelope::new(wrapper, "", data),
        })
        .await
    }

    /// Destroy the provider stream (if opened) and release the transport
    /// handle. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.cancel.cancel();
        if let Some(sink) = inner.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        inner.transport.shutdown().await?;
        Ok(())
    }
}

async fn unsubscribe_inner(inner: &Arc<QueryInner>, name: &str) -> Result<()> {
    let guard = inner.sink.lock().await;
    let Some(sink) = guard.as_ref() else {
        return Ok(());
    };
    if !inner.subscriptions.contains_key(name) {
        return Ok(());
    }

    let unsubscribe = QueryProviderOutbound::Unsubscribe(QuerySubscription {
        query: name.to_string(),
        result_name: String::new(),
        client_id: inner.session.identity.client_id.clone(),
        component_name: inner.session.identity.component_name.clone(),
    });
    sink.send(frame::encode(&unsubscribe)?).await?;
    inner.subscriptions.remove(name);
    debug!("unsubscribed query handler for '{name}'");
    Ok(())
}

/// Open the provider stream if it is not open yet, declaring the permit
/// budget as the first frame.
async fn ensure_sink(inner: &Arc<QueryInner>) -> Result<Arc<dyn FrameSink>> {
    let mut guard = inner.sink.lock().await;
    if let Some(sink) = guard.as_ref() {
        return Ok(sink.clone());
    }

    let call = inner
        .transport
        .open_bidi(routes::QUERY_STREAM, &inner.session.metadata)
        .await?;

    let flow = QueryProviderOutbound::FlowControl(FlowControl {
        client_id: inner.session.identity.client_id.clone(),
        permits: inner.permits,
    });
    call.sink.send(frame::encode(&flow)?).await?;

    tokio::spawn(run_inbound(inner.clone(), call.inbound, call.sink.clone()));

    *guard = Some(call.sink.clone());
    Ok(call.sink)
}

async fn run_inbound(inner: Arc<QueryInner>, inbound: FrameStream, sink: Arc<dyn FrameSink>) {
    // The cancellation future is !Unpin; box it so the combined stream can
    // be polled with `next()`.
    let mut inbound = inbound.take_until(Box::pin(inner.cancel.clone().cancelled_owned()));
    while let Some(item) = inbound.next().await {
        match item {
            Ok(bytes) => match frame::decode::<QueryProviderInbound>(&bytes) {
                Ok(QueryProviderInbound::Query(query)) => {
                    tokio::spawn(handle_invocation(inner.clone(), sink.clone(), query));
                }
                Ok(_) => {}
                Err(e) => warn!("undecodable frame on query stream: {e}"),
            },
            // Reported, not fatal: the stream is left open.
            Err(e) => warn!("query stream error: {e}"),
        }
    }
    debug!("query provider stream ended");
}

/// Handle one remote invocation with the two-phase protocol: a response
/// frame followed by a completion frame on success, a single error-tagged
/// response frame on failure.
async fn handle_invocation(inner: Arc<QueryInner>, sink: Arc<dyn FrameSink>, query: QueryRequest) {
    let Some((handler, response_type)) = inner
        .subscriptions
        .get(&query.query)
        .map(|entry| (entry.handler.clone(), entry.response_type.clone()))
    else {
        debug!("dropping query '{}' without subscription", query.query);
        return;
    };

    let mut response = QueryResponse {
        request_identifier: query.message_identifier.clone(),
        ..QueryResponse::default()
    };

    match invoke(&*inner.codec, &*handler, query.payload).await {
        Ok(value) => {
            let message_id = Uuid::new_v4().to_string();
            response.message_identifier = message_id.clone();
            if let Some(value) = value {
                match inner.codec.encode(&value) {
                    Ok(data) => response.payload = Some(Envelope::new(response_type, "", data)),
                    Err(e) => {
                        write_frame(
                            &sink,
                            &QueryProviderOutbound::QueryResponse(QueryResponse {
                                message_identifier: String::new(),
                                request_identifier: query.message_identifier.clone(),
                                payload: None,
                                error_message: Some(ErrorMessage::new(e.to_string())),
                            }),
                        )
                        .await;
                        return;
                    }
                }
            }

            write_frame(&sink, &QueryProviderOutbound::QueryResponse(response)).await;
            write_frame(
                &sink,
                &QueryProviderOutbound::QueryComplete(QueryComplete {
                    request_id: query.message_identifier,
                    message_id,
                }),
            )
            .await;
        }
        Err(message) => {
            // No completion frame follows an error-tagged response.
            response.error_message = Some(ErrorMessage::new(message));
            write_frame(&sink, &QueryProviderOutbound::QueryResponse(response)).await;
        }
    }
}

async fn write_frame(sink: &Arc<dyn FrameSink>, outbound: &QueryProviderOutbound) {
    match frame::encode(outbound) {
        Ok(bytes) => {
            if let Err(e) = sink.send(bytes).await {
                warn!("failed to write query provider frame: {e}");
            }
        }
        Err(e) => warn!("failed to encode query provider frame: {e}"),
    }
}
