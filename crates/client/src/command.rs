//! Command channel: subscription registry for remote-invoked handlers and
//! unary dispatch for commands this client issues.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use busline_codec::{Codec, Envelope, JsonCodec};
use busline_protocol::command::{
    Command, CommandProviderInbound, CommandProviderOutbound, CommandResponse, CommandSubscription,
};
use busline_protocol::common::{ErrorMessage, FlowControl, ProcessingInstruction};
use busline_protocol::{frame, routes};
use busline_transport::{FrameSink, FrameStream, Transport};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::session::{DecodedPayload, PayloadData, Session, decode_payload};

/// Default permit budget declared when the provider stream opens.
///
/// Declared once and never replenished on this channel.
pub const DEFAULT_PERMITS: u64 = 500;

/// A command to dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Command name.
    pub name: String,
    /// Optional command payload.
    pub payload: Option<PayloadData>,
}

/// Decoded response to a dispatched command.
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    /// Identifier of the response message.
    pub message_identifier: String,
    /// Identifier of the dispatched command.
    pub request_identifier: String,
    /// Decoded response payload, when the handler returned one.
    pub payload: Option<DecodedPayload>,
}

struct SubscriptionEntry {
    handler: Arc<dyn Handler>,
    response_type: String,
}

struct CommandInner {
    session: Session,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    subscriptions: DashMap<String, SubscriptionEntry>,
    sink: tokio::sync::Mutex<Option<Arc<dyn FrameSink>>>,
    permits: u64,
    cancel: CancellationToken,
    closed: AtomicBool,
}

/// Channel for dispatching commands and serving remote-invoked handlers.
///
/// At most one handler per command name. The provider stream is opened
/// lazily on first subscribe; dispatch is independent of it.
#[derive(Clone)]
pub struct CommandChannel {
    inner: Arc<CommandInner>,
}

/// Handle returned by subscribe; unsubscribes when consumed.
pub struct SubscriptionHandle {
    inner: Arc<CommandInner>,
    name: String,
}

impl SubscriptionHandle {
    /// The subscribed command name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the registration this handle stands for.
    pub async fn unsubscribe(self) -> Result<()> {
        unsubscribe_inner(&self.inner, &self.name).await
    }
}

impl CommandChannel {
    /// Connect a command channel against the session's resolved endpoint.
    pub async fn connect(session: Session) -> Result<Self> {
        Self::connect_with_permits(session, DEFAULT_PERMITS).await
    }

    /// Connect with an explicit permit budget.
    pub async fn connect_with_permits(session: Session, permits: u64) -> Result<Self> {
        let transport = session.connector.connect(&session.endpoint).await?;
        Ok(Self {
            inner: Arc::new(CommandInner {
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

    /// Register a handler for a command name.
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

        let result = self.announce_subscription(name).await;
        if result.is_err() {
            inner.subscriptions.remove(name);
        }
        result?;

        Ok(SubscriptionHandle {
            inner: inner.clone(),
            name: name.to_string(),
        })
    }

    async fn announce_subscription(&self, name: &str) -> Result<()> {
        let sink = ensure_sink(&self.inner).await?;
        let subscribe = CommandProviderOutbound::Subscribe(self.inner.subscription_frame(name));
        sink.send(frame::encode(&subscribe)?).await?;
        debug!("subscribed command handler for '{name}'");
        Ok(())
    }

    /// Remove a handler registration. No-op when nothing is registered or
    /// the provider stream was never opened.
    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        unsubscribe_inner(&self.inner, name).await
    }

    /// Dispatch a command and await its response.
    ///
    /// Independent of the provider stream. An error-tagged response surfaces
    /// as [`Error::Remote`]; transport failures as [`Error::Transport`].
    pub async fn dispatch(&self, options: DispatchOptions) -> Result<DispatchResponse> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let payload = options
            .payload
            .map(|p| p.into_envelope(&*inner.codec))
            .transpose()?;

        let command = Command {
            message_identifier: Uuid::new_v4().to_string(),
            name: options.name,
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload,
            processing_instructions: vec![ProcessingInstruction::routing_key()],
            client_id: inner.session.identity.client_id.clone(),
            component_name: inner.session.identity.component_name.clone(),
        };

        let response_bytes = inner
            .transport
            .unary(
                routes::COMMAND_DISPATCH,
                frame::encode(&command)?,
                &inner.session.metadata,
            )
            .await?;
        let response: CommandResponse = frame::decode(&response_bytes)?;

        if let Some(error) = response.error_message {
            return Err(Error::Remote(error));
        }

        Ok(DispatchResponse {
            message_identifier: response.message_identifier,
            request_identifier: response.request_identifier,
            payload: decode_payload(&*inner.codec, response.payload)?,
        })
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

impl CommandInner {
    fn subscription_frame(&self, name: &str) -> CommandSubscription {
        CommandSubscription {
            command: name.to_string(),
            client_id: self.session.identity.client_id.clone(),
            component_name: self.session.identity.component_name.clone(),
        }
    }
}

async fn unsubscribe_inner(inner: &Arc<CommandInner>, name: &str) -> Result<()> {
    let guard = inner.sink.lock().await;
    let Some(sink) = guard.as_ref() else {
        return Ok(());
    };
    if !inner.subscriptions.contains_key(name) {
        return Ok(());
    }

    let unsubscribe = CommandProviderOutbound::Unsubscribe(inner.subscription_frame(name));
    sink.send(frame::encode(&unsubscribe)?).await?;
    inner.subscriptions.remove(name);
    debug!("unsubscribed command handler for '{name}'");
    Ok(())
}

/// Open the provider stream if it is not open yet, declaring the permit
/// budget as the first frame.
async fn ensure_sink(inner: &Arc<CommandInner>) -> Result<Arc<dyn FrameSink>> {
    let mut guard = inner.sink.lock().await;
    if let Some(sink) = guard.as_ref() {
        return Ok(sink.clone());
    }

    let call = inner
        .transport
        .open_bidi(routes::COMMAND_STREAM, &inner.session.metadata)
        .await?;

    let flow = CommandProviderOutbound::FlowControl(FlowControl {
        client_id: inner.session.identity.client_id.clone(),
        permits: inner.permits,
    });
    call.sink.send(frame::encode(&flow)?).await?;

    tokio::spawn(run_inbound(inner.clone(), call.inbound, call.sink.clone()));

    *guard = Some(call.sink.clone());
    Ok(call.sink)
}

async fn run_inbound(
    inner: Arc<CommandInner>,
    inbound: FrameStream,
    sink: Arc<dyn FrameSink>,
) {
    // The cancellation future is !Unpin; box it so the combined stream can
    // be polled with `next()`.
    let mut inbound = inbound.take_until(Box::pin(inner.cancel.clone().cancelled_owned()));
    while let Some(item) = inbound.next().await {
        match item {
            Ok(bytes) => match frame::decode::<CommandProviderInbound>(&bytes) {
                Ok(CommandProviderInbound::Command(command)) => {
                    // Handlers run concurrently; completion order is not
                    // defined.
                    tokio::spawn(handle_invocation(inner.clone(), sink.clone(), command));
                }
                Ok(_) => {}
                Err(e) => warn!("undecodable frame on command stream: {e}"),
            },
            // Reported, not fatal: the stream is left open.
            Err(e) => warn!("command stream error: {e}"),
        }
    }
    debug!("command provider stream ended");
}

async fn handle_invocation(inner: Arc<CommandInner>, sink: Arc<dyn FrameSink>, command: Command) {
    let Some((handler, response_type)) = inner
        .subscriptions
        .get(&command.name)
        .map(|entry| (entry.handler.clone(), entry.response_type.clone()))
    else {
        debug!("dropping command '{}' without subscription", command.name);
        return;
    };

    let mut response = CommandResponse {
        message_identifier: Uuid::new_v4().to_string(),
        request_identifier: command.message_identifier.clone(),
        ..CommandResponse::default()
    };

    match invoke(&*inner.codec, &*handler, command.payload).await {
        Ok(Some(value)) => match inner.codec.encode(&value) {
            Ok(data) => response.payload = Some(Envelope::new(response_type, "", data)),
            Err(e) => response.error_message = Some(ErrorMessage::new(e.to_string())),
        },
        Ok(None) => {}
        Err(message) => response.error_message = Some(ErrorMessage::new(message)),
    }

    let outbound = CommandProviderOutbound::CommandResponse(response);
    match frame::encode(&outbound) {
        Ok(bytes) => {
            if let Err(e) = sink.send(bytes).await {
                warn!("failed to write command response: {e}");
            }
        }
        Err(e) => warn!("failed to encode command response: {e}"),
    }
}

/// Decode the payload and run the handler; any failure becomes the error
/// text of the response.
pub(crate) async fn invoke(
    codec: &dyn Codec,
    handler: &dyn Handler,
    payload: Option<Envelope>,
) -> std::result::Result<Option<serde_json::Value>, String> {
    let decoded = payload
        .as_ref()
        .map(|p| codec.decode(&p.data))
        .transpose()
        .map_err(|e| e.to_string())?;
    handler.handle(decoded).await.map_err(|e| e.message)
}
