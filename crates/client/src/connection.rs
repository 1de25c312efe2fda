//! Connection establishment: identity registration and node discovery.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use busline_protocol::control::{ControlInbound, ControlOutbound, PlatformInfo};
use busline_protocol::{frame, routes};
use busline_transport::{CallMetadata, Connect, FrameStream, Transport};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::session::{ClientConfig, ClientIdentity, Session};

/// Observable moments on the control stream.
///
/// Inbound instructions are surfaced here and not otherwise acted upon.
/// Stream errors and stream end do not trigger reconnection; the session is
/// inert afterwards and must be recreated by the caller.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// A server-pushed instruction arrived.
    Instruction(ControlInbound),
    /// The control stream reported an error; listening continues.
    StreamError(String),
    /// The control stream ended.
    StreamEnded,
}

/// Hook the embedding application supplies to observe the control stream.
pub type InstructionObserver = Arc<dyn Fn(ControlEvent) + Send + Sync>;

/// A registered connection to the bus.
///
/// Opens the control stream immediately on construction: a one-time register
/// frame carrying the identity, then indefinite listening for server-pushed
/// instructions. [`discover`](Self::discover) must be called exactly once
/// before constructing channels from the returned [`Session`].
pub struct ConnectionSession {
    config: ClientConfig,
    identity: ClientIdentity,
    metadata: CallMetadata,
    connector: Arc<dyn Connect>,
    transport: Mutex<Arc<dyn Transport>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl ConnectionSession {
    /// Connect and register, reporting control-stream events via `tracing`.
    pub async fn connect(config: ClientConfig, connector: Arc<dyn Connect>) -> Result<Self> {
        Self::connect_with_observer(
            config,
            connector,
            Arc::new(|event| match event {
                ControlEvent::Instruction(instruction) => {
                    debug!("control instruction: {instruction:?}");
                }
                ControlEvent::StreamError(reason) => warn!("control stream error: {reason}"),
                ControlEvent::StreamEnded => warn!("control stream ended"),
            }),
        )
        .await
    }

    /// Connect and register with an explicit control-stream observer.
    pub async fn connect_with_observer(
        config: ClientConfig,
        connector: Arc<dyn Connect>,
        observer: InstructionObserver,
    ) -> Result<Self> {
        let transport = connector.connect(&config.endpoint).await?;
        let identity = config.identity();
        let metadata = config.metadata();
        let cancel = CancellationToken::new();

        let call = transport.open_bidi(routes::CONTROL_STREAM, &metadata).await?;
        let register = frame::encode(&ControlOutbound::Register(identity.identification()))?;
        call.sink.send(register).await?;
        tokio::spawn(run_control(call.inbound, observer, cancel.clone()));

        Ok(Self {
            config,
            identity,
            metadata,
            connector,
            transport: Mutex::new(transport),
            cancel,
            closed: AtomicBool::new(false),
        })
    }

    /// The identity registered for this session.
    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Resolve the node this client should talk to.
    ///
    /// The server either confirms the current connection or names a primary
    /// node, in which case a fresh transport handle is connected against that
    /// address. Returns the resolved [`Session`] the channels are built from.
    pub async fn discover(&self) -> Result<Session> {
        let request = frame::encode(&self.identity.identification())?;
        let transport = self.transport.lock().clone();
        let response = transport
            .unary(routes::CONTROL_DISCOVER, request, &self.metadata)
            .await?;
        let info: PlatformInfo = frame::decode(&response)?;

        let endpoint = match (&info.primary, info.same_connection) {
            (_, true) | (None, false) => self.config.endpoint.clone(),
            (Some(primary), false) => {
                let endpoint = primary.endpoint();
                debug!("redirected to primary node {endpoint}");
                let redirected = self.connector.connect(&endpoint).await?;
                *self.transport.lock() = redirected;
                endpoint
            }
        };

        Ok(Session {
            endpoint,
            identity: self.identity.clone(),
            metadata: self.metadata.clone(),
            connector: self.connector.clone(),
        })
    }

    /// Destroy the control stream and release the transport handle.
    ///
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        let transport = self.transport.lock().clone();
        transport.shutdown().await?;
        Ok(())
    }
}

async fn run_control(
    inbound: FrameStream,
    observer: InstructionObserver,
    cancel: CancellationToken,
) {
    // The cancellation future is !Unpin; box it so the combined stream can
    // be polled with `next()`.
    let mut inbound = inbound.take_until(Box::pin(cancel.clone().cancelled_owned()));
    while let Some(item) = inbound.next().await {
        match item {
            Ok(bytes) => match frame::decode::<ControlInbound>(&bytes) {
                Ok(instruction) => observer(ControlEvent::Instruction(instruction)),
                Err(e) => observer(ControlEvent::StreamError(e.to_string())),
            },
            // Reported, not fatal: the stream is left open.
            Err(e) => observer(ControlEvent::StreamError(e.to_string())),
        }
    }
    if !cancel.is_cancelled() {
        observer(ControlEvent::StreamEnded);
    }
}
