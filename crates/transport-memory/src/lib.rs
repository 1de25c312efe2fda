//! In-memory transport implementation for testing
//!
//! Routes calls to scriptable endpoints within the same process. Tests
//! register a [`MemoryEndpoint`] under an endpoint name, attach handlers per
//! route, and connect the client through a [`MemoryConnector`].

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use busline_transport::{
    BidiCall, CallMetadata, ClientStreamCall, Connect, FrameSink, FrameStream, Route, Transport,
    TransportError,
};
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::debug;

/// Global registry of memory endpoints for in-process routing.
static REGISTRY: once_cell::sync::Lazy<DashMap<String, Arc<MemoryEndpoint>>> =
    once_cell::sync::Lazy::new(DashMap::new);

type UnaryHandler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, Result<Bytes, TransportError>> + Send + Sync>;
type ClientStreamHandler =
    Arc<dyn Fn(Vec<Bytes>) -> BoxFuture<'static, Result<Bytes, TransportError>> + Send + Sync>;
type ServerStreamHandler =
    Arc<dyn Fn(Bytes) -> BoxFuture<'static, Vec<Result<Bytes, TransportError>>> + Send + Sync>;
type BidiHandler = Arc<dyn Fn(BidiServer) -> BoxFuture<'static, ()> + Send + Sync>;

enum RouteHandler {
    Unary(UnaryHandler),
    ClientStream(ClientStreamHandler),
    ServerStream(ServerStreamHandler),
    Bidi(BidiHandler),
}

/// Server side of an in-memory bidirectional call, handed to the scripted
/// handler when a client opens the route.
pub struct BidiServer {
    rx: flume::Receiver<Bytes>,
    tx: flume::Sender<Result<Bytes, TransportError>>,
}

impl BidiServer {
    /// Receive the next client frame; `None` once the client closed.
    pub async fn recv(&self) -> Option<Bytes> {
        self.rx.recv_async().await.ok()
    }

    /// Deliver a frame to the client. Returns false when the client is gone.
    pub async fn send(&self, frame: Bytes) -> bool {
        self.tx.send_async(Ok(frame)).await.is_ok()
    }

    /// Deliver a stream error to the client.
    pub async fn send_error(&self, error: TransportError) -> bool {
        self.tx.send_async(Err(error)).await.is_ok()
    }
}

/// A scriptable in-process endpoint standing in for the bus server.
pub struct MemoryEndpoint {
    name: String,
    handlers: DashMap<Route, RouteHandler>,
    metadata_log: Mutex<Vec<(Route, Option<String>)>>,
}

impl MemoryEndpoint {
    /// Register an endpoint under the given name.
    ///
    /// # Errors
    ///
    /// Fails when the name is already taken.
    pub fn register(name: &str) -> Result<Arc<Self>, TransportError> {
        match REGISTRY.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(TransportError::connection_failed(
                name,
                "endpoint already registered",
            )),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let endpoint = Arc::new(Self {
                    name: name.to_string(),
                    handlers: DashMap::new(),
                    metadata_log: Mutex::new(Vec::new()),
                });
                vacant.insert(endpoint.clone());
                debug!("registered memory endpoint {name}");
                Ok(endpoint)
            }
        }
    }

    /// Remove an endpoint registration.
    pub fn unregister(name: &str) {
        REGISTRY.remove(name);
    }

    /// Clear all registrations (test hygiene).
    pub fn clear_registry() {
        REGISTRY.clear();
    }

    /// Endpoint name this registration answers under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a unary handler to a route.
    pub fn on_unary<F, Fut>(&self, route: Route, handler: F)
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, TransportError>> + Send + 'static,
    {
        self.handlers.insert(
            route,
            RouteHandler::Unary(Arc::new(move |request| Box::pin(handler(request)))),
        );
    }

    /// Attach a client-streaming handler: all written frames in, one response.
    pub fn on_client_stream<F, Fut>(&self, route: Route, handler: F)
    where
        F: Fn(Vec<Bytes>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, TransportError>> + Send + 'static,
    {
        self.handlers.insert(
            route,
            RouteHandler::ClientStream(Arc::new(move |frames| Box::pin(handler(frames)))),
        );
    }

    /// Attach a server-streaming handler: one request in, a frame sequence out.
    pub fn on_server_stream<F, Fut>(&self, route: Route, handler: F)
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<Result<Bytes, TransportError>>> + Send + 'static,
    {
        self.handlers.insert(
            route,
            RouteHandler::ServerStream(Arc::new(move |request| Box::pin(handler(request)))),
        );
    }

    /// Attach a bidirectional handler; spawned once per opened call.
    pub fn on_bidi<F, Fut>(&self, route: Route, handler: F)
    where
        F: Fn(BidiServer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.insert(
            route,
            RouteHandler::Bidi(Arc::new(move |server| Box::pin(handler(server)))),
        );
    }

    /// Access tokens observed on calls, in arrival order.
    pub fn recorded_tokens(&self) -> Vec<Option<String>> {
        self.metadata_log
            .lock()
            .iter()
            .map(|(_, token)| token.clone())
            .collect()
    }

    fn record(&self, route: Route, metadata: &CallMetadata) {
        self.metadata_log
            .lock()
            .push((route, metadata.access_token.clone()));
    }

    fn handler(&self, route: Route) -> Result<dashmap::mapref::one::Ref<'_, Route, RouteHandler>, TransportError> {
        self.handlers
            .get(&route)
            .ok_or(TransportError::UnknownRoute { route })
    }
}

/// Connector resolving endpoint names against the global registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryConnector;

#[async_trait]
impl Connect for MemoryConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let registered = REGISTRY
            .get(endpoint)
            .map(|entry| entry.clone())
            .ok_or_else(|| TransportError::connection_failed(endpoint, "no such endpoint"))?;

        debug!("connected memory transport to {endpoint}");

        Ok(Arc::new(MemoryTransport {
            endpoint: registered,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// Client-side transport handle bound to one registered endpoint.
pub struct MemoryTransport {
    endpoint: Arc<MemoryEndpoint>,
    closed: Arc<AtomicBool>,
}

impl MemoryTransport {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn unary(
        &self,
        route: Route,
        request: Bytes,
        metadata: &CallMetadata,
    ) -> Result<Bytes, TransportError> {
        self.check_open()?;
        self.endpoint.record(route, metadata);

        let handler = {
            let entry = self.endpoint.handler(route)?;
            match &*entry {
                RouteHandler::Unary(handler) => handler.clone(),
                _ => return Err(TransportError::call_failed(route, "not a unary route")),
            }
        };

        handler(request).await
    }

    async fn open_client_stream(
        &self,
        route: Route,
        metadata: &CallMetadata,
    ) -> Result<Box<dyn ClientStreamCall>, TransportError> {
        self.check_open()?;
        self.endpoint.record(route, metadata);

        let handler = {
            let entry = self.endpoint.handler(route)?;
            match &*entry {
                RouteHandler::ClientStream(handler) => handler.clone(),
                _ => {
                    return Err(TransportError::call_failed(
                        route,
                        "not a client-streaming route",
                    ));
                }
            }
        };

        let (frame_tx, frame_rx) = flume::unbounded::<Bytes>();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let mut frames = Vec::new();
            while let Ok(frame) = frame_rx.recv_async().await {
                frames.push(frame);
            }
            let _ = done_tx.send(handler(frames).await);
        });

        Ok(Box::new(MemoryClientStream {
            tx: Some(frame_tx),
            done: done_rx,
        }))
    }

    async fn server_stream(
        &self,
        route: Route,
        request: Bytes,
        metadata: &CallMetadata,
    ) -> Result<FrameStream, TransportError> {
        self.check_open()?;
        self.endpoint.record(route, metadata);

        let handler = {
            let entry = self.endpoint.handler(route)?;
            match &*entry {
                RouteHandler::ServerStream(handler) => handler.clone(),
                _ => {
                    return Err(TransportError::call_failed(
                        route,
                        "not a server-streaming route",
                    ));
                }
            }
        };

        let frames = handler(request).await;
        Ok(Box::pin(futures::stream::iter(frames)))
    }

    async fn open_bidi(
        &self,
        route: Route,
        metadata: &CallMetadata,
    ) -> Result<BidiCall, TransportError> {
        self.check_open()?;
        self.endpoint.record(route, metadata);

        let handler = {
            let entry = self.endpoint.handler(route)?;
            match &*entry {
                RouteHandler::Bidi(handler) => handler.clone(),
                _ => {
                    return Err(TransportError::call_failed(
                        route,
                        "not a bidirectional route",
                    ));
                }
            }
        };

        let (client_tx, server_rx) = flume::unbounded::<Bytes>();
        let (server_tx, client_rx) = flume::unbounded::<Result<Bytes, TransportError>>();

        tokio::spawn(handler(BidiServer {
            rx: server_rx,
            tx: server_tx,
        }));

        Ok(BidiCall {
            sink: Arc::new(MemorySink {
                tx: client_tx,
                closed: self.closed.clone(),
            }),
            inbound: Box::pin(client_rx.into_stream()),
        })
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        debug!("shutting down memory transport to {}", self.endpoint.name);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemorySink {
    tx: flume::Sender<Bytes>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.tx
            .send_async(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryClientStream {
    tx: Option<flume::Sender<Bytes>>,
    done: tokio::sync::oneshot::Receiver<Result<Bytes, TransportError>>,
}

#[async_trait]
impl ClientStreamCall for MemoryClientStream {
    async fn write(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send_async(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn finish(mut self: Box<Self>) -> Result<Bytes, TransportError> {
        // Dropping the sender ends the server-side collection loop.
        self.tx.take();
        self.done.await.map_err(|_| TransportError::Closed)?
    }
}
