//! `ServerInstance`: one listening socket serving both plain HTTP and
//! WebSocket upgrades.
//!
//! An instance walks through its startup states in order:
//!
//! ```text
//! Offline ──begin──→ Starting ──bind──→ HttpOnline ──attach ws──→ WsOnline
//! ```
//!
//! Each step only runs from the state before it; calling a step out of
//! order, or again after it succeeded, does nothing. Shutdown is not a
//! state: it closes the listener and every connection and leaves the
//! instance inert.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use mapcast_http::{FileAccess, FileSource, StaticRouter, TokioFileAccess};
use mapcast_registry::ConnectionRegistry;
use mapcast_transport::{ConnectionId, TransportError, WebSocketConnection};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::handler::accept_loop;
use crate::{EventHandler, MapcastError, ServerConfig, ServerEvent};

/// How long shutdown waits for connections to report their close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Startup state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ServerStatus {
    Offline = 0,
    Starting = 1,
    HttpOnline = 2,
    WsOnline = 3,
}

impl ServerStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Offline,
            1 => Self::Starting,
            2 => Self::HttpOnline,
            _ => Self::WsOnline,
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Offline => "OFFLINE",
            Self::Starting => "STARTING",
            Self::HttpOnline => "HTTP_ONLINE",
            Self::WsOnline => "WS_ONLINE",
        };
        f.write_str(name)
    }
}

/// State shared between the instance, its handles, and its tasks.
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) registry: ConnectionRegistry<WebSocketConnection>,
    pub(crate) router: StaticRouter,
    pub(crate) span: tracing::Span,
    status: AtomicU8,
    stopped: AtomicBool,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    /// Tells the accept loop to close the listener and cancel socket tasks.
    pub(crate) stop_signal: Notify,
    /// Upgraded connections whose task has not finished its close path.
    live: AtomicUsize,
    drained: Notify,
}

impl Shared {
    pub(crate) fn status(&self) -> ServerStatus {
        ServerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Whether upgrade requests may be accepted right now.
    pub(crate) fn accepts_upgrades(&self) -> bool {
        self.status() == ServerStatus::WsOnline && !self.is_stopped()
    }

    /// Moves from `from` to `to`. A no-op returning `false` if the current
    /// state is not `from`.
    fn advance(&self, from: ServerStatus, to: ServerStatus) -> bool {
        match self.status.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                tracing::debug!(%from, %to, "state transition");
                true
            }
            Err(current) => {
                tracing::debug!(
                    current = %ServerStatus::from_u8(current),
                    expected = %from,
                    %to,
                    "transition precondition unmet, ignoring"
                );
                false
            }
        }
    }

    pub(crate) fn emit(&self, event: &ServerEvent) {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler.handle(event);
        }
    }

    pub(crate) fn connection_opened(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    /// Called last by a connection's task, after its close was reported.
    pub(crate) fn connection_finished(&self) {
        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    fn live_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

/// A clonable handle for talking to an instance from elsewhere: event
/// handlers, another instance's handlers, or the bootstrap.
#[derive(Clone)]
pub struct InstanceHandle {
    shared: Arc<Shared>,
}

impl InstanceHandle {
    /// The instance's display name.
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn status(&self) -> ServerStatus {
        self.shared.status()
    }

    /// Number of currently registered connections.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Registers (or replaces) the file served under `name`.
    pub fn register_file(&self, name: impl Into<String>, source: FileSource) {
        self.shared.router.register_file(name, source);
    }

    /// Adds an event handler. Handlers are called in registration order.
    pub fn on_event(&self, handler: impl EventHandler) {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Queues a text frame for one connection.
    pub fn send(&self, id: ConnectionId, text: &str) -> Result<(), MapcastError> {
        Ok(self.shared.registry.send(id, text)?)
    }

    /// Queues a `kind` envelope for one connection.
    pub fn send_typed<T: Serialize + ?Sized>(
        &self,
        id: ConnectionId,
        kind: &str,
        data: &T,
    ) -> Result<(), MapcastError> {
        let text = mapcast_protocol::encode(kind, data)?;
        self.send(id, &text)
    }

    /// Queues a text frame for every connection. Returns how many
    /// connections it was queued for.
    pub fn broadcast(&self, text: &str) -> usize {
        self.shared
            .span
            .in_scope(|| self.shared.registry.broadcast(text))
    }

    /// Queues a `kind` envelope for every connection.
    pub fn broadcast_typed<T: Serialize + ?Sized>(
        &self,
        kind: &str,
        data: &T,
    ) -> Result<usize, MapcastError> {
        let text = mapcast_protocol::encode(kind, data)?;
        Ok(self.broadcast(&text))
    }
}

/// One server instance: listener, router, registry, and event handlers.
///
/// # Example
///
/// ```rust,no_run
/// use mapcast::prelude::*;
///
/// # async fn run() -> Result<(), MapcastError> {
/// let mut map = ServerInstance::new(ServerConfig::new("map"));
/// map.register_file("index.html", FileSource::on_disk("client/map/index.html"));
/// map.on_event(|event: &ServerEvent| {
///     if let ServerEvent::Connected(conn) = event {
///         let _ = conn.send_typed("welcome", "map");
///     }
/// });
/// map.run_startup().await?;
/// // ...
/// map.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct ServerInstance {
    handle: InstanceHandle,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

impl ServerInstance {
    /// Creates an `Offline` instance that reads files from disk.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_file_access(config, Arc::new(TokioFileAccess))
    }

    /// Creates an `Offline` instance that reads files through `fs`.
    pub fn with_file_access(config: ServerConfig, fs: Arc<dyn FileAccess>) -> Self {
        let span = tracing::info_span!("server", name = %config.name);
        let router = StaticRouter::new(
            config.assets_prefix.clone(),
            config.assets_dir.clone(),
            fs,
        );
        let shared = Arc::new(Shared {
            config,
            registry: ConnectionRegistry::new(),
            router,
            span,
            status: AtomicU8::new(ServerStatus::Offline as u8),
            stopped: AtomicBool::new(false),
            handlers: RwLock::new(Vec::new()),
            stop_signal: Notify::new(),
            live: AtomicUsize::new(0),
            drained: Notify::new(),
        });
        Self {
            handle: InstanceHandle { shared },
            local_addr: None,
            accept_task: None,
        }
    }

    /// Creates an instance and drives it all the way to `WsOnline`.
    ///
    /// # Errors
    /// Returns [`TransportError::BindFailed`] if the listener cannot be
    /// bound; the instance never reaches `HttpOnline`.
    pub async fn start(config: ServerConfig) -> Result<Self, MapcastError> {
        let mut instance = Self::new(config);
        instance.run_startup().await?;
        Ok(instance)
    }

    /// Runs every startup step in order. Steps whose precondition is not
    /// met are skipped, so calling this again on a running instance
    /// leaves it untouched.
    pub async fn run_startup(&mut self) -> Result<(), MapcastError> {
        self.begin();
        self.start_http().await?;
        self.start_ws();
        Ok(())
    }

    /// `Offline → Starting`.
    pub fn begin(&self) -> bool {
        let shared = &self.handle.shared;
        shared
            .span
            .in_scope(|| shared.advance(ServerStatus::Offline, ServerStatus::Starting))
    }

    /// `Starting → HttpOnline`: binds the listener and starts serving HTTP.
    ///
    /// # Errors
    /// Returns [`TransportError::BindFailed`] if the bind fails; the state
    /// stays `Starting`.
    pub async fn start_http(&mut self) -> Result<bool, MapcastError> {
        let span = self.handle.shared.span.clone();
        self.bind_and_serve().instrument(span).await
    }

    async fn bind_and_serve(&mut self) -> Result<bool, MapcastError> {
        let shared = Arc::clone(&self.handle.shared);
        if shared.status() != ServerStatus::Starting || shared.is_stopped() {
            tracing::debug!(current = %shared.status(), "not starting, skipping bind");
            return Ok(false);
        }

        let addr = shared.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .and_then(|listener| Ok((listener.local_addr()?, listener)));
        let (local_addr, listener) = listener.map_err(|source| {
            TransportError::BindFailed {
                addr: addr.clone(),
                source,
            }
        })?;

        let task = tokio::spawn(
            accept_loop(listener, Arc::clone(&shared))
                .instrument(shared.span.clone()),
        );
        self.accept_task = Some(task);
        self.local_addr = Some(local_addr);

        shared.advance(ServerStatus::Starting, ServerStatus::HttpOnline);
        tracing::info!("server running at http://{local_addr}/");
        Ok(true)
    }

    /// `HttpOnline → WsOnline`: starts accepting upgrade requests on the
    /// already-bound listener.
    pub fn start_ws(&self) -> bool {
        let shared = &self.handle.shared;
        shared.span.in_scope(|| {
            if self.accept_task.is_none() {
                tracing::debug!("no listener bound, not attaching upgrades");
                return false;
            }
            let advanced =
                shared.advance(ServerStatus::HttpOnline, ServerStatus::WsOnline);
            if advanced {
                tracing::info!(
                    subprotocol = mapcast_protocol::SUBPROTOCOL,
                    "accepting WebSocket connections"
                );
            }
            advanced
        })
    }

    /// Stops the listener and closes every connection.
    ///
    /// Requests and handshakes still in flight are cancelled without
    /// emitting events. Waits briefly for the upgraded connections to
    /// report their close, so their `Disconnected` events have been emitted
    /// when this returns. Calling it again is a no-op.
    pub async fn shutdown(&mut self) {
        let span = self.handle.shared.span.clone();
        self.stop_and_drain().instrument(span).await
    }

    async fn stop_and_drain(&mut self) {
        let shared = Arc::clone(&self.handle.shared);
        if shared.stopped.swap(true, Ordering::AcqRel) {
            tracing::debug!("already shut down");
            return;
        }

        // Once the accept task has returned, no socket task can register
        // another connection.
        shared.stop_signal.notify_one();
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "accept task failed");
            }
        }

        let closed = shared.registry.close_all();
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        loop {
            let drained = shared.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if shared.live_connections() == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                tracing::warn!(
                    remaining = shared.live_connections(),
                    "connections still open after shutdown timeout"
                );
                break;
            }
        }

        tracing::info!(closed, "server shut down");
    }

    /// A clonable handle to this instance.
    pub fn handle(&self) -> InstanceHandle {
        self.handle.clone()
    }

    /// The address the listener is bound to, once `HttpOnline`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_shut_down(&self) -> bool {
        self.handle.shared.is_stopped()
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn status(&self) -> ServerStatus {
        self.handle.status()
    }

    pub fn connection_count(&self) -> usize {
        self.handle.connection_count()
    }

    pub fn register_file(&self, name: impl Into<String>, source: FileSource) {
        self.handle.register_file(name, source);
    }

    pub fn on_event(&self, handler: impl EventHandler) {
        self.handle.on_event(handler);
    }

    pub fn send(&self, id: ConnectionId, text: &str) -> Result<(), MapcastError> {
        self.handle.send(id, text)
    }

    pub fn send_typed<T: Serialize + ?Sized>(
        &self,
        id: ConnectionId,
        kind: &str,
        data: &T,
    ) -> Result<(), MapcastError> {
        self.handle.send_typed(id, kind, data)
    }

    pub fn broadcast(&self, text: &str) -> usize {
        self.handle.broadcast(text)
    }

    pub fn broadcast_typed<T: Serialize + ?Sized>(
        &self,
        kind: &str,
        data: &T,
    ) -> Result<usize, MapcastError> {
        self.handle.broadcast_typed(kind, data)
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        // Without an explicit shutdown, at least release the port and tell
        // the peers; close events still follow from their tasks.
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        let shared = &self.handle.shared;
        if !shared.stopped.swap(true, Ordering::AcqRel) {
            shared.registry.close_all();
        }
    }
}
