//! Long-lived, reconnecting transport client.
//!
//! # State machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected
//!                                         -> Reconnecting -> Connecting -> ...
//! ```
//!
//! After an established connection drops, and while reconnect is enabled,
//! the client retries with exponential backoff. On success the registered
//! [`ClientHandler::on_reconnected`] runs *before* the state flips back to
//! `Connected`, so anything it sends (handshake, re-subscriptions) is queued
//! ahead of traffic from waiting callers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::protocol::error::{RemotingError, Result};
use crate::protocol::Packet;
use crate::transport::connection::{
    Connection, ConnectionEvent, ConnectionHandle, ConnectionRole, IdleConfig,
};

/// Default time to wait for a connection to be established
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(16);

/// Default time `send` waits for a reconnect before giving up
pub const DEFAULT_WAIT_CONNECT: Duration = Duration::from_secs(4);

/// Default heartbeat window
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection state of a [`TransportClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Configuration for a [`TransportClient`].
#[derive(Debug, Clone)]
pub struct TransportClientConfig {
    /// Address of the server this client talks to
    pub server_addr: SocketAddr,
    /// Bound on `connect` and on a single call's wait
    pub connect_timeout: Duration,
    /// How long `send` waits for a reconnect
    pub wait_connect: Duration,
    /// Read-idle window; pings are sent at half of it
    pub heartbeat_timeout: Duration,
    pub enable_reconnect: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl TransportClientConfig {
    pub fn new(server_addr: SocketAddr) -> Self {
        TransportClientConfig {
            server_addr,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            wait_connect: DEFAULT_WAIT_CONNECT,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            enable_reconnect: true,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_wait_connect(mut self, wait: Duration) -> Self {
        self.wait_connect = wait;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.enable_reconnect = enabled;
        self
    }
}

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            current: initial,
            max,
        }
    }

    /// Returns the delay for this attempt and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// Callbacks from a [`TransportClient`].
///
/// Callbacks run on the client's event task and must not block.
pub trait ClientHandler: Send + Sync {
    fn on_receive(&self, client: &TransportClient, packet: Packet);

    /// The first connection is up. Runs before `connect` returns.
    fn on_connected(&self, _client: &TransportClient) -> Result<()> {
        Ok(())
    }

    /// A reconnect attempt to `endpoint` is about to start.
    fn on_reconnecting(&self, _endpoint: SocketAddr) {}

    /// A replacement connection is up. Runs before the state becomes `Connected`.
    fn on_reconnected(&self, _client: &TransportClient) -> Result<()> {
        Ok(())
    }

    fn on_disconnected(&self, _client: &TransportClient) {}

    fn on_error(&self, _client: &TransportClient, _error: &RemotingError) {}
}

struct ClientInner {
    config: TransportClientConfig,
    endpoint: Mutex<Option<SocketAddr>>,
    current: Mutex<Option<ConnectionHandle>>,
    handler: RwLock<Option<Arc<dyn ClientHandler>>>,
    state: watch::Sender<ClientState>,
    reconnect: AtomicBool,
    reconnecting: AtomicBool,
    closed: AtomicBool,
    /// Id of the last connection marked by [`TransportClient::mark_initialized`]
    initialized: AtomicU64,
}

/// A reconnecting TCP client.
///
/// # Example
///
/// ```no_run
/// use remoting_common::transport::{TransportClient, TransportClientConfig};
/// use remoting_common::protocol::Ping;
///
/// # async fn example() -> remoting_common::protocol::Result<()> {
/// let addr = "127.0.0.1:9000".parse()?;
/// let client = TransportClient::new(TransportClientConfig::new(addr));
/// client.connect(addr).await?;
/// client.send(Ping::now()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<ClientInner>,
}

impl TransportClient {
    pub fn new(config: TransportClientConfig) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        let reconnect = config.enable_reconnect;
        TransportClient {
            inner: Arc::new(ClientInner {
                config,
                endpoint: Mutex::new(None),
                current: Mutex::new(None),
                handler: RwLock::new(None),
                state,
                reconnect: AtomicBool::new(reconnect),
                reconnecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                initialized: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &TransportClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
            && self.current_connection().is_some_and(|c| c.is_connected())
    }

    pub fn is_reconnect_enabled(&self) -> bool {
        self.inner.reconnect.load(Ordering::Acquire)
    }

    /// Address of the last successful or attempted connect.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.inner.endpoint.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Local address of the current connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.current_connection().map(|c| c.local_addr())
    }

    /// Id of the current connection.
    pub fn connection_id(&self) -> Option<u64> {
        self.current_connection().map(|c| c.id())
    }

    /// Marks the current connection as initialized.
    ///
    /// Returns `true` only the first time for a given connection, so
    /// per-connection setup runs once however many callers borrow the
    /// client. Returns `false` when no connection is installed.
    pub fn mark_initialized(&self) -> bool {
        let Some(id) = self.connection_id() else {
            return false;
        };
        self.inner.initialized.swap(id, Ordering::AcqRel) != id
    }

    /// Subscribes to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    pub fn set_handler(&self, handler: Arc<dyn ClientHandler>) {
        *self.inner.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Detaches the handler; later events are dropped.
    pub fn clear_handler(&self) {
        *self.inner.handler.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Enables or disables automatic reconnect.
    ///
    /// Disabling wakes every caller waiting in [`send`](Self::send) with a
    /// disconnected error.
    pub fn set_reconnect(&self, enabled: bool) {
        self.inner.reconnect.store(enabled, Ordering::Release);
        self.inner.state.send_modify(|_| {});
    }

    /// Connects to `addr`, waiting up to the connect timeout.
    ///
    /// # Errors
    ///
    /// - [`RemotingError::AlreadyConnected`] if a connection is up
    /// - [`RemotingError::ConnectTimeout`] if the server did not accept in time
    pub async fn connect(&self, addr: SocketAddr) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RemotingError::Closed(format!("TransportClient({})", addr)));
        }
        if self.is_connected() {
            return Err(RemotingError::AlreadyConnected(addr.to_string()));
        }

        *self.inner.endpoint.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);
        self.inner.state.send_replace(ClientState::Connecting);
        let mut attempt = ConnectAttempt::new(&self.inner.state);

        let stream = match self.open(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                self.inner.state.send_replace(ClientState::Disconnected);
                return Err(e);
            }
        };
        if let Err(e) = self.install(stream) {
            self.inner.state.send_replace(ClientState::Disconnected);
            return Err(e);
        }

        if let Some(handler) = self.handler() {
            if let Err(e) = handler.on_connected(self) {
                tracing::error!(remote = %addr, error = %e, "Connect initializer failed");
                self.close_current();
                self.inner.state.send_replace(ClientState::Disconnected);
                return Err(e);
            }
        }

        attempt.settle();
        self.inner.state.send_replace(ClientState::Connected);
        tracing::info!(remote = %addr, "Connected");
        Ok(())
    }

    /// Starts connecting in the background.
    pub fn connect_async(&self, addr: SocketAddr) -> ConnectHandle {
        let client = self.clone();
        ConnectHandle {
            task: tokio::spawn(async move { client.connect(addr).await }),
        }
    }

    /// Sends a packet, waiting for a reconnect if one is in progress.
    ///
    /// # Errors
    ///
    /// Returns [`RemotingError::ClientDisconnected`] immediately when
    /// disconnected with reconnect disabled, or after the wait-connect window
    /// when the connection does not come back.
    pub async fn send(&self, packet: impl Into<Packet>) -> Result<()> {
        let packet = packet.into();
        if self.is_connected() {
            return self.send_now(packet);
        }
        if !self.is_reconnect_enabled() || self.inner.closed.load(Ordering::Acquire) {
            return Err(self.disconnected());
        }

        let mut state = self.watch_state();
        let inner = Arc::clone(&self.inner);
        let wait = state.wait_for(|s| {
            *s == ClientState::Connected
                || !inner.reconnect.load(Ordering::Acquire)
                || inner.closed.load(Ordering::Acquire)
        });
        let woke = matches!(
            tokio::time::timeout(self.inner.config.wait_connect, wait).await,
            Ok(Ok(_))
        );
        if woke && self.is_connected() {
            self.send_now(packet)
        } else {
            Err(self.disconnected())
        }
    }

    /// Writes to the current connection without waiting.
    pub fn send_now(&self, packet: impl Into<Packet>) -> Result<()> {
        match self.current_connection() {
            Some(conn) => conn.send(packet),
            None => Err(self.disconnected()),
        }
    }

    /// Disables reconnect and closes the connection for good.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.set_reconnect(false);
        self.close_current();
        self.inner.state.send_replace(ClientState::Disconnected);
    }

    /// Closes the current connection; reconnect follows if enabled.
    pub fn disconnect(&self) {
        self.close_current();
    }

    fn handler(&self) -> Option<Arc<dyn ClientHandler>> {
        self.inner
            .handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn current_connection(&self) -> Option<ConnectionHandle> {
        self.inner
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn close_current(&self) {
        if let Some(conn) = self.current_connection() {
            conn.close();
        }
    }

    fn disconnected(&self) -> RemotingError {
        match self.endpoint() {
            Some(addr) => RemotingError::disconnected(addr),
            None => RemotingError::disconnected(self.inner.config.server_addr),
        }
    }

    async fn open(&self, addr: SocketAddr) -> Result<TcpStream> {
        let timeout = self.inner.config.connect_timeout;
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => {
                tracing::debug!(remote = %addr, error = %e, "Connect failed");
                Err(RemotingError::Connection(format!(
                    "Failed to connect to {}: {}",
                    addr, e
                )))
            }
            Err(_) => Err(RemotingError::connect_timeout(addr, timeout)),
        }
    }

    fn install(&self, stream: TcpStream) -> Result<()> {
        let idle = IdleConfig::client(self.inner.config.heartbeat_timeout);
        let (conn, events) = Connection::spawn(stream, idle, ConnectionRole::Client)?;
        *self.inner.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(conn.clone());
        tokio::spawn(self.clone().pump(conn, events));
        Ok(())
    }

    async fn pump(self, conn: ConnectionHandle, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Received(packet) => {
                    if let Some(handler) = self.handler() {
                        handler.on_receive(&self, packet);
                    }
                }
                ConnectionEvent::Error(e) => {
                    if let Some(handler) = self.handler() {
                        handler.on_error(&self, &e);
                    }
                }
                ConnectionEvent::IdleRead => {
                    tracing::warn!(remote = %conn.remote_addr(), "Heartbeat lost");
                }
                ConnectionEvent::IdleWrite => {}
                ConnectionEvent::Closed => break,
            }
        }

        let is_current = self
            .current_connection()
            .is_some_and(|current| current.same(&conn));
        if !is_current {
            return;
        }

        self.inner.state.send_replace(ClientState::Disconnected);
        tracing::info!(remote = %conn.remote_addr(), "Disconnected");
        if let Some(handler) = self.handler() {
            handler.on_disconnected(&self);
        }

        if self.is_reconnect_enabled() && !self.inner.closed.load(Ordering::Acquire) {
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(&self) {
        if self.inner.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let client = self.clone();
        tokio::spawn(async move {
            client.reconnect_loop().await;
            client.inner.reconnecting.store(false, Ordering::Release);
        });
    }

    async fn reconnect_loop(&self) {
        let Some(addr) = self.endpoint() else {
            return;
        };
        let config = &self.inner.config;
        let mut backoff = Backoff::new(config.initial_backoff, config.max_backoff);

        loop {
            if !self.is_reconnect_enabled() || self.inner.closed.load(Ordering::Acquire) {
                self.inner.state.send_replace(ClientState::Disconnected);
                return;
            }

            self.inner.state.send_replace(ClientState::Reconnecting);
            if let Some(handler) = self.handler() {
                handler.on_reconnecting(addr);
            }
            let delay = backoff.next_delay();
            tracing::info!(remote = %addr, delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::time::sleep(delay).await;

            if !self.is_reconnect_enabled() || self.inner.closed.load(Ordering::Acquire) {
                self.inner.state.send_replace(ClientState::Disconnected);
                return;
            }

            self.inner.state.send_replace(ClientState::Connecting);
            let stream = match self.open(addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(remote = %addr, error = %e, "Reconnect attempt failed");
                    continue;
                }
            };
            if let Err(e) = self.install(stream) {
                tracing::debug!(remote = %addr, error = %e, "Reconnect attempt failed");
                continue;
            }

            if let Some(handler) = self.handler() {
                if let Err(e) = handler.on_reconnected(self) {
                    tracing::error!(remote = %addr, error = %e, "Reconnect initializer failed");
                    self.close_current();
                    continue;
                }
            }

            self.inner.state.send_replace(ClientState::Connected);
            tracing::info!(remote = %addr, "Reconnected");
            return;
        }
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .finish()
    }
}

/// Puts a `Connecting` state back to `Disconnected` when a connect future
/// is dropped before it finishes.
struct ConnectAttempt<'a> {
    state: &'a watch::Sender<ClientState>,
    settled: bool,
}

impl<'a> ConnectAttempt<'a> {
    fn new(state: &'a watch::Sender<ClientState>) -> Self {
        ConnectAttempt { state, settled: false }
    }

    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.state.send_if_modified(|state| {
            if *state == ClientState::Connecting {
                *state = ClientState::Disconnected;
                true
            } else {
                false
            }
        });
    }
}

/// A background connect that can be awaited or cancelled.
pub struct ConnectHandle {
    task: JoinHandle<Result<()>>,
}

impl ConnectHandle {
    pub async fn wait(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(RemotingError::Closed("connect".into())),
            Err(e) => Err(RemotingError::Connection(e.to_string())),
        }
    }

    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
