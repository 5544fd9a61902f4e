//! Accepting transport server.
//!
//! Accepts connections up to a capacity bound, tracks them by remote
//! address, and forwards per-connection events to one [`ServerHandler`].
//! Pings are echoed by the connection itself and never reach the handler.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::error::{RemotingError, Result};
use crate::protocol::Packet;
use crate::transport::client::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_TIMEOUT};
use crate::transport::connection::{
    Connection, ConnectionEvent, ConnectionHandle, ConnectionRole, IdleConfig,
};

/// Default maximum number of simultaneous connections
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Configuration for a [`TransportServer`].
#[derive(Debug, Clone)]
pub struct TransportServerConfig {
    pub bind_addr: SocketAddr,
    /// Connections accepted beyond this are closed immediately
    pub capacity: usize,
    /// Read-idle window per connection
    pub heartbeat_timeout: Duration,
    /// Bound on server-side rendezvous waits
    pub connect_timeout: Duration,
}

impl TransportServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        TransportServerConfig {
            bind_addr,
            capacity: DEFAULT_CAPACITY,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Listens on every interface at `port`.
    pub fn with_port(port: u16) -> Self {
        Self::new(SocketAddr::from(([0, 0, 0, 0], port)))
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Callbacks from a [`TransportServer`].
///
/// Callbacks for one connection run in order on that connection's task.
pub trait ServerHandler: Send + Sync + 'static {
    fn on_connected(&self, _connection: &ConnectionHandle) {}

    fn on_disconnected(&self, _connection: &ConnectionHandle) {}

    fn on_receive(&self, connection: &ConnectionHandle, packet: Packet);

    fn on_error(&self, _connection: &ConnectionHandle, _error: &RemotingError) {}
}

struct ServerInner {
    config: TransportServerConfig,
    local_addr: SocketAddr,
    connections: Mutex<HashMap<SocketAddr, ConnectionHandle>>,
    handler: Arc<dyn ServerHandler>,
    started: AtomicBool,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// A TCP server accepting framed connections.
#[derive(Clone)]
pub struct TransportServer {
    inner: Arc<ServerInner>,
}

impl TransportServer {
    /// Binds and starts accepting.
    ///
    /// # Arguments
    /// * `config` - Bind address, capacity and heartbeat settings
    /// * `handler` - Receives every connection's events
    pub async fn start(config: TransportServerConfig, handler: Arc<dyn ServerHandler>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            RemotingError::Connection(format!("Failed to bind to {}: {}", config.bind_addr, e))
        })?;
        let local_addr = listener.local_addr()?;

        let server = TransportServer {
            inner: Arc::new(ServerInner {
                config,
                local_addr,
                connections: Mutex::new(HashMap::new()),
                handler,
                started: AtomicBool::new(true),
                accept_task: Mutex::new(None),
            }),
        };

        let task = tokio::spawn(server.clone().accept_loop(listener));
        *server.inner.accept_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        tracing::info!(addr = %local_addr, capacity = server.inner.config.capacity, "Transport server listening");
        Ok(server)
    }

    pub fn config(&self) -> &TransportServerConfig {
        &self.inner.config
    }

    /// Actual bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Sends a packet to the connection at `remote`.
    ///
    /// # Errors
    ///
    /// Returns [`RemotingError::ClientDisconnected`] if no such connection is
    /// tracked or it has closed.
    pub fn send(&self, remote: SocketAddr, packet: impl Into<Packet>) -> Result<()> {
        match self.connection(remote) {
            Some(conn) => conn.send(packet),
            None => Err(RemotingError::disconnected(remote)),
        }
    }

    pub fn connection(&self, remote: SocketAddr) -> Option<ConnectionHandle> {
        self.lock_connections().get(&remote).cloned()
    }

    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.lock_connections().values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.lock_connections().len()
    }

    /// Remote addresses of every connection, tab separated, three per line.
    pub fn dump_clients(&self) -> String {
        let mut addrs: Vec<SocketAddr> = self.lock_connections().keys().copied().collect();
        addrs.sort();
        addrs
            .chunks(3)
            .map(|line| {
                line.iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join("\t")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Stops accepting and closes every connection.
    pub fn shutdown(&self) {
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.inner.accept_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        for conn in self.connections() {
            conn.close();
        }
        tracing::info!(addr = %self.inner.local_addr, "Transport server stopped");
    }

    fn lock_connections(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, ConnectionHandle>> {
        self.inner.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn accept_loop(self, listener: TcpListener) {
        let idle = IdleConfig::server(self.inner.config.heartbeat_timeout);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            let current = self.connection_count();
            let capacity = self.inner.config.capacity;
            if current >= capacity {
                let err = RemotingError::CapacityExceeded { current, capacity };
                tracing::warn!(remote = %peer_addr, "{}, closing", err);
                drop(stream);
                continue;
            }

            let (conn, events) = match Connection::spawn(stream, idle, ConnectionRole::Server) {
                Ok(spawned) => spawned,
                Err(e) => {
                    tracing::warn!(remote = %peer_addr, error = %e, "Failed to set up connection");
                    continue;
                }
            };

            self.lock_connections().insert(peer_addr, conn.clone());
            tracing::debug!(remote = %peer_addr, "Connection established");
            tokio::spawn(self.clone().serve_connection(conn, events));
        }
    }

    async fn serve_connection(self, conn: ConnectionHandle, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        let handler = Arc::clone(&self.inner.handler);
        handler.on_connected(&conn);

        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Received(packet) => handler.on_receive(&conn, packet),
                ConnectionEvent::Error(e) => handler.on_error(&conn, &e),
                ConnectionEvent::IdleRead => {
                    tracing::warn!(remote = %conn.remote_addr(), "Client heartbeat lost, closing");
                }
                ConnectionEvent::IdleWrite => {}
                ConnectionEvent::Closed => break,
            }
        }

        {
            let mut connections = self.lock_connections();
            if connections
                .get(&conn.remote_addr())
                .is_some_and(|tracked| tracked.same(&conn))
            {
                connections.remove(&conn.remote_addr());
            }
        }
        tracing::debug!(remote = %conn.remote_addr(), "Connection removed");
        handler.on_disconnected(&conn);
    }
}

impl std::fmt::Debug for TransportServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportServer")
            .field("local_addr", &self.inner.local_addr)
            .field("started", &self.is_started())
            .finish()
    }
}
