use std::net::SocketAddr;
use std::sync::Arc;

use remoting_common::protocol::error::Result;
use remoting_common::transport::{TransportClient, TransportClientConfig};

use crate::pool::PoolMode;

/// Extra initializer run after every (re)connect, once the handshake and
/// re-subscriptions are queued.
pub type InitHook = Arc<dyn Fn(&TransportClient) -> Result<()> + Send + Sync>;

/// Configuration for a [`Facade`](crate::Facade).
///
/// # Example
///
/// ```rust
/// use remoting_client::{PoolMode, RpcClientConfig};
///
/// let addr = "127.0.0.1:9000".parse().unwrap();
/// let config = RpcClientConfig::stateful(addr, 2).with_trace_id("req-1");
/// assert_eq!(config.pool, PoolMode::NonPooled);
/// assert_eq!(config.event_version, 2);
/// ```
#[derive(Clone)]
pub struct RpcClientConfig {
    pub transport: TransportClientConfig,
    pub pool: PoolMode,
    /// Declared in the handshake; drives compute election and broadcast filtering
    pub event_version: i32,
    pub init_hook: Option<InitHook>,
    /// Propagated on every method call
    pub trace_id: Option<String>,
}

impl RpcClientConfig {
    pub fn new(transport: TransportClientConfig, pool: PoolMode) -> Self {
        Self {
            transport,
            pool,
            event_version: 0,
            init_hook: None,
            trace_id: None,
        }
    }

    /// One long-lived reconnecting connection; required for events.
    pub fn stateful(server_addr: SocketAddr, event_version: i32) -> Self {
        Self {
            event_version,
            ..Self::new(TransportClientConfig::new(server_addr), PoolMode::NonPooled)
        }
    }

    /// Bounded pool of connections for stateless calls.
    pub fn pooled(server_addr: SocketAddr, min_size: usize, max_size: usize) -> Self {
        Self::new(
            TransportClientConfig::new(server_addr),
            PoolMode::Pooled { min_size, max_size },
        )
    }

    pub fn with_transport(mut self, transport: TransportClientConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_event_version(mut self, event_version: i32) -> Self {
        self.event_version = event_version;
        self
    }

    pub fn with_init_hook(mut self, hook: InitHook) -> Self {
        self.init_hook = Some(hook);
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.transport.server_addr
    }
}

impl std::fmt::Debug for RpcClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClientConfig")
            .field("transport", &self.transport)
            .field("pool", &self.pool)
            .field("event_version", &self.event_version)
            .field("init_hook", &self.init_hook.is_some())
            .field("trace_id", &self.trace_id)
            .finish()
    }
}
