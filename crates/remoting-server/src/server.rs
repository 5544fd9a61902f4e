use std::net::SocketAddr;
use std::sync::Arc;

use remoting_common::protocol::error::Result;
use remoting_common::transport::TransportServer;

use crate::broker::{EventBroker, EventHub, RpcServerConfig};
use crate::service::Service;

/// A service exposed over a transport server.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use remoting_common::transport::TransportServerConfig;
/// use remoting_server::{MethodRouter, RpcServer, RpcServerConfig};
/// use serde_json::json;
///
/// # async fn example() -> remoting_common::Result<()> {
/// let service = MethodRouter::new().method("ping", |_| Ok(json!("pong")));
/// let config = RpcServerConfig::new(TransportServerConfig::with_port(9000));
/// let server = RpcServer::register(Arc::new(service), config).await?;
/// println!("listening on {}", server.local_addr());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcServer {
    transport: TransportServer,
    broker: EventBroker,
}

impl RpcServer {
    /// Binds the service's events to a broker and starts accepting.
    pub async fn register(service: Arc<dyn Service>, config: RpcServerConfig) -> Result<Self> {
        let broker = EventBroker::new(service.clone(), config.clone());
        service.bind_events(broker.hub());

        let transport = TransportServer::start(config.transport, Arc::new(broker.clone())).await?;
        tracing::info!(
            addr = %transport.local_addr(),
            compute = ?broker.config().compute,
            "RPC server registered"
        );

        Ok(RpcServer { transport, broker })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn transport(&self) -> &TransportServer {
        &self.transport
    }

    pub fn broker(&self) -> &EventBroker {
        &self.broker
    }

    pub fn hub(&self) -> EventHub {
        self.broker.hub()
    }

    /// Stops accepting and closes every connection.
    pub fn shutdown(&self) {
        tracing::info!(addr = %self.local_addr(), "RPC server shutting down");
        self.transport.shutdown();
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("local_addr", &self.local_addr())
            .field("connections", &self.transport.connection_count())
            .finish()
    }
}
