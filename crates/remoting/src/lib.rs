//! # Remoting
//!
//! RPC runtime over framed TCP: correlated method calls and a
//! publish/compute/broadcast event protocol.
//!
//! This crate owns the [`Runtime`] registry that ties the pieces together:
//!
//! - client pools shared by every facade targeting the same server and pool
//!   mode
//! - named services registered on their own listening ports
//!
//! The protocol, client and server crates are re-exported as [`common`],
//! [`client`] and [`server`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use remoting::{MethodRouter, RpcClientConfig, RpcServerConfig, Runtime, TransportServerConfig};
//! use serde_json::json;
//!
//! # async fn example() -> remoting::Result<()> {
//! let runtime = Runtime::new();
//!
//! let service = MethodRouter::new().method("ping", |_| Ok(json!("pong")));
//! let config = RpcServerConfig::new(TransportServerConfig::with_port(9000));
//! let server = runtime.register("ping", Arc::new(service), config).await?;
//!
//! let facade = runtime.facade(RpcClientConfig::pooled(server.local_addr(), 1, 8));
//! assert_eq!(facade.invoke("ping", vec![]).await?, json!("pong"));
//!
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

pub use remoting_client as client;
pub use remoting_common as common;
pub use remoting_server as server;

pub use remoting_client::{ClientPool, EventContext, Facade, PoolMode, RpcClientConfig};
pub use remoting_common::transport::{TransportClientConfig, TransportServerConfig};
pub use remoting_common::{RemotingError, Result};
pub use remoting_server::{
    ComputePolicy, EventHub, MethodRouter, RpcServer, RpcServerConfig, Service, ServiceError,
};

/// Identifies a shared client pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub server_addr: SocketAddr,
    pub mode: PoolMode,
}

impl PoolKey {
    pub fn of(config: &RpcClientConfig) -> Self {
        PoolKey {
            server_addr: config.server_addr(),
            mode: config.pool,
        }
    }
}

/// Registry of client pools and registered services.
///
/// A pool is created by the first facade asking for its [`PoolKey`] and
/// keeps that facade's transport settings. Services are registered under
/// unique names.
#[derive(Default)]
pub struct Runtime {
    pools: Mutex<HashMap<PoolKey, Arc<ClientPool>>>,
    servers: Mutex<HashMap<String, RpcServer>>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared pool for `config`, creating and warming it up on
    /// first use. Must be called within a tokio runtime.
    pub fn pool(&self, config: &RpcClientConfig) -> Arc<ClientPool> {
        let key = PoolKey::of(config);
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools
            .entry(key)
            .or_insert_with(|| {
                tracing::info!(remote = %key.server_addr, mode = ?key.mode, "Creating client pool");
                let pool = Arc::new(ClientPool::new(config.transport.clone(), config.pool));
                pool.spawn_warm_up();
                pool
            })
            .clone()
    }

    /// Builds a facade borrowing from the shared pool for its key.
    pub fn facade(&self, config: RpcClientConfig) -> Facade {
        let pool = self.pool(&config);
        Facade::with_pool(config, pool)
    }

    pub fn pool_count(&self) -> usize {
        self.pools.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Starts `service` and records it under `name`.
    pub async fn register(
        &self,
        name: impl Into<String>,
        service: Arc<dyn Service>,
        config: RpcServerConfig,
    ) -> Result<RpcServer> {
        let name = name.into();
        if self.server(&name).is_some() {
            return Err(RemotingError::InvalidRequest(format!(
                "Service already registered: {}",
                name
            )));
        }

        let server = RpcServer::register(service, config).await?;
        let mut servers = self.servers.lock().unwrap_or_else(|e| e.into_inner());
        if servers.contains_key(&name) {
            server.shutdown();
            return Err(RemotingError::InvalidRequest(format!(
                "Service already registered: {}",
                name
            )));
        }
        tracing::info!(service = %name, addr = %server.local_addr(), "Service registered");
        servers.insert(name, server.clone());
        Ok(server)
    }

    pub fn server(&self, name: &str) -> Option<RpcServer> {
        self.servers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .servers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Stops every registered service and closes every pool.
    pub async fn shutdown(&self) {
        let servers: Vec<(String, RpcServer)> = self
            .servers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (name, server) in servers {
            tracing::info!(service = %name, "Stopping service");
            server.shutdown();
        }

        let pools: Vec<Arc<ClientPool>> = self
            .pools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, pool)| pool)
            .collect();
        for pool in pools {
            pool.close().await;
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("pools", &self.pool_count())
            .field("servers", &self.server_names())
            .finish()
    }
}

#[cfg(test)]
mod tests;
