use remoting_common::protocol::error::{RemotingError, Result};
use remoting_common::transport::{TransportClient, TransportClientConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// How a facade obtains its transport clients.
///
/// # Modes
///
/// - `Pooled`: a bounded set of clients shared by stateless callers. Each
///   call borrows a client and gives it back once nothing is pending on it.
/// - `NonPooled`: every borrow opens a fresh client; the caller keeps it for
///   as long as it is usable. Used for stateful facades whose server-side
///   session (subscriptions) must survive between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolMode {
    Pooled { min_size: usize, max_size: usize },
    NonPooled,
}

impl PoolMode {
    pub fn is_pooled(&self) -> bool {
        matches!(self, PoolMode::Pooled { .. })
    }
}

impl Default for PoolMode {
    fn default() -> Self {
        PoolMode::NonPooled
    }
}

/// Bounded pool of [`TransportClient`]s for one server address.
///
/// # Architecture
///
/// - Idle clients are kept on a stack and reused LIFO
/// - A client is validated on borrow (must be connected) and on return
///   (must be connected or able to reconnect)
/// - Destroying a client detaches its handler and closes its socket
/// - When the pool is at `max_size`, borrowers wait in a short sleep loop
///   until a client comes back or the connect timeout elapses
///
/// # Example
///
/// ```rust,no_run
/// use remoting_client::{ClientPool, PoolMode};
/// use remoting_common::transport::TransportClientConfig;
///
/// # async fn example() -> remoting_common::protocol::Result<()> {
/// let config = TransportClientConfig::new("127.0.0.1:9000".parse()?);
/// let pool = ClientPool::new(config, PoolMode::Pooled { min_size: 1, max_size: 4 });
///
/// let client = pool.borrow().await?;
/// // Use the client...
/// pool.return_client(client).await;
/// # Ok(())
/// # }
/// ```
pub struct ClientPool {
    config: TransportClientConfig,
    mode: PoolMode,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    idle: Vec<TransportClient>,
    /// Clients created by this pool and not yet destroyed (idle + borrowed)
    total: usize,
    closed: bool,
}

impl ClientPool {
    pub fn new(config: TransportClientConfig, mode: PoolMode) -> Self {
        Self {
            config,
            mode,
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                total: 0,
                closed: false,
            }),
        }
    }

    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    pub fn config(&self) -> &TransportClientConfig {
        &self.config
    }

    pub async fn idle_count(&self) -> usize {
        self.inner.lock().await.idle.len()
    }

    pub async fn total_count(&self) -> usize {
        self.inner.lock().await.total
    }

    /// Borrows a connected client.
    ///
    /// This method implements the following strategy:
    ///
    /// 1. Pop idle clients (LIFO) until a connected one is found; destroy the rest
    /// 2. If under `max_size`, connect a new client
    /// 3. If at the limit, wait and retry until the connect timeout
    ///
    /// # Errors
    ///
    /// - [`RemotingError::PoolTimeout`] if the pool stays full
    /// - [`RemotingError::ConnectTimeout`] / [`RemotingError::Connection`] if
    ///   the new client cannot connect
    pub async fn borrow(&self) -> Result<TransportClient> {
        let max_size = match self.mode {
            PoolMode::NonPooled => return self.create().await,
            PoolMode::Pooled { min_size, max_size } => max_size.max(min_size).max(1),
        };

        let timeout = self.config.connect_timeout;
        let start = Instant::now();

        loop {
            if start.elapsed() >= timeout {
                return Err(RemotingError::PoolTimeout(timeout.as_millis() as u64));
            }

            {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return Err(RemotingError::Closed("ClientPool".into()));
                }

                while let Some(client) = inner.idle.pop() {
                    if client.is_connected() {
                        return Ok(client);
                    }
                    tracing::debug!(
                        remote = %self.config.server_addr,
                        "Removing invalid client from pool"
                    );
                    Self::destroy(&client);
                    inner.total -= 1;
                }

                if inner.total < max_size {
                    inner.total += 1;
                    break;
                }
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        match self.create().await {
            Ok(client) => Ok(client),
            Err(e) => {
                self.inner.lock().await.total -= 1;
                Err(e)
            }
        }
    }

    /// Gives a client back.
    ///
    /// In pooled mode a client that is connected, or able to reconnect, goes
    /// back on the idle stack; anything else is destroyed. In non-pooled mode
    /// an unusable client is destroyed and a usable one is left to its owner.
    pub async fn return_client(&self, client: TransportClient) {
        let usable = Self::is_usable(&client);
        if !self.mode.is_pooled() {
            if !usable {
                Self::destroy(&client);
            }
            return;
        }

        client.clear_handler();
        let mut inner = self.inner.lock().await;
        if usable && !inner.closed {
            inner.idle.push(client);
        } else {
            Self::destroy(&client);
            inner.total = inner.total.saturating_sub(1);
        }
    }

    /// Forgets a borrowed client and closes it.
    pub async fn invalidate(&self, client: TransportClient) {
        Self::destroy(&client);
        if self.mode.is_pooled() {
            let mut inner = self.inner.lock().await;
            inner.total = inner.total.saturating_sub(1);
        }
    }

    /// Pre-connects `min_size` idle clients in the background.
    pub fn spawn_warm_up(self: &Arc<Self>) {
        let PoolMode::Pooled { min_size, .. } = self.mode else {
            return;
        };
        if min_size == 0 {
            return;
        }

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            for _ in 0..min_size {
                {
                    let mut inner = pool.inner.lock().await;
                    if inner.closed || inner.total >= min_size {
                        return;
                    }
                    inner.total += 1;
                }

                match pool.create().await {
                    Ok(client) => pool.inner.lock().await.idle.push(client),
                    Err(e) => {
                        pool.inner.lock().await.total -= 1;
                        tracing::warn!(remote = %pool.config.server_addr, error = %e, "Pool warm-up failed");
                        return;
                    }
                }
            }
            tracing::debug!(remote = %pool.config.server_addr, min_size, "Pool warmed up");
        });
    }

    /// Destroys every idle client and refuses further borrows.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        for client in inner.idle.drain(..) {
            Self::destroy(&client);
        }
        inner.total = 0;
    }

    /// Detaches every hook and closes the socket.
    pub fn destroy(client: &TransportClient) {
        client.clear_handler();
        client.close();
    }

    /// Connected, or configured to come back on its own.
    pub fn is_usable(client: &TransportClient) -> bool {
        client.is_connected() || client.is_reconnect_enabled()
    }

    async fn create(&self) -> Result<TransportClient> {
        let client = TransportClient::new(self.config.clone());
        client.connect(self.config.server_addr).await?;
        Ok(client)
    }
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("server_addr", &self.config.server_addr)
            .field("mode", &self.mode)
            .finish()
    }
}
