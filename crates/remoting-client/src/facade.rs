//! Client-side RPC facade.
//!
//! A [`Facade`] turns calls into [`MethodCall`] packets, correlates replies by
//! call id, and layers the event protocol (subscribe, unsubscribe, publish)
//! on the same transport.
//!
//! # Correlation
//!
//! Every transport client used by a facade carries a binding that owns its
//! pending-call table. A reply completes the entry with the same id at most
//! once; later replies for that id are logged and dropped. After a reconnect
//! the binding re-sends the handshake, every local subscription, and every
//! still-pending call before the client reports itself connected again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use remoting_common::protocol::error::{RemotingError, Result};
use remoting_common::protocol::{
    CallId, CallIdGenerator, EventFlag, EventPacket, HandshakeMetadata, MethodCall, Packet, Value,
};
use remoting_common::transport::{ClientHandler, TransportClient};
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::config::RpcClientConfig;
use crate::pool::ClientPool;

/// Context passed to a local event handler.
///
/// `is_compute` is set while the handler runs on behalf of a server
/// `ComputeArgs` request. A publish made with such a context is the compute
/// result, not a new event, and is never sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    pub event_name: String,
    pub is_compute: bool,
}

impl EventContext {
    pub fn local(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            is_compute: false,
        }
    }

    pub fn compute(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            is_compute: true,
        }
    }
}

/// Local event handler. Mutations to the payload are what gets sent back
/// for a compute request.
pub type EventHandler = Arc<dyn Fn(&EventContext, &mut Value) + Send + Sync>;

struct PendingCall {
    call: MethodCall,
    signal: oneshot::Sender<Result<MethodCall>>,
}

/// Per-client correlation table and event hooks.
struct Binding {
    facade: Weak<FacadeInner>,
    pending: Mutex<HashMap<CallId, PendingCall>>,
    /// Set for pooled clients, which go back to the pool once idle
    pool: Option<Arc<ClientPool>>,
}

impl Binding {
    fn new(facade: Weak<FacadeInner>, pool: Option<Arc<ClientPool>>) -> Self {
        Self {
            facade,
            pending: Mutex::new(HashMap::new()),
            pool,
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<CallId, PendingCall>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, call: MethodCall) -> oneshot::Receiver<Result<MethodCall>> {
        let (signal, waiter) = oneshot::channel();
        self.lock_pending().insert(call.id, PendingCall { call, signal });
        waiter
    }

    fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn complete(&self, client: &TransportClient, reply: MethodCall) {
        let id = reply.id;
        let entry = self.lock_pending().remove(&id);
        match entry {
            Some(pending) => {
                if pending.signal.send(Ok(reply)).is_err() {
                    tracing::debug!(id, "Reply arrived after the caller stopped waiting");
                    self.release_if_idle(client);
                }
            }
            None => {
                tracing::warn!(id, method = %reply.method_name, "Dropping uncorrelated reply");
            }
        }
    }

    /// Removes an entry whose caller gave up.
    fn abandon(&self, id: CallId) {
        self.lock_pending().remove(&id);
    }

    /// Hands an orphaned pooled client back from the event task.
    fn release_if_idle(&self, client: &TransportClient) {
        let Some(pool) = &self.pool else {
            return;
        };
        if self.pending_count() > 0 {
            return;
        }
        let pool = Arc::clone(pool);
        let client = client.clone();
        tokio::spawn(async move { pool.return_client(client).await });
    }

    /// Fails every pending call. Returns whether any caller was still
    /// waiting, or `None` if nothing was pending.
    fn fail_all(&self, client: &TransportClient) -> Option<bool> {
        let drained: Vec<PendingCall> = self.lock_pending().drain().map(|(_, p)| p).collect();
        if drained.is_empty() {
            return None;
        }
        tracing::debug!(count = drained.len(), "Failing pending calls");
        let addr = client
            .endpoint()
            .unwrap_or(client.config().server_addr);
        let mut waiting = false;
        for pending in drained {
            waiting |= pending
                .signal
                .send(Err(RemotingError::disconnected(addr)))
                .is_ok();
        }
        Some(waiting)
    }

    fn resend_pending(&self, client: &TransportClient) {
        let mut calls: Vec<MethodCall> = self
            .lock_pending()
            .values()
            .map(|p| p.call.clone())
            .collect();
        calls.sort_by_key(|c| c.id);

        for call in calls {
            let id = call.id;
            match client.send_now(call) {
                Ok(()) => tracing::debug!(id, "Re-sent pending call"),
                Err(e) => tracing::warn!(id, error = %e, "Failed to re-send pending call"),
            }
        }
    }
}

impl ClientHandler for Binding {
    fn on_receive(&self, client: &TransportClient, packet: Packet) {
        match packet {
            Packet::MethodCall(reply) => self.complete(client, reply),
            Packet::Event(event) => {
                if let Some(facade) = self.facade.upgrade() {
                    facade.on_event(client, event);
                }
            }
            other => tracing::debug!(kind = other.kind(), "Ignoring packet"),
        }
    }

    fn on_reconnecting(&self, endpoint: std::net::SocketAddr) {
        tracing::debug!(remote = %endpoint, pending = self.pending_count(), "Reconnecting with pending calls");
    }

    fn on_reconnected(&self, client: &TransportClient) -> Result<()> {
        if let Some(facade) = self.facade.upgrade() {
            facade.initialize(client)?;
        }
        self.resend_pending(client);
        Ok(())
    }

    fn on_disconnected(&self, client: &TransportClient) {
        if client.is_reconnect_enabled() {
            return;
        }
        // A waiting caller returns the client itself
        if self.fail_all(client) == Some(false) {
            self.release_if_idle(client);
        }
    }

    fn on_error(&self, client: &TransportClient, error: &RemotingError) {
        tracing::warn!(remote = ?client.endpoint(), error = %error, "Server reported error");
    }
}

#[derive(Clone)]
struct Bound {
    client: TransportClient,
    binding: Arc<Binding>,
}

struct FacadeInner {
    config: RpcClientConfig,
    pool: Arc<ClientPool>,
    /// Current stateful connection
    current: Mutex<Option<Bound>>,
    /// Serializes creation of the current connection
    connect_lock: tokio::sync::Mutex<()>,
    ids: CallIdGenerator,
    handlers: RwLock<HashMap<String, EventHandler>>,
}

impl FacadeInner {
    /// Handshake, re-subscriptions, then the user hook.
    ///
    /// Runs once per connection; a pooled client borrowed again skips it.
    fn initialize(&self, client: &TransportClient) -> Result<()> {
        if !client.mark_initialized() {
            return Ok(());
        }
        client.send_now(HandshakeMetadata {
            event_version: self.config.event_version,
        })?;

        let names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        for name in names {
            client.send_now(EventPacket::subscribe(name))?;
        }

        if let Some(hook) = &self.config.init_hook {
            hook(client)?;
        }
        Ok(())
    }

    fn handler(&self, event_name: &str) -> Option<EventHandler> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event_name)
            .cloned()
    }

    fn run_local(&self, ctx: &EventContext, payload: &mut Value) -> bool {
        match self.handler(&ctx.event_name) {
            Some(handler) => {
                handler(ctx, payload);
                true
            }
            None => false,
        }
    }

    fn on_event(&self, client: &TransportClient, mut event: EventPacket) {
        match event.flag {
            EventFlag::ComputeArgs => {
                let ctx = EventContext::compute(&event.event_name);
                if !self.run_local(&ctx, &mut event.payload) {
                    tracing::warn!(event = %event.event_name, "Compute requested without a local handler");
                }
                let name = event.event_name.clone();
                if let Err(e) = client.send_now(event) {
                    tracing::warn!(event = %name, error = %e, "Failed to send compute result");
                }
            }
            EventFlag::Broadcast => {
                let ctx = EventContext::local(&event.event_name);
                if !self.run_local(&ctx, &mut event.payload) {
                    tracing::debug!(event = %event.event_name, "Broadcast without a local handler");
                }
            }
            flag => {
                tracing::debug!(event = %event.event_name, ?flag, "Ignoring event packet");
            }
        }
    }

    fn current(&self) -> Option<Bound> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn usable_current(&self) -> Option<Bound> {
        self.current()
            .filter(|bound| ClientPool::is_usable(&bound.client))
    }

    fn take_current(&self) -> Option<Bound> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// RPC facade over a pooled or stateful transport.
///
/// # Example
///
/// ```rust,no_run
/// use remoting_client::{Facade, RpcClientConfig};
/// use serde_json::json;
///
/// # async fn example() -> remoting_common::protocol::Result<()> {
/// let facade = Facade::new(RpcClientConfig::stateful("127.0.0.1:9000".parse()?, 1));
///
/// let sum: i64 = facade.call("add", vec![json!(1), json!(2)]).await?;
/// assert_eq!(sum, 3);
///
/// facade.subscribe("price", |_ctx, payload| {
///     println!("price update: {}", payload);
/// }).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Facade {
    inner: Arc<FacadeInner>,
}

impl Facade {
    /// Creates a facade with its own pool.
    pub fn new(config: RpcClientConfig) -> Self {
        let pool = Arc::new(ClientPool::new(config.transport.clone(), config.pool));
        Self::with_pool(config, pool)
    }

    /// Creates a facade borrowing from a shared pool.
    pub fn with_pool(config: RpcClientConfig, pool: Arc<ClientPool>) -> Self {
        Self {
            inner: Arc::new(FacadeInner {
                config,
                pool,
                current: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                ids: CallIdGenerator::new(),
                handlers: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &RpcClientConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.inner.pool
    }

    pub fn is_stateful(&self) -> bool {
        !self.inner.pool.mode().is_pooled()
    }

    /// The current stateful client, if one is up.
    pub fn current_client(&self) -> Option<TransportClient> {
        self.inner.current().map(|bound| bound.client)
    }

    /// Calls still awaiting a reply on the current stateful client.
    pub fn pending_count(&self) -> usize {
        self.inner
            .current()
            .map(|bound| bound.binding.pending_count())
            .unwrap_or(0)
    }

    /// Invokes `method` remotely and waits for its return value.
    ///
    /// # Errors
    ///
    /// - [`RemotingError::Remote`] if the remote method failed
    /// - [`RemotingError::CallTimeout`] if no reply arrived within the
    ///   connect timeout while connected; the call stays registered and a
    ///   late reply is discarded
    /// - [`RemotingError::ClientDisconnected`] if the connection is down
    pub async fn invoke(&self, method: &str, parameters: Vec<Value>) -> Result<Value> {
        let bound = self.acquire().await?;
        let id = self.inner.ids.next_id();
        let call = MethodCall::new(id, method, parameters)
            .with_trace_id(self.inner.config.trace_id.clone());
        let signal = bound.binding.register(call.clone());
        tracing::debug!(id, method, "Invoking");

        if let Err(e) = bound.client.send(call).await {
            if !bound.client.is_reconnect_enabled() {
                bound.binding.abandon(id);
                self.release(&bound).await;
                return Err(e);
            }
            tracing::debug!(id, error = %e, "Send failed, waiting for reconnect");
        }

        let timeout = self.inner.config.transport.connect_timeout;
        let result = match tokio::time::timeout(timeout, signal).await {
            Ok(Ok(Ok(reply))) => match reply.error_message {
                Some(message) => Err(RemotingError::Remote(message)),
                None => Ok(reply.return_value.unwrap_or(Value::Null)),
            },
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(RemotingError::disconnected(self.inner.config.server_addr())),
            Err(_) if !bound.client.is_connected() => {
                bound.binding.abandon(id);
                Err(RemotingError::disconnected(self.inner.config.server_addr()))
            }
            Err(_) => {
                // A pooled client stays borrowed until this entry resolves
                tracing::warn!(id, method, "Call timed out, leaving it registered");
                Err(RemotingError::CallTimeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };

        self.release(&bound).await;
        result
    }

    /// [`invoke`](Self::invoke) and deserialize the return value.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, parameters: Vec<Value>) -> Result<T> {
        let value = self.invoke(method, parameters).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Registers a local handler for `event_name` and subscribes to it.
    ///
    /// The handler is in place before the subscribe packet is sent, so a
    /// compute request arriving right after can find it. Subscriptions are
    /// re-sent after every reconnect.
    pub async fn subscribe<F>(&self, event_name: &str, handler: F) -> Result<()>
    where
        F: Fn(&EventContext, &mut Value) + Send + Sync + 'static,
    {
        self.require_stateful()?;
        let bound = self.stateful().await?;
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event_name.to_string(), Arc::new(handler));

        bound.client.send(EventPacket::subscribe(event_name)).await?;
        tracing::info!(event = %event_name, "Subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, event_name: &str) -> Result<()> {
        self.require_stateful()?;
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(event_name);

        let bound = self.stateful().await?;
        bound.client.send(EventPacket::unsubscribe(event_name)).await?;
        tracing::info!(event = %event_name, "Unsubscribed");
        Ok(())
    }

    /// Publishes an event to every other subscriber.
    ///
    /// The local handler (if any) runs first and may mutate the payload;
    /// the mutated payload is what gets sent and returned.
    pub async fn publish(&self, event_name: &str, payload: Value) -> Result<Value> {
        self.publish_with(&EventContext::local(event_name), event_name, payload)
            .await
    }

    /// Publishes from inside an event handler.
    ///
    /// With a compute context nothing is sent: the payload is the compute
    /// result and is returned as is.
    pub async fn publish_with(&self, ctx: &EventContext, event_name: &str, payload: Value) -> Result<Value> {
        if ctx.is_compute {
            tracing::debug!(event = %event_name, "Publish inside compute handler, not sending");
            return Ok(payload);
        }
        self.require_stateful()?;

        let mut payload = payload;
        self.inner
            .run_local(&EventContext::local(event_name), &mut payload);

        let bound = self.stateful().await?;
        bound
            .client
            .send(EventPacket::publish(event_name, payload.clone()))
            .await?;
        tracing::info!(event = %event_name, "Published");
        Ok(payload)
    }

    /// Closes the stateful connection and fails its pending calls.
    pub async fn close(&self) {
        let _guard = self.inner.connect_lock.lock().await;
        if let Some(bound) = self.inner.take_current() {
            let _ = bound.binding.fail_all(&bound.client);
            ClientPool::destroy(&bound.client);
        }
    }

    fn require_stateful(&self) -> Result<()> {
        if self.is_stateful() {
            Ok(())
        } else {
            Err(RemotingError::InvalidRequest(
                "event operations require a stateful facade".into(),
            ))
        }
    }

    /// Returns a pooled client once nothing is pending on it.
    async fn release(&self, bound: &Bound) {
        if self.is_stateful() || bound.binding.pending_count() > 0 {
            return;
        }
        self.inner.pool.return_client(bound.client.clone()).await;
    }

    async fn acquire(&self) -> Result<Bound> {
        if self.is_stateful() {
            return self.stateful().await;
        }

        let client = self.inner.pool.borrow().await?;
        let binding = Arc::new(Binding::new(
            Arc::downgrade(&self.inner),
            Some(Arc::clone(&self.inner.pool)),
        ));
        client.set_handler(binding.clone());
        if let Err(e) = self.inner.initialize(&client) {
            tracing::warn!(error = %e, "Pooled client initializer failed");
            self.inner.pool.invalidate(client).await;
            return Err(e);
        }
        Ok(Bound { client, binding })
    }

    /// Returns the current connection, replacing it if it is unusable.
    async fn stateful(&self) -> Result<Bound> {
        if let Some(bound) = self.inner.usable_current() {
            return Ok(bound);
        }

        let _guard = self.inner.connect_lock.lock().await;
        if let Some(bound) = self.inner.usable_current() {
            return Ok(bound);
        }

        if let Some(stale) = self.inner.take_current() {
            tracing::debug!("Replacing unusable stateful client");
            let _ = stale.binding.fail_all(&stale.client);
            self.inner.pool.invalidate(stale.client).await;
        }

        let client = self.inner.pool.borrow().await?;
        let binding = Arc::new(Binding::new(Arc::downgrade(&self.inner), None));
        client.set_handler(binding.clone());
        if let Err(e) = self.inner.initialize(&client) {
            ClientPool::destroy(&client);
            return Err(e);
        }

        let bound = Bound { client, binding };
        *self.inner.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(bound.clone());
        tracing::info!(remote = %self.inner.config.server_addr(), "Stateful connection ready");
        Ok(bound)
    }
}

impl std::fmt::Debug for Facade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Facade")
            .field("config", &self.inner.config)
            .finish()
    }
}
