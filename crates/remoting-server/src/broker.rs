//! Event broker and method dispatch.
//!
//! The broker is the [`ServerHandler`] of an RPC server. It stores each
//! connection's handshake, tracks per-event subscriber sets, runs the
//! publish algorithm (optional compute rendezvous with one elected
//! subscriber, then broadcast to the rest) and dispatches method calls to
//! the registered [`Service`].
//!
//! Publishes of one event are serialized; different events run
//! independently. Publishes sent by one connection are applied in the order
//! they arrived.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::seq::SliceRandom;
use remoting_common::protocol::error::RemotingError;
use remoting_common::protocol::ids::generate_compute_id;
use remoting_common::protocol::{ComputeId, EventFlag, EventPacket, MethodCall, Packet, Value};
use remoting_common::transport::{ConnectionHandle, ServerHandler, TransportServerConfig};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use crate::service::{Service, ServiceError};

thread_local! {
    /// Set while a service method runs on a blocking worker
    static IN_SERVICE_METHOD: Cell<bool> = const { Cell::new(false) };
}

/// Queued client publish: target event and payload.
type PublishJob = (Arc<EventEntry>, Value);

/// Which subscriber, if any, transforms a payload before broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputePolicy {
    /// Broadcast payloads as published
    #[default]
    Disabled,
    /// Elect among subscribers declaring the highest event version
    LatestVersion,
    /// Elect among subscribers declaring exactly this version
    FixedVersion(i32),
}

impl ComputePolicy {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, ComputePolicy::Disabled)
    }
}

/// Configuration for an [`RpcServer`](crate::RpcServer).
#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    pub transport: TransportServerConfig,
    pub compute: ComputePolicy,
    /// Event versions allowed to receive broadcasts; empty allows all
    pub broadcast_versions: Vec<i32>,
}

impl RpcServerConfig {
    pub fn new(transport: TransportServerConfig) -> Self {
        Self {
            transport,
            compute: ComputePolicy::Disabled,
            broadcast_versions: Vec::new(),
        }
    }

    pub fn with_compute(mut self, compute: ComputePolicy) -> Self {
        self.compute = compute;
        self
    }

    pub fn with_broadcast_versions(mut self, versions: Vec<i32>) -> Self {
        self.broadcast_versions = versions;
        self
    }

    fn compute_wait(&self) -> Duration {
        self.transport.connect_timeout
    }

    fn allows_broadcast(&self, version: i32) -> bool {
        self.broadcast_versions.is_empty() || self.broadcast_versions.contains(&version)
    }
}

struct ComputeContext {
    payload: Value,
    computing: ConnectionHandle,
    reply: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct EventState {
    subscribers: Vec<ConnectionHandle>,
    computations: HashMap<ComputeId, ComputeContext>,
}

struct EventEntry {
    name: String,
    publish_lock: tokio::sync::Mutex<()>,
    state: Mutex<EventState>,
}

impl EventEntry {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            publish_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(EventState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EventState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct BrokerInner {
    service: Arc<dyn Service>,
    config: RpcServerConfig,
    events: Mutex<HashMap<String, Arc<EventEntry>>>,
    /// Per-connection publish queues, keyed by connection id
    publishers: Mutex<HashMap<u64, mpsc::UnboundedSender<PublishJob>>>,
    runtime: Handle,
}

/// Server-side event broker and method dispatcher.
#[derive(Clone)]
pub struct EventBroker {
    inner: Arc<BrokerInner>,
}

impl EventBroker {
    /// Must be called from within a tokio runtime.
    pub fn new(service: Arc<dyn Service>, config: RpcServerConfig) -> Self {
        EventBroker {
            inner: Arc::new(BrokerInner {
                service,
                config,
                events: Mutex::new(HashMap::new()),
                publishers: Mutex::new(HashMap::new()),
                runtime: Handle::current(),
            }),
        }
    }

    pub fn config(&self) -> &RpcServerConfig {
        &self.inner.config
    }

    /// Handle through which the service raises events.
    pub fn hub(&self) -> EventHub {
        EventHub {
            broker: Arc::downgrade(&self.inner),
            runtime: self.inner.runtime.clone(),
        }
    }

    /// Live subscribers of `event_name`.
    pub fn subscriber_count(&self, event_name: &str) -> usize {
        let Some(entry) = self.inner.entry(event_name) else {
            return 0;
        };
        let state = entry.state();
        state.subscribers.iter().filter(|c| c.is_connected()).count()
    }

    /// Compute contexts not yet completed or purged.
    pub fn pending_computations(&self, event_name: &str) -> usize {
        let Some(entry) = self.inner.entry(event_name) else {
            return 0;
        };
        let state = entry.state();
        state.computations.len()
    }

    /// Runs the publish algorithm and returns the payload that was broadcast.
    pub async fn publish(&self, event_name: &str, payload: Value) -> Value {
        match self.inner.entry(event_name) {
            Some(entry) => self.inner.publish(&entry, None, payload).await,
            None => {
                tracing::debug!(event = %event_name, "No subscribers, publish dropped");
                payload
            }
        }
    }
}

impl BrokerInner {
    fn events(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<EventEntry>>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry(&self, event_name: &str) -> Option<Arc<EventEntry>> {
        self.events().get(event_name).cloned()
    }

    fn subscribe(&self, connection: &ConnectionHandle, event_name: &str) {
        let entry = {
            let mut events = self.events();
            events
                .entry(event_name.to_string())
                .or_insert_with(|| {
                    tracing::info!(event = %event_name, "Attached event hub");
                    Arc::new(EventEntry::new(event_name))
                })
                .clone()
        };

        let mut state = entry.state();
        if state.subscribers.iter().any(|c| c.same(connection)) {
            tracing::debug!(event = %event_name, remote = %connection.remote_addr(), "Already subscribed");
            return;
        }
        state.subscribers.push(connection.clone());
        tracing::info!(
            event = %event_name,
            remote = %connection.remote_addr(),
            subscribers = state.subscribers.len(),
            "Subscribed"
        );
    }

    fn unsubscribe(&self, connection: &ConnectionHandle, event_name: &str) {
        if let Some(entry) = self.entry(event_name) {
            entry.state().subscribers.retain(|c| !c.same(connection));
            tracing::info!(event = %event_name, remote = %connection.remote_addr(), "Unsubscribed");
        }
    }

    fn forget(&self, connection: &ConnectionHandle) {
        // Queued publishes still run; the worker exits once they are done
        self.publishers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&connection.id());

        let entries: Vec<Arc<EventEntry>> = self.events().values().cloned().collect();
        for entry in entries {
            entry.state().subscribers.retain(|c| !c.same(connection));
        }
    }

    /// Merges a compute reply into its context and wakes the publisher.
    fn complete_compute(&self, connection: &ConnectionHandle, event: EventPacket) {
        let Some(compute_id) = event.compute_id else {
            tracing::warn!(event = %event.event_name, "Compute reply without an id");
            return;
        };
        let Some(entry) = self.entry(&event.event_name) else {
            tracing::debug!(event = %event.event_name, compute_id, "Compute reply for unknown event");
            return;
        };

        let mut state = entry.state();
        match state.computations.get_mut(&compute_id) {
            Some(ctx) if ctx.computing.same(connection) => {
                merge_payload(&mut ctx.payload, event.payload);
                if let Some(reply) = ctx.reply.take() {
                    let _ = reply.send(());
                }
            }
            Some(_) => {
                tracing::warn!(
                    event = %event.event_name,
                    compute_id,
                    remote = %connection.remote_addr(),
                    "Compute reply from a connection that was not elected"
                );
            }
            None => {
                tracing::debug!(event = %event.event_name, compute_id, "Late compute reply ignored");
            }
        }
    }

    /// Queues a client publish behind earlier ones from the same connection.
    fn enqueue_publish(self: &Arc<Self>, connection: &ConnectionHandle, entry: Arc<EventEntry>, payload: Value) {
        let mut publishers = self.publishers.lock().unwrap_or_else(|e| e.into_inner());
        let queue = publishers.entry(connection.id()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            self.runtime
                .spawn(Arc::clone(self).publish_worker(connection.clone(), rx));
            tx
        });
        if queue.send((entry, payload)).is_err() {
            tracing::warn!(remote = %connection.remote_addr(), "Publish queue closed, event dropped");
        }
    }

    async fn publish_worker(
        self: Arc<Self>,
        source: ConnectionHandle,
        mut queue: mpsc::UnboundedReceiver<PublishJob>,
    ) {
        while let Some((entry, payload)) = queue.recv().await {
            self.publish(&entry, Some(source.clone()), payload).await;
        }
        tracing::debug!(remote = %source.remote_addr(), "Publish queue drained");
    }

    fn elect(&self, entry: &EventEntry, source: Option<&ConnectionHandle>) -> Option<ConnectionHandle> {
        let state = entry.state();
        let candidates: Vec<(&ConnectionHandle, i32)> = state
            .subscribers
            .iter()
            .filter(|c| c.is_connected())
            .filter(|c| source.map_or(true, |s| !s.same(c)))
            .filter_map(|c| c.handshake().map(|meta| (c, meta.event_version)))
            .collect();

        let wanted = match self.config.compute {
            ComputePolicy::Disabled => return None,
            ComputePolicy::LatestVersion => candidates.iter().map(|(_, v)| *v).max()?,
            ComputePolicy::FixedVersion(version) => version,
        };

        let eligible: Vec<&ConnectionHandle> = candidates
            .into_iter()
            .filter(|(_, v)| *v == wanted)
            .map(|(c, _)| c)
            .collect();
        let elected = eligible.choose(&mut rand::thread_rng()).map(|c| (*c).clone());
        elected
    }

    async fn publish(
        self: &Arc<Self>,
        entry: &Arc<EventEntry>,
        source: Option<ConnectionHandle>,
        mut payload: Value,
    ) -> Value {
        let _serial = entry.publish_lock.lock().await;

        let mut computing = None;
        if self.config.compute.is_enabled() {
            match self.elect(entry, source.as_ref()) {
                Some(target) => {
                    payload = self.compute(entry, &target, payload).await;
                    computing = Some(target);
                }
                None => {
                    tracing::info!(event = %entry.name, "No compute target, broadcasting as published");
                }
            }
        }

        self.broadcast(entry, &payload, source.as_ref(), computing.as_ref());
        payload
    }

    /// Hands the payload to `target` and waits for its transformed copy.
    ///
    /// On timeout the payload is broadcast as it stands.
    async fn compute(self: &Arc<Self>, entry: &Arc<EventEntry>, target: &ConnectionHandle, payload: Value) -> Value {
        let compute_id = generate_compute_id();
        let wait = self.config.compute_wait();
        let (tx, rx) = oneshot::channel();

        entry.state().computations.insert(
            compute_id,
            ComputeContext {
                payload: payload.clone(),
                computing: target.clone(),
                reply: Some(tx),
            },
        );

        let purge_entry = Arc::downgrade(entry);
        self.runtime.spawn(async move {
            tokio::time::sleep(wait * 2).await;
            if let Some(entry) = purge_entry.upgrade() {
                if entry.state().computations.remove(&compute_id).is_some() {
                    tracing::debug!(event = %entry.name, compute_id, "Purged compute context");
                }
            }
        });

        tracing::debug!(
            event = %entry.name,
            compute_id,
            remote = %target.remote_addr(),
            "Requesting compute"
        );
        match target.send(EventPacket::compute_args(&entry.name, compute_id, payload.clone())) {
            Ok(()) => {
                if tokio::time::timeout(wait, rx).await.is_err() {
                    tracing::warn!(
                        event = %entry.name,
                        compute_id,
                        remote = %target.remote_addr(),
                        "Compute timed out after {:?}",
                        wait
                    );
                }
            }
            Err(e) => {
                tracing::warn!(event = %entry.name, compute_id, error = %e, "Failed to send compute request");
            }
        }

        let completed = entry.state().computations.remove(&compute_id);
        completed.map_or(payload, |ctx| ctx.payload)
    }

    fn broadcast(
        &self,
        entry: &EventEntry,
        payload: &Value,
        source: Option<&ConnectionHandle>,
        computing: Option<&ConnectionHandle>,
    ) {
        let targets: Vec<ConnectionHandle> = {
            let mut state = entry.state();
            let before = state.subscribers.len();
            state.subscribers.retain(|c| c.is_connected());
            let pruned = before - state.subscribers.len();
            if pruned > 0 {
                tracing::debug!(event = %entry.name, pruned, "Pruned disconnected subscribers");
            }

            state
                .subscribers
                .iter()
                .filter(|c| source.map_or(true, |s| !s.same(c)))
                .filter(|c| computing.map_or(true, |s| !s.same(c)))
                .filter(|c| {
                    c.handshake()
                        .is_some_and(|meta| self.config.allows_broadcast(meta.event_version))
                })
                .cloned()
                .collect()
        };

        tracing::debug!(event = %entry.name, targets = targets.len(), "Broadcasting");
        for target in targets {
            if let Err(e) = target.send(EventPacket::broadcast(&entry.name, payload.clone())) {
                tracing::debug!(event = %entry.name, remote = %target.remote_addr(), error = %e, "Broadcast send failed");
                entry.state().subscribers.retain(|c| !c.same(&target));
            }
        }
    }

    async fn dispatch(self: Arc<Self>, connection: ConnectionHandle, mut call: MethodCall) {
        let service = self.service.clone();
        let method = call.method_name.clone();
        let parameters = std::mem::take(&mut call.parameters);

        let result = tokio::task::spawn_blocking(move || {
            IN_SERVICE_METHOD.with(|flag| flag.set(true));
            let result = service.invoke(&method, parameters);
            IN_SERVICE_METHOD.with(|flag| flag.set(false));
            result
        })
        .await;
        match result {
            Ok(Ok(value)) => call.return_value = Some(value),
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Method failed");
                call.error_message = Some(e.to_string());
            }
            Err(e) => {
                tracing::error!(error = %e, "Method panicked");
                call.error_message = Some(format!("Panic {}", e));
            }
        }

        if let Err(e) = connection.send(call) {
            tracing::warn!(remote = %connection.remote_addr(), error = %e, "Failed to send reply");
        }
    }

    fn on_event(self: &Arc<Self>, connection: &ConnectionHandle, event: EventPacket) {
        match event.flag {
            EventFlag::Subscribe => self.subscribe(connection, &event.event_name),
            EventFlag::Unsubscribe => self.unsubscribe(connection, &event.event_name),
            EventFlag::ComputeArgs => self.complete_compute(connection, event),
            EventFlag::Publish => {
                let Some(entry) = self.entry(&event.event_name) else {
                    tracing::debug!(event = %event.event_name, "No subscribers, publish dropped");
                    return;
                };
                self.enqueue_publish(connection, entry, event.payload);
            }
            EventFlag::Broadcast => {
                tracing::warn!(
                    event = %event.event_name,
                    remote = %connection.remote_addr(),
                    "Ignoring broadcast sent by a client"
                );
            }
        }
    }
}

impl ServerHandler for EventBroker {
    fn on_connected(&self, connection: &ConnectionHandle) {
        tracing::debug!(remote = %connection.remote_addr(), "Client connected");
    }

    fn on_disconnected(&self, connection: &ConnectionHandle) {
        tracing::debug!(remote = %connection.remote_addr(), "Client disconnected");
        self.inner.forget(connection);
    }

    fn on_receive(&self, connection: &ConnectionHandle, packet: Packet) {
        match packet {
            Packet::Handshake(meta) => {
                tracing::debug!(
                    remote = %connection.remote_addr(),
                    event_version = meta.event_version,
                    "Handshake"
                );
                connection.set_handshake(meta);
            }
            Packet::Event(event) => self.inner.on_event(connection, event),
            Packet::MethodCall(call) => {
                let span = tracing::info_span!(
                    "dispatch",
                    id = call.id,
                    method = %call.method_name,
                    trace_id = call.trace_id.as_deref().unwrap_or("")
                );
                let inner = self.inner.clone();
                let connection = connection.clone();
                self.inner
                    .runtime
                    .spawn(inner.dispatch(connection, call).instrument(span));
            }
            Packet::Error(err) => {
                tracing::warn!(remote = %connection.remote_addr(), "Client reported: {}", err.message);
            }
            Packet::Ping(_) => {}
        }
    }

    fn on_error(&self, connection: &ConnectionHandle, error: &RemotingError) {
        // The transport already queued an error packet for the peer
        tracing::warn!(remote = %connection.remote_addr(), error = %error, "Connection error");
    }
}

/// Replaces `target` with `reply`, merging field by field when both are objects.
fn merge_payload(target: &mut Value, reply: Value) {
    match (target, reply) {
        (Value::Object(target), Value::Object(reply)) => {
            for (key, value) in reply {
                target.insert(key, value);
            }
        }
        (target, reply) => *target = reply,
    }
}

/// Raises events on behalf of a service.
///
/// Events with no subscriber are dropped and return the payload untouched.
#[derive(Clone)]
pub struct EventHub {
    broker: Weak<BrokerInner>,
    runtime: Handle,
}

impl EventHub {
    /// Publishes with the server as source and returns the broadcast payload.
    pub async fn raise(&self, event_name: &str, payload: Value) -> Value {
        let Some(inner) = self.broker.upgrade() else {
            tracing::debug!(event = %event_name, "Broker gone, event dropped");
            return payload;
        };
        match inner.entry(event_name) {
            Some(entry) => inner.publish(&entry, None, payload).await,
            None => payload,
        }
    }

    /// Publishes in the background.
    pub fn raise_detached(&self, event_name: &str, payload: Value) {
        let hub = self.clone();
        let event_name = event_name.to_string();
        self.runtime.spawn(async move {
            hub.raise(&event_name, payload).await;
        });
    }

    /// Publishes from a service method, or from a thread outside the runtime.
    ///
    /// # Errors
    ///
    /// Returns an `IllegalState` [`ServiceError`] when called from any other
    /// thread inside the runtime, such as an async task.
    pub fn raise_blocking(&self, event_name: &str, payload: Value) -> Result<Value, ServiceError> {
        let in_runtime = Handle::try_current().is_ok();
        if in_runtime && !IN_SERVICE_METHOD.with(Cell::get) {
            return Err(ServiceError::new(
                "IllegalState",
                format!("cannot block on event {} from inside the runtime", event_name),
            ));
        }
        Ok(self.runtime.block_on(self.raise(event_name, payload)))
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("attached", &(self.broker.strong_count() > 0))
            .finish()
    }
}
