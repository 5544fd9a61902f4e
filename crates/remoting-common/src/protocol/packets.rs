//! Remoting Wire Packets
//!
//! This module defines the closed set of packet kinds exchanged between
//! transport clients and servers. Every frame on the wire carries exactly one
//! [`Packet`], tagged by kind so the receiver can dispatch it without any
//! outside context.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Identifier correlating a method call with its reply.
pub type CallId = u64;

/// Identifier of one in-flight compute round trip on the server.
pub type ComputeId = u64;

/// Dynamically typed argument/return value.
pub type Value = serde_json::Value;

/// A remote method invocation.
///
/// The caller creates it with a fresh id; the receiver fills in
/// `return_value` or `error_message`, clears `parameters` and sends the same
/// packet back.
///
/// # Example
///
/// ```
/// use remoting_common::protocol::MethodCall;
/// use serde_json::json;
///
/// let call = MethodCall::new(1, "add", vec![json!(1), json!(2)]);
/// assert_eq!(call.method_name, "add");
/// assert!(call.return_value.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MethodCall {
    /// Correlation id, unique among calls in flight on one logical connection
    pub id: CallId,
    /// Name of the method to invoke on the service
    pub method_name: String,
    /// Positional parameters
    pub parameters: Vec<Value>,
    /// Return value (filled in by the receiver)
    pub return_value: Option<Value>,
    /// Formatted error (filled in by the receiver on failure)
    pub error_message: Option<String>,
    /// Optional trace id propagated to the server
    pub trace_id: Option<String>,
}

impl MethodCall {
    pub fn new(id: CallId, method_name: impl Into<String>, parameters: Vec<Value>) -> Self {
        MethodCall {
            id,
            method_name: method_name.into(),
            parameters,
            return_value: None,
            error_message: None,
            trace_id: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Whether the receiver reported a failure.
    pub fn is_error(&self) -> bool {
        self.error_message.is_some()
    }
}

/// Role of an [`EventPacket`] in the subscribe/publish protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventFlag {
    /// Client asks to receive broadcasts of an event
    Subscribe,
    /// Client stops receiving broadcasts of an event
    Unsubscribe,
    /// Client raises an event for every other subscriber
    Publish,
    /// Server asks the elected subscriber to compute the payload, and the
    /// subscriber answers with the same flag
    ComputeArgs,
    /// Server delivers the final payload
    Broadcast,
}

/// An event protocol packet.
///
/// `compute_id` is only populated for [`EventFlag::ComputeArgs`] requests and
/// their replies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventPacket {
    pub event_name: String,
    pub flag: EventFlag,
    pub payload: Value,
    pub compute_id: Option<ComputeId>,
}

impl EventPacket {
    pub fn new(event_name: impl Into<String>, flag: EventFlag, payload: Value) -> Self {
        EventPacket {
            event_name: event_name.into(),
            flag,
            payload,
            compute_id: None,
        }
    }

    pub fn subscribe(event_name: impl Into<String>) -> Self {
        Self::new(event_name, EventFlag::Subscribe, Value::Null)
    }

    pub fn unsubscribe(event_name: impl Into<String>) -> Self {
        Self::new(event_name, EventFlag::Unsubscribe, Value::Null)
    }

    pub fn publish(event_name: impl Into<String>, payload: Value) -> Self {
        Self::new(event_name, EventFlag::Publish, payload)
    }

    pub fn compute_args(event_name: impl Into<String>, compute_id: ComputeId, payload: Value) -> Self {
        EventPacket {
            compute_id: Some(compute_id),
            ..Self::new(event_name, EventFlag::ComputeArgs, payload)
        }
    }

    pub fn broadcast(event_name: impl Into<String>, payload: Value) -> Self {
        Self::new(event_name, EventFlag::Broadcast, payload)
    }
}

/// Connection-scoped metadata, sent by a client right after every connect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeMetadata {
    pub event_version: i32,
}

/// Heartbeat packet. The server echoes it back unchanged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ping {
    /// Milliseconds since the unix epoch at the sender
    pub timestamp: i64,
}

impl Ping {
    pub fn now() -> Self {
        Ping {
            timestamp: unix_millis(),
        }
    }

    /// Milliseconds elapsed since this ping was created.
    pub fn elapsed_millis(&self) -> i64 {
        unix_millis() - self.timestamp
    }
}

/// Control packet reporting a peer-side failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPacket {
    pub message: String,
}

/// Every frame on the wire is one of these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Packet {
    MethodCall(MethodCall),
    Event(EventPacket),
    Handshake(HandshakeMetadata),
    Ping(Ping),
    Error(ErrorPacket),
}

impl Packet {
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::MethodCall(_) => "method_call",
            Packet::Event(_) => "event",
            Packet::Handshake(_) => "handshake",
            Packet::Ping(_) => "ping",
            Packet::Error(_) => "error",
        }
    }

    /// Control packets are never correlated to application calls.
    pub fn is_control(&self) -> bool {
        matches!(self, Packet::Ping(_) | Packet::Error(_))
    }
}

impl From<MethodCall> for Packet {
    fn from(call: MethodCall) -> Self {
        Packet::MethodCall(call)
    }
}

impl From<EventPacket> for Packet {
    fn from(event: EventPacket) -> Self {
        Packet::Event(event)
    }
}

impl From<HandshakeMetadata> for Packet {
    fn from(meta: HandshakeMetadata) -> Self {
        Packet::Handshake(meta)
    }
}

impl From<Ping> for Packet {
    fn from(ping: Ping) -> Self {
        Packet::Ping(ping)
    }
}

impl From<ErrorPacket> for Packet {
    fn from(err: ErrorPacket) -> Self {
        Packet::Error(err)
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
