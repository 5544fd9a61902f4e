//! Remoting Server
//!
//! Exposes a [`Service`] over the framed TCP transport. Method calls are
//! dispatched on blocking worker threads and answered on the calling
//! connection. Events published by clients or raised by the service are
//! routed by the [`EventBroker`], optionally through one elected subscriber
//! that computes the payload before it is broadcast.

pub mod broker;
pub mod server;
pub mod service;

pub use broker::{ComputePolicy, EventBroker, EventHub, RpcServerConfig};
pub use server::RpcServer;
pub use service::{param, MethodRouter, Service, ServiceError};
