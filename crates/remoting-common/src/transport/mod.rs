//! Remoting Transport Layer
//!
//! This module provides the framed TCP transport every other layer builds on.
//!
//! # Architecture
//!
//! - **Wire Format**: `[4-byte length prefix as u32 big-endian] + [JSON packet]`
//! - **Connection**: one socket driven by a reader task and a writer task,
//!   with idle-based heartbeats
//! - **Client**: a single long-lived connection with automatic reconnect
//! - **Server**: accepts connections up to a capacity and tracks them by
//!   remote address
//!
//! # Components
//!
//! - **[`Codec`]** / **[`JsonCodec`]**: Encode/decode packets
//! - **[`Connection`]** / **[`ConnectionHandle`]**: A framed socket
//! - **[`TransportClient`]**: Reconnecting client
//! - **[`TransportServer`]**: Accepting server
//!
//! # Message Size Limits
//!
//! Frames larger than 100 MB are rejected to prevent memory exhaustion.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use remoting_common::protocol::{MethodCall, Packet};
//! use remoting_common::transport::{
//!     ConnectionHandle, ServerHandler, TransportClient, TransportClientConfig,
//!     TransportServer, TransportServerConfig,
//! };
//!
//! struct Echo;
//!
//! impl ServerHandler for Echo {
//!     fn on_receive(&self, connection: &ConnectionHandle, packet: Packet) {
//!         let _ = connection.send(packet);
//!     }
//! }
//!
//! # async fn example() -> remoting_common::protocol::Result<()> {
//! let server = TransportServer::start(
//!     TransportServerConfig::new("127.0.0.1:0".parse()?),
//!     Arc::new(Echo),
//! ).await?;
//!
//! let client = TransportClient::new(TransportClientConfig::new(server.local_addr()));
//! client.connect(server.local_addr()).await?;
//! client.send(MethodCall::new(1, "echo", vec![])).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod connection;
pub mod server;

pub use client::{
    Backoff, ClientHandler, ClientState, ConnectHandle, TransportClient, TransportClientConfig,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_WAIT_CONNECT,
};
pub use codec::{read_frame, write_frame, Codec, JsonCodec, MAX_FRAME_SIZE};
pub use connection::{Connection, ConnectionEvent, ConnectionHandle, ConnectionRole, IdleConfig};
pub use server::{ServerHandler, TransportServer, TransportServerConfig, DEFAULT_CAPACITY};

#[cfg(test)]
mod tests;
