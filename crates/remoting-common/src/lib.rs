//! Remoting Common Types and Transport
//!
//! This crate provides the wire protocol and the TCP transport layer for the
//! remoting RPC runtime.
//!
//! # Overview
//!
//! Every other crate in the workspace builds on the pieces defined here:
//!
//! - **Protocol Layer**: the closed set of wire packets, error taxonomy and id
//!   generators
//! - **Transport Layer**: framed connections with heartbeats, a reconnecting
//!   client and an accepting server
//!
//! # Architecture
//!
//! - **Transport**: long-lived TCP connections
//! - **Serialization**: JSON, tagged by packet kind
//! - **Message Format**: `[4-byte length prefix as u32 big-endian] + [JSON data]`
//! - **Max Message Size**: 100 MB
//!
//! # Components
//!
//! - [`protocol`] - Packets, errors, ids
//! - [`transport`] - Codec, connection, client and server
//!
//! # Example
//!
//! ```
//! use remoting_common::{MethodCall, Packet};
//! use remoting_common::transport::JsonCodec;
//! use serde_json::json;
//!
//! let call = MethodCall::new(1, "add", vec![json!(1), json!(2)]);
//! let bytes = JsonCodec::encode(&Packet::from(call)).unwrap();
//! assert!(!bytes.is_empty());
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
