//! Remoting Client
//!
//! Client side of the remoting RPC runtime:
//!
//! - [`ClientPool`]: bounded pool of reconnecting transport clients, or a
//!   non-pooled source of one long-lived client per facade
//! - [`Facade`]: method calls correlated by id, plus event subscribe,
//!   unsubscribe and publish
//!
//! Typed contracts are thin wrappers over [`Facade::call`]:
//!
//! ```rust,no_run
//! use remoting_client::Facade;
//! use remoting_common::protocol::Result;
//! use serde_json::json;
//!
//! struct Calculator(Facade);
//!
//! impl Calculator {
//!     async fn add(&self, a: i64, b: i64) -> Result<i64> {
//!         self.0.call("add", vec![json!(a), json!(b)]).await
//!     }
//! }
//! ```

pub mod config;
pub mod facade;
pub mod pool;

pub use config::{InitHook, RpcClientConfig};
pub use facade::{EventContext, EventHandler, Facade};
pub use pool::{ClientPool, PoolMode};
