use std::net::SocketAddr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemotingError {
    #[error("Connect to {addr} timed out after {timeout_ms}ms")]
    ConnectTimeout { addr: String, timeout_ms: u64 },

    #[error("Client disconnected: {0}")]
    ClientDisconnected(String),

    #[error("The method {method} read timeout after {timeout_ms}ms")]
    CallTimeout { method: String, timeout_ms: u64 },

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Not enough capacity {current}/{capacity}")]
    CapacityExceeded { current: usize, capacity: usize },

    #[error("Pool acquire timed out after {0}ms")]
    PoolTimeout(u64),

    #[error("{0} has already connected")]
    AlreadyConnected(String),

    #[error("{0} is closed")]
    Closed(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl RemotingError {
    pub fn disconnected(addr: impl std::fmt::Display) -> Self {
        RemotingError::ClientDisconnected(addr.to_string())
    }

    pub fn connect_timeout(addr: SocketAddr, timeout: std::time::Duration) -> Self {
        RemotingError::ConnectTimeout {
            addr: addr.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Whether a reconnecting caller may still see this operation succeed later.
    pub fn is_disconnected(&self) -> bool {
        matches!(
            self,
            RemotingError::ClientDisconnected(_)
                | RemotingError::ConnectTimeout { .. }
                | RemotingError::Connection(_)
        )
    }
}

impl From<std::net::AddrParseError> for RemotingError {
    fn from(err: std::net::AddrParseError) -> Self {
        RemotingError::InvalidRequest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RemotingError>;
