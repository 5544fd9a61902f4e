pub mod error;
pub mod ids;
pub mod packets;

#[cfg(test)]
mod tests;

pub use error::{RemotingError, Result};
pub use ids::{generate_compute_id, CallIdGenerator};
pub use packets::{
    CallId, ComputeId, ErrorPacket, EventFlag, EventPacket, HandshakeMetadata, MethodCall, Packet,
    Ping, Value,
};
