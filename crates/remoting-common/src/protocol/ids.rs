use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use super::packets::{CallId, ComputeId};

static COMPUTE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Monotonically increasing call ids for one facade.
#[derive(Debug, Default)]
pub struct CallIdGenerator {
    next: AtomicU64,
}

impl CallIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> CallId {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Globally unique compute id built from time and a sequence.
pub fn generate_compute_id() -> ComputeId {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    // Upper 32 bits from the clock, lower 32 bits from the sequence
    let counter = COMPUTE_ID_COUNTER.fetch_add(1, Ordering::SeqCst);
    (timestamp & 0xFFFF_FFFF_0000_0000) | (counter & 0xFFFF_FFFF)
}
