//! Monotonic log-sequence-number allocation.

use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

pub type Lsn = u64;

fn now_seed() -> Lsn {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64;
    ms.saturating_mul(1_000_000)
}

/// Single mutex-guarded monotonic counter. `next()` never regresses even if wall-clock does,
/// and never stalls behind other allocators.
pub struct LsnAllocator {
    last: Mutex<Lsn>,
}

impl LsnAllocator {
    pub fn new() -> Self {
        Self { last: Mutex::new(now_seed()) }
    }

    pub fn next(&self) -> Lsn {
        let mut last = self.last.lock();
        let candidate = (*last + 1).max(now_seed());
        *last = candidate;
        candidate
    }
}

impl Default for LsnAllocator {
    fn default() -> Self {
        Self::new()
    }
}
