//! Time source abstraction. The Position Engine timestamps every snapshot
//! and interpolates from "now"; tests substitute a `FakeClock` so dead
//! reckoning math can be asserted without sleeping real time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u128;
}

#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ns(&self) -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_nanos()
    }
}

/// Deterministic clock for tests: starts at an arbitrary fixed instant and
/// only moves when `advance`/`set` is called.
#[derive(Clone)]
pub struct FakeClock {
    now_ns: Arc<AtomicU64>,
}

impl FakeClock {
    pub fn new(start_ns: u64) -> FakeClock {
        FakeClock {
            now_ns: Arc::new(AtomicU64::new(start_ns)),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_ns.fetch_add(ms * 1_000_000, Ordering::SeqCst);
    }

    pub fn set_ns(&self, ns: u64) {
        self.now_ns.store(ns, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_ns(&self) -> u128 {
        self.now_ns.load(Ordering::SeqCst) as u128
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances() {
        let clock = FakeClock::new(1_000);
        assert_eq!(clock.now_ns(), 1_000);
        clock.advance_ms(5);
        assert_eq!(clock.now_ns(), 1_000 + 5_000_000);
    }
}
