//! Logical clock for record timestamps.
//!
//! Timestamps are Unix milliseconds. The device clock never goes backwards
//! and is pushed past any server timestamp it observes, so a local write made
//! after receiving a remote record always sorts after it.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::util::unix_millis_now;

/// Source of `updated_at` values for local writes.
pub trait Clock: Send + Sync {
    /// Next timestamp; strictly greater than any value previously returned.
    fn now(&self) -> i64;

    /// Record a timestamp seen on a remote record.
    fn observe(&self, remote: i64);
}

/// Monotonic wall clock.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    pub const fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        let wall = unix_millis_now();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }

    fn observe(&self, remote: i64) {
        self.last.fetch_max(remote, Ordering::AcqRel);
    }
}

/// Hand-driven clock for tests and replay.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    current: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn starting_at(millis: i64) -> Self {
        Self {
            current: Arc::new(AtomicI64::new(millis)),
        }
    }

    pub fn set(&self, millis: i64) {
        self.current.store(millis, Ordering::Release);
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.current.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn observe(&self, remote: i64) {
        self.current.fetch_max(remote, Ordering::AcqRel);
    }
}
