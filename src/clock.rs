//! Pluggable time sources
//!
//! Every timed component takes an `Arc<dyn Clock>` instead of reading wall
//! time directly, so tests can drive windows and cooldowns deterministically.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of epoch-millisecond timestamps
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in epoch milliseconds
    fn now(&self) -> i64;
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock. Never goes backwards even if the system time does.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        let wall = chrono::Utc::now().timestamp_millis();
        let prev = self.last.fetch_max(wall, Ordering::SeqCst);
        prev.max(wall)
    }
}

/// Settable clock for tests and replays
#[derive(Debug, Default)]
pub struct ManualClock {
    current: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            current: AtomicI64::new(start),
        }
    }

    /// Set the current time
    pub fn set(&self, ts: i64) {
        self.current.store(ts, Ordering::SeqCst);
    }

    /// Move the clock forward by `ms` milliseconds and return the new time
    pub fn advance_by(&self, ms: i64) -> i64 {
        self.current.fetch_add(ms, Ordering::SeqCst) + ms
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }
}
