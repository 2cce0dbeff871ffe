//! Monotonic time source for deadline tracking
//!
//! The engine never sleeps; it compares deadlines against a monotonic
//! millisecond counter read once per poll. Production code uses
//! [`MonotonicClock`]; tests drive [`ManualClock`] to simulate timeouts
//! without waiting.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

/// Monotonic milliseconds-since-start time source
pub trait Clock {
    /// Milliseconds elapsed since the clock was created
    fn now_ms(&self) -> u64;
}

/// Wall clock backed by `std::time::Instant`
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Manually advanced clock for tests
///
/// Clones share the same counter, so a test can keep one handle and hand
/// another to the engine.
#[derive(Clone)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(0)),
        }
    }

    /// Move time forward by `ms` milliseconds
    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}
