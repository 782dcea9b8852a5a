//! Monotonic time, abstracted so tests can run dead-host waits instantly.
//!
//! Timestamps written to disk are only ever compared for change or against
//! `LEASE_FREE`; they are never compared across hosts, so each host's epoch
//! is arbitrary. `monotime()` is clamped to be nonzero because zero is the
//! FREE sentinel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Source of monotonic seconds and bounded sleeps.
pub trait Clock: Send + Sync {
    /// Whole seconds since an arbitrary per-process epoch; never zero.
    fn monotime(&self) -> u64;

    /// Block the calling thread for `d` (virtual time in tests).
    fn sleep(&self, d: Duration);
}

/// Wall clock backed by [`Instant`].
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotime(&self) -> u64 {
        // Offset so a fresh process never reports the FREE sentinel.
        self.origin.elapsed().as_secs() + 1
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// Manually advanced clock for tests.
///
/// `sleep` advances the shared virtual time instead of blocking, so loops
/// that wait out `host_dead_seconds` complete immediately. Concurrent
/// sleepers each advance the clock; tests that depend on exact interleaving
/// should drive actors sequentially.
#[derive(Debug, Default)]
pub struct TestClock {
    now: AtomicU64,
}

impl TestClock {
    /// Start at `start` seconds (clamped to 1).
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start.max(1)),
        }
    }

    /// Advance the virtual time.
    pub fn advance(&self, seconds: u64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn monotime(&self) -> u64 {
        self.now.load(Ordering::SeqCst).max(1)
    }

    fn sleep(&self, d: Duration) {
        // Round up so a 1s engine sleep always moves time forward.
        let secs = u64::from(d.subsec_nanos() > 0) + d.as_secs();
        self.advance(secs.max(1));
    }
}
