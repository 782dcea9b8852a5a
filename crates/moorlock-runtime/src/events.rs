//! Bounded in-memory event ring served by the log-dump command.

use std::collections::VecDeque;

use parking_lot::Mutex;

const RING_CAPACITY: usize = 1024;

/// Recent noteworthy events, oldest first.
pub struct EventRing {
    ring: Mutex<VecDeque<String>>,
}

impl Default for EventRing {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRing {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut ring = self.ring.lock();
        if ring.len() == RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(line.into());
    }

    #[must_use]
    pub fn dump(&self) -> Vec<String> {
        self.ring.lock().iter().cloned().collect()
    }
}
