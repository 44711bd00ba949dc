//! Rolling history of decoded readings.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::protocol::HISTORY_CAPACITY;
use crate::types::Reading;

/// Fixed-capacity FIFO of the most recent [`Reading`]s.
///
/// Shared between the notification ingestion task (writer) and whoever
/// renders the history (readers).  All mutation goes through one internal
/// mutex, so callers never lock anything themselves.  The lock is only held
/// for an O(1) push or a copy of at most `capacity` elements.
#[derive(Debug)]
pub struct SampleBuffer {
    capacity: usize,
    samples: Mutex<VecDeque<Reading>>,
}

impl SampleBuffer {
    /// Create an empty buffer holding at most `capacity` readings.
    ///
    /// A capacity of `0` is bumped to `1`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            // One spare slot: push_back happens before pop_front.
            samples: Mutex::new(VecDeque::with_capacity(capacity + 1)),
        }
    }

    /// Append `value_db` as the newest reading and return it.
    ///
    /// The sequence number is one past the newest retained reading, or `0`
    /// when the buffer is empty.  When the buffer is full the oldest reading
    /// is dropped.
    pub fn push(&self, value_db: f64) -> Reading {
        let mut buf = self.lock();
        let sequence = buf.back().map_or(0, |last| last.sequence + 1);
        let reading = Reading { value_db, sequence };
        buf.push_back(reading);
        if buf.len() > self.capacity {
            buf.pop_front();
        }
        reading
    }

    /// Copy of the current window, oldest first.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.lock().iter().copied().collect()
    }

    /// Drop every reading.  The next push restarts at sequence `0`.
    pub fn clear(&self) {
        self.lock().clear();
    }

    // A panic while holding the lock cannot leave the deque half-updated,
    // so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Reading>> {
        self.samples.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}
