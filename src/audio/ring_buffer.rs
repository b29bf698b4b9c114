//! Bounded drop-oldest byte buffer fed by the capture callback.
//!
//! Offsets handed in and out of the buffer are absolute: they count bytes
//! since recording started. The buffer keeps only the newest `capacity`
//! bytes and remembers how many it has evicted (`dropped`), so the live
//! window is always `[dropped, dropped + len)`.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};

/// Ring buffer shared between the capture thread and fetch tasks.
pub type SharedRingBuffer = Arc<Mutex<AudioRingBuffer>>;

/// Lock a shared ring buffer, recovering from a poisoned lock.
///
/// The capture callback must never panic while holding the lock, but if it
/// ever does the byte contents are still consistent, so the guard is reused.
pub fn lock_ring(ring: &SharedRingBuffer) -> MutexGuard<'_, AudioRingBuffer> {
    match ring.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Bounded byte buffer that evicts its oldest bytes on overflow.
#[derive(Debug, Clone)]
pub struct AudioRingBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
    dropped: u64,
}

/// Result of reading an absolute byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRead {
    pub bytes: Vec<u8>,
    /// Absolute offset the returned bytes actually start at.
    pub start: u64,
    /// True when the requested start had already been evicted.
    pub clamped: bool,
}

impl AudioRingBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Wrap in the shared handle used by capture and fetch.
    #[must_use]
    pub fn shared(capacity: usize) -> SharedRingBuffer {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    /// Append a captured chunk, evicting from the head as needed.
    ///
    /// Returns the number of bytes evicted by this call.
    pub fn append(&mut self, chunk: &[u8]) -> usize {
        if self.capacity == 0 {
            self.dropped += chunk.len() as u64;
            return chunk.len();
        }

        if chunk.len() >= self.capacity {
            let evicted = self.bytes.len() + (chunk.len() - self.capacity);
            self.bytes.clear();
            self.bytes.extend(&chunk[chunk.len() - self.capacity..]);
            self.dropped += evicted as u64;
            return evicted;
        }

        self.bytes.extend(chunk);
        let excess = self.bytes.len().saturating_sub(self.capacity);
        if excess > 0 {
            self.bytes.drain(..excess);
            self.dropped += excess as u64;
        }
        excess
    }

    /// Forget all contents and restart offsets at zero.
    pub fn reset(&mut self) {
        self.bytes.clear();
        self.dropped = 0;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes evicted since the last reset.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Total bytes appended since the last reset.
    #[must_use]
    pub fn total_written(&self) -> u64 {
        self.dropped + self.bytes.len() as u64
    }

    /// Absolute offsets currently held.
    #[must_use]
    pub fn live_window(&self) -> Range<u64> {
        self.dropped..self.total_written()
    }

    /// Bytes still missing before `end` is inside the live window.
    #[must_use]
    pub fn shortfall(&self, end: u64) -> u64 {
        end.saturating_sub(self.total_written())
    }

    /// Copy out the absolute range `[start, end)`.
    ///
    /// A start that has already been evicted is clamped to the earliest live
    /// byte, and an end beyond the live window is clamped to its end.
    #[must_use]
    pub fn read_range(&self, start: u64, end: u64) -> RangeRead {
        let window = self.live_window();
        let clamped = start < window.start;
        let from = start.clamp(window.start, window.end);
        let to = end.clamp(from, window.end);

        let lo = (from - window.start) as usize;
        let hi = (to - window.start) as usize;
        RangeRead {
            bytes: self.bytes.range(lo..hi).copied().collect(),
            start: from,
            clamped,
        }
    }
}
