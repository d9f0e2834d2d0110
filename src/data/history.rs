//! Bounded, time-ordered history of readings.
//!
//! The history buffer is the only piece of mutable state shared between the ingestion
//! task and the presentation layer.
//!
//! # Thread Safety
//!
//! - **Writes**: `append` takes the write lock for one `VecDeque` push (plus at most one
//!   pop). Only the ingestion loop holds a [`HistoryBuffer`]; everyone else gets a
//!   [`HistoryView`].
//! - **Reads**: `snapshot` and `latest` take the read lock only long enough to copy
//!   the readings out. The lock is never held across I/O or an `.await`.
//! - Readings are `Copy`, so a reader can never observe a half-written entry.

use crate::measurement::Reading;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

/// Default number of readings kept in memory.
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug)]
struct Ring {
    readings: VecDeque<Reading>,
    total_appended: u64,
}

/// Fixed-capacity FIFO of readings in arrival order.
#[derive(Debug)]
pub struct HistoryBuffer {
    capacity: usize,
    inner: RwLock<Ring>,
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl HistoryBuffer {
    /// Create an empty buffer holding at most `capacity` readings (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: RwLock::new(Ring {
                readings: VecDeque::with_capacity(capacity),
                total_appended: 0,
            }),
        }
    }

    /// Insert at the tail, evicting the oldest reading when full.
    pub fn append(&self, reading: Reading) {
        let mut ring = self.inner.write();
        if ring.readings.len() == self.capacity {
            ring.readings.pop_front();
        }
        ring.readings.push_back(reading);
        ring.total_appended += 1;
    }

    /// Point-in-time copy of the retained readings, oldest first.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.inner.read().readings.iter().copied().collect()
    }

    /// Most recently appended reading.
    pub fn latest(&self) -> Option<Reading> {
        self.inner.read().readings.back().copied()
    }

    /// Number of readings currently retained.
    pub fn len(&self) -> usize {
        self.inner.read().readings.len()
    }

    /// Whether nothing has been retained yet.
    pub fn is_empty(&self) -> bool {
        self.inner.read().readings.is_empty()
    }

    /// Maximum number of retained readings.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Readings ever appended, including evicted ones.
    pub fn total_appended(&self) -> u64 {
        self.inner.read().total_appended
    }
}

/// Read-only handle to a shared [`HistoryBuffer`].
///
/// Cheap to clone; this is what the presentation layer holds.
#[derive(Debug, Clone)]
pub struct HistoryView {
    buffer: Arc<HistoryBuffer>,
}

impl HistoryView {
    /// Wrap a shared buffer.
    pub fn new(buffer: Arc<HistoryBuffer>) -> Self {
        Self { buffer }
    }

    /// See [`HistoryBuffer::snapshot`].
    pub fn snapshot(&self) -> Vec<Reading> {
        self.buffer.snapshot()
    }

    /// See [`HistoryBuffer::latest`].
    pub fn latest(&self) -> Option<Reading> {
        self.buffer.latest()
    }

    /// See [`HistoryBuffer::len`].
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// See [`HistoryBuffer::is_empty`].
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// See [`HistoryBuffer::capacity`].
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// See [`HistoryBuffer::total_appended`].
    pub fn total_appended(&self) -> u64 {
        self.buffer.total_appended()
    }
}
