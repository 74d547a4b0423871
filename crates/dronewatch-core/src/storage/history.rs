use std::collections::VecDeque;

use crate::sensors::Reading;

/// Newest-first ring of readings capped at a fixed capacity.
///
/// Inserting prepends; once the ring is full the oldest reading (the tail)
/// is evicted and handed back to the caller.
#[derive(Debug, Clone)]
pub struct HistoryRing {
    entries: VecDeque<Reading>,
    capacity: usize,
}

impl HistoryRing {
    /// Create an empty ring. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Prepend a reading, returning the evicted tail if the ring was full
    pub fn push(&mut self, reading: Reading) -> Option<Reading> {
        self.entries.push_front(reading);
        if self.entries.len() > self.capacity {
            self.entries.pop_back()
        } else {
            None
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent reading
    pub fn newest(&self) -> Option<&Reading> {
        self.entries.front()
    }

    /// Reading at `index`, where 0 is the newest
    pub fn get(&self, index: usize) -> Option<&Reading> {
        self.entries.get(index)
    }

    /// Iterate newest first (non-consuming, read-only access)
    pub fn iter(&self) -> impl Iterator<Item = &Reading> {
        self.entries.iter()
    }

    /// Copy out the ring, newest first
    pub fn to_vec(&self) -> Vec<Reading> {
        self.entries.iter().cloned().collect()
    }
}
