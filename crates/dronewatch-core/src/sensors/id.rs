//! Ingestion-time reading identifiers

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Low bits reserved for the per-millisecond sequence number
const SEQUENCE_BITS: u32 = 16;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Unique, monotonically increasing reading identifier.
///
/// Packs `(milliseconds since epoch, sequence)` into one `u64`, so ids sort
/// in arrival order and double as display keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ReadingId(u64);

impl ReadingId {
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Arrival time in milliseconds since the Unix epoch
    pub const fn millis(self) -> u64 {
        self.0 >> SEQUENCE_BITS
    }

    /// Disambiguator for arrivals within the same millisecond
    pub const fn sequence(self) -> u16 {
        (self.0 & SEQUENCE_MASK) as u16
    }
}

impl fmt::Display for ReadingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.millis(), self.sequence())
    }
}

/// Issues [`ReadingId`]s shared by every ingestion path.
///
/// The clock alone is not trusted for uniqueness: when two arrivals land in
/// the same tick, or the wall clock steps backwards, the previous id plus one
/// is issued instead.
#[derive(Debug, Default)]
pub struct IdSource {
    last: AtomicU64,
}

impl IdSource {
    pub const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Issue an id stamped with the current wall clock
    pub fn next(&self) -> ReadingId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.next_at(now)
    }

    /// Issue an id for an arrival at `millis`
    pub fn next_at(&self, millis: u64) -> ReadingId {
        let candidate = millis.min(u64::MAX >> SEQUENCE_BITS) << SEQUENCE_BITS;
        let mut previous = self.last.load(Ordering::Relaxed);
        loop {
            let next = if candidate > previous {
                candidate
            } else {
                previous + 1
            };
            match self.last.compare_exchange_weak(
                previous,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return ReadingId(next),
                Err(actual) => previous = actual,
            }
        }
    }
}
