//! Per-source reading state
//!
//! Each source owns one [`SourceStore`]: a [`LatestTable`] keyed by canonical
//! region and a newest-first [`HistoryRing`]. Stores are wrapped in their own
//! async mutex so the two sources never contend with each other, and locks
//! are only held for the in-memory update itself.

mod history;
mod latest;
pub mod manager;

pub use history::HistoryRing;
pub use latest::LatestTable;
pub use manager::{SourceSnapshot, SourceStore};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex as AsyncMutex;

/// Lock-protected store shared between a connector and its readers
pub type SharedStore = AsyncMutex<CriticalSectionRawMutex, SourceStore>;
