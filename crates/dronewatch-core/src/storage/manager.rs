use std::collections::BTreeMap;

use log::debug;
use serde::Serialize;

use super::{HistoryRing, LatestTable};
use crate::connector::ConnectionStatus;
use crate::metrics::{RegionShare, region_percentages};
use crate::sensors::{Parameter, Reading};

/// State owned by one source connector
///
/// Holds the Latest-State table, the History ring and the connection
/// status for a single source. Only that source's connector writes here;
/// everybody else gets a [`SourceSnapshot`].
///
/// Once [`SourceStore::close`] has run every mutator becomes a no-op and
/// returns `false`, so a connector that is still unwinding after shutdown
/// cannot change what the dashboard sees.
#[derive(Debug)]
pub struct SourceStore {
    latest: LatestTable,
    history: HistoryRing,
    status: ConnectionStatus,
    ingested: u64,
    dropped: u64,
    closed: bool,
}

impl SourceStore {
    pub fn new<I, S>(history_capacity: usize, known_regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            latest: LatestTable::with_regions(known_regions),
            history: HistoryRing::new(history_capacity),
            status: ConnectionStatus::Disconnected,
            ingested: 0,
            dropped: 0,
            closed: false,
        }
    }

    /// Admit a normalized reading into both tables
    pub fn ingest(&mut self, reading: Reading) -> bool {
        if self.closed {
            return false;
        }

        self.latest.record(reading.clone());
        if let Some(evicted) = self.history.push(reading) {
            debug!("Evicted reading {} from history", evicted.id);
        }
        self.ingested += 1;
        true
    }

    /// Count a payload that failed normalization
    pub fn record_drop(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.dropped += 1;
        true
    }

    /// Update the connection status, returning whether it changed
    pub fn set_status(&mut self, status: ConnectionStatus) -> bool {
        if self.closed || self.status == status {
            return false;
        }
        self.status = status;
        true
    }

    /// Mark the source as shut down; returns whether this call closed it
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.status = ConnectionStatus::Disconnected;
        self.closed = true;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn latest(&self) -> &LatestTable {
        &self.latest
    }

    pub fn history(&self) -> &HistoryRing {
        &self.history
    }

    /// Region breakdown of `parameter` over the current history
    pub fn percentages(&self, parameter: Parameter) -> Vec<RegionShare> {
        region_percentages(self.history.iter(), parameter)
    }

    /// Copy out everything a dashboard renders
    pub fn snapshot(&self) -> SourceSnapshot {
        SourceSnapshot {
            status: self.status.clone(),
            latest: self.latest.to_map(),
            history: self.history.to_vec(),
            history_capacity: self.history.capacity(),
            ingested: self.ingested,
            dropped: self.dropped,
        }
    }
}

/// Point-in-time copy of a [`SourceStore`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSnapshot {
    pub status: ConnectionStatus,
    pub latest: BTreeMap<String, Option<Reading>>,
    /// Newest first
    pub history: Vec<Reading>,
    pub history_capacity: usize,
    pub ingested: u64,
    pub dropped: u64,
}

impl SourceSnapshot {
    /// Latest reading for `region`, if any has arrived
    pub fn latest_for(&self, region: &str) -> Option<&Reading> {
        self.latest
            .get(&crate::sensors::canonical_region(region))?
            .as_ref()
    }
}
