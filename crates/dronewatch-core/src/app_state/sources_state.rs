//! Read access to per-source state

use std::sync::Arc;

use crate::connector::ConnectionStatus;
use crate::metrics::RegionShare;
use crate::sensors::{Parameter, Reading, SourceId};
use crate::storage::{SharedStore, SourceSnapshot};

/// Cloneable view of one source's tables
///
/// Every accessor takes the store lock for the duration of a copy and hands
/// back owned data, so a reader always sees whole readings and never holds
/// the lock while rendering.
#[derive(Clone)]
pub struct SourceHandle {
    id: SourceId,
    store: Arc<SharedStore>,
}

impl SourceHandle {
    pub(crate) fn new(id: SourceId, store: Arc<SharedStore>) -> Self {
        Self { id, store }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub async fn snapshot(&self) -> SourceSnapshot {
        self.store.lock().await.snapshot()
    }

    /// Snapshot without waiting; `None` while the connector holds the lock
    pub fn try_snapshot(&self) -> Option<SourceSnapshot> {
        self.store.try_lock().ok().map(|store| store.snapshot())
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.store.lock().await.status().clone()
    }

    /// Latest reading from `region`; matching ignores case and padding
    pub async fn latest(&self, region: &str) -> Option<Reading> {
        self.store.lock().await.latest().get(region).cloned()
    }

    /// Retained readings, newest first
    pub async fn history(&self) -> Vec<Reading> {
        self.store.lock().await.history().to_vec()
    }

    pub async fn percentages(&self, parameter: Parameter) -> Vec<RegionShare> {
        self.store.lock().await.percentages(parameter)
    }
}
