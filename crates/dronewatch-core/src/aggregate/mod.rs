//! Remote aggregate statistics
//!
//! The aggregate service computes totals over everything it has ever
//! collected. The poller mirrors three of its endpoints into an
//! [`AggregateStore`]; a failed refresh keeps the previous value and raises
//! the field's error flag, so the dashboard prefers stale data over none.

mod client;
pub mod poller;

pub use client::{AggregateFetchError, AggregateSource, HttpAggregateClient};
pub use poller::AggregatePoller;

use core::fmt;
use std::collections::BTreeMap;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex as AsyncMutex;
use serde::Serialize;

use crate::sensors::{Parameter, canonical_region};

/// Lock-protected aggregate state shared by the poller and readers
pub type SharedAggregates = AsyncMutex<CriticalSectionRawMutex, AggregateStore>;

/// The independently refreshed parts of the snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AggregateField {
    TotalCollected,
    TotalByRegion,
    TotalByParameter,
}

impl AggregateField {
    pub const ALL: [AggregateField; 3] = [
        Self::TotalCollected,
        Self::TotalByRegion,
        Self::TotalByParameter,
    ];

    /// API path serving this field
    pub const fn path(self) -> &'static str {
        match self {
            Self::TotalCollected => "/api/estatisticas/total-coletado",
            Self::TotalByRegion => "/api/estatisticas/total-por-regiao",
            Self::TotalByParameter => "/api/estatisticas/total-por-elemento-climatico",
        }
    }
}

impl fmt::Display for AggregateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TotalCollected => "total collected",
            Self::TotalByRegion => "total by region",
            Self::TotalByParameter => "total by parameter",
        })
    }
}

/// A freshly fetched value for one field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Total(u64),
    ByRegion(BTreeMap<String, u64>),
    ByParameter(BTreeMap<String, u64>),
}

impl FieldValue {
    pub const fn field(&self) -> AggregateField {
        match self {
            Self::Total(_) => AggregateField::TotalCollected,
            Self::ByRegion(_) => AggregateField::TotalByRegion,
            Self::ByParameter(_) => AggregateField::TotalByParameter,
        }
    }
}

/// A value plus the outcome of its latest refresh
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tracked<T> {
    pub value: T,
    /// Set while the most recent completed fetch failed
    pub error: Option<String>,
    /// At least one fetch has completed, successfully or not
    pub loaded: bool,
    /// Completed fetches committed so far
    pub generation: u64,
}

impl<T> Tracked<T> {
    fn succeed(&mut self, value: T) {
        self.value = value;
        self.error = None;
        self.loaded = true;
        self.generation += 1;
    }

    fn fail(&mut self, error: String) {
        self.error = Some(error);
        self.loaded = true;
        self.generation += 1;
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
    /// `None` until the first successful fetch
    pub total_collected: Tracked<Option<u64>>,
    pub total_by_region: Tracked<BTreeMap<String, u64>>,
    pub total_by_parameter: Tracked<BTreeMap<String, u64>>,
}

impl AggregateSnapshot {
    pub fn has_error(&self, field: AggregateField) -> bool {
        match field {
            AggregateField::TotalCollected => self.total_collected.has_error(),
            AggregateField::TotalByRegion => self.total_by_region.has_error(),
            AggregateField::TotalByParameter => self.total_by_parameter.has_error(),
        }
    }
}

/// Wire name for known parameters, trimmed lower case for anything else
fn canonical_parameter(key: &str) -> String {
    match key.parse::<Parameter>() {
        Ok(parameter) => parameter.wire_name().to_owned(),
        Err(_) => key.trim().to_lowercase(),
    }
}

/// Fold keys with `canonical`, summing counts that collide
fn fold_counts(
    counts: BTreeMap<String, u64>,
    canonical: impl Fn(&str) -> String,
) -> BTreeMap<String, u64> {
    let mut folded = BTreeMap::new();
    for (key, count) in counts {
        let entry = folded.entry(canonical(&key)).or_insert(0u64);
        *entry = entry.saturating_add(count);
    }
    folded
}

/// Aggregate state with a shutdown latch
#[derive(Debug, Default)]
pub struct AggregateStore {
    snapshot: AggregateSnapshot,
    closed: bool,
}

impl AggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a completed fetch; results land in completion order.
    ///
    /// Returns `false` without touching anything once the store is closed.
    pub fn commit(
        &mut self,
        field: AggregateField,
        outcome: Result<FieldValue, AggregateFetchError>,
    ) -> bool {
        if self.closed {
            return false;
        }

        match outcome {
            Ok(FieldValue::Total(total)) => self.snapshot.total_collected.succeed(Some(total)),
            Ok(FieldValue::ByRegion(counts)) => self
                .snapshot
                .total_by_region
                .succeed(fold_counts(counts, canonical_region)),
            Ok(FieldValue::ByParameter(counts)) => self
                .snapshot
                .total_by_parameter
                .succeed(fold_counts(counts, canonical_parameter)),
            Err(error) => {
                let message = error.to_string();
                match field {
                    AggregateField::TotalCollected => self.snapshot.total_collected.fail(message),
                    AggregateField::TotalByRegion => self.snapshot.total_by_region.fail(message),
                    AggregateField::TotalByParameter => {
                        self.snapshot.total_by_parameter.fail(message)
                    }
                }
            }
        }
        true
    }

    /// Refuse every later commit
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn snapshot(&self) -> &AggregateSnapshot {
        &self.snapshot
    }
}
