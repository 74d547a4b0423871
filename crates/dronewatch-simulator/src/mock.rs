//! In-process stand-in for the aggregate HTTP API

use core::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use serde_json::Value;

use dronewatch_core::aggregate::{AggregateField, AggregateFetchError, AggregateSource};
use dronewatch_core::metrics::{RegionShare, region_percentages};
use dronewatch_core::sensors::{IdSource, normalize};
use dronewatch_core::{Parameter, Reading};

/// Every Nth request fails with a 503 so the dashboard shows stale flags.
const FAILURE_EVERY: u64 = 7;

/// Recent readings kept for the history and percentage endpoints.
const HISTORY_LIMIT: usize = 30;

/// Running totals plus a bounded window of recent readings
#[derive(Default)]
struct Collected {
    requests: u64,
    total: u64,
    by_region: BTreeMap<String, u64>,
    recent: VecDeque<Reading>,
}

/// Counts what the feeders publish and serves it back as aggregates.
pub struct MockAggregateService {
    state: BlockingMutex<CriticalSectionRawMutex, RefCell<Collected>>,
    ids: IdSource,
}

impl MockAggregateService {
    pub fn new() -> Self {
        Self {
            state: BlockingMutex::new(RefCell::new(Collected::default())),
            ids: IdSource::new(),
        }
    }

    /// Remember a payload the way the backend would after storing it
    pub fn record(&self, payload: &Value) {
        let Ok(reading) = normalize(payload, &self.ids) else {
            return;
        };
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.total += 1;
            // Upper case, like the backend's region column.
            *state
                .by_region
                .entry(reading.region.to_uppercase())
                .or_insert(0) += 1;
            if state.recent.len() == HISTORY_LIMIT {
                state.recent.pop_front();
            }
            state.recent.push_back(reading);
        });
    }

    /// Count a request, failing every [`FAILURE_EVERY`]th one, and read
    /// the answer out of the collected state
    fn request<R>(
        &self,
        endpoint: &'static str,
        answer: impl FnOnce(&Collected) -> R,
    ) -> Result<R, AggregateFetchError> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.requests += 1;
            if state.requests % FAILURE_EVERY == 0 {
                return Err(AggregateFetchError::Status {
                    endpoint,
                    status: 503,
                });
            }
            Ok(answer(&state))
        })
    }
}

impl Default for MockAggregateService {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregateSource for MockAggregateService {
    async fn total_collected(&self) -> Result<u64, AggregateFetchError> {
        self.request(AggregateField::TotalCollected.path(), |c| c.total)
    }

    async fn total_by_region(&self) -> Result<BTreeMap<String, u64>, AggregateFetchError> {
        self.request(AggregateField::TotalByRegion.path(), |c| {
            c.by_region.clone()
        })
    }

    async fn total_by_parameter(&self) -> Result<BTreeMap<String, u64>, AggregateFetchError> {
        // Every reading carries all four parameters.
        self.request(AggregateField::TotalByParameter.path(), |c| {
            Parameter::ALL
                .into_iter()
                .map(|p| (p.wire_name().to_owned(), c.total))
                .collect()
        })
    }

    async fn percentages(
        &self,
        parameter: Parameter,
    ) -> Result<Vec<RegionShare>, AggregateFetchError> {
        self.request("/api/estatisticas/percentual", |c| {
            region_percentages(&c.recent, parameter)
        })
    }

    async fn drone_history(&self) -> Result<Vec<Value>, AggregateFetchError> {
        self.request("/api/drones/status", |c| {
            c.recent
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "pressao": r.pressure,
                        "radiacao": r.radiation,
                        "temperatura": r.temperature,
                        "umidade": r.humidity,
                        "latitude": r.latitude,
                        "longitude": r.longitude,
                        "posicao": r.region,
                    })
                })
                .collect()
        })
    }
}
