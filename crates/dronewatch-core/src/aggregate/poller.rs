use core::time::Duration;
use std::sync::Arc;

use log::{debug, warn};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{AggregateField, AggregateFetchError, AggregateSource, FieldValue, SharedAggregates};
use crate::app_state::{EngineEvent, EventChannel, notify};

/// Periodic refresh of the aggregate snapshot
///
/// Runs one task per [`AggregateField`]. Every tick starts a new fetch
/// without waiting for the previous one, so slow responses can overlap.
/// Each fetch commits on completion under the store lock: the last one to
/// complete wins, whichever was issued first.
///
/// ## Shutdown
///
/// Cancelling the token stops the tickers and aborts in-flight fetches. A
/// fetch that still manages to complete is refused by the store's closed
/// latch once the engine has closed it.
pub struct AggregatePoller<C> {
    client: Arc<C>,
    store: Arc<SharedAggregates>,
    events: Arc<EventChannel>,
    interval: Duration,
}

impl<C: AggregateSource> AggregatePoller<C> {
    pub fn new(
        client: Arc<C>,
        store: Arc<SharedAggregates>,
        events: Arc<EventChannel>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            store,
            events,
            interval,
        }
    }

    /// Spawn the three endpoint tasks on the current Tokio runtime
    pub fn spawn(self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        AggregateField::ALL
            .into_iter()
            .map(|field| {
                let endpoint = Endpoint {
                    field,
                    client: self.client.clone(),
                    store: self.store.clone(),
                    events: self.events.clone(),
                };
                tokio::spawn(endpoint.run(self.interval, cancel.clone()))
            })
            .collect()
    }
}

/// Fetch one field once
pub async fn fetch_field<C: AggregateSource>(
    client: &C,
    field: AggregateField,
) -> Result<FieldValue, AggregateFetchError> {
    match field {
        AggregateField::TotalCollected => client.total_collected().await.map(FieldValue::Total),
        AggregateField::TotalByRegion => client.total_by_region().await.map(FieldValue::ByRegion),
        AggregateField::TotalByParameter => client
            .total_by_parameter()
            .await
            .map(FieldValue::ByParameter),
    }
}

struct Endpoint<C> {
    field: AggregateField,
    client: Arc<C>,
    store: Arc<SharedAggregates>,
    events: Arc<EventChannel>,
}

impl<C: AggregateSource> Endpoint<C> {
    async fn run(self, interval: Duration, cancel: CancellationToken) {
        // First tick completes immediately, so the view gets data at startup.
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    in_flight.spawn(fetch_and_commit(
                        self.field,
                        self.client.clone(),
                        self.store.clone(),
                        self.events.clone(),
                    ));
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        in_flight.abort_all();
        debug!("Aggregate poller for {} stopped", self.field);
    }
}

/// Fetch `field` once and commit whatever comes back
async fn fetch_and_commit<C: AggregateSource>(
    field: AggregateField,
    client: Arc<C>,
    store: Arc<SharedAggregates>,
    events: Arc<EventChannel>,
) {
    let outcome = fetch_field(&*client, field).await;
    let ok = outcome.is_ok();
    if let Err(e) = &outcome {
        warn!("Aggregate refresh of {} failed: {}", field, e);
    }

    let committed = store.lock().await.commit(field, outcome);
    if committed {
        notify(&events, EngineEvent::Aggregate { field, ok });
    } else {
        debug!("Discarded {} result after shutdown", field);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateStore;
    use crate::metrics::RegionShare;
    use crate::sensors::Parameter;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// Counts up on every successful total fetch; fails while `failing` is set
    #[derive(Default)]
    struct ScriptedSource {
        calls: AtomicU64,
        failing: AtomicBool,
        delay_first_ms: u64,
    }

    impl AggregateSource for ScriptedSource {
        async fn total_collected(&self) -> Result<u64, AggregateFetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == 1 && self.delay_first_ms > 0 {
                time::sleep(Duration::from_millis(self.delay_first_ms)).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(AggregateFetchError::Status {
                    endpoint: AggregateField::TotalCollected.path(),
                    status: 503,
                });
            }
            Ok(call * 100)
        }

        async fn total_by_region(&self) -> Result<BTreeMap<String, u64>, AggregateFetchError> {
            Ok([("Norte".to_string(), 4)].into_iter().collect())
        }

        async fn total_by_parameter(
            &self,
        ) -> Result<BTreeMap<String, u64>, AggregateFetchError> {
            Ok(BTreeMap::new())
        }

        async fn percentages(
            &self,
            _parameter: Parameter,
        ) -> Result<Vec<RegionShare>, AggregateFetchError> {
            Ok(Vec::new())
        }

        async fn drone_history(&self) -> Result<Vec<Value>, AggregateFetchError> {
            Ok(Vec::new())
        }
    }

    fn harness(
        source: ScriptedSource,
        interval_ms: u64,
    ) -> (
        Arc<ScriptedSource>,
        Arc<SharedAggregates>,
        CancellationToken,
        Vec<JoinHandle<()>>,
    ) {
        let source = Arc::new(source);
        let store = Arc::new(SharedAggregates::new(AggregateStore::new()));
        let events = Arc::new(EventChannel::new());
        let cancel = CancellationToken::new();
        let handles = AggregatePoller::new(
            source.clone(),
            store.clone(),
            events,
            Duration::from_millis(interval_ms),
        )
        .spawn(&cancel);
        (source, store, cancel, handles)
    }

    async fn stop(cancel: CancellationToken, handles: Vec<JoinHandle<()>>) {
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_fetch_is_immediate_and_regions_are_folded() {
        let (_source, store, cancel, handles) = harness(ScriptedSource::default(), 10_000);
        time::sleep(Duration::from_millis(100)).await;

        {
            let store = store.lock().await;
            let snapshot = store.snapshot();
            assert_eq!(snapshot.total_collected.value, Some(100));
            assert_eq!(snapshot.total_by_region.value.get("norte"), Some(&4));
            assert!(snapshot.total_by_parameter.loaded);
        }

        stop(cancel, handles).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_value_then_recovers() {
        let (source, store, cancel, handles) = harness(ScriptedSource::default(), 40);
        time::sleep(Duration::from_millis(20)).await;
        let before = store.lock().await.snapshot().total_collected.value;
        assert!(before.is_some());

        source.failing.store(true, Ordering::SeqCst);
        time::sleep(Duration::from_millis(100)).await;
        {
            let store = store.lock().await;
            let total = &store.snapshot().total_collected;
            assert!(total.has_error());
            assert_eq!(total.value, before);
        }

        source.failing.store(false, Ordering::SeqCst);
        time::sleep(Duration::from_millis(100)).await;
        {
            let store = store.lock().await;
            let total = &store.snapshot().total_collected;
            assert!(!total.has_error());
            assert!(total.value > before);
        }

        stop(cancel, handles).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_completed_wins_over_last_issued() {
        // The first request stalls past the second tick, so the second
        // request (value 200) completes first and the first (value 100)
        // lands last.
        let source = ScriptedSource {
            delay_first_ms: 120,
            ..ScriptedSource::default()
        };
        let (source, store, cancel, handles) = harness(source, 50);

        time::sleep(Duration::from_millis(75)).await;
        assert_eq!(store.lock().await.snapshot().total_collected.value, Some(200));

        // A third request lands at 100ms, then the stalled first one at 120ms.
        time::sleep(Duration::from_millis(70)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.lock().await.snapshot().total_collected.value, Some(100));

        stop(cancel, handles).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_store_refuses_commits() {
        let (_source, store, cancel, handles) = harness(ScriptedSource::default(), 20);
        time::sleep(Duration::from_millis(10)).await;

        store.lock().await.close();
        let frozen = store.lock().await.snapshot().clone();
        time::sleep(Duration::from_millis(60)).await;

        assert_eq!(store.lock().await.snapshot(), &frozen);
        stop(cancel, handles).await;
    }
}
