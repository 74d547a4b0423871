//! Engine-wide state and error types for dronewatch

mod events;
mod sources_state;

pub use events::*;
pub use sources_state::*;

pub(crate) use events::notify;

use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::aggregate::{
    AggregateFetchError, AggregatePoller, AggregateSnapshot, AggregateSource, AggregateStore,
    SharedAggregates,
};
use crate::config::{ConfigError, EngineConfig};
use crate::connector::{SourceConnector, SourceSink};
use crate::metrics::RegionShare;
use crate::sensors::{IdSource, NormalizeError, Parameter, SourceId, normalize};
use crate::storage::{SharedStore, SourceStore};
use crate::transport::{Transport, TransportError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("aggregate error: {0}")]
    AggregateFetch(#[from] AggregateFetchError),
    #[error("invalid reading: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("{0} source already has a transport attached")]
    AlreadyAttached(SourceId),
    #[error("aggregate poller already running")]
    PollerRunning,
    #[error("engine is shutting down")]
    ShuttingDown,
    #[error("no Tokio runtime to spawn tasks on")]
    NoRuntime,
    #[error("all event subscriber slots are taken")]
    NoSubscriberSlots,
}

/// Truncating conversion into a bounded string
pub trait FromTruncated<T> {
    fn from_truncated(value: T) -> Self;
}

impl<'a, const N: usize> FromTruncated<&'a str> for heapless::String<N> {
    /// Copies as many whole characters as fit
    fn from_truncated(value: &'a str) -> Self {
        let mut out = heapless::String::<N>::new();
        for c in value.chars() {
            if out.push(c).is_err() {
                break;
            }
        }
        out
    }
}

/// Outcome of a history backfill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BackfillReport {
    /// Records ingested into the source's tables
    pub admitted: usize,
    /// Records that failed validation or arrived after shutdown
    pub skipped: usize,
}

/// The stream aggregation engine
///
/// Owns the per-source stores, the aggregate snapshot and the event channel,
/// and spawns one connector task per attached transport plus the aggregate
/// poller tasks. All tasks share one cancellation token; [`Engine::shutdown`]
/// fires it, waits for the tasks within the configured grace period and then
/// latches every store closed.
pub struct Engine {
    config: EngineConfig,
    ids: Arc<IdSource>,
    events: Arc<EventChannel>,
    mqtt: Arc<SharedStore>,
    stomp: Arc<SharedStore>,
    aggregates: Arc<SharedAggregates>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    attached: BTreeSet<SourceId>,
    poller_running: bool,
    shut_down: bool,
}

impl Engine {
    /// Validate `config` and create empty stores for both sources
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let store_for = |id: SourceId| {
            let source = config.source(id);
            let store = SourceStore::new(source.history_capacity, &source.known_regions);
            Arc::new(SharedStore::new(store))
        };
        let mqtt = store_for(SourceId::Mqtt);
        let stomp = store_for(SourceId::Stomp);

        Ok(Self {
            config,
            ids: Arc::new(IdSource::new()),
            events: Arc::new(EventChannel::new()),
            mqtt,
            stomp,
            aggregates: Arc::new(SharedAggregates::new(AggregateStore::new())),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            attached: BTreeSet::new(),
            poller_running: false,
            shut_down: false,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a connector for `source` driving `transport`
    pub fn attach<T>(&mut self, source: SourceId, transport: T) -> Result<(), EngineError>
    where
        T: Transport + 'static,
    {
        let runtime = self.runtime()?;
        if self.attached.contains(&source) {
            return Err(EngineError::AlreadyAttached(source));
        }

        let connector = SourceConnector::new(
            transport,
            self.config.source(source),
            self.config.close_timeout(),
            self.sink(source),
        );
        self.tasks.push(runtime.spawn(connector.run(self.cancel.clone())));
        self.attached.insert(source);
        info!("Attached {} transport", source);
        Ok(())
    }

    /// Start refreshing the aggregate snapshot from `client`
    pub fn start_poller<C: AggregateSource>(&mut self, client: Arc<C>) -> Result<(), EngineError> {
        let runtime = self.runtime()?;
        if self.poller_running {
            return Err(EngineError::PollerRunning);
        }

        let poller = AggregatePoller::new(
            client,
            self.aggregates.clone(),
            self.events.clone(),
            self.config.poll_interval(),
        );
        // Entering the runtime lets the poller spawn from outside a task.
        let _guard = runtime.enter();
        self.tasks.extend(poller.spawn(&self.cancel));
        self.poller_running = true;
        info!(
            "Aggregate poller started, refreshing every {:?}",
            self.config.poll_interval()
        );
        Ok(())
    }

    fn runtime(&self) -> Result<Handle, EngineError> {
        if self.shut_down || self.cancel.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        Handle::try_current().map_err(|_| EngineError::NoRuntime)
    }

    fn store(&self, source: SourceId) -> Arc<SharedStore> {
        match source {
            SourceId::Mqtt => self.mqtt.clone(),
            SourceId::Stomp => self.stomp.clone(),
        }
    }

    fn sink(&self, source: SourceId) -> SourceSink {
        SourceSink::new(
            source,
            self.store(source),
            self.events.clone(),
            self.ids.clone(),
        )
    }

    /// Read handle for one source's tables
    pub fn source(&self, source: SourceId) -> SourceHandle {
        SourceHandle::new(source, self.store(source))
    }

    pub async fn aggregates(&self) -> AggregateSnapshot {
        self.aggregates.lock().await.snapshot().clone()
    }

    /// Region breakdown of `parameter` over one source's history
    pub async fn percentages(&self, source: SourceId, parameter: Parameter) -> Vec<RegionShare> {
        self.source(source).percentages(parameter).await
    }

    /// One-shot server-side breakdown of `parameter`
    pub async fn remote_percentages<C: AggregateSource>(
        &self,
        client: &C,
        parameter: Parameter,
    ) -> Result<Vec<RegionShare>, EngineError> {
        let shares = client.percentages(parameter).await?;
        debug!("Fetched {} remote shares for {}", shares.len(), parameter);
        Ok(shares)
    }

    pub fn events(&self) -> Arc<EventChannel> {
        self.events.clone()
    }

    /// Listen to engine notifications
    pub fn subscribe(&self) -> Result<EventSubscriber<'_>, EngineError> {
        self.events
            .subscriber()
            .map_err(|_| EngineError::NoSubscriberSlots)
    }

    /// Ingest historical records into `source`, in the order given.
    ///
    /// Records are expected oldest first so the newest ends up at the head of
    /// the history. Invalid records are skipped; capacity still applies.
    pub async fn backfill(&self, source: SourceId, records: &[Value]) -> BackfillReport {
        let mut report = BackfillReport::default();
        let shared = self.store(source);
        let mut store = shared.lock().await;

        for record in records {
            match normalize(record, &self.ids) {
                Ok(reading) => {
                    if store.ingest(reading) {
                        report.admitted += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                Err(e) => {
                    debug!("{}: skipping history record: {}", source, e);
                    report.skipped += 1;
                }
            }
        }

        info!(
            "{}: backfilled {} readings, skipped {}",
            source, report.admitted, report.skipped
        );
        report
    }

    /// Fetch the remote drone history and backfill it into `source`
    pub async fn backfill_from<C: AggregateSource>(
        &self,
        source: SourceId,
        client: &C,
    ) -> Result<BackfillReport, EngineError> {
        let records = client.drone_history().await?;
        Ok(self.backfill(source, &records).await)
    }

    /// Stop every task and latch all state closed.
    ///
    /// Tasks that outlive the grace period are aborted. Calling this again is
    /// a no-op.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        info!("Shutting down engine");
        self.cancel.cancel();

        let deadline = Instant::now() + self.config.shutdown_grace();
        for mut task in self.tasks.drain(..) {
            match time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Engine task failed: {}", e),
                Err(_) => {
                    warn!("Engine task did not stop in time, aborting");
                    task.abort();
                }
            }
        }

        for source in SourceId::ALL {
            self.sink(source).close().await;
        }
        self.aggregates.lock().await.close();
        info!("Engine stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateField;
    use core::time::Duration;
    use std::collections::BTreeMap;
    use crate::connector::ConnectionStatus;
    use crate::transport::channel_transport;
    use embassy_sync::pubsub::WaitResult;
    use serde_json::json;

    fn record(region: &str, temperature: f64) -> Value {
        json!({
            "pressao": 1000.0,
            "radiacao": 150.0,
            "temperatura": temperature,
            "umidade": 60.0,
            "latitude": -1.0,
            "longitude": -48.0,
            "posicao": region,
        })
    }

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.poll_interval_ms = 20;
        config.shutdown_grace_ms = 500;
        config.close_timeout_ms = 100;
        config.mqtt.reconnect_delay_ms = 20;
        config.stomp.reconnect_delay_ms = 20;
        config
    }

    struct FixedSource;

    impl AggregateSource for FixedSource {
        async fn total_collected(&self) -> Result<u64, AggregateFetchError> {
            Ok(12)
        }

        async fn total_by_region(&self) -> Result<BTreeMap<String, u64>, AggregateFetchError> {
            Ok([("Sul".to_string(), 12)].into_iter().collect())
        }

        async fn total_by_parameter(
            &self,
        ) -> Result<BTreeMap<String, u64>, AggregateFetchError> {
            Ok([("temperatura".to_string(), 12)].into_iter().collect())
        }

        async fn percentages(
            &self,
            _parameter: Parameter,
        ) -> Result<Vec<RegionShare>, AggregateFetchError> {
            Ok(vec![RegionShare {
                region: "sul".into(),
                percentage: 100.0,
            }])
        }

        async fn drone_history(&self) -> Result<Vec<Value>, AggregateFetchError> {
            Ok(vec![record("norte", 1.0), json!({"posicao": 3}), record("sul", 2.0)])
        }
    }

    #[test]
    fn test_truncation_keeps_whole_chars() {
        let s: heapless::String<4> = heapless::String::from_truncated("açaí");
        assert_eq!(s.as_str(), "aça");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.mqtt.history_capacity = 0;
        assert!(matches!(Engine::new(config), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_attach_needs_a_runtime() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let (transport, _feed) = channel_transport(1);
        assert!(matches!(
            engine.attach(SourceId::Mqtt, transport),
            Err(EngineError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_known_regions_start_empty() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let snapshot = engine.source(SourceId::Mqtt).snapshot().await;

        assert_eq!(snapshot.latest.len(), 4);
        assert!(snapshot.latest.values().all(Option::is_none));
        assert_eq!(snapshot.history_capacity, 10);
        assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
        assert!(engine.source(SourceId::Stomp).snapshot().await.latest.is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_ingest_and_shutdown() {
        let mut engine = Engine::new(fast_config()).unwrap();
        let channel = engine.events();
        let mut events = channel.subscriber().unwrap();
        let (mqtt, mqtt_feed) = channel_transport(8);
        let (stomp, _stomp_feed) = channel_transport(8);
        engine.attach(SourceId::Mqtt, mqtt).unwrap();
        engine.attach(SourceId::Stomp, stomp).unwrap();

        let (again, _) = channel_transport(1);
        assert!(matches!(
            engine.attach(SourceId::Mqtt, again),
            Err(EngineError::AlreadyAttached(SourceId::Mqtt))
        ));

        loop {
            if let WaitResult::Message(EngineEvent::Status { source, status }) =
                events.next_message().await
                && source == SourceId::Mqtt
                && status.is_connected()
            {
                break;
            }
        }

        mqtt_feed
            .publish("mqtt/dadosClima", record("Norte", 20.0).to_string())
            .await
            .unwrap();
        loop {
            if let WaitResult::Message(EngineEvent::Reading { source, reading }) =
                events.next_message().await
            {
                assert_eq!(source, SourceId::Mqtt);
                assert_eq!(reading.region, "norte");
                break;
            }
        }

        let latest = engine.source(SourceId::Mqtt).latest("NORTE").await.unwrap();
        assert_eq!(latest.temperature, 20.0);
        assert!(engine.source(SourceId::Stomp).history().await.is_empty());

        drop(events);
        engine.shutdown().await;
        assert!(engine.is_shut_down());
        assert_eq!(
            engine.source(SourceId::Mqtt).status().await,
            ConnectionStatus::Disconnected
        );
        assert!(mqtt_feed.close_calls() >= 1);

        let (late, _) = channel_transport(1);
        assert!(matches!(
            engine.attach(SourceId::Stomp, late),
            Err(EngineError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_poller_fills_snapshot_until_shutdown() {
        let mut engine = Engine::new(fast_config()).unwrap();
        engine.start_poller(Arc::new(FixedSource)).unwrap();
        assert!(matches!(
            engine.start_poller(Arc::new(FixedSource)),
            Err(EngineError::PollerRunning)
        ));

        time::sleep(Duration::from_millis(50)).await;
        let snapshot = engine.aggregates().await;
        assert_eq!(snapshot.total_collected.value, Some(12));
        assert_eq!(snapshot.total_by_region.value.get("sul"), Some(&12));
        assert!(!snapshot.has_error(AggregateField::TotalByParameter));

        engine.shutdown().await;
        let frozen = engine.aggregates().await;
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.aggregates().await, frozen);
    }

    #[tokio::test]
    async fn test_backfill_ingests_oldest_first_and_skips_invalid() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let report = engine
            .backfill_from(SourceId::Stomp, &FixedSource)
            .await
            .unwrap();

        assert_eq!(
            report,
            BackfillReport {
                admitted: 2,
                skipped: 1
            }
        );
        let history = engine.source(SourceId::Stomp).history().await;
        assert_eq!(history[0].region, "sul");
        assert_eq!(history[1].region, "norte");
        assert!(history[0].id > history[1].id);
    }

    #[tokio::test]
    async fn test_backfill_honors_capacity() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let records: Vec<Value> = (0..15).map(|i| record("leste", f64::from(i))).collect();

        let report = engine.backfill(SourceId::Mqtt, &records).await;
        assert_eq!(report.admitted, 15);

        let history = engine.source(SourceId::Mqtt).history().await;
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].temperature, 14.0);
    }

    #[tokio::test]
    async fn test_remote_percentages_pass_through() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let shares = engine
            .remote_percentages(&FixedSource, Parameter::Humidity)
            .await
            .unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].percentage, 100.0);
    }
}
