//! Source connector lifecycle
//!
//! A [`SourceConnector`] owns a single transport session and the writes to
//! one [`SourceStore`](crate::storage::SourceStore). It connects, subscribes,
//! pumps messages through the normalizer and into the store, and on any
//! transport failure reports `Error`, waits out the reconnect delay and tries
//! again. Only an explicit shutdown ends the loop.

mod status;

pub use status::{ConnectionStatus, StatusReason};

use core::time::Duration;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::app_state::{EngineEvent, EventChannel, notify};
use crate::config::SourceConfig;
use crate::sensors::{IdSource, SourceId, normalize_bytes};
use crate::storage::SharedStore;
use crate::transport::{SessionOptions, Transport, TransportError};

/// Write side of one source: its store, the event channel and the id source
#[derive(Clone)]
pub struct SourceSink {
    source: SourceId,
    store: Arc<SharedStore>,
    events: Arc<EventChannel>,
    ids: Arc<IdSource>,
}

impl SourceSink {
    pub fn new(
        source: SourceId,
        store: Arc<SharedStore>,
        events: Arc<EventChannel>,
        ids: Arc<IdSource>,
    ) -> Self {
        Self {
            source,
            store,
            events,
            ids,
        }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    /// Normalize one message body and apply it to the store.
    ///
    /// Returns whether the reading was admitted. Rejected payloads are
    /// counted and reported; they never touch the tables.
    pub async fn accept(&self, body: &[u8]) -> bool {
        match normalize_bytes(body, &self.ids) {
            Ok(reading) => {
                debug!(
                    "{}: reading {} from {}",
                    self.source, reading.id, reading.region
                );
                let admitted = self.store.lock().await.ingest(reading.clone());
                if admitted {
                    notify(
                        &self.events,
                        EngineEvent::Reading {
                            source: self.source,
                            reading,
                        },
                    );
                }
                admitted
            }
            Err(e) => {
                warn!("{}: dropping payload: {}", self.source, e);
                let counted = self.store.lock().await.record_drop();
                if counted {
                    notify(
                        &self.events,
                        EngineEvent::Dropped {
                            source: self.source,
                            error: e,
                        },
                    );
                }
                false
            }
        }
    }

    /// Record a status transition, publishing it when it changed
    pub async fn set_status(&self, status: ConnectionStatus) {
        let changed = self.store.lock().await.set_status(status.clone());
        if changed {
            info!("{} status: {}", self.source, status);
            notify(
                &self.events,
                EngineEvent::Status {
                    source: self.source,
                    status,
                },
            );
        }
    }

    /// Latch the store closed and announce the final `Disconnected`
    pub async fn close(&self) {
        let closed = self.store.lock().await.close();
        if closed {
            info!("{} status: {}", self.source, ConnectionStatus::Disconnected);
            notify(
                &self.events,
                EngineEvent::Status {
                    source: self.source,
                    status: ConnectionStatus::Disconnected,
                },
            );
        }
    }
}

enum SessionEnd {
    Shutdown,
    Failed(TransportError),
}

/// Drives one transport session for one source
pub struct SourceConnector<T> {
    transport: T,
    options: SessionOptions,
    destinations: Vec<String>,
    reconnect_delay: Duration,
    close_timeout: Duration,
    sink: SourceSink,
}

impl<T: Transport + 'static> SourceConnector<T> {
    pub fn new(
        transport: T,
        config: &SourceConfig,
        close_timeout: Duration,
        sink: SourceSink,
    ) -> Self {
        Self {
            transport,
            options: config.session_options(sink.source()),
            destinations: config.destinations.clone(),
            reconnect_delay: config.reconnect_delay(),
            close_timeout,
            sink,
        }
    }

    /// Run until `cancel` fires, reconnecting after every failure
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            self.sink.set_status(ConnectionStatus::Connecting).await;

            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.open_session() => Some(result),
            };

            let failure = match opened {
                None => break,
                Some(Err(e)) => e,
                Some(Ok(())) => {
                    self.sink.set_status(ConnectionStatus::Connected).await;
                    match self.pump(&cancel).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Failed(e) => e,
                    }
                }
            };

            warn!("{}: {}", self.sink.source(), failure);
            self.sink.set_status(ConnectionStatus::error(&failure)).await;
            self.teardown().await;

            debug!(
                "{}: reconnecting in {:?}",
                self.sink.source(),
                self.reconnect_delay
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = time::sleep(self.reconnect_delay) => {}
            }
        }

        self.shutdown().await;
    }

    async fn open_session(&mut self) -> Result<(), TransportError> {
        self.transport.connect(&self.options).await?;
        for channel in &self.destinations {
            self.transport.subscribe(channel).await?;
        }
        Ok(())
    }

    async fn pump(&mut self, cancel: &CancellationToken) -> SessionEnd {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => return SessionEnd::Shutdown,
                delivery = self.transport.recv() => match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => return SessionEnd::Failed(e),
                },
            };
            self.sink.accept(&delivery.payload).await;
        }
    }

    /// Drop a failed session before the next attempt
    async fn teardown(&mut self) {
        match time::timeout(self.close_timeout, self.transport.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("{}: close after failure: {}", self.sink.source(), e),
            Err(_) => warn!("{}: close after failure timed out", self.sink.source()),
        }
    }

    async fn release(&mut self) -> Result<(), TransportError> {
        for channel in &self.destinations {
            if let Err(e) = self.transport.unsubscribe(channel).await {
                debug!("{}: unsubscribe {}: {}", self.sink.source(), channel, e);
            }
        }
        self.transport.close().await
    }

    async fn shutdown(&mut self) {
        match time::timeout(self.close_timeout, self.release()).await {
            Ok(Ok(())) => debug!("{}: session closed", self.sink.source()),
            Ok(Err(e)) => warn!("{}: close failed: {}", self.sink.source(), e),
            Err(_) => error!(
                "{}: close did not finish within {:?}",
                self.sink.source(),
                self.close_timeout
            ),
        }
        self.sink.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SourceStore;
    use crate::transport::{ChannelFeed, ChannelTransport, channel_transport};
    use embassy_sync::pubsub::WaitResult;
    use tokio::task::JoinHandle;

    const TOPIC: &str = "mqtt/dadosClima";

    fn payload(region: &str, temperature: f64) -> String {
        serde_json::json!({
            "pressao": 1013.0,
            "radiacao": 200.0,
            "temperatura": temperature,
            "umidade": 55.0,
            "latitude": -3.1,
            "longitude": -60.0,
            "posicao": region,
        })
        .to_string()
    }

    struct Rig {
        feed: ChannelFeed,
        store: Arc<SharedStore>,
        events: Arc<EventChannel>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    }

    fn start_with(source: SourceId, events: Arc<EventChannel>, ids: Arc<IdSource>) -> Rig {
        let config = SourceConfig {
            reconnect_delay_ms: 20,
            history_capacity: 7,
            ..SourceConfig::mqtt_defaults()
        };
        let (transport, feed): (ChannelTransport, ChannelFeed) = channel_transport(16);
        let store = Arc::new(SharedStore::new(SourceStore::new(
            config.history_capacity,
            &config.known_regions,
        )));
        let sink = SourceSink::new(source, store.clone(), events.clone(), ids);
        let connector =
            SourceConnector::new(transport, &config, Duration::from_millis(200), sink);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(connector.run(cancel.clone()));
        Rig {
            feed,
            store,
            events,
            cancel,
            task,
        }
    }

    fn start() -> Rig {
        start_with(
            SourceId::Mqtt,
            Arc::new(EventChannel::new()),
            Arc::new(IdSource::new()),
        )
    }

    async fn wait_until<F>(store: &SharedStore, mut condition: F)
    where
        F: FnMut(&SourceStore) -> bool,
    {
        for _ in 0..200 {
            if condition(&*store.lock().await) {
                return;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn stop(rig: &mut Rig) {
        rig.cancel.cancel();
        (&mut rig.task).await.unwrap();
    }

    #[tokio::test]
    async fn test_readings_reach_latest_and_history() {
        let mut rig = start();
        wait_until(&rig.store, |s| s.status().is_connected()).await;

        rig.feed.publish(TOPIC, payload("Norte", 20.0)).await.unwrap();
        rig.feed.publish(TOPIC, payload("norte ", 25.0)).await.unwrap();
        wait_until(&rig.store, |s| s.history().len() == 2).await;

        {
            let store = rig.store.lock().await;
            let latest = store.latest().get("norte").unwrap();
            assert_eq!(latest.temperature, 25.0);
            assert_eq!(store.history().newest().unwrap().temperature, 25.0);
            assert!(store.latest().get("sul").is_none());
            assert!(store.latest().contains("sul"));
        }

        stop(&mut rig).await;
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped_without_state_change() {
        let mut rig = start();
        wait_until(&rig.store, |s| s.status().is_connected()).await;

        rig.feed.publish(TOPIC, "{not json").await.unwrap();
        rig.feed
            .publish(TOPIC, r#"{"temperatura": 1.0, "posicao": "sul"}"#)
            .await
            .unwrap();
        rig.feed.publish(TOPIC, payload("sul", 30.0)).await.unwrap();
        wait_until(&rig.store, |s| s.history().len() == 1).await;

        let snapshot = rig.store.lock().await.snapshot();
        assert_eq!(snapshot.dropped, 2);
        assert_eq!(snapshot.ingested, 1);
        assert!(snapshot.status.is_connected());
        assert_eq!(snapshot.latest_for("sul").unwrap().temperature, 30.0);

        stop(&mut rig).await;
    }

    #[tokio::test]
    async fn test_transport_fault_reconnects_after_backoff() {
        let mut rig = start();
        let mut events = rig.events.subscriber().unwrap();
        wait_until(&rig.store, |s| s.status().is_connected()).await;

        rig.feed.inject_fault("broker went away").await.unwrap();

        let mut saw_error = false;
        loop {
            let WaitResult::Message(event) = events.next_message().await else {
                continue;
            };
            if let EngineEvent::Status { status, .. } = event {
                if status.is_error() {
                    saw_error = true;
                }
                if saw_error && status.is_connected() {
                    break;
                }
            }
        }
        assert_eq!(rig.feed.connect_attempts(), 2);

        // The new session is subscribed again and ingests as before.
        rig.feed.publish(TOPIC, payload("leste", 12.0)).await.unwrap();
        wait_until(&rig.store, |s| s.history().len() == 1).await;

        drop(events);
        stop(&mut rig).await;
    }

    #[tokio::test]
    async fn test_refused_connects_are_retried() {
        let events = Arc::new(EventChannel::new());
        let config = SourceConfig {
            reconnect_delay_ms: 10,
            ..SourceConfig::mqtt_defaults()
        };
        let (transport, feed) = channel_transport(4);
        feed.refuse_connects(3);
        let store = Arc::new(SharedStore::new(SourceStore::new(10, ["norte"])));
        let sink = SourceSink::new(
            SourceId::Mqtt,
            store.clone(),
            events,
            Arc::new(IdSource::new()),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            SourceConnector::new(transport, &config, Duration::from_millis(100), sink)
                .run(cancel.clone()),
        );

        wait_until(&store, |s| s.status().is_connected()).await;
        assert_eq!(feed.connect_attempts(), 4);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_session_and_freezes_state() {
        let mut rig = start();
        wait_until(&rig.store, |s| s.status().is_connected()).await;
        rig.feed.publish(TOPIC, payload("oeste", 18.0)).await.unwrap();
        wait_until(&rig.store, |s| s.history().len() == 1).await;

        stop(&mut rig).await;
        assert!(rig.feed.close_calls() >= 1);
        assert!(!rig.feed.is_connected());

        let before = rig.store.lock().await.snapshot();
        assert_eq!(before.status, ConnectionStatus::Disconnected);
        assert!(rig.store.lock().await.is_closed());

        // Nobody pumps the feed anymore; a late payload changes nothing.
        let _ = rig.feed.publish(TOPIC, payload("oeste", 99.0)).await;
        time::sleep(Duration::from_millis(30)).await;
        assert_eq!(rig.store.lock().await.snapshot(), before);
    }

    #[tokio::test]
    async fn test_connectors_fail_independently() {
        let events = Arc::new(EventChannel::new());
        let ids = Arc::new(IdSource::new());
        let mut mqtt = start_with(SourceId::Mqtt, events.clone(), ids.clone());
        let mut stomp = start_with(SourceId::Stomp, events, ids);
        wait_until(&mqtt.store, |s| s.status().is_connected()).await;
        wait_until(&stomp.store, |s| s.status().is_connected()).await;

        stomp.feed.refuse_connects(usize::MAX);
        stomp.feed.inject_fault("stomp broker down").await.unwrap();
        wait_until(&stomp.store, |s| s.status().is_error()).await;

        mqtt.feed.publish(TOPIC, payload("norte", 21.0)).await.unwrap();
        wait_until(&mqtt.store, |s| s.history().len() == 1).await;
        assert!(mqtt.store.lock().await.status().is_connected());
        assert!(stomp.store.lock().await.history().is_empty());

        stop(&mut mqtt).await;
        stop(&mut stomp).await;
    }
}
