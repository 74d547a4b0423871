//! Console simulator for the dronewatch engine.
//!
//! Generates synthetic drone readings for four regions and feeds them to the
//! engine through two in-process transports, one per source. Aggregates come
//! from an in-process mock unless `DRONEWATCH_AGGREGATE_URL` points at a real
//! API. A dashboard summary is logged every second.
//!
//! # Environment
//!
//! | Variable                   | Effect                                   |
//! |----------------------------|------------------------------------------|
//! | `DRONEWATCH_CONFIG`        | JSON config file instead of env settings |
//! | `DRONEWATCH_AGGREGATE_URL` | Poll this API instead of the mock        |
//! | `DRONEWATCH_MQTT_LIVE`     | Subscribe to the configured MQTT broker  |
//! | `DRONEWATCH_SIM_SECONDS`   | Stop after this many seconds             |
//! | `RUST_LOG`                 | Log filter (`info` recommended)          |
//!
//! A `.env` file in the working directory is loaded first.

mod mock;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use embassy_sync::pubsub::WaitResult;
use log::{debug, error, info, warn};
use serde_json::{Value, json};
use tokio::time;
use tokio_util::sync::CancellationToken;

use dronewatch_core::aggregate::{AggregateField, HttpAggregateClient};
use dronewatch_core::transport::{ChannelFeed, MqttTransport, channel_transport};
use dronewatch_core::{Engine, EngineConfig, EngineEvent, Parameter, SourceId};

use mock::MockAggregateService;

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

/// Regions the synthetic drones report from.
const REGIONS: [&str; 4] = ["norte", "sul", "leste", "oeste"];

/// Interval between synthetic readings on the pub/sub source.
const MQTT_SAMPLE_INTERVAL: Duration = Duration::from_millis(700);

/// Interval between synthetic readings on the broker source.
const STOMP_SAMPLE_INTERVAL: Duration = Duration::from_millis(1100);

/// Every Nth payload is published without a region label.
const MALFORMED_EVERY: u64 = 23;

/// Every Nth tick the feed drops the session.
const FAULT_EVERY: u64 = 45;

/// Interval between dashboard summaries.
const DASHBOARD_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Mock data generation
// ---------------------------------------------------------------------------

/// Generates synthetic drone payloads that vary over time.
struct MockDroneGenerator {
    /// Seconds of simulated flight, used as the phase of every curve.
    elapsed_secs: f64,
    /// Payloads generated so far.
    count: u64,
}

impl MockDroneGenerator {
    fn new() -> Self {
        let phase = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            % 3600;
        Self {
            elapsed_secs: phase as f64,
            count: 0,
        }
    }

    /// Advance the internal clock and return the next wire payload.
    fn next_payload(&mut self, dt_secs: f64) -> Value {
        self.elapsed_secs += dt_secs;
        self.count += 1;
        let t = self.elapsed_secs;
        let index = (self.count as usize) % REGIONS.len();
        let region = REGIONS[index];
        // Each region runs a little warmer than the previous one.
        let offset = index as f64;

        // Temperature: 22-32 °C
        let temperature = 26.0 + offset + 3.0 * (t / 90.0).sin() + 0.8 * (t / 17.0).cos();

        // Humidity: 55-85 %
        let humidity = 70.0 - 2.0 * offset + 10.0 * (t / 150.0).sin() + 2.0 * (t / 29.0).cos();

        // Pressure: around 1013 hPa
        let pressure = 1013.0 + 4.0 * (t / 400.0).sin();

        // Radiation: 0-900 W/m², never negative
        let radiation = (450.0 + 450.0 * (t / 240.0).sin()).max(0.0);

        let mut payload = json!({
            "pressao": round2(pressure),
            "radiacao": round2(radiation),
            "temperatura": round2(temperature),
            "umidade": round2(humidity),
            "latitude": -3.1 - offset * 0.5 + 0.01 * (t / 10.0).sin(),
            "longitude": -60.0 + offset * 0.5 + 0.01 * (t / 10.0).cos(),
            "posicao": region,
        });

        if self.count % MALFORMED_EVERY == 0
            && let Some(fields) = payload.as_object_mut()
        {
            fields.remove("posicao");
        }
        payload
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Feeders
// ---------------------------------------------------------------------------

/// Publish synthetic readings on `topic` until cancelled.
async fn run_feeder(
    source: SourceId,
    feed: ChannelFeed,
    topic: String,
    interval: Duration,
    mock: Arc<MockAggregateService>,
    cancel: CancellationToken,
) {
    let mut generator = MockDroneGenerator::new();
    let mut ticker = time::interval(interval);
    let mut ticks = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        ticks += 1;

        if ticks % FAULT_EVERY == 0 {
            info!("{} feed: simulating a dropped broker connection", source);
            if feed.inject_fault("simulated broker restart").await.is_err() {
                break;
            }
            continue;
        }

        let payload = generator.next_payload(interval.as_secs_f64());
        mock.record(&payload);
        if feed.publish(topic.as_str(), payload.to_string()).await.is_err() {
            debug!("{} feed: transport gone", source);
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Dashboard
// ---------------------------------------------------------------------------

/// Log one summary of everything the dashboard would show.
async fn render_dashboard(engine: &Engine) {
    for source in SourceId::ALL {
        let snapshot = engine.source(source).snapshot().await;
        info!(
            "[{}] {} | ingested {} dropped {} | history {}/{}",
            source,
            snapshot.status,
            snapshot.ingested,
            snapshot.dropped,
            snapshot.history.len(),
            snapshot.history_capacity
        );

        let latest: Vec<String> = snapshot
            .latest
            .iter()
            .map(|(region, reading)| match reading {
                Some(r) => format!("{region} {:.1}°C", r.temperature),
                None => format!("{region} waiting"),
            })
            .collect();
        info!("[{}] latest: {}", source, latest.join(", "));

        let shares = engine.percentages(source, Parameter::Temperature).await;
        if let Some(top) = shares.first() {
            info!(
                "[{}] warmest share: {} {:.1}%",
                source, top.region, top.percentage
            );
        }
    }

    let aggregates = engine.aggregates().await;
    let stale = |field| {
        if aggregates.has_error(field) {
            " (stale)"
        } else {
            ""
        }
    };
    match aggregates.total_collected.value {
        Some(total) => info!(
            "[aggregate] total collected {}{}",
            total,
            stale(AggregateField::TotalCollected)
        ),
        None if aggregates.total_collected.loaded => warn!("[aggregate] total unavailable"),
        None => info!("[aggregate] loading"),
    }
    info!(
        "[aggregate] by region {:?}{}",
        aggregates.total_by_region.value,
        stale(AggregateField::TotalByRegion)
    );
}

/// Log notable engine events as they happen.
async fn watch_events(engine_events: Arc<dronewatch_core::app_state::EventChannel>) {
    let mut subscriber = match engine_events.subscriber() {
        Ok(subscriber) => subscriber,
        Err(e) => {
            warn!("No event subscriber available: {:?}", e);
            return;
        }
    };

    loop {
        match subscriber.next_message().await {
            WaitResult::Lagged(missed) => debug!("Event watcher missed {} events", missed),
            WaitResult::Message(EngineEvent::Dropped { source, error }) => {
                info!("[{}] rejected payload: {}", source, error)
            }
            WaitResult::Message(EngineEvent::Aggregate { field, ok: false }) => {
                info!("[aggregate] {} refresh failed, keeping last value", field)
            }
            WaitResult::Message(_) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn load_config() -> Result<EngineConfig, dronewatch_core::config::ConfigError> {
    match std::env::var("DRONEWATCH_CONFIG") {
        Ok(path) => {
            info!("Loading config from {}", path);
            EngineConfig::load(path)
        }
        Err(_) => EngineConfig::from_env(),
    }
}

fn run_time() -> Option<Duration> {
    let raw = std::env::var("DRONEWATCH_SIM_SECONDS").ok()?;
    match raw.trim().parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => {
            warn!("Ignoring DRONEWATCH_SIM_SECONDS={:?}", raw);
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        // A missing .env file is the usual case.
        if !e.not_found() {
            eprintln!("Failed to load .env: {e}");
        }
    }
    env_logger::init();
    info!("Starting dronewatch simulator");

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };
    let mqtt_topic = config.mqtt.destinations.first().cloned().unwrap_or_default();
    let stomp_topic = config
        .stomp
        .destinations
        .first()
        .cloned()
        .unwrap_or_default();
    let use_remote = std::env::var("DRONEWATCH_AGGREGATE_URL").is_ok();
    let live_mqtt = std::env::var("DRONEWATCH_MQTT_LIVE").is_ok();
    let base_url = config.aggregate_base_url.clone();
    let request_timeout = config.request_timeout();

    let mut engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to create engine: {}", e);
            std::process::exit(2);
        }
    };

    let mock = Arc::new(MockAggregateService::new());
    let cancel = CancellationToken::new();

    // Transports and feeders
    let (mqtt, mqtt_feed) = channel_transport(64);
    let (stomp, stomp_feed) = channel_transport(64);
    stomp_feed.refuse_connects(2);

    let started = if live_mqtt {
        info!("MQTT source subscribes to the configured broker");
        engine.attach(SourceId::Mqtt, MqttTransport::new())
    } else {
        engine.attach(SourceId::Mqtt, mqtt)
    }
    .and_then(|()| engine.attach(SourceId::Stomp, stomp));
    if let Err(e) = started {
        error!("Failed to attach transports: {}", e);
        std::process::exit(1);
    }

    let mut feeders = vec![tokio::spawn(run_feeder(
        SourceId::Stomp,
        stomp_feed,
        stomp_topic,
        STOMP_SAMPLE_INTERVAL,
        mock.clone(),
        cancel.clone(),
    ))];
    if !live_mqtt {
        feeders.push(tokio::spawn(run_feeder(
            SourceId::Mqtt,
            mqtt_feed,
            mqtt_topic,
            MQTT_SAMPLE_INTERVAL,
            mock.clone(),
            cancel.clone(),
        )));
    }
    let watcher = tokio::spawn(watch_events(engine.events()));

    // Aggregates
    let poller = if use_remote {
        info!("Polling aggregate API at {}", base_url);
        HttpAggregateClient::new(base_url, request_timeout)
            .map_err(Into::into)
            .and_then(|client| engine.start_poller(Arc::new(client)))
    } else {
        info!("Serving aggregates from the in-process mock");
        engine.start_poller(mock.clone())
    };
    if let Err(e) = poller {
        error!("Aggregate poller not started: {}", e);
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------
    let deadline = run_time().map(|limit| time::Instant::now() + limit);
    let mut dashboard = time::interval(DASHBOARD_INTERVAL);
    let mut backfilled = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break;
            }
            _ = async {
                match deadline {
                    Some(deadline) => time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                info!("Run time elapsed");
                break;
            }
            _ = dashboard.tick() => {}
        }

        // Once the mock has history, replay it into the broker source.
        if !backfilled && !use_remote {
            match engine.backfill_from(SourceId::Stomp, &*mock).await {
                Ok(report) if report.admitted > 0 => backfilled = true,
                Ok(_) => {}
                Err(e) => debug!("Backfill deferred: {}", e),
            }
        }

        render_dashboard(&engine).await;
    }

    cancel.cancel();
    for feeder in feeders {
        if let Err(e) = feeder.await {
            warn!("Feeder task failed: {}", e);
        }
    }
    watcher.abort();
    engine.shutdown().await;

    info!("Simulator exiting");
}
