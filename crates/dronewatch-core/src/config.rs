//! Engine configuration
//!
//! Defaults match the original deployment: a public MQTT broker topic with a
//! 10-reading history, a local RabbitMQ STOMP fanout with a 60-reading
//! history, 5 s reconnect backoff and a 3 s aggregate refresh.
//!
//! Configuration can come from JSON (`EngineConfig::from_json_str`) or from
//! `DRONEWATCH_*` environment variables layered over the defaults
//! (`EngineConfig::from_env`). A source block given in JSON replaces that
//! source's defaults; omitted fields inside it take the generic
//! [`SourceConfig`] defaults.

use core::time::Duration;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sensors::SourceId;
use crate::transport::{Credentials, SessionOptions};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: invalid value {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{0} source has no destinations")]
    NoDestinations(SourceId),
    #[error("aggregate base URL is empty")]
    EmptyBaseUrl,
    #[error("config parse failed: {0}")]
    Parse(String),
    #[error("config read failed: {0}")]
    Io(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Aggregate refresh period
    pub poll_interval_ms: u64,
    /// Per-request HTTP timeout for the aggregate API
    pub request_timeout_ms: u64,
    pub aggregate_base_url: String,
    /// Upper bound on unsubscribe + close during shutdown
    pub close_timeout_ms: u64,
    /// How long shutdown waits for tasks before aborting them
    pub shutdown_grace_ms: u64,
    pub mqtt: SourceConfig,
    pub stomp: SourceConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceConfig {
    pub broker_url: String,
    /// Empty means `dronewatch-<source>`
    pub client_id: String,
    /// Topics (pub/sub) or destinations (broker) to subscribe to
    pub destinations: Vec<String>,
    pub login: Option<String>,
    pub passcode: Option<String>,
    pub heartbeat_ms: Option<u64>,
    /// Max retained readings in this source's history
    pub history_capacity: usize,
    /// Backoff between reconnect attempts
    pub reconnect_delay_ms: u64,
    /// Regions listed before any reading arrives
    pub known_regions: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            broker_url: String::new(),
            client_id: String::new(),
            destinations: Vec::new(),
            login: None,
            passcode: None,
            heartbeat_ms: None,
            history_capacity: 10,
            reconnect_delay_ms: 5000,
            known_regions: Vec::new(),
        }
    }
}

impl SourceConfig {
    /// Pub/sub defaults: single topic, four pre-seeded regions
    pub fn mqtt_defaults() -> Self {
        Self {
            broker_url: "ws://broker.hivemq.com:8000/mqtt".into(),
            destinations: vec!["mqtt/dadosClima".into()],
            history_capacity: 10,
            known_regions: ["norte", "sul", "leste", "oeste"]
                .into_iter()
                .map(String::from)
                .collect(),
            ..Self::default()
        }
    }

    /// Broker defaults: fanout exchange destination with guest login
    pub fn stomp_defaults() -> Self {
        Self {
            broker_url: "ws://localhost:15674/ws".into(),
            destinations: vec!["/exchange/amq.fanout/dadosClima".into()],
            login: Some("guest".into()),
            passcode: Some("guest".into()),
            heartbeat_ms: Some(4000),
            history_capacity: 60,
            ..Self::default()
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Session parameters handed to the transport on every connect
    pub fn session_options(&self, source: SourceId) -> SessionOptions {
        let client_id = if self.client_id.is_empty() {
            format!("dronewatch-{source}")
        } else {
            self.client_id.clone()
        };
        let credentials = self.login.as_ref().map(|login| Credentials {
            login: login.clone(),
            passcode: self.passcode.clone().unwrap_or_default(),
        });

        SessionOptions {
            broker_url: self.broker_url.clone(),
            client_id,
            credentials,
            heartbeat: self.heartbeat_ms.map(Duration::from_millis),
        }
    }

    fn validate(&self, source: SourceId) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::Zero("historyCapacity"));
        }
        if self.reconnect_delay_ms == 0 {
            return Err(ConfigError::Zero("reconnectDelayMs"));
        }
        if self.destinations.iter().all(|d| d.trim().is_empty()) {
            return Err(ConfigError::NoDestinations(source));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3000,
            request_timeout_ms: 2500,
            aggregate_base_url: "http://localhost:8080".into(),
            close_timeout_ms: 2000,
            shutdown_grace_ms: 3000,
            mqtt: SourceConfig::mqtt_defaults(),
            stomp: SourceConfig::stomp_defaults(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Defaults overridden by `DRONEWATCH_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each known key
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_key(&lookup, "DRONEWATCH_POLL_INTERVAL_MS")? {
            config.poll_interval_ms = v;
        }
        if let Some(v) = parse_key(&lookup, "DRONEWATCH_REQUEST_TIMEOUT_MS")? {
            config.request_timeout_ms = v;
        }
        if let Some(v) = lookup("DRONEWATCH_AGGREGATE_URL") {
            config.aggregate_base_url = v;
        }
        if let Some(v) = parse_key(&lookup, "DRONEWATCH_CLOSE_TIMEOUT_MS")? {
            config.close_timeout_ms = v;
        }
        if let Some(v) = parse_key(&lookup, "DRONEWATCH_SHUTDOWN_GRACE_MS")? {
            config.shutdown_grace_ms = v;
        }
        if let Some(v) = parse_key(&lookup, "DRONEWATCH_RECONNECT_DELAY_MS")? {
            config.mqtt.reconnect_delay_ms = v;
            config.stomp.reconnect_delay_ms = v;
        }

        apply_source_env(&lookup, "MQTT", &mut config.mqtt)?;
        apply_source_env(&lookup, "STOMP", &mut config.stomp)?;

        Ok(config)
    }

    pub fn source(&self, source: SourceId) -> &SourceConfig {
        match source {
            SourceId::Mqtt => &self.mqtt,
            SourceId::Stomp => &self.stomp,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Zero("pollIntervalMs"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Zero("requestTimeoutMs"));
        }
        if self.close_timeout_ms == 0 {
            return Err(ConfigError::Zero("closeTimeoutMs"));
        }
        if self.shutdown_grace_ms == 0 {
            return Err(ConfigError::Zero("shutdownGraceMs"));
        }
        if self.aggregate_base_url.trim().is_empty() {
            return Err(ConfigError::EmptyBaseUrl);
        }
        for source in SourceId::ALL {
            self.source(source).validate(source)?;
        }
        Ok(())
    }
}

fn parse_key<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: core::str::FromStr,
{
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    let parsed = value.trim().parse::<T>();
    match parsed {
        Ok(parsed) => Ok(Some(parsed)),
        Err(_) => Err(ConfigError::InvalidValue {
            key: key.to_owned(),
            value,
        }),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

fn apply_source_env<F>(lookup: &F, prefix: &str, source: &mut SourceConfig) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let key = |suffix: &str| format!("DRONEWATCH_{prefix}_{suffix}");

    if let Some(v) = lookup(&key("URL")) {
        source.broker_url = v;
    }
    if let Some(v) = lookup(&key("CLIENT_ID")) {
        source.client_id = v;
    }
    if let Some(v) = lookup(&key("DESTINATIONS")) {
        source.destinations = split_list(&v);
    }
    if let Some(v) = lookup(&key("LOGIN")) {
        source.login = Some(v);
    }
    if let Some(v) = lookup(&key("PASSCODE")) {
        source.passcode = Some(v);
    }
    if let Some(v) = parse_key(lookup, &key("HEARTBEAT_MS"))? {
        source.heartbeat_ms = Some(v);
    }
    if let Some(v) = parse_key(lookup, &key("HISTORY_CAPACITY"))? {
        source.history_capacity = v;
    }
    if let Some(v) = parse_key(lookup, &key("RECONNECT_DELAY_MS"))? {
        source.reconnect_delay_ms = v;
    }
    if let Some(v) = lookup(&key("REGIONS")) {
        source.known_regions = split_list(&v);
    }
    Ok(())
}
