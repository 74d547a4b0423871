//! Canonical drone readings and the parameters they carry

mod id;
mod normalizer;

pub use id::{IdSource, ReadingId};
pub use normalizer::{
    Malformed, NormalizeError, canonical_region, normalize, normalize_bytes, normalize_text,
};

use core::fmt;
use core::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// A validated drone reading.
///
/// Built only by the normalizer, which guarantees all six numeric fields are
/// present and `region` is in canonical (trimmed, lower-case) form. Readings
/// are never mutated once admitted into engine state; tables hold copies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub id: ReadingId,
    pub pressure: f64,
    pub radiation: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub region: String,
}

impl Reading {
    /// Value of the given additive parameter
    pub const fn value(&self, parameter: Parameter) -> f64 {
        match parameter {
            Parameter::Temperature => self.temperature,
            Parameter::Humidity => self.humidity,
            Parameter::Pressure => self.pressure,
            Parameter::Radiation => self.radiation,
        }
    }
}

/// Environmental parameter a dashboard can break down by region.
///
/// Coordinates are deliberately absent: summing latitudes is meaningless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Parameter {
    #[serde(rename = "temperatura")]
    Temperature,
    #[serde(rename = "umidade")]
    Humidity,
    #[serde(rename = "pressao")]
    Pressure,
    #[serde(rename = "radiacao")]
    Radiation,
}

impl Parameter {
    pub const ALL: [Parameter; 4] = [
        Self::Temperature,
        Self::Humidity,
        Self::Pressure,
        Self::Radiation,
    ];

    /// Name used in payloads and in the aggregate API query string
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::Temperature => "temperatura",
            Self::Humidity => "umidade",
            Self::Pressure => "pressao",
            Self::Radiation => "radiacao",
        }
    }

    /// Get a short label for display
    pub const fn label(self) -> &'static str {
        match self {
            Self::Temperature => "Temperature",
            Self::Humidity => "Humidity",
            Self::Pressure => "Pressure",
            Self::Radiation => "Radiation",
        }
    }

    /// Display unit, empty for unit-less values
    pub const fn unit(self) -> &'static str {
        match self {
            Self::Temperature => "°C",
            Self::Humidity => "%",
            Self::Pressure => "hPa",
            Self::Radiation => "",
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown parameter: {0}")]
pub struct UnknownParameter(pub String);

impl FromStr for Parameter {
    type Err = UnknownParameter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "temperatura" | "temperature" => Ok(Self::Temperature),
            "umidade" | "humidity" => Ok(Self::Humidity),
            "pressao" | "pressão" | "pressure" => Ok(Self::Pressure),
            "radiacao" | "radiação" | "radiation" => Ok(Self::Radiation),
            _ => Err(UnknownParameter(s.to_owned())),
        }
    }
}

/// Which of the two inbound transports a reading or status belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    /// Pub/sub transport delivering a single topic
    Mqtt,
    /// Queue/topic broker session with credentials
    Stomp,
}

impl SourceId {
    pub const ALL: [SourceId; 2] = [Self::Mqtt, Self::Stomp];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Mqtt => "mqtt",
            Self::Stomp => "stomp",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
