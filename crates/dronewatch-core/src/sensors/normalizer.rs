//! Payload validation into canonical [`Reading`]s

use core::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

use super::{IdSource, Reading};

// Wire field names shared by both transports and the history endpoint.
const PRESSURE: &str = "pressao";
const RADIATION: &str = "radiacao";
const TEMPERATURE: &str = "temperatura";
const HUMIDITY: &str = "umidade";
const LATITUDE: &str = "latitude";
const LONGITUDE: &str = "longitude";
const REGION: &str = "posicao";

/// Why a payload was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("malformed payload: {0}")]
    MalformedPayload(Malformed),
    #[error("payload has no region label")]
    MissingRegion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Malformed {
    NotUtf8,
    InvalidJson(String),
    NotAnObject,
    MissingField(&'static str),
    NotNumeric(&'static str),
}

impl fmt::Display for Malformed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotUtf8 => f.write_str("body is not valid UTF-8"),
            Self::InvalidJson(details) => write!(f, "invalid JSON ({details})"),
            Self::NotAnObject => f.write_str("expected a JSON object"),
            Self::MissingField(field) => write!(f, "missing field `{field}`"),
            Self::NotNumeric(field) => write!(f, "field `{field}` is not a number"),
        }
    }
}

impl From<Malformed> for NormalizeError {
    fn from(value: Malformed) -> Self {
        Self::MalformedPayload(value)
    }
}

/// Canonical form of a region label: trimmed and lower-cased.
///
/// Every region key in the engine goes through this, whatever its origin.
pub fn canonical_region(label: &str) -> String {
    label.trim().to_lowercase()
}

fn number(object: &Map<String, Value>, field: &'static str) -> Result<f64, NormalizeError> {
    match object.get(field) {
        None | Some(Value::Null) => Err(Malformed::MissingField(field).into()),
        Some(value) => value
            .as_f64()
            .ok_or_else(|| Malformed::NotNumeric(field).into()),
    }
}

/// Validate a decoded payload and stamp it with a fresh id.
///
/// The id is only drawn once the payload is known to be valid.
pub fn normalize(payload: &Value, ids: &IdSource) -> Result<Reading, NormalizeError> {
    let object = payload.as_object().ok_or(Malformed::NotAnObject)?;

    let pressure = number(object, PRESSURE)?;
    let radiation = number(object, RADIATION)?;
    let temperature = number(object, TEMPERATURE)?;
    let humidity = number(object, HUMIDITY)?;
    let latitude = number(object, LATITUDE)?;
    let longitude = number(object, LONGITUDE)?;

    let region = object
        .get(REGION)
        .and_then(Value::as_str)
        .map(canonical_region)
        .filter(|region| !region.is_empty())
        .ok_or(NormalizeError::MissingRegion)?;

    Ok(Reading {
        id: ids.next(),
        pressure,
        radiation,
        temperature,
        humidity,
        latitude,
        longitude,
        region,
    })
}

/// Decode JSON text, then [`normalize`] it
pub fn normalize_text(text: &str, ids: &IdSource) -> Result<Reading, NormalizeError> {
    let payload: Value = serde_json::from_str(text)
        .map_err(|e| Malformed::InvalidJson(e.to_string()))?;
    normalize(&payload, ids)
}

/// Decode a raw transport body as UTF-8 JSON, then [`normalize`] it
pub fn normalize_bytes(body: &[u8], ids: &IdSource) -> Result<Reading, NormalizeError> {
    let text = core::str::from_utf8(body).map_err(|_| Malformed::NotUtf8)?;
    normalize_text(text, ids)
}
