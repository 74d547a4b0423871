use core::future::Future;
use core::time::Duration;
use std::collections::BTreeMap;

use log::debug;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use super::AggregateField;
use crate::metrics::RegionShare;
use crate::sensors::{Parameter, canonical_region};

const PERCENTAGES_PATH: &str = "/api/estatisticas/percentual";
const HISTORY_PATH: &str = "/api/drones/status";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregateFetchError {
    #[error("{endpoint}: request failed: {details}")]
    Request {
        endpoint: &'static str,
        details: String,
    },
    #[error("{endpoint}: request timed out")]
    Timeout { endpoint: &'static str },
    #[error("{endpoint}: unexpected status {status}")]
    Status { endpoint: &'static str, status: u16 },
    #[error("{endpoint}: invalid response body: {details}")]
    Decode {
        endpoint: &'static str,
        details: String,
    },
    #[error("HTTP client setup failed: {0}")]
    Client(String),
}

/// Read-only access to the remote aggregate service.
///
/// [`HttpAggregateClient`] talks to the real API; tests and the simulator
/// provide in-process implementations.
pub trait AggregateSource: Send + Sync + 'static {
    /// Number of readings collected overall
    fn total_collected(&self) -> impl Future<Output = Result<u64, AggregateFetchError>> + Send;

    /// Readings collected per region
    fn total_by_region(
        &self,
    ) -> impl Future<Output = Result<BTreeMap<String, u64>, AggregateFetchError>> + Send;

    /// Readings collected per climate parameter
    fn total_by_parameter(
        &self,
    ) -> impl Future<Output = Result<BTreeMap<String, u64>, AggregateFetchError>> + Send;

    /// Server-side regional breakdown of one parameter
    fn percentages(
        &self,
        parameter: Parameter,
    ) -> impl Future<Output = Result<Vec<RegionShare>, AggregateFetchError>> + Send;

    /// Historical Reading-shaped records, oldest first
    fn drone_history(&self)
    -> impl Future<Output = Result<Vec<Value>, AggregateFetchError>> + Send;
}

/// [`AggregateSource`] backed by the aggregate HTTP API
#[derive(Debug, Clone)]
pub struct HttpAggregateClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAggregateClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AggregateFetchError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AggregateFetchError::Client(e.to_string()))?;
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        query: &[(&str, &str)],
    ) -> Result<T, AggregateFetchError> {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!("GET {}", url);

        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| request_error(endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AggregateFetchError::Status {
                endpoint,
                status: status.as_u16(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| AggregateFetchError::Decode {
                endpoint,
                details: e.to_string(),
            })
    }
}

fn request_error(endpoint: &'static str, error: reqwest::Error) -> AggregateFetchError {
    if error.is_timeout() {
        AggregateFetchError::Timeout { endpoint }
    } else {
        AggregateFetchError::Request {
            endpoint,
            details: error.to_string(),
        }
    }
}

impl AggregateSource for HttpAggregateClient {
    async fn total_collected(&self) -> Result<u64, AggregateFetchError> {
        self.get_json(AggregateField::TotalCollected.path(), &[]).await
    }

    async fn total_by_region(&self) -> Result<BTreeMap<String, u64>, AggregateFetchError> {
        self.get_json(AggregateField::TotalByRegion.path(), &[]).await
    }

    async fn total_by_parameter(&self) -> Result<BTreeMap<String, u64>, AggregateFetchError> {
        self.get_json(AggregateField::TotalByParameter.path(), &[])
            .await
    }

    async fn percentages(
        &self,
        parameter: Parameter,
    ) -> Result<Vec<RegionShare>, AggregateFetchError> {
        let shares: Vec<RegionShare> = self
            .get_json(PERCENTAGES_PATH, &[("parametro", parameter.wire_name())])
            .await?;
        Ok(shares
            .into_iter()
            .map(|share| RegionShare {
                region: canonical_region(&share.region),
                percentage: share.percentage,
            })
            .collect())
    }

    async fn drone_history(&self) -> Result<Vec<Value>, AggregateFetchError> {
        self.get_json(HISTORY_PATH, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client =
            HttpAggregateClient::new("http://localhost:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
    }

    #[tokio::test]
    async fn test_unreachable_service_reports_request_error() {
        // Port 9 (discard) on loopback is not expected to serve HTTP.
        let client =
            HttpAggregateClient::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();

        let err = client.total_collected().await.unwrap_err();
        assert!(matches!(
            err,
            AggregateFetchError::Request { .. } | AggregateFetchError::Timeout { .. }
        ));
    }

    #[test]
    fn test_share_records_decode_from_wire_names() {
        let shares: Vec<RegionShare> =
            serde_json::from_str(r#"[{"regiao": "Norte", "valor": 35.2}]"#).unwrap();
        assert_eq!(shares[0].region, "Norte");
        assert_eq!(shares[0].percentage, 35.2);
    }
}
