//! Geocoding client
//!
//! Resolves a free-form address string to coordinates through the Google Geocoding API.
//! Every call waits on the shared token-bucket limiter first.

use async_trait::async_trait;
use provdir_common::config::GeocodingConfig;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::utils::{Classify, FailureClass, RateLimiter};

const USER_AGENT: &str = concat!("provdir/", env!("CARGO_PKG_VERSION"));

/// Successful geocoder answers
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeocodeOutcome {
    Found { latitude: f64, longitude: f64 },
    /// The address cannot be resolved; terminal for this address
    NoResult,
}

/// Geocoder client errors
#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Over query limit")]
    OverQueryLimit,

    #[error("Geocoder unavailable: {0}")]
    Unavailable(String),

    #[error("Request denied: {0}")]
    RequestDenied(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl Classify for GeocodeError {
    fn classify(&self) -> FailureClass {
        match self {
            GeocodeError::NetworkError(_)
            | GeocodeError::OverQueryLimit
            | GeocodeError::Unavailable(_) => FailureClass::Retryable,
            GeocodeError::RequestDenied(_) => FailureClass::Fatal,
            GeocodeError::ParseError(_) => FailureClass::Terminal,
        }
    }
}

/// Geocoding collaborator
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Result<GeocodeOutcome, GeocodeError>;
}

#[derive(Debug, Deserialize)]
struct GoogleResponse {
    status: String,
    #[serde(default)]
    results: Vec<GoogleResult>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleResult {
    geometry: GoogleGeometry,
}

#[derive(Debug, Deserialize)]
struct GoogleGeometry {
    location: GoogleLatLng,
}

#[derive(Debug, Deserialize)]
struct GoogleLatLng {
    lat: f64,
    lng: f64,
}

/// Map a Google Geocoding response body to an outcome
fn parse_response(body: &str) -> Result<GeocodeOutcome, GeocodeError> {
    let response: GoogleResponse =
        serde_json::from_str(body).map_err(|e| GeocodeError::ParseError(e.to_string()))?;
    let message = response.error_message.unwrap_or_default();

    match response.status.as_str() {
        "OK" => response
            .results
            .first()
            .map(|r| GeocodeOutcome::Found {
                latitude: r.geometry.location.lat,
                longitude: r.geometry.location.lng,
            })
            .ok_or_else(|| GeocodeError::ParseError("OK status without results".to_string())),
        "ZERO_RESULTS" | "INVALID_REQUEST" => Ok(GeocodeOutcome::NoResult),
        "OVER_QUERY_LIMIT" | "OVER_DAILY_LIMIT" => Err(GeocodeError::OverQueryLimit),
        "REQUEST_DENIED" => Err(GeocodeError::RequestDenied(message)),
        "UNKNOWN_ERROR" => Err(GeocodeError::Unavailable(message)),
        other => Err(GeocodeError::ParseError(format!("Unexpected status {}", other))),
    }
}

/// Google Geocoding API client
pub struct GoogleGeocoder {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    rate_limiter: Arc<RateLimiter>,
}

impl GoogleGeocoder {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<Self, GeocodeError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| GeocodeError::NetworkError(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            rate_limiter,
        })
    }

    /// Client with its own token bucket built from `[geocoding]` settings
    pub fn from_config(config: &GeocodingConfig, api_key: String) -> provdir_common::Result<Self> {
        let limiter = RateLimiter::token_bucket(config.bucket_capacity, config.refill_per_second)?;
        Self::new(
            config.base_url.clone(),
            api_key,
            crate::config::timeout_from_secs(config.timeout_secs),
            Arc::new(limiter),
        )
        .map_err(|e| provdir_common::Error::Config(format!("Geocoder client: {}", e)))
    }
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    async fn geocode(&self, address: &str) -> Result<GeocodeOutcome, GeocodeError> {
        self.rate_limiter.acquire().await;

        tracing::debug!(address = %address, "Querying geocoder");

        let response = self
            .http_client
            .get(&self.base_url)
            .query(&[("address", address), ("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| GeocodeError::NetworkError(e.to_string()))?;

        let status = response.status();

        if status.as_u16() == 429 {
            return Err(GeocodeError::OverQueryLimit);
        }

        if status.as_u16() == 401 || status.as_u16() == 403 {
            let error_text = response.text().await.unwrap_or_default();
            return Err(GeocodeError::RequestDenied(error_text));
        }

        if !status.is_success() {
            return Err(GeocodeError::Unavailable(format!("HTTP {}", status.as_u16())));
        }

        let body = response
            .text()
            .await
            .map_err(|e| GeocodeError::NetworkError(e.to_string()))?;

        parse_response(&body)
    }
}
