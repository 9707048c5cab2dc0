//! NPI registry client
//!
//! Looks providers up by NPI in the public NPPES registry (API version 2.1). Absence from
//! the registry is a valid answer (`Ok(None)`), not an error.

use async_trait::async_trait;
use provdir_common::config::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::utils::{Classify, FailureClass, RateLimiter};

const USER_AGENT: &str = concat!("provdir/", env!("CARGO_PKG_VERSION"));
const API_VERSION: &str = "2.1";

/// Registry client errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Registry unavailable ({0})")]
    Unavailable(u16),

    #[error("Request denied ({0}): {1}")]
    Denied(u16, String),

    #[error("API error {0}: {1}")]
    ApiError(u16, String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl Classify for RegistryError {
    fn classify(&self) -> FailureClass {
        match self {
            RegistryError::NetworkError(_)
            | RegistryError::RateLimitExceeded
            | RegistryError::Unavailable(_) => FailureClass::Retryable,
            RegistryError::Denied(..) => FailureClass::Fatal,
            RegistryError::ApiError(..) | RegistryError::ParseError(_) => FailureClass::Terminal,
        }
    }
}

/// Provider as the registry reports it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub npi: String,
    /// "individual" or "organization"
    pub entity_kind: Option<String>,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub organization_name: Option<String>,
    pub credential: Option<String>,
    /// Primary taxonomy code
    pub taxonomy_code: Option<String>,
    pub deactivated: bool,
    pub deactivation_date: Option<String>,
    /// States of the practice-location addresses
    pub practice_states: Vec<String>,
}

/// Registry collaborator
#[async_trait]
pub trait RegistryLookup: Send + Sync {
    /// Fetch one provider; `Ok(None)` when the NPI is not in the registry
    async fn fetch(&self, npi: &str) -> Result<Option<RegistryRecord>, RegistryError>;
}

#[derive(Debug, Deserialize)]
struct NppesResponse {
    #[serde(default)]
    result_count: u64,
    #[serde(default)]
    results: Vec<NppesResult>,
    #[serde(rename = "Errors", default)]
    errors: Vec<NppesError>,
}

#[derive(Debug, Deserialize)]
struct NppesError {
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct NppesResult {
    number: serde_json::Value,
    enumeration_type: Option<String>,
    #[serde(default)]
    basic: NppesBasic,
    #[serde(default)]
    taxonomies: Vec<NppesTaxonomy>,
    #[serde(default)]
    addresses: Vec<NppesAddress>,
}

#[derive(Debug, Default, Deserialize)]
struct NppesBasic {
    first_name: Option<String>,
    middle_name: Option<String>,
    last_name: Option<String>,
    organization_name: Option<String>,
    credential: Option<String>,
    status: Option<String>,
    deactivation_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NppesTaxonomy {
    code: Option<String>,
    #[serde(default)]
    primary: bool,
}

#[derive(Debug, Deserialize)]
struct NppesAddress {
    address_purpose: Option<String>,
    state: Option<String>,
}

impl NppesResult {
    fn into_record(self, npi: &str) -> RegistryRecord {
        let number = match &self.number {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => npi.to_string(),
        };

        let entity_kind = self.enumeration_type.as_deref().and_then(|t| match t {
            "NPI-1" => Some("individual".to_string()),
            "NPI-2" => Some("organization".to_string()),
            _ => None,
        });

        let taxonomy_code = self
            .taxonomies
            .iter()
            .find(|t| t.primary)
            .or_else(|| self.taxonomies.first())
            .and_then(|t| t.code.clone());

        let mut practice_states: Vec<String> = self
            .addresses
            .iter()
            .filter(|a| a.address_purpose.as_deref() == Some("LOCATION"))
            .filter_map(|a| a.state.as_deref())
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        practice_states.sort();
        practice_states.dedup();

        let deactivation_date = self
            .basic
            .deactivation_date
            .filter(|d| !d.trim().is_empty());
        let deactivated = self.basic.status.as_deref() == Some("D") || deactivation_date.is_some();

        RegistryRecord {
            npi: number,
            entity_kind,
            first_name: self.basic.first_name,
            middle_name: self.basic.middle_name,
            last_name: self.basic.last_name,
            organization_name: self.basic.organization_name,
            credential: self.basic.credential,
            taxonomy_code,
            deactivated,
            deactivation_date,
            practice_states,
        }
    }
}

/// Parse an NPPES response body
fn parse_response(npi: &str, body: &str) -> Result<Option<RegistryRecord>, RegistryError> {
    let response: NppesResponse =
        serde_json::from_str(body).map_err(|e| RegistryError::ParseError(e.to_string()))?;

    if let Some(error) = response.errors.first() {
        return Err(RegistryError::ApiError(200, error.description.clone()));
    }

    if response.result_count == 0 {
        return Ok(None);
    }

    Ok(response.results.into_iter().next().map(|r| r.into_record(npi)))
}

/// NPPES registry HTTP client
pub struct NppesClient {
    http_client: reqwest::Client,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
}

impl NppesClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration, rate_limiter: Arc<RateLimiter>) -> Result<Self, RegistryError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::NetworkError(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.into(),
            rate_limiter,
        })
    }

    /// Client with its own limiter built from `[registry]` settings
    pub fn from_config(config: &RegistryConfig) -> provdir_common::Result<Self> {
        let limiter = RateLimiter::per_second_with_delay(
            config.requests_per_second,
            Duration::from_millis(config.inter_call_delay_ms),
        )?;
        Self::new(
            config.base_url.clone(),
            crate::config::timeout_from_secs(config.timeout_secs),
            Arc::new(limiter),
        )
        .map_err(|e| provdir_common::Error::Config(format!("Registry client: {}", e)))
    }
}

#[async_trait]
impl RegistryLookup for NppesClient {
    async fn fetch(&self, npi: &str) -> Result<Option<RegistryRecord>, RegistryError> {
        self.rate_limiter.acquire().await;

        tracing::debug!(npi = %npi, "Querying NPI registry");

        let response = self
            .http_client
            .get(&self.base_url)
            .query(&[("number", npi), ("version", API_VERSION)])
            .send()
            .await
            .map_err(|e| RegistryError::NetworkError(e.to_string()))?;

        let status = response.status();

        if status.as_u16() == 429 {
            return Err(RegistryError::RateLimitExceeded);
        }

        if status.as_u16() == 401 || status.as_u16() == 403 {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RegistryError::Denied(status.as_u16(), error_text));
        }

        if status.is_server_error() {
            return Err(RegistryError::Unavailable(status.as_u16()));
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RegistryError::ApiError(status.as_u16(), error_text));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RegistryError::NetworkError(e.to_string()))?;

        parse_response(npi, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_individual() {
        let body = r#"{
            "result_count": 1,
            "results": [{
                "number": 1234567893,
                "enumeration_type": "NPI-1",
                "basic": {
                    "first_name": "JANE",
                    "last_name": "DOE",
                    "credential": "M.D.",
                    "status": "A"
                },
                "taxonomies": [
                    {"code": "208D00000X", "primary": false},
                    {"code": "207Q00000X", "primary": true}
                ],
                "addresses": [
                    {"address_purpose": "MAILING", "state": "CA"},
                    {"address_purpose": "LOCATION", "state": "ny"}
                ]
            }]
        }"#;

        let record = parse_response("1234567893", body).unwrap().unwrap();
        assert_eq!(record.npi, "1234567893");
        assert_eq!(record.entity_kind.as_deref(), Some("individual"));
        assert_eq!(record.last_name.as_deref(), Some("DOE"));
        assert_eq!(record.taxonomy_code.as_deref(), Some("207Q00000X"));
        assert_eq!(record.practice_states, vec!["NY".to_string()]);
        assert!(!record.deactivated);
    }

    #[test]
    fn test_parse_not_found() {
        let body = r#"{"result_count": 0, "results": []}"#;
        assert_eq!(parse_response("1234567893", body).unwrap(), None);
    }

    #[test]
    fn test_parse_deactivated() {
        let body = r#"{
            "result_count": 1,
            "results": [{
                "number": "1234567893",
                "enumeration_type": "NPI-2",
                "basic": {"organization_name": "ACME CLINIC", "status": "D", "deactivation_date": "2024-01-15"}
            }]
        }"#;
        let record = parse_response("1234567893", body).unwrap().unwrap();
        assert!(record.deactivated);
        assert_eq!(record.entity_kind.as_deref(), Some("organization"));
        assert_eq!(record.deactivation_date.as_deref(), Some("2024-01-15"));
    }

    #[test]
    fn test_api_errors_are_terminal() {
        let body = r#"{"Errors": [{"description": "Invalid NPI"}]}"#;
        let err = parse_response("12", body).unwrap_err();
        assert_eq!(err.classify(), FailureClass::Terminal);

        let err = parse_response("12", "not json").unwrap_err();
        assert_eq!(err.classify(), FailureClass::Terminal);
    }

    #[test]
    fn test_classification() {
        assert_eq!(RegistryError::RateLimitExceeded.classify(), FailureClass::Retryable);
        assert_eq!(RegistryError::Unavailable(503).classify(), FailureClass::Retryable);
        assert_eq!(RegistryError::Denied(403, String::new()).classify(), FailureClass::Fatal);
    }
}
