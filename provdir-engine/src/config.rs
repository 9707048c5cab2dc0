//! Configuration resolution for the engine
//!
//! Provides multi-tier resolution of the geocoder API key with Database → ENV → TOML
//! priority, and the runtime tunables derived from the bootstrap TOML.

use provdir_common::config::TomlConfig;
use provdir_common::{Error, Result};
use sqlx::{Pool, Sqlite};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable carrying the geocoder API key
pub const GEOCODER_KEY_ENV_VAR: &str = "PROVDIR_GEOCODER_API_KEY";

/// Resolve geocoder API key from 3-tier configuration
///
/// **Priority:** Database → ENV → TOML
pub async fn resolve_geocoder_api_key(db: &Pool<Sqlite>, toml_config: &TomlConfig) -> Result<String> {
    let db_key = crate::db::settings::get_geocoder_api_key(db).await?;
    let env_key = std::env::var(GEOCODER_KEY_ENV_VAR).ok();
    let toml_key = toml_config.geocoding.api_key.clone();

    let candidates = [
        ("database", db_key),
        ("environment", env_key),
        ("TOML", toml_key),
    ];

    let sources: Vec<&str> = candidates
        .iter()
        .filter(|(_, key)| key.as_deref().map(is_valid_key).unwrap_or(false))
        .map(|(source, _)| *source)
        .collect();

    // Warn if multiple sources (potential misconfiguration)
    if sources.len() > 1 {
        warn!(
            "Geocoder API key found in multiple sources: {}. Using {} (highest priority).",
            sources.join(", "),
            sources[0]
        );
    }

    for (source, key) in candidates {
        if let Some(key) = key.filter(|k| is_valid_key(k)) {
            info!("Geocoder API key loaded from {}", source);
            return Ok(key.trim().to_string());
        }
    }

    Err(Error::Config(format!(
        "Geocoder API key not configured. Please configure using one of:\n\
         1. Database: settings key 'geocoder_api_key'\n\
         2. Environment: {}=your-key-here\n\
         3. TOML config: [geocoding] api_key = \"your-key\"",
        GEOCODER_KEY_ENV_VAR
    )))
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

/// Confidence tunables
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceSettings {
    pub verification_ttl_months: u32,
    pub acceptance_ttl_months: u32,
    pub half_life_days: f64,
}

impl Default for ConfidenceSettings {
    fn default() -> Self {
        Self {
            verification_ttl_months: 6,
            acceptance_ttl_months: 6,
            half_life_days: 90.0,
        }
    }
}

impl From<&TomlConfig> for ConfidenceSettings {
    fn from(config: &TomlConfig) -> Self {
        Self {
            verification_ttl_months: config.confidence.verification_ttl_months,
            acceptance_ttl_months: config.confidence.acceptance_ttl_months,
            half_life_days: config.confidence.half_life_days,
        }
    }
}

/// Reconciliation tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSettings {
    /// Providers reconciled longer ago than this are due again
    pub staleness: chrono::Duration,
    pub page_size: u32,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            staleness: chrono::Duration::days(90),
            page_size: 100,
        }
    }
}

impl From<&TomlConfig> for ReconcileSettings {
    fn from(config: &TomlConfig) -> Self {
        Self {
            staleness: chrono::Duration::days(config.registry.staleness_days),
            ..Self::default()
        }
    }
}

/// Geocoding tunables (everything except the key, which is resolved separately)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeocodeSettings {
    pub cost_per_request_usd: f64,
    pub page_size: u32,
}

impl Default for GeocodeSettings {
    fn default() -> Self {
        Self {
            cost_per_request_usd: 0.005,
            page_size: 100,
        }
    }
}

impl From<&TomlConfig> for GeocodeSettings {
    fn from(config: &TomlConfig) -> Self {
        Self {
            cost_per_request_usd: config.geocoding.cost_per_request_usd,
            ..Self::default()
        }
    }
}

/// HTTP timeout helper shared by the client constructors
pub fn timeout_from_secs(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use provdir_common::db::init_database;
    use serial_test::serial;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Pool<Sqlite>) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("config.db")).await.unwrap();
        (dir, pool)
    }

    #[test]
    fn test_is_valid_key() {
        assert!(is_valid_key("abc"));
        assert!(!is_valid_key(""));
        assert!(!is_valid_key("   "));
    }

    #[tokio::test]
    #[serial]
    async fn test_database_key_wins() {
        let (_dir, pool) = setup().await;
        crate::db::settings::set_geocoder_api_key(&pool, "db-key".to_string())
            .await
            .unwrap();
        std::env::set_var(GEOCODER_KEY_ENV_VAR, "env-key");
        let mut config = TomlConfig::default();
        config.geocoding.api_key = Some("toml-key".to_string());

        let key = resolve_geocoder_api_key(&pool, &config).await.unwrap();
        std::env::remove_var(GEOCODER_KEY_ENV_VAR);

        assert_eq!(key, "db-key");
    }

    #[tokio::test]
    #[serial]
    async fn test_env_beats_toml() {
        let (_dir, pool) = setup().await;
        std::env::set_var(GEOCODER_KEY_ENV_VAR, "env-key");
        let mut config = TomlConfig::default();
        config.geocoding.api_key = Some("toml-key".to_string());

        let key = resolve_geocoder_api_key(&pool, &config).await.unwrap();
        std::env::remove_var(GEOCODER_KEY_ENV_VAR);

        assert_eq!(key, "env-key");
    }

    #[tokio::test]
    #[serial]
    async fn test_blank_sources_skipped_and_missing_key_errors() {
        let (_dir, pool) = setup().await;
        std::env::set_var(GEOCODER_KEY_ENV_VAR, "  ");
        let mut config = TomlConfig::default();
        config.geocoding.api_key = Some("toml-key".to_string());

        let key = resolve_geocoder_api_key(&pool, &config).await.unwrap();
        assert_eq!(key, "toml-key");

        config.geocoding.api_key = None;
        let result = resolve_geocoder_api_key(&pool, &config).await;
        std::env::remove_var(GEOCODER_KEY_ENV_VAR);

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_settings_from_toml() {
        let config = TomlConfig::from_toml_str(
            r#"
            [registry]
            staleness_days = 30

            [confidence]
            half_life_days = 45.0
            "#,
        )
        .unwrap();

        assert_eq!(ReconcileSettings::from(&config).staleness, chrono::Duration::days(30));
        assert_eq!(ConfidenceSettings::from(&config).half_life_days, 45.0);
        assert_eq!(ConfidenceSettings::from(&config).verification_ttl_months, 6);
    }
}
