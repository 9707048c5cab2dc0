//! Bootstrap configuration loading
//!
//! Configuration file resolution follows this priority order:
//! 1. Command-line argument (highest priority)
//! 2. `PROVDIR_CONFIG` environment variable
//! 3. User config file (`~/.config/provdir/config.toml`), then `/etc/provdir/config.toml`
//! 4. Built-in defaults (fallback)
//!
//! Every section is optional; missing keys fall back to the defaults below.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "PROVDIR_CONFIG";

/// Environment variable naming the database file
pub const DATABASE_ENV_VAR: &str = "PROVDIR_DATABASE";

/// Top-level TOML configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Path to SQLite database file
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub geocoding: GeocodingConfig,

    #[serde(default)]
    pub confidence: ConfidenceConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive (trace, debug, info, warn, error); `RUST_LOG` overrides
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Canonical registry client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_url")]
    pub base_url: String,
    /// Requests-per-second ceiling
    #[serde(default = "default_registry_rps")]
    pub requests_per_second: u32,
    /// Fixed delay inserted between consecutive calls
    #[serde(default = "default_registry_delay_ms")]
    pub inter_call_delay_ms: u64,
    /// Providers reconciled more recently than this are skipped
    #[serde(default = "default_staleness_days")]
    pub staleness_days: i64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: default_registry_url(),
            requests_per_second: default_registry_rps(),
            inter_call_delay_ms: default_registry_delay_ms(),
            staleness_days: default_staleness_days(),
            max_attempts: default_max_attempts(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Geocoding client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocodingConfig {
    #[serde(default = "default_geocoder_url")]
    pub base_url: String,
    /// API key (lowest priority source; see engine config resolution)
    #[serde(default)]
    pub api_key: Option<String>,
    /// Token bucket capacity (burst size)
    #[serde(default = "default_bucket_capacity")]
    pub bucket_capacity: u32,
    /// Token bucket refill rate in tokens per second
    #[serde(default = "default_refill_per_second")]
    pub refill_per_second: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Estimated price of one geocoding request, for dry-run cost reports
    #[serde(default = "default_cost_per_request")]
    pub cost_per_request_usd: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            base_url: default_geocoder_url(),
            api_key: None,
            bucket_capacity: default_bucket_capacity(),
            refill_per_second: default_refill_per_second(),
            max_attempts: default_max_attempts(),
            cost_per_request_usd: default_cost_per_request(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Confidence scoring settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    /// Lifetime of a verification event
    #[serde(default = "default_ttl_months")]
    pub verification_ttl_months: u32,
    /// Lifetime of an acceptance record
    #[serde(default = "default_ttl_months")]
    pub acceptance_ttl_months: u32,
    /// Days after which an unrefreshed score halves
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            verification_ttl_months: default_ttl_months(),
            acceptance_ttl_months: default_ttl_months(),
            half_life_days: default_half_life_days(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_registry_url() -> String {
    "https://npiregistry.cms.hhs.gov/api/".to_string()
}

fn default_registry_rps() -> u32 {
    5
}

fn default_registry_delay_ms() -> u64 {
    100
}

fn default_staleness_days() -> i64 {
    90
}

fn default_max_attempts() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_geocoder_url() -> String {
    "https://maps.googleapis.com/maps/api/geocode/json".to_string()
}

fn default_bucket_capacity() -> u32 {
    10
}

fn default_refill_per_second() -> u32 {
    10
}

fn default_cost_per_request() -> f64 {
    0.005
}

fn default_ttl_months() -> u32 {
    6
}

fn default_half_life_days() -> f64 {
    90.0
}

impl TomlConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Validate values that would make the engine misbehave
    pub fn validate(&self) -> Result<()> {
        if self.registry.requests_per_second == 0 {
            return Err(Error::Config("registry.requests_per_second must be > 0".to_string()));
        }
        if self.geocoding.bucket_capacity == 0 || self.geocoding.refill_per_second == 0 {
            return Err(Error::Config(
                "geocoding.bucket_capacity and geocoding.refill_per_second must be > 0".to_string(),
            ));
        }
        if self.registry.max_attempts == 0 || self.geocoding.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be >= 1".to_string()));
        }
        if !(self.confidence.half_life_days > 0.0) {
            return Err(Error::Config("confidence.half_life_days must be > 0".to_string()));
        }
        if self.confidence.verification_ttl_months == 0 || self.confidence.acceptance_ttl_months == 0 {
            return Err(Error::Config("confidence TTLs must be at least one month".to_string()));
        }
        Ok(())
    }
}

/// Load configuration following the priority order in the module docs
pub fn load_config(cli_path: Option<&Path>) -> Result<TomlConfig> {
    let explicit = cli_path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from));

    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(Error::Config(format!("Config file not found: {}", path.display())));
            }
            Some(path)
        }
        None => default_config_file(),
    };

    let config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
            info!("Loaded configuration from {}", path.display());
            TomlConfig::from_toml_str(&content)?
        }
        None => {
            debug!("No configuration file found, using built-in defaults");
            TomlConfig::default()
        }
    };

    config.validate()?;
    Ok(config)
}

/// Resolve database path: CLI argument, environment, TOML, OS default
pub fn resolve_database_path(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var(DATABASE_ENV_VAR) {
        return PathBuf::from(path);
    }
    if let Some(path) = &config.database_path {
        return path.clone();
    }
    default_data_dir().join("provdir.db")
}

/// First existing config file among the per-user and system locations
fn default_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("provdir").join("config.toml"));
    let system_config = PathBuf::from("/etc/provdir/config.toml");

    user_config
        .into_iter()
        .chain(std::iter::once(system_config))
        .find(|p| p.exists())
}

/// OS-dependent data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("provdir"))
        .unwrap_or_else(|| PathBuf::from("./provdir_data"))
}
