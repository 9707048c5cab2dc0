//! Tests for bootstrap configuration loading
//!
//! Uses serial_test to prevent environment variable races: tests that touch
//! PROVDIR_CONFIG or PROVDIR_DATABASE are marked #[serial].

use provdir_common::config::{
    load_config, resolve_database_path, TomlConfig, CONFIG_ENV_VAR, DATABASE_ENV_VAR,
};
use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[test]
fn test_empty_toml_yields_defaults() {
    let config = TomlConfig::from_toml_str("").unwrap();

    assert_eq!(config.logging.level, "info");
    assert_eq!(config.registry.staleness_days, 90);
    assert_eq!(config.registry.max_attempts, 3);
    assert_eq!(config.confidence.verification_ttl_months, 6);
    assert_eq!(config.confidence.acceptance_ttl_months, 6);
    assert!(config.geocoding.api_key.is_none());
    assert!(config.validate().is_ok());
}

#[test]
fn test_partial_sections_keep_other_defaults() {
    let config = TomlConfig::from_toml_str(
        r#"
        database_path = "/var/lib/provdir/dir.db"

        [geocoding]
        bucket_capacity = 2
        refill_per_second = 1

        [confidence]
        half_life_days = 30.0
        "#,
    )
    .unwrap();

    assert_eq!(config.database_path, Some(PathBuf::from("/var/lib/provdir/dir.db")));
    assert_eq!(config.geocoding.bucket_capacity, 2);
    assert_eq!(config.geocoding.max_attempts, 3);
    assert_eq!(config.confidence.half_life_days, 30.0);
    assert_eq!(config.confidence.verification_ttl_months, 6);
}

#[test]
fn test_invalid_toml_is_config_error() {
    let err = TomlConfig::from_toml_str("registry = [").unwrap_err();
    assert!(err.to_string().contains("Configuration error"));
}

#[test]
fn test_validate_rejects_zero_rates() {
    let mut config = TomlConfig::default();
    config.geocoding.refill_per_second = 0;
    assert!(config.validate().is_err());

    let mut config = TomlConfig::default();
    config.registry.requests_per_second = 0;
    assert!(config.validate().is_err());

    let mut config = TomlConfig::default();
    config.confidence.half_life_days = 0.0;
    assert!(config.validate().is_err());
}

#[test]
#[serial]
fn test_load_config_from_cli_path() {
    env::remove_var(CONFIG_ENV_VAR);
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("provdir.toml");
    std::fs::write(&path, "[registry]\nstaleness_days = 30\n").unwrap();

    let config = load_config(Some(&path)).unwrap();
    assert_eq!(config.registry.staleness_days, 30);
}

#[test]
#[serial]
fn test_load_config_from_env_var() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("env.toml");
    std::fs::write(&path, "[logging]\nlevel = \"debug\"\n").unwrap();

    env::set_var(CONFIG_ENV_VAR, &path);
    let config = load_config(None).unwrap();
    env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(config.logging.level, "debug");
}

#[test]
#[serial]
fn test_missing_explicit_config_is_error() {
    env::remove_var(CONFIG_ENV_VAR);
    let result = load_config(Some(Path::new("/nonexistent/provdir/config.toml")));
    assert!(result.is_err());
}

#[test]
#[serial]
fn test_database_path_priority() {
    let mut config = TomlConfig::default();
    config.database_path = Some(PathBuf::from("/from/toml.db"));

    env::remove_var(DATABASE_ENV_VAR);
    assert_eq!(
        resolve_database_path(Some(Path::new("/from/cli.db")), &config),
        PathBuf::from("/from/cli.db")
    );
    assert_eq!(resolve_database_path(None, &config), PathBuf::from("/from/toml.db"));

    env::set_var(DATABASE_ENV_VAR, "/from/env.db");
    assert_eq!(resolve_database_path(None, &config), PathBuf::from("/from/env.db"));
    env::remove_var(DATABASE_ENV_VAR);

    let fallback = resolve_database_path(None, &TomlConfig::default());
    assert!(fallback.ends_with("provdir.db"));
}
