//! Database initialization
//!
//! Opens (creating if needed) the directory database and creates every table and index
//! idempotently. Safe to call on every startup.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Current schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Per-connection pragmas: every pooled connection enforces foreign keys
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(5000));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create all tables and indexes (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_settings_table(pool).await?;
    create_providers_table(pool).await?;
    create_practice_locations_table(pool).await?;
    create_insurance_plans_table(pool).await?;
    create_acceptance_table(pool).await?;
    create_verification_events_table(pool).await?;
    create_import_conflicts_table(pool).await?;
    create_discrepancies_table(pool).await?;
    create_network_observations_table(pool).await?;
    create_batch_runs_table(pool).await?;

    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the settings table
///
/// Stores runtime key-value settings (e.g. the geocoder API key).
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Providers keyed by NPI
///
/// `field_tiers` is a JSON object mapping field name to the tier that last wrote it;
/// absent fields are owned by `registry`.
async fn create_providers_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS providers (
            npi TEXT PRIMARY KEY,
            entity_kind TEXT CHECK (entity_kind IN ('individual', 'organization')),
            first_name TEXT,
            middle_name TEXT,
            last_name TEXT,
            organization_name TEXT,
            credential TEXT,
            taxonomy_code TEXT,
            deactivation_date TEXT,
            field_tiers TEXT NOT NULL DEFAULT '{}',
            registry_synced_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_providers_registry_synced ON providers(registry_synced_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_practice_locations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS practice_locations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            provider_npi TEXT NOT NULL REFERENCES providers(npi) ON DELETE CASCADE,
            location_name TEXT,
            address_line1 TEXT,
            address_line2 TEXT,
            city TEXT,
            state TEXT,
            zip TEXT,
            phone TEXT,
            fax TEXT,
            address_hash TEXT NOT NULL,
            latitude REAL,
            longitude REAL,
            geocoded_at TEXT,
            geocode_status TEXT CHECK (geocode_status IN ('ok', 'no_result')),
            source_tier TEXT NOT NULL,
            field_tiers TEXT NOT NULL DEFAULT '{}',
            enriched_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (provider_npi, address_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_locations_address_hash ON practice_locations(address_hash)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_insurance_plans_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS insurance_plans (
            plan_id TEXT PRIMARY KEY,
            plan_name TEXT,
            carrier_name TEXT,
            issuer_name TEXT,
            plan_type TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Provider/plan acceptance records
///
/// Two partial unique indexes give the two mutually exclusive uniqueness scopes:
/// (provider, plan, location) for located rows, (provider, plan) for provider-wide rows.
async fn create_acceptance_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS provider_plan_acceptance (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            provider_npi TEXT NOT NULL REFERENCES providers(npi) ON DELETE CASCADE,
            plan_id TEXT NOT NULL REFERENCES insurance_plans(plan_id),
            location_id INTEGER REFERENCES practice_locations(id) ON DELETE CASCADE,
            acceptance_status TEXT NOT NULL DEFAULT 'PENDING',
            confidence_score INTEGER NOT NULL DEFAULT 0
                CHECK (confidence_score BETWEEN 0 AND 100),
            source_tier TEXT NOT NULL,
            verification_count INTEGER NOT NULL DEFAULT 0,
            last_verified_at TEXT,
            expires_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_ppa_provider_plan_location
        ON provider_plan_acceptance(provider_npi, plan_id, location_id)
        WHERE location_id IS NOT NULL
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_ppa_provider_plan_wide
        ON provider_plan_acceptance(provider_npi, plan_id)
        WHERE location_id IS NULL
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_verification_events_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS verification_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            provider_npi TEXT NOT NULL REFERENCES providers(npi) ON DELETE CASCADE,
            plan_id TEXT NOT NULL REFERENCES insurance_plans(plan_id),
            vote TEXT NOT NULL CHECK (vote IN ('up', 'down')),
            weight INTEGER NOT NULL DEFAULT 1 CHECK (weight > 0),
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_verification_events_key
        ON verification_events(provider_npi, plan_id, expires_at)
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_import_conflicts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_kind TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            field TEXT NOT NULL,
            kept_value TEXT,
            rejected_value TEXT,
            current_source TEXT NOT NULL,
            incoming_source TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Discrepancies outlive their provider (no foreign key) so the audit trail survives cleanup
async fn create_discrepancies_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS discrepancies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT,
            provider_npi TEXT NOT NULL,
            severity TEXT NOT NULL CHECK (severity IN ('CRITICAL', 'WARNING', 'INFO')),
            category TEXT NOT NULL,
            field TEXT,
            observed_value TEXT,
            expected_value TEXT,
            resolved INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            resolved_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_discrepancies_provider ON discrepancies(provider_npi, resolved)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_network_observations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS provider_network_observations (
            provider_npi TEXT NOT NULL REFERENCES providers(npi) ON DELETE CASCADE,
            network_name TEXT NOT NULL,
            observed_at TEXT NOT NULL,
            PRIMARY KEY (provider_npi, network_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_batch_runs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS batch_runs (
            run_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            state TEXT NOT NULL,
            dry_run INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            report TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
