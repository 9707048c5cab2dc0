//! Provider network-name observations (plan matcher input)

use chrono::{DateTime, Utc};
use provdir_common::time::to_db;
use provdir_common::Result;
use sqlx::sqlite::SqliteExecutor;

/// Record that a provider was seen under a free-text network name
///
/// # Returns
/// `true` for a new observation, `false` if already known
pub async fn record_observation<'e, E>(
    executor: E,
    npi: &str,
    network_name: &str,
    now: DateTime<Utc>,
) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO provider_network_observations (provider_npi, network_name, observed_at)
        VALUES (?, ?, ?)
        ON CONFLICT(provider_npi, network_name) DO NOTHING
        "#,
    )
    .bind(npi)
    .bind(network_name.trim())
    .bind(to_db(now))
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Next page of distinct network names, keyset-ordered
pub async fn network_names_page<'e, E>(
    executor: E,
    after: Option<&str>,
    page_size: u32,
) -> Result<Vec<String>>
where
    E: SqliteExecutor<'e>,
{
    let names: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT network_name
        FROM provider_network_observations
        WHERE network_name > ?
        ORDER BY network_name
        LIMIT ?
        "#,
    )
    .bind(after.unwrap_or(""))
    .bind(page_size as i64)
    .fetch_all(executor)
    .await?;

    Ok(names)
}

/// Providers observed under exactly this network name
pub async fn providers_for_network<'e, E>(executor: E, network_name: &str) -> Result<Vec<String>>
where
    E: SqliteExecutor<'e>,
{
    let npis: Vec<String> = sqlx::query_scalar(
        "SELECT provider_npi FROM provider_network_observations WHERE network_name = ? ORDER BY provider_npi",
    )
    .bind(network_name)
    .fetch_all(executor)
    .await?;

    Ok(npis)
}
