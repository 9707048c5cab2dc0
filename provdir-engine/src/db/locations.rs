//! Practice location persistence and geocoding groups

use chrono::{DateTime, Utc};
use provdir_common::address::AddressParts;
use provdir_common::db::{FieldTiers, GeocodeStatus, PracticeLocation};
use provdir_common::time::to_db;
use provdir_common::{Result, SourceTier};
use sqlx::sqlite::SqliteExecutor;
use sqlx::{Row, SqliteConnection};

const LOCATION_COLUMNS: &str = "id, provider_npi, location_name, address_line1, address_line2, \
    city, state, zip, phone, fax, address_hash, latitude, longitude, geocoded_at, geocode_status, \
    source_tier, field_tiers, enriched_at, created_at, updated_at";

/// Location by its natural key (provider, address identity hash)
pub async fn find_location<'e, E>(
    executor: E,
    npi: &str,
    address_hash: &str,
) -> Result<Option<PracticeLocation>>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!(
        "SELECT {} FROM practice_locations WHERE provider_npi = ? AND address_hash = ?",
        LOCATION_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(npi)
        .bind(address_hash)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(PracticeLocation::from_row).transpose()
}

pub async fn get_location<'e, E>(executor: E, id: i64) -> Result<Option<PracticeLocation>>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!("SELECT {} FROM practice_locations WHERE id = ?", LOCATION_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(executor).await?;
    row.as_ref().map(PracticeLocation::from_row).transpose()
}

pub async fn locations_for_provider<'e, E>(executor: E, npi: &str) -> Result<Vec<PracticeLocation>>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!(
        "SELECT {} FROM practice_locations WHERE provider_npi = ? ORDER BY id",
        LOCATION_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(npi).fetch_all(executor).await?;
    rows.iter().map(PracticeLocation::from_row).collect()
}

/// Insert a new location row carrying its address components
///
/// If another row with the same address hash is already geocoded, the new row inherits
/// its coordinates so rows sharing a hash never disagree.
///
/// # Returns
/// Row id of the new location
pub async fn insert_location(
    conn: &mut SqliteConnection,
    npi: &str,
    address: &AddressParts,
    address_hash: &str,
    tier: SourceTier,
    now: DateTime<Utc>,
) -> Result<i64> {
    let ts = to_db(now);

    let result = sqlx::query(
        r#"
        INSERT INTO practice_locations (
            provider_npi, address_line1, address_line2, city, state, zip,
            address_hash, source_tier, field_tiers, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, '{}', ?, ?)
        "#,
    )
    .bind(npi)
    .bind(non_empty(&address.line1))
    .bind(address.line2.as_deref().and_then(non_empty))
    .bind(non_empty(&address.city))
    .bind(non_empty(&address.state).map(str::to_ascii_uppercase))
    .bind(non_empty(&address.zip))
    .bind(address_hash)
    .bind(tier.as_str())
    .bind(&ts)
    .bind(&ts)
    .execute(&mut *conn)
    .await?;
    let id = result.last_insert_rowid();

    sqlx::query(
        r#"
        UPDATE practice_locations
        SET (latitude, longitude, geocoded_at, geocode_status) = (
            SELECT latitude, longitude, geocoded_at, geocode_status
            FROM practice_locations
            WHERE address_hash = ? AND id <> ? AND geocode_status IS NOT NULL
            ORDER BY id LIMIT 1
        )
        WHERE id = ? AND EXISTS (
            SELECT 1 FROM practice_locations
            WHERE address_hash = ? AND id <> ? AND geocode_status IS NOT NULL
        )
        "#,
    )
    .bind(address_hash)
    .bind(id)
    .bind(id)
    .bind(address_hash)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    Ok(id)
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Write merged column values, tier map and source tier
///
/// `enriched_at` is only overwritten when a value is given.
pub async fn update_location_columns(
    conn: &mut SqliteConnection,
    id: i64,
    columns: &[(&'static str, Option<String>)],
    tiers: &FieldTiers,
    source_tier: SourceTier,
    enriched_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<()> {
    let assignments: String = columns
        .iter()
        .map(|(column, _)| format!("{} = ?, ", column))
        .collect();
    let sql = format!(
        "UPDATE practice_locations SET {}field_tiers = ?, source_tier = ?, \
         enriched_at = COALESCE(?, enriched_at), updated_at = ? WHERE id = ?",
        assignments
    );

    let mut query = sqlx::query(&sql);
    for (_, value) in columns {
        query = query.bind(value.clone());
    }
    query
        .bind(tiers.to_json()?)
        .bind(source_tier.as_str())
        .bind(enriched_at.map(to_db))
        .bind(to_db(now))
        .bind(id)
        .execute(conn)
        .await?;

    Ok(())
}

/// One unique ungeocoded address and how many rows share it
#[derive(Debug, Clone)]
pub struct AddressGroup {
    pub address_hash: String,
    pub address: AddressParts,
    pub row_count: u64,
}

/// Next page of unique ungeocoded addresses, keyset-ordered by hash
///
/// Rows already marked `no_result` are terminal and never returned.
pub async fn ungeocoded_groups<'e, E>(
    executor: E,
    after_hash: Option<&str>,
    page_size: u32,
) -> Result<Vec<AddressGroup>>
where
    E: SqliteExecutor<'e>,
{
    // Bare columns next to MIN(id) come from the row holding the minimum
    let rows = sqlx::query(
        r#"
        SELECT address_hash, MIN(id) AS first_id,
               address_line1, address_line2, city, state, zip,
               COUNT(*) AS row_count
        FROM practice_locations
        WHERE latitude IS NULL AND geocode_status IS NULL AND address_hash > ?
        GROUP BY address_hash
        ORDER BY address_hash
        LIMIT ?
        "#,
    )
    .bind(after_hash.unwrap_or(""))
    .bind(page_size as i64)
    .fetch_all(executor)
    .await?;

    rows.iter()
        .map(|row| -> Result<AddressGroup> {
            let line1: Option<String> = row.try_get("address_line1")?;
            let line2: Option<String> = row.try_get("address_line2")?;
            let city: Option<String> = row.try_get("city")?;
            let state: Option<String> = row.try_get("state")?;
            let zip: Option<String> = row.try_get("zip")?;
            let row_count: i64 = row.try_get("row_count")?;
            Ok(AddressGroup {
                address_hash: row.try_get("address_hash")?,
                address: AddressParts::new(
                    line1.unwrap_or_default(),
                    line2,
                    city.unwrap_or_default(),
                    state.unwrap_or_default(),
                    zip.unwrap_or_default(),
                ),
                row_count: row_count as u64,
            })
        })
        .collect()
}

/// Count unique ungeocoded address hashes (dry-run estimate)
pub async fn count_ungeocoded_hashes<'e, E>(executor: E) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(DISTINCT address_hash)
        FROM practice_locations
        WHERE latitude IS NULL AND geocode_status IS NULL
        "#,
    )
    .fetch_one(executor)
    .await?;

    Ok(count as u64)
}

/// Fan coordinates out to every row sharing the hash in one statement
///
/// # Returns
/// Number of rows updated
pub async fn apply_coordinates<'e, E>(
    executor: E,
    address_hash: &str,
    latitude: f64,
    longitude: f64,
    at: DateTime<Utc>,
) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE practice_locations
        SET latitude = ?, longitude = ?, geocoded_at = ?, geocode_status = ?
        WHERE address_hash = ?
        "#,
    )
    .bind(latitude)
    .bind(longitude)
    .bind(to_db(at))
    .bind(GeocodeStatus::Ok.as_str())
    .bind(address_hash)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Mark every row sharing the hash as terminally unresolvable
pub async fn mark_no_result<'e, E>(executor: E, address_hash: &str, at: DateTime<Utc>) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE practice_locations
        SET geocode_status = ?, geocoded_at = ?
        WHERE address_hash = ? AND latitude IS NULL
        "#,
    )
    .bind(GeocodeStatus::NoResult.as_str())
    .bind(to_db(at))
    .bind(address_hash)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}
