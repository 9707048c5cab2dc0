//! Settings database operations
//!
//! Provides get/set accessors for the settings table following the key-value pattern.

use provdir_common::{Error, Result};
use sqlx::{Pool, Sqlite};

const GEOCODER_API_KEY: &str = "geocoder_api_key";

/// Get geocoder API key from database
///
/// **Returns:** Some(key) if exists, None if not set
pub async fn get_geocoder_api_key(db: &Pool<Sqlite>) -> Result<Option<String>> {
    get_setting::<String>(db, GEOCODER_API_KEY).await
}

/// Set geocoder API key in database
pub async fn set_geocoder_api_key(db: &Pool<Sqlite>, key: String) -> Result<()> {
    set_setting(db, GEOCODER_API_KEY, key).await
}

/// Generic setting getter
pub async fn get_setting<T>(db: &Pool<Sqlite>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let row: Option<(Option<String>,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await?;

    match row {
        Some((Some(value),)) => {
            let parsed = value
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Parse setting {} failed: {}", key, e)))?;
            Ok(Some(parsed))
        }
        _ => Ok(None),
    }
}

/// Generic setting setter
pub async fn set_setting<T>(db: &Pool<Sqlite>, key: &str, value: T) -> Result<()>
where
    T: std::fmt::Display,
{
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await?;

    Ok(())
}
