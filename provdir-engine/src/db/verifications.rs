//! Crowd verification events (append-only)

use chrono::{DateTime, Utc};
use provdir_common::db::{VerificationEvent, Vote};
use provdir_common::time::to_db;
use provdir_common::Result;
use sqlx::sqlite::SqliteExecutor;

/// Append a verification event
pub async fn insert_event<'e, E>(
    executor: E,
    npi: &str,
    plan_id: &str,
    vote: Vote,
    weight: i64,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<i64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO verification_events (provider_npi, plan_id, vote, weight, created_at, expires_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(npi)
    .bind(plan_id)
    .bind(vote.as_str())
    .bind(weight)
    .bind(to_db(created_at))
    .bind(to_db(expires_at))
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Events for a provider/plan pair submitted at or before `at`, live or expired
///
/// Expired events stay in the table; scoring separates live from lapsed signal.
pub async fn events_recorded_by<'e, E>(
    executor: E,
    npi: &str,
    plan_id: &str,
    at: DateTime<Utc>,
) -> Result<Vec<VerificationEvent>>
where
    E: SqliteExecutor<'e>,
{
    let rows = sqlx::query(
        r#"
        SELECT id, provider_npi, plan_id, vote, weight, created_at, expires_at
        FROM verification_events
        WHERE provider_npi = ? AND plan_id = ? AND created_at <= ?
        ORDER BY created_at, id
        "#,
    )
    .bind(npi)
    .bind(plan_id)
    .bind(to_db(at))
    .fetch_all(executor)
    .await?;

    rows.iter().map(VerificationEvent::from_row).collect()
}

/// Total events ever recorded for a pair, live or expired
pub async fn count_events<'e, E>(executor: E, npi: &str, plan_id: &str) -> Result<u64>
where
    E: SqliteExecutor<'e>,
{
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM verification_events WHERE provider_npi = ? AND plan_id = ?",
    )
    .bind(npi)
    .bind(plan_id)
    .fetch_one(executor)
    .await?;
    Ok(count as u64)
}
