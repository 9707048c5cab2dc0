//! Provider/plan acceptance (PPA) persistence

use chrono::{DateTime, Utc};
use provdir_common::db::{Acceptance, AcceptanceStatus};
use provdir_common::time::to_db;
use provdir_common::{Result, SourceTier};
use sqlx::sqlite::SqliteExecutor;
use sqlx::{SqliteConnection, SqlitePool};

const ACCEPTANCE_COLUMNS: &str = "id, provider_npi, plan_id, location_id, acceptance_status, \
    confidence_score, source_tier, verification_count, last_verified_at, expires_at, \
    created_at, updated_at";

/// Values for a new acceptance row
#[derive(Debug, Clone)]
pub struct NewAcceptance<'a> {
    pub provider_npi: &'a str,
    pub plan_id: &'a str,
    pub location_id: Option<i64>,
    pub status: AcceptanceStatus,
    pub confidence_score: i64,
    pub source_tier: SourceTier,
    pub expires_at: DateTime<Utc>,
}

/// Acceptance by its uniqueness scope
///
/// `location_id = None` addresses the provider-wide row, never a located one.
pub async fn find_acceptance<'e, E>(
    executor: E,
    npi: &str,
    plan_id: &str,
    location_id: Option<i64>,
) -> Result<Option<Acceptance>>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!(
        "SELECT {} FROM provider_plan_acceptance \
         WHERE provider_npi = ? AND plan_id = ? AND location_id IS ?",
        ACCEPTANCE_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(npi)
        .bind(plan_id)
        .bind(location_id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(Acceptance::from_row).transpose()
}

pub async fn get_acceptance<'e, E>(executor: E, id: i64) -> Result<Option<Acceptance>>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!("SELECT {} FROM provider_plan_acceptance WHERE id = ?", ACCEPTANCE_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(executor).await?;
    row.as_ref().map(Acceptance::from_row).transpose()
}

/// All acceptance rows (located and provider-wide) for a provider/plan pair
pub async fn acceptances_for_pair<'e, E>(executor: E, npi: &str, plan_id: &str) -> Result<Vec<Acceptance>>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!(
        "SELECT {} FROM provider_plan_acceptance WHERE provider_npi = ? AND plan_id = ? ORDER BY id",
        ACCEPTANCE_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(npi).bind(plan_id).fetch_all(executor).await?;
    rows.iter().map(Acceptance::from_row).collect()
}

/// Insert an acceptance row
///
/// A uniqueness violation surfaces as a database error; callers look the row up first.
pub async fn insert_acceptance(
    conn: &mut SqliteConnection,
    new: &NewAcceptance<'_>,
    now: DateTime<Utc>,
) -> Result<i64> {
    let ts = to_db(now);
    let result = sqlx::query(
        r#"
        INSERT INTO provider_plan_acceptance (
            provider_npi, plan_id, location_id, acceptance_status, confidence_score,
            source_tier, verification_count, expires_at, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
        "#,
    )
    .bind(new.provider_npi)
    .bind(new.plan_id)
    .bind(new.location_id)
    .bind(new.status.as_str())
    .bind(new.confidence_score)
    .bind(new.source_tier.as_str())
    .bind(to_db(new.expires_at))
    .bind(&ts)
    .bind(&ts)
    .execute(conn)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Insert a provider-wide PENDING link unless the pair already has any acceptance row
///
/// # Returns
/// `true` if a row was created
pub async fn insert_pending_if_absent<'e, E>(
    executor: E,
    npi: &str,
    plan_id: &str,
    tier: SourceTier,
    confidence_score: i64,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let ts = to_db(now);
    let result = sqlx::query(
        r#"
        INSERT INTO provider_plan_acceptance (
            provider_npi, plan_id, location_id, acceptance_status, confidence_score,
            source_tier, verification_count, expires_at, created_at, updated_at
        )
        SELECT ?, ?, NULL, ?, ?, ?, 0, ?, ?, ?
        WHERE NOT EXISTS (
            SELECT 1 FROM provider_plan_acceptance WHERE provider_npi = ? AND plan_id = ?
        )
        "#,
    )
    .bind(npi)
    .bind(plan_id)
    .bind(AcceptanceStatus::Pending.as_str())
    .bind(confidence_score)
    .bind(tier.as_str())
    .bind(to_db(expires_at))
    .bind(&ts)
    .bind(&ts)
    .bind(npi)
    .bind(plan_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Whether the pair has any acceptance row at all
pub async fn pair_has_acceptance<'e, E>(executor: E, npi: &str, plan_id: &str) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let exists: i64 = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM provider_plan_acceptance WHERE provider_npi = ? AND plan_id = ?)",
    )
    .bind(npi)
    .bind(plan_id)
    .fetch_one(executor)
    .await?;
    Ok(exists != 0)
}

/// Persist the outcome of recording a verification
pub async fn store_verification_outcome(
    conn: &mut SqliteConnection,
    id: i64,
    status: AcceptanceStatus,
    confidence_score: i64,
    verified_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE provider_plan_acceptance
        SET verification_count = verification_count + 1,
            last_verified_at = ?,
            source_tier = ?,
            acceptance_status = ?,
            confidence_score = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(to_db(verified_at))
    .bind(SourceTier::CrowdVerified.as_str())
    .bind(status.as_str())
    .bind(confidence_score)
    .bind(to_db(now))
    .bind(id)
    .execute(conn)
    .await?;

    Ok(())
}

/// Overwrite the stored score and tier (merge of an imported confidence)
pub async fn store_score_and_tier<'e, E>(
    executor: E,
    id: i64,
    confidence_score: i64,
    tier: SourceTier,
    now: DateTime<Utc>,
) -> Result<()>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "UPDATE provider_plan_acceptance SET confidence_score = ?, source_tier = ?, updated_at = ? WHERE id = ?",
    )
    .bind(confidence_score)
    .bind(tier.as_str())
    .bind(to_db(now))
    .bind(id)
    .execute(executor)
    .await?;

    Ok(())
}

/// Store a recomputed score only if it differs
///
/// # Returns
/// `true` if the row changed
pub async fn store_score_if_changed<'e, E>(
    executor: E,
    id: i64,
    confidence_score: i64,
    now: DateTime<Utc>,
) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE provider_plan_acceptance
        SET confidence_score = ?, updated_at = ?
        WHERE id = ? AND confidence_score <> ?
        "#,
    )
    .bind(confidence_score)
    .bind(to_db(now))
    .bind(id)
    .bind(confidence_score)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Next page of verified acceptances (count > 0), keyset-ordered by id
pub async fn verified_page(pool: &SqlitePool, after_id: i64, page_size: u32) -> Result<Vec<Acceptance>> {
    let sql = format!(
        "SELECT {} FROM provider_plan_acceptance \
         WHERE verification_count > 0 AND id > ? ORDER BY id LIMIT ?",
        ACCEPTANCE_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(after_id)
        .bind(page_size as i64)
        .fetch_all(pool)
        .await?;
    rows.iter().map(Acceptance::from_row).collect()
}
