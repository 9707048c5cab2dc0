//! Registry discrepancy audit records

use chrono::{DateTime, Utc};
use provdir_common::db::{Discrepancy, DiscrepancyCategory};
use provdir_common::time::to_db;
use provdir_common::Result;
use sqlx::sqlite::SqliteExecutor;

const DISCREPANCY_COLUMNS: &str = "id, run_id, provider_npi, severity, category, field, \
    observed_value, expected_value, resolved, created_at, resolved_at";

/// A classified registry difference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDiscrepancy {
    pub category: DiscrepancyCategory,
    pub field: Option<String>,
    /// Local value
    pub observed_value: Option<String>,
    /// Registry value
    pub expected_value: Option<String>,
}

pub async fn insert_discrepancy<'e, E>(
    executor: E,
    run_id: &str,
    npi: &str,
    discrepancy: &NewDiscrepancy,
    resolved: bool,
    now: DateTime<Utc>,
) -> Result<i64>
where
    E: SqliteExecutor<'e>,
{
    let ts = to_db(now);
    let result = sqlx::query(
        r#"
        INSERT INTO discrepancies (
            run_id, provider_npi, severity, category, field,
            observed_value, expected_value, resolved, created_at, resolved_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(run_id)
    .bind(npi)
    .bind(discrepancy.category.severity().as_str())
    .bind(discrepancy.category.as_str())
    .bind(&discrepancy.field)
    .bind(&discrepancy.observed_value)
    .bind(&discrepancy.expected_value)
    .bind(resolved as i64)
    .bind(&ts)
    .bind(resolved.then(|| ts.clone()))
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Mark a discrepancy resolved
///
/// # Returns
/// `false` if it did not exist or was already resolved
pub async fn mark_resolved<'e, E>(executor: E, id: i64, now: DateTime<Utc>) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE discrepancies SET resolved = 1, resolved_at = ? WHERE id = ? AND resolved = 0",
    )
    .bind(to_db(now))
    .bind(id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn get_discrepancy<'e, E>(executor: E, id: i64) -> Result<Option<Discrepancy>>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!("SELECT {} FROM discrepancies WHERE id = ?", DISCREPANCY_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(executor).await?;
    row.as_ref().map(Discrepancy::from_row).transpose()
}

pub async fn discrepancies_for_provider<'e, E>(executor: E, npi: &str) -> Result<Vec<Discrepancy>>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!(
        "SELECT {} FROM discrepancies WHERE provider_npi = ? ORDER BY id",
        DISCREPANCY_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(npi).fetch_all(executor).await?;
    rows.iter().map(Discrepancy::from_row).collect()
}
