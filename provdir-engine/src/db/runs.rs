//! Batch run log

use provdir_common::time::to_db;
use provdir_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::BatchReport;

/// Save a batch run with its current state and report
///
/// Called at start and again when the run ends; the second call overwrites the first.
pub async fn save_run(pool: &SqlitePool, report: &BatchReport) -> Result<()> {
    // Prepare all data before acquiring a connection
    let run_id = report.run_id.to_string();
    let report_json = serde_json::to_string(report)
        .map_err(|e| Error::Internal(format!("Failed to serialize report: {}", e)))?;
    let started_at = to_db(report.started_at.unwrap_or_else(provdir_common::time::now));
    let ended_at = report.finished_at.map(to_db);

    sqlx::query(
        r#"
        INSERT INTO batch_runs (run_id, kind, state, dry_run, started_at, ended_at, report)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(run_id) DO UPDATE SET
            state = excluded.state,
            ended_at = excluded.ended_at,
            report = excluded.report
        "#,
    )
    .bind(&run_id)
    .bind(report.kind.as_str())
    .bind(report.state.as_str())
    .bind(report.dry_run as i64)
    .bind(&started_at)
    .bind(&ended_at)
    .bind(&report_json)
    .execute(pool)
    .await?;

    Ok(())
}

/// Load a batch run report
pub async fn load_run(pool: &SqlitePool, run_id: Uuid) -> Result<Option<BatchReport>> {
    let row = sqlx::query("SELECT report FROM batch_runs WHERE run_id = ?")
        .bind(run_id.to_string())
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => {
            let report_json: Option<String> = row.try_get("report")?;
            report_json
                .map(|json| {
                    serde_json::from_str(&json)
                        .map_err(|e| Error::Internal(format!("Failed to deserialize report: {}", e)))
                })
                .transpose()
        }
        None => Ok(None),
    }
}
