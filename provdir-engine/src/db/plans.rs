//! Canonical insurance plans

use chrono::{DateTime, Utc};
use provdir_common::db::InsurancePlan;
use provdir_common::time::to_db;
use provdir_common::Result;
use sqlx::sqlite::SqliteExecutor;

/// Insert or refresh a canonical plan
pub async fn upsert_plan<'e, E>(executor: E, plan: &InsurancePlan, now: DateTime<Utc>) -> Result<()>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO insurance_plans (plan_id, plan_name, carrier_name, issuer_name, plan_type, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(plan_id) DO UPDATE SET
            plan_name = COALESCE(excluded.plan_name, plan_name),
            carrier_name = COALESCE(excluded.carrier_name, carrier_name),
            issuer_name = COALESCE(excluded.issuer_name, issuer_name),
            plan_type = COALESCE(excluded.plan_type, plan_type)
        "#,
    )
    .bind(&plan.plan_id)
    .bind(&plan.plan_name)
    .bind(&plan.carrier_name)
    .bind(&plan.issuer_name)
    .bind(&plan.plan_type)
    .bind(to_db(now))
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn get_plan<'e, E>(executor: E, plan_id: &str) -> Result<Option<InsurancePlan>>
where
    E: SqliteExecutor<'e>,
{
    let row = sqlx::query(
        "SELECT plan_id, plan_name, carrier_name, issuer_name, plan_type FROM insurance_plans WHERE plan_id = ?",
    )
    .bind(plan_id)
    .fetch_optional(executor)
    .await?;
    row.as_ref().map(InsurancePlan::from_row).transpose()
}

/// Every canonical plan, ordered by id
pub async fn list_plans<'e, E>(executor: E) -> Result<Vec<InsurancePlan>>
where
    E: SqliteExecutor<'e>,
{
    let rows = sqlx::query(
        "SELECT plan_id, plan_name, carrier_name, issuer_name, plan_type FROM insurance_plans ORDER BY plan_id",
    )
    .fetch_all(executor)
    .await?;
    rows.iter().map(InsurancePlan::from_row).collect()
}
