//! Provider persistence and the reconciliation cursor

use chrono::{DateTime, Utc};
use provdir_common::db::{FieldTiers, Provider};
use provdir_common::time::to_db;
use provdir_common::Result;
use sqlx::sqlite::SqliteExecutor;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::VecDeque;

const PROVIDER_COLUMNS: &str = "npi, entity_kind, first_name, middle_name, last_name, \
    organization_name, credential, taxonomy_code, deactivation_date, field_tiers, \
    registry_synced_at, created_at, updated_at";

/// Load provider by NPI
pub async fn get_provider<'e, E>(executor: E, npi: &str) -> Result<Option<Provider>>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!("SELECT {} FROM providers WHERE npi = ?", PROVIDER_COLUMNS);
    let row = sqlx::query(&sql).bind(npi).fetch_optional(executor).await?;
    row.as_ref().map(Provider::from_row).transpose()
}

/// Insert a provider with no attributes yet (first sighting)
///
/// # Returns
/// `true` if the row was created, `false` if it already existed
pub async fn insert_provider_shell<'e, E>(executor: E, npi: &str, now: DateTime<Utc>) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let ts = to_db(now);
    let result = sqlx::query(
        r#"
        INSERT INTO providers (npi, field_tiers, created_at, updated_at)
        VALUES (?, '{}', ?, ?)
        ON CONFLICT(npi) DO NOTHING
        "#,
    )
    .bind(npi)
    .bind(&ts)
    .bind(&ts)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Write merged column values and the updated tier map
///
/// Column names come from the closed `ProviderField` set, never from input.
pub async fn update_provider_columns(
    conn: &mut SqliteConnection,
    npi: &str,
    columns: &[(&'static str, Option<String>)],
    tiers: &FieldTiers,
    now: DateTime<Utc>,
) -> Result<()> {
    let assignments: String = columns
        .iter()
        .map(|(column, _)| format!("{} = ?, ", column))
        .collect();
    let sql = format!(
        "UPDATE providers SET {}field_tiers = ?, updated_at = ? WHERE npi = ?",
        assignments
    );

    let mut query = sqlx::query(&sql);
    for (_, value) in columns {
        query = query.bind(value.clone());
    }
    query
        .bind(tiers.to_json()?)
        .bind(to_db(now))
        .bind(npi)
        .execute(conn)
        .await?;

    Ok(())
}

/// Advance the reconciliation watermark; never moves it backwards
pub async fn advance_watermark<'e, E>(executor: E, npi: &str, at: DateTime<Utc>) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let ts = to_db(at);
    let result = sqlx::query(
        r#"
        UPDATE providers
        SET registry_synced_at = ?
        WHERE npi = ? AND (registry_synced_at IS NULL OR registry_synced_at < ?)
        "#,
    )
    .bind(&ts)
    .bind(npi)
    .bind(&ts)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Distinct, non-empty practice states known locally for a provider
pub async fn location_states<'e, E>(executor: E, npi: &str) -> Result<Vec<String>>
where
    E: SqliteExecutor<'e>,
{
    let states: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT UPPER(TRIM(state))
        FROM practice_locations
        WHERE provider_npi = ? AND state IS NOT NULL AND TRIM(state) <> ''
        ORDER BY 1
        "#,
    )
    .bind(npi)
    .fetch_all(executor)
    .await?;

    Ok(states)
}

/// Count deactivated providers and their dependent records, first `limit` providers only
pub async fn count_deactivated(pool: &SqlitePool, limit: Option<u64>) -> Result<DeactivatedCounts> {
    // Selection and order match `deactivated_npis`
    let (providers, locations, acceptances, verifications): (i64, i64, i64, i64) = sqlx::query_as(
        r#"
        WITH doomed AS (
            SELECT npi FROM providers
            WHERE deactivation_date IS NOT NULL AND TRIM(deactivation_date) <> ''
            ORDER BY npi
            LIMIT ?
        )
        SELECT
            (SELECT COUNT(*) FROM doomed),
            (SELECT COUNT(*) FROM practice_locations WHERE provider_npi IN (SELECT npi FROM doomed)),
            (SELECT COUNT(*) FROM provider_plan_acceptance WHERE provider_npi IN (SELECT npi FROM doomed)),
            (SELECT COUNT(*) FROM verification_events WHERE provider_npi IN (SELECT npi FROM doomed))
        "#,
    )
    .bind(limit.map(|l| l as i64).unwrap_or(-1))
    .fetch_one(pool)
    .await?;

    Ok(DeactivatedCounts {
        providers: providers as u64,
        locations: locations as u64,
        acceptances: acceptances as u64,
        verifications: verifications as u64,
    })
}

/// Dependent record counts for the deactivation-cleanup sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeactivatedCounts {
    pub providers: u64,
    pub locations: u64,
    pub acceptances: u64,
    pub verifications: u64,
}

/// NPIs of deactivated providers, in key order
pub async fn deactivated_npis(pool: &SqlitePool, limit: Option<u64>) -> Result<Vec<String>> {
    let npis: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT npi FROM providers
        WHERE deactivation_date IS NOT NULL AND TRIM(deactivation_date) <> ''
        ORDER BY npi
        LIMIT ?
        "#,
    )
    .bind(limit.map(|l| l as i64).unwrap_or(-1))
    .fetch_all(pool)
    .await?;

    Ok(npis)
}

/// Hard-delete one provider and everything that depends on it
///
/// Locations and network observations cascade through foreign keys. Verification events
/// and acceptances are removed explicitly so the deleted counts are exact.
pub async fn delete_provider_cascade(conn: &mut SqliteConnection, npi: &str) -> Result<bool> {
    sqlx::query("DELETE FROM verification_events WHERE provider_npi = ?")
        .bind(npi)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM provider_plan_acceptance WHERE provider_npi = ?")
        .bind(npi)
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query("DELETE FROM providers WHERE npi = ?")
        .bind(npi)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// Which providers a reconciliation scan visits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFilter {
    /// Never reconciled, or reconciled before the cutoff
    StaleBefore(DateTime<Utc>),
    /// Never reconciled at all (resume mode)
    NeverReconciled,
}

/// Keyset cursor over providers ordered by NPI
///
/// Pages are fetched `batch_size` rows at a time but handed out one provider at a time.
/// [`ProviderCursor::last_key`] is the last NPI handed out, so a scan stopped between two
/// calls to [`ProviderCursor::next`] reports exactly how far it got.
#[derive(Debug, Clone)]
pub struct ProviderCursor {
    filter: ScanFilter,
    batch_size: u32,
    page: VecDeque<Provider>,
    /// Key of the last row fetched, where the next page starts
    page_key: Option<String>,
    last_npi: Option<String>,
    exhausted: bool,
}

impl ProviderCursor {
    pub fn new(filter: ScanFilter, batch_size: u32) -> Self {
        Self {
            filter,
            batch_size: batch_size.max(1),
            page: VecDeque::new(),
            page_key: None,
            last_npi: None,
            exhausted: false,
        }
    }

    pub fn last_key(&self) -> Option<&str> {
        self.last_npi.as_deref()
    }

    /// Hand out the next provider, or `None` once the scan is exhausted
    pub async fn next(&mut self, pool: &SqlitePool) -> Result<Option<Provider>> {
        if self.page.is_empty() && !self.exhausted {
            self.fetch_page(pool).await?;
        }

        let provider = self.page.pop_front();
        if let Some(provider) = &provider {
            self.last_npi = Some(provider.npi.clone());
        }
        Ok(provider)
    }

    async fn fetch_page(&mut self, pool: &SqlitePool) -> Result<()> {
        let filter_clause = match self.filter {
            ScanFilter::StaleBefore(_) => {
                "AND (registry_synced_at IS NULL OR registry_synced_at < ?)"
            }
            ScanFilter::NeverReconciled => "AND registry_synced_at IS NULL",
        };
        let sql = format!(
            "SELECT {} FROM providers WHERE npi > ? {} ORDER BY npi LIMIT ?",
            PROVIDER_COLUMNS, filter_clause
        );

        let mut query = sqlx::query(&sql).bind(self.page_key.clone().unwrap_or_default());
        if let ScanFilter::StaleBefore(cutoff) = self.filter {
            query = query.bind(to_db(cutoff));
        }
        let rows = query.bind(self.batch_size as i64).fetch_all(pool).await?;

        if rows.len() < self.batch_size as usize {
            self.exhausted = true;
        }
        for row in &rows {
            self.page.push_back(Provider::from_row(row)?);
        }
        if let Some(last) = self.page.back() {
            self.page_key = Some(last.npi.clone());
        }

        Ok(())
    }
}
