//! Deactivation cleanup sweep
//!
//! Hard-deletes providers the registry reports as deactivated, together with their
//! locations, acceptances, verification events and network observations. Each provider
//! is removed in its own transaction.

use provdir_common::Result;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::db::{providers, runs};
use crate::models::{BatchKind, BatchOptions, BatchReport};
use crate::utils::RecordTransaction;

pub struct DeactivationCleanup {
    db: SqlitePool,
}

impl DeactivationCleanup {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Run the sweep
    ///
    /// Dry-run reports how many providers and dependent rows would be deleted, honoring the
    /// same limit as an apply run.
    pub async fn run(&self, options: &BatchOptions) -> Result<BatchReport> {
        let mut report = BatchReport::new(BatchKind::DeactivationCleanup, options.dry_run);
        report.begin()?;

        if options.dry_run {
            let counts = providers::count_deactivated(&self.db, options.limit).await?;
            report.processed = counts.providers;
            report.add_changes("providers", counts.providers);
            report.add_changes("locations", counts.locations);
            report.add_changes("acceptances", counts.acceptances);
            report.add_changes("verifications", counts.verifications);
            report.complete()?;
            info!(
                providers = counts.providers,
                locations = counts.locations,
                acceptances = counts.acceptances,
                verifications = counts.verifications,
                limit = ?options.limit,
                "Deactivation cleanup dry run"
            );
            return Ok(report);
        }

        runs::save_run(&self.db, &report).await?;
        let npis = providers::deactivated_npis(&self.db, options.limit).await?;
        info!(run_id = %report.run_id, candidates = npis.len(), "Starting deactivation cleanup");

        for npi in npis {
            if options.should_stop(report.processed) {
                report.cancelled = options.cancel.is_cancelled();
                break;
            }
            report.processed += 1;

            match self.delete_one(&npi).await {
                Ok(true) => {
                    debug!(npi = %npi, "Deactivated provider deleted");
                    report.record_change("providers");
                }
                Ok(false) => report.unchanged += 1,
                Err(err) if err.is_connectivity_loss() => return Err(err),
                Err(err) => {
                    warn!(npi = %npi, error = %err, "Deleting deactivated provider failed");
                    report.record_failure(&err);
                }
            }
        }

        report.complete()?;
        runs::save_run(&self.db, &report).await?;
        info!(
            run_id = %report.run_id,
            deleted = report.changed_count("providers"),
            errors = report.errors,
            "Deactivation cleanup finished"
        );

        Ok(report)
    }

    async fn delete_one(&self, npi: &str) -> Result<bool> {
        let mut tx = RecordTransaction::begin(&self.db, "deactivation_cleanup").await?;
        let deleted = providers::delete_provider_cascade(tx.conn()?, npi).await?;
        tx.commit().await?;
        Ok(deleted)
    }
}
