//! Geocoding batch processor
//!
//! Resolves every unique ungeocoded address once and fans the result out to all location
//! rows sharing the address identity hash.
//!
//! **Algorithm:**
//! 1. Page through ungeocoded address hashes (keyset by hash, `no_result` rows excluded)
//! 2. For each unique address: acquire a limiter token, geocode under the retry policy
//! 3. `Found`: write coordinates to every row with the hash in one statement
//! 4. `NoResult`: mark rows terminal so later runs skip them
//! 5. Unreadable response: mark rows terminal too, counted as `unreadable`
//! 6. Transient failure after retries: count, leave for the next run
//! 7. Request denied: abort; results already written stay committed
//!
//! Dry-run counts unique addresses and estimates the external-call cost without calling out.

use provdir_common::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::geocoder_client::{GeocodeOutcome, Geocoder};
use crate::config::GeocodeSettings;
use crate::db::{locations, runs};
use crate::models::{BatchKind, BatchOptions, BatchReport};
use crate::utils::{Classify, FailureClass, RetryPolicy};

pub struct GeocodingProcessor {
    db: SqlitePool,
    geocoder: Arc<dyn Geocoder>,
    retry: RetryPolicy,
    settings: GeocodeSettings,
}

impl GeocodingProcessor {
    pub fn new(
        db: SqlitePool,
        geocoder: Arc<dyn Geocoder>,
        retry: RetryPolicy,
        settings: GeocodeSettings,
    ) -> Self {
        Self {
            db,
            geocoder,
            retry,
            settings,
        }
    }

    /// Run one geocoding pass
    pub async fn run(&self, options: &BatchOptions) -> Result<BatchReport> {
        let mut report = BatchReport::new(BatchKind::Geocoding, options.dry_run);
        report.begin()?;

        if options.dry_run {
            let unique = locations::count_ungeocoded_hashes(&self.db).await?;
            let planned = options.limit.map(|l| l.min(unique)).unwrap_or(unique);
            report.processed = planned;
            report.estimated_cost_usd = Some(planned as f64 * self.settings.cost_per_request_usd);
            report.complete()?;
            info!(
                unique_addresses = unique,
                planned,
                estimated_cost_usd = report.estimated_cost_usd,
                "Geocoding dry run"
            );
            return Ok(report);
        }

        runs::save_run(&self.db, &report).await?;
        info!(run_id = %report.run_id, limit = ?options.limit, "Starting geocoding run");

        let mut after: Option<String> = None;

        'scan: loop {
            let groups =
                locations::ungeocoded_groups(&self.db, after.as_deref(), self.settings.page_size).await?;
            if groups.is_empty() {
                break;
            }

            for group in groups {
                if options.should_stop(report.processed) {
                    report.cancelled = options.cancel.is_cancelled();
                    break 'scan;
                }
                after = Some(group.address_hash.clone());
                report.processed += 1;

                let query = group.address.query_string();
                let outcome = self
                    .retry
                    .run(&format!("geocode {}", group.address_hash), || {
                        self.geocoder.geocode(&query)
                    })
                    .await;

                let now = provdir_common::time::now();
                let written = match outcome {
                    Ok(GeocodeOutcome::Found {
                        latitude,
                        longitude,
                    }) => locations::apply_coordinates(
                        &self.db,
                        &group.address_hash,
                        latitude,
                        longitude,
                        now,
                    )
                    .await
                    .map(|rows| ("geocoded", rows)),
                    Ok(GeocodeOutcome::NoResult) => {
                        locations::mark_no_result(&self.db, &group.address_hash, now)
                            .await
                            .map(|rows| ("no_result", rows))
                    }
                    Err(err) if err.classify() == FailureClass::Fatal => {
                        error!(
                            run_id = %report.run_id,
                            address_hash = %group.address_hash,
                            error = %err,
                            "Geocoder denied access, aborting run"
                        );
                        report.fail(err.to_string())?;
                        runs::save_run(&self.db, &report).await?;
                        return Ok(report);
                    }
                    Err(err) if err.classify() == FailureClass::Terminal => {
                        warn!(
                            address_hash = %group.address_hash,
                            error = %err,
                            "Unreadable geocoder response, address marked terminal"
                        );
                        locations::mark_no_result(&self.db, &group.address_hash, now)
                            .await
                            .map(|rows| ("unreadable", rows))
                    }
                    Err(err) => {
                        warn!(
                            address_hash = %group.address_hash,
                            error = %err,
                            "Geocoding failed, address left for next run"
                        );
                        report.errors += 1;
                        continue;
                    }
                };

                match written {
                    Ok((category, rows)) => {
                        debug!(
                            address_hash = %group.address_hash,
                            category,
                            rows,
                            expected_rows = group.row_count,
                            "Geocoding result fanned out"
                        );
                        report.record_change(category);
                        report.add_changes("rows_updated", rows);
                    }
                    Err(err) if err.is_connectivity_loss() => return Err(err),
                    Err(err) => {
                        warn!(address_hash = %group.address_hash, error = %err, "Fan-out update failed");
                        report.record_failure(&err);
                    }
                }
            }
        }

        report.complete()?;
        runs::save_run(&self.db, &report).await?;
        info!(
            run_id = %report.run_id,
            processed = report.processed,
            errors = report.errors,
            geocoded = report.changed_count("geocoded"),
            no_result = report.changed_count("no_result"),
            unreadable = report.changed_count("unreadable"),
            "Geocoding run finished"
        );

        Ok(report)
    }
}
