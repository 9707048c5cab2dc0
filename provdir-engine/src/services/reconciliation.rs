//! Registry reconciliation auditor
//!
//! Diffs local providers against the NPI registry, records every difference as a
//! discrepancy, and writes registry corrections back through the merge engine.
//!
//! **Algorithm (per provider):**
//! 1. Fetch the registry record under the retry policy (no transaction open)
//! 2. Open one short transaction
//! 3. Classify differences against the local record and its practice states
//! 4. Merge corrections with tier `registry`; discrepancies whose correction applied are resolved
//! 5. Append discrepancy records, advance the watermark, commit
//!
//! Transient registry failures skip the provider (counted as an error, watermark untouched).
//! An authorization failure aborts the run in state FAILED.

use provdir_common::db::{Discrepancy, DiscrepancyCategory, Provider, Severity};
use provdir_common::{Error, Result, SourceTier};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::merge_engine::{merge_provider, FieldUpdate, MergeField, ProviderField};
use super::registry_client::{RegistryLookup, RegistryRecord};
use crate::config::ReconcileSettings;
use crate::db::discrepancies::{get_discrepancy, insert_discrepancy, mark_resolved, NewDiscrepancy};
use crate::db::providers::{self, ProviderCursor, ScanFilter};
use crate::db::runs;
use crate::models::{BatchKind, BatchOptions, BatchReport};
use crate::utils::{Classify, FailureClass, RecordTransaction, RetryPolicy};

/// One classified difference and the registry correction that would resolve it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub discrepancy: NewDiscrepancy,
    pub correction: Option<FieldUpdate<ProviderField>>,
}

/// Case- and whitespace-insensitive text equality; empty equals absent
fn same_text(local: Option<&str>, registry: Option<&str>) -> bool {
    fn norm(value: Option<&str>) -> String {
        value
            .unwrap_or_default()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }
    norm(local) == norm(registry)
}

/// Classify the differences between a local provider and its registry record
///
/// # Arguments
/// * `provider` - Local record
/// * `record` - Registry record, `None` when the NPI is absent from the registry
/// * `local_states` - Distinct states of the provider's known practice locations
pub fn classify_discrepancies(
    provider: &Provider,
    record: Option<&RegistryRecord>,
    local_states: &[String],
) -> Vec<Finding> {
    let Some(record) = record else {
        return vec![Finding {
            discrepancy: NewDiscrepancy {
                category: DiscrepancyCategory::NotInRegistry,
                field: None,
                observed_value: Some(provider.npi.clone()),
                expected_value: None,
            },
            correction: None,
        }];
    };

    let mut findings = Vec::new();

    if record.deactivated && !provider.is_deactivated() {
        let date = record
            .deactivation_date
            .clone()
            .unwrap_or_else(|| provdir_common::time::now().format("%Y-%m-%d").to_string());
        findings.push(mismatch(
            DiscrepancyCategory::Deactivated,
            ProviderField::DeactivationDate,
            provider.deactivation_date.as_deref(),
            &date,
        ));
    }

    let compared = [
        (DiscrepancyCategory::NameMismatch, ProviderField::FirstName, &provider.first_name, &record.first_name),
        (DiscrepancyCategory::NameMismatch, ProviderField::MiddleName, &provider.middle_name, &record.middle_name),
        (DiscrepancyCategory::NameMismatch, ProviderField::LastName, &provider.last_name, &record.last_name),
        (
            DiscrepancyCategory::NameMismatch,
            ProviderField::OrganizationName,
            &provider.organization_name,
            &record.organization_name,
        ),
        (DiscrepancyCategory::TaxonomyMismatch, ProviderField::TaxonomyCode, &provider.taxonomy_code, &record.taxonomy_code),
        (DiscrepancyCategory::CredentialMismatch, ProviderField::Credential, &provider.credential, &record.credential),
    ];

    for (category, field, local, expected) in compared {
        // Registry silence on a field is not a difference
        let Some(expected) = expected.as_deref().filter(|v| !v.trim().is_empty()) else {
            continue;
        };
        if !same_text(local.as_deref(), Some(expected)) {
            findings.push(mismatch(category, field, local.as_deref(), expected));
        }
    }

    if !record.practice_states.is_empty() && !local_states.is_empty() {
        let known = record
            .practice_states
            .iter()
            .any(|state| local_states.iter().any(|local| local.eq_ignore_ascii_case(state)));
        if !known {
            findings.push(Finding {
                discrepancy: NewDiscrepancy {
                    category: DiscrepancyCategory::StateMismatch,
                    field: Some("state".to_string()),
                    observed_value: Some(local_states.join(",")),
                    expected_value: Some(record.practice_states.join(",")),
                },
                correction: None,
            });
        }
    }

    findings
}

fn mismatch(
    category: DiscrepancyCategory,
    field: ProviderField,
    local: Option<&str>,
    expected: &str,
) -> Finding {
    Finding {
        discrepancy: NewDiscrepancy {
            category,
            field: Some(field.column().to_string()),
            observed_value: local.map(str::to_string),
            expected_value: Some(expected.to_string()),
        },
        correction: Some(FieldUpdate::new(field, expected)),
    }
}

/// Why one provider could not be reconciled
#[derive(Debug)]
enum ProviderFailure {
    /// Abort the run
    Fatal(String),
    /// Skip the provider and count an error
    Skipped(String),
    /// Store error inside the record transaction
    Store(provdir_common::Error),
}

impl From<provdir_common::Error> for ProviderFailure {
    fn from(err: provdir_common::Error) -> Self {
        ProviderFailure::Store(err)
    }
}

/// Per-provider result
#[derive(Debug, Default)]
struct ProviderResult {
    critical: u64,
    warning: u64,
    info: u64,
    corrected: u64,
    conflicts: u64,
}

impl ProviderResult {
    fn is_unchanged(&self) -> bool {
        self.critical + self.warning + self.info + self.corrected == 0
    }
}

/// Registry reconciliation auditor
pub struct RegistryAuditor {
    db: SqlitePool,
    registry: Arc<dyn RegistryLookup>,
    retry: RetryPolicy,
    settings: ReconcileSettings,
}

impl RegistryAuditor {
    pub fn new(
        db: SqlitePool,
        registry: Arc<dyn RegistryLookup>,
        retry: RetryPolicy,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            db,
            registry,
            retry,
            settings,
        }
    }

    /// Run one reconciliation pass
    ///
    /// Dry-run counts the providers that are due without calling the registry.
    ///
    /// # Returns
    /// The run report; `Err` only when the store itself fails
    pub async fn run(&self, options: &BatchOptions) -> Result<BatchReport> {
        let mut report = BatchReport::new(BatchKind::RegistryReconciliation, options.dry_run);
        report.begin()?;
        if !options.dry_run {
            runs::save_run(&self.db, &report).await?;
        }

        let started = provdir_common::time::now();
        let filter = if options.resume {
            ScanFilter::NeverReconciled
        } else {
            ScanFilter::StaleBefore(started - self.settings.staleness)
        };
        let run_id = report.run_id.to_string();

        info!(
            run_id = %run_id,
            dry_run = options.dry_run,
            resume = options.resume,
            limit = ?options.limit,
            "Starting registry reconciliation"
        );

        let mut cursor = ProviderCursor::new(filter, self.settings.page_size);

        loop {
            // Stop before the cursor hands out a provider that would go unprocessed
            if options.should_stop(report.processed) {
                report.cancelled = options.cancel.is_cancelled();
                break;
            }
            let Some(provider) = cursor.next(&self.db).await? else {
                break;
            };
            report.processed += 1;

            if options.dry_run {
                continue;
            }

            match self.reconcile_provider(&provider, &run_id).await {
                Ok(result) => {
                    if result.is_unchanged() {
                        report.unchanged += 1;
                    }
                    report.add_changes("discrepancy_critical", result.critical);
                    report.add_changes("discrepancy_warning", result.warning);
                    report.add_changes("discrepancy_info", result.info);
                    report.add_changes("fields_corrected", result.corrected);
                    report.add_changes("conflicts", result.conflicts);
                }
                Err(ProviderFailure::Fatal(cause)) => {
                    error!(run_id = %run_id, npi = %provider.npi, cause = %cause, "Registry denied access, aborting run");
                    report.fail(cause)?;
                    runs::save_run(&self.db, &report).await?;
                    return Ok(report);
                }
                Err(ProviderFailure::Skipped(reason)) => {
                    warn!(npi = %provider.npi, reason = %reason, "Registry lookup failed, provider skipped");
                    report.errors += 1;
                }
                Err(ProviderFailure::Store(err)) => {
                    if err.is_connectivity_loss() {
                        return Err(err);
                    }
                    warn!(npi = %provider.npi, error = %err, "Provider reconciliation rolled back");
                    report.record_failure(&err);
                }
            }
        }

        report.complete()?;
        if !options.dry_run {
            runs::save_run(&self.db, &report).await?;
        }
        info!(
            run_id = %run_id,
            processed = report.processed,
            unchanged = report.unchanged,
            errors = report.errors,
            last_npi = ?cursor.last_key(),
            "Registry reconciliation finished"
        );

        Ok(report)
    }

    async fn reconcile_provider(
        &self,
        provider: &Provider,
        run_id: &str,
    ) -> std::result::Result<ProviderResult, ProviderFailure> {
        let npi = provider.npi.as_str();

        let record = self
            .retry
            .run(&format!("registry lookup {}", npi), || self.registry.fetch(npi))
            .await
            .map_err(|err| match err.classify() {
                FailureClass::Fatal => ProviderFailure::Fatal(err.to_string()),
                _ => ProviderFailure::Skipped(err.to_string()),
            })?;

        let now = provdir_common::time::now();
        let mut tx = RecordTransaction::begin(&self.db, "reconcile_provider").await?;

        let local_states = providers::location_states(tx.conn()?, npi).await?;
        let findings = classify_discrepancies(provider, record.as_ref(), &local_states);

        let mut corrections: Vec<FieldUpdate<ProviderField>> =
            findings.iter().filter_map(|f| f.correction.clone()).collect();
        if provider.entity_kind.is_none() {
            if let Some(kind) = record.as_ref().and_then(|r| r.entity_kind.clone()) {
                corrections.push(FieldUpdate::new(ProviderField::EntityKind, kind));
            }
        }

        let outcome = merge_provider(tx.conn()?, npi, &corrections, SourceTier::Registry, now).await?;

        let mut result = ProviderResult {
            corrected: outcome.applied.len() as u64,
            conflicts: outcome.conflicts.len() as u64,
            ..ProviderResult::default()
        };

        for finding in &findings {
            let resolved = finding
                .correction
                .as_ref()
                .map(|c| outcome.was_applied(c.field.column()))
                .unwrap_or(false);
            insert_discrepancy(tx.conn()?, run_id, npi, &finding.discrepancy, resolved, now).await?;

            match finding.discrepancy.category.severity() {
                Severity::Critical => result.critical += 1,
                Severity::Warning => result.warning += 1,
                Severity::Info => result.info += 1,
            }
            debug!(
                npi = %npi,
                category = %finding.discrepancy.category,
                field = ?finding.discrepancy.field,
                resolved,
                "Discrepancy recorded"
            );
        }

        providers::advance_watermark(tx.conn()?, npi, now).await?;
        tx.commit().await?;

        Ok(result)
    }
}

/// Operator action: mark one discrepancy resolved
///
/// Resolving an already resolved discrepancy is a no-op.
///
/// # Returns
/// The discrepancy after the update; `NotFound` for an unknown id
pub async fn resolve_discrepancy(db: &SqlitePool, id: i64) -> Result<Discrepancy> {
    let newly = mark_resolved(db, id, provdir_common::time::now()).await?;
    let discrepancy = get_discrepancy(db, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Discrepancy {}", id)))?;
    if newly {
        info!(id, npi = %discrepancy.provider_npi, category = %discrepancy.category, "Discrepancy resolved by operator");
    }
    Ok(discrepancy)
}
