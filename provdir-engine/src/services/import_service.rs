//! JSON-lines ingestion
//!
//! Bulk and enrichment collaborators hand over already-normalized tuples, one JSON object
//! per line. Every record goes through the merge engine in its own transaction; crowd
//! verifications go through the verification service.
//!
//! Record shapes (discriminated by `kind`):
//!
//! ```text
//! {"kind":"provider","npi":"1234567893","tier":"bulk_scrape",
//!  "fields":[{"field":"last_name","value":"Smith"}]}
//! {"kind":"location","npi":"1234567893","tier":"enrichment_import",
//!  "address":{"line1":"1 Main St","city":"Springfield","state":"IL","zip":"62701"},
//!  "fields":[{"field":"phone","value":"217-555-0100"}]}
//! {"kind":"plan","plan_id":"P1","plan_name":"Choice POS II","carrier_name":"Aetna"}
//! {"kind":"acceptance","npi":"1234567893","plan_id":"P1","confidence_score":70,
//!  "tier":"enrichment_import"}
//! {"kind":"observation","npi":"1234567893","network_name":"Aetna Choice POS"}
//! ```

use provdir_common::address::AddressParts;
use provdir_common::db::InsurancePlan;
use provdir_common::time::add_months;
use provdir_common::{Error, Result, SourceTier};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use super::merge_engine::{validate_npi, FieldUpdate, LocationField, MergeEngine, MergeOutcome, ProviderField};
use super::verification_service::{VerificationInput, VerificationService};
use crate::config::ConfidenceSettings;
use crate::db::{locations, observations, plans, providers, runs};
use crate::models::{BatchKind, BatchOptions, BatchReport};

/// One normalized ingestion tuple
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImportRecord {
    Provider {
        npi: String,
        tier: SourceTier,
        #[serde(default)]
        fields: Vec<FieldUpdate<ProviderField>>,
    },
    Location {
        npi: String,
        tier: SourceTier,
        address: AddressParts,
        #[serde(default)]
        fields: Vec<FieldUpdate<LocationField>>,
    },
    Plan(InsurancePlan),
    Acceptance {
        npi: String,
        plan_id: String,
        /// Scopes the acceptance to a known location; provider-wide when absent
        #[serde(default)]
        address: Option<AddressParts>,
        confidence_score: i64,
        tier: SourceTier,
    },
    Observation {
        npi: String,
        network_name: String,
    },
}

impl ImportRecord {
    fn kind(&self) -> &'static str {
        match self {
            ImportRecord::Provider { .. } => "provider",
            ImportRecord::Location { .. } => "location",
            ImportRecord::Plan(_) => "plan",
            ImportRecord::Acceptance { .. } => "acceptance",
            ImportRecord::Observation { .. } => "observation",
        }
    }
}

/// What one record did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordOutcome {
    pub created: bool,
    pub fields_applied: u64,
    pub conflicts: u64,
}

impl RecordOutcome {
    fn changed(&self) -> bool {
        self.created || self.fields_applied > 0
    }
}

impl From<MergeOutcome> for RecordOutcome {
    fn from(outcome: MergeOutcome) -> Self {
        Self {
            created: outcome.created,
            fields_applied: outcome.applied.len() as u64,
            conflicts: outcome.conflicts.len() as u64,
        }
    }
}

pub struct ImportService {
    db: SqlitePool,
    merge: MergeEngine,
    verifications: VerificationService,
    settings: ConfidenceSettings,
}

impl ImportService {
    pub fn new(db: SqlitePool, settings: ConfidenceSettings) -> Self {
        Self {
            merge: MergeEngine::new(db.clone()),
            verifications: VerificationService::new(db.clone(), settings),
            db,
            settings,
        }
    }

    /// Apply one ingestion record
    pub async fn apply_record(&self, record: &ImportRecord) -> Result<RecordOutcome> {
        let now = provdir_common::time::now();

        match record {
            ImportRecord::Provider { npi, tier, fields } => {
                Ok(self.merge.apply_provider(npi, fields, *tier).await?.into())
            }
            ImportRecord::Location {
                npi,
                tier,
                address,
                fields,
            } => {
                let (_, outcome) = self.merge.apply_location(npi, address, fields, *tier).await?;
                Ok(outcome.into())
            }
            ImportRecord::Plan(plan) => {
                if plan.plan_id.trim().is_empty() {
                    return Err(Error::InvalidInput("plan_id must not be empty".to_string()));
                }
                let existed = plans::get_plan(&self.db, &plan.plan_id).await?.is_some();
                plans::upsert_plan(&self.db, plan, now).await?;
                Ok(RecordOutcome {
                    created: !existed,
                    ..RecordOutcome::default()
                })
            }
            ImportRecord::Acceptance {
                npi,
                plan_id,
                address,
                confidence_score,
                tier,
            } => {
                let location_id = match address {
                    Some(address) => {
                        let hash = address.identity_hash();
                        let location = locations::find_location(&self.db, npi, &hash)
                            .await?
                            .ok_or_else(|| {
                                Error::InvalidInput(format!("No location {} for provider {}", hash, npi))
                            })?;
                        Some(location.id)
                    }
                    None => None,
                };
                let expires_at = add_months(now, self.settings.acceptance_ttl_months)?;
                Ok(self
                    .merge
                    .apply_acceptance_confidence(npi, plan_id, location_id, *confidence_score, *tier, expires_at)
                    .await?
                    .into())
            }
            ImportRecord::Observation { npi, network_name } => {
                validate_npi(npi)?;
                if network_name.trim().is_empty() {
                    return Err(Error::InvalidInput("network_name must not be empty".to_string()));
                }
                providers::insert_provider_shell(&self.db, npi, now).await?;
                let created = observations::record_observation(&self.db, npi, network_name, now).await?;
                Ok(RecordOutcome {
                    created,
                    ..RecordOutcome::default()
                })
            }
        }
    }

    /// Import a JSON-lines file of [`ImportRecord`]s
    pub async fn import_file(&self, path: &Path, options: &BatchOptions) -> Result<BatchReport> {
        let file = tokio::fs::File::open(path).await?;
        self.import_records(BufReader::new(file), options).await
    }

    /// Import [`ImportRecord`]s from a JSON-lines stream
    ///
    /// Malformed lines and rejected records are counted as errors; the stream continues.
    /// Dry-run parses and validates without writing.
    pub async fn import_records<R>(&self, reader: R, options: &BatchOptions) -> Result<BatchReport>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut report = BatchReport::new(BatchKind::Import, options.dry_run);
        report.begin()?;
        if !options.dry_run {
            runs::save_run(&self.db, &report).await?;
        }
        info!(run_id = %report.run_id, dry_run = options.dry_run, "Starting import");

        let mut lines = reader.lines();
        let mut line_no = 0u64;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            if options.should_stop(report.processed) {
                report.cancelled = options.cancel.is_cancelled();
                break;
            }
            report.processed += 1;

            let record: ImportRecord = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(err) => {
                    warn!(line = line_no, error = %err, "Malformed import record");
                    report.errors += 1;
                    continue;
                }
            };

            if options.dry_run {
                report.record_change(record.kind());
                continue;
            }

            match self.apply_record(&record).await {
                Ok(outcome) => {
                    debug!(line = line_no, kind = record.kind(), ?outcome, "Import record applied");
                    if outcome.created {
                        report.record_change("created");
                    }
                    report.add_changes("fields_applied", outcome.fields_applied);
                    report.add_changes("conflicts", outcome.conflicts);
                    if !outcome.changed() {
                        report.unchanged += 1;
                    }
                }
                Err(err) if err.is_connectivity_loss() => return Err(err),
                Err(err) => {
                    warn!(line = line_no, kind = record.kind(), error = %err, "Import record rejected");
                    report.record_failure(&err);
                }
            }
        }

        report.complete()?;
        if !options.dry_run {
            runs::save_run(&self.db, &report).await?;
        }
        info!(run_id = %report.run_id, summary = %report.summary_line(), "Import finished");

        Ok(report)
    }

    /// Record crowd verifications from a JSON-lines file of [`VerificationInput`]s
    pub async fn import_verification_file(&self, path: &Path, options: &BatchOptions) -> Result<BatchReport> {
        let file = tokio::fs::File::open(path).await?;
        self.import_verifications(BufReader::new(file), options).await
    }

    /// Record crowd verifications from a JSON-lines stream
    pub async fn import_verifications<R>(&self, reader: R, options: &BatchOptions) -> Result<BatchReport>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut report = BatchReport::new(BatchKind::Verification, options.dry_run);
        report.begin()?;
        if !options.dry_run {
            runs::save_run(&self.db, &report).await?;
        }
        info!(run_id = %report.run_id, dry_run = options.dry_run, "Starting verification intake");

        let mut lines = reader.lines();
        let mut line_no = 0u64;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            if options.should_stop(report.processed) {
                report.cancelled = options.cancel.is_cancelled();
                break;
            }
            report.processed += 1;

            let input: VerificationInput = match serde_json::from_str(&line) {
                Ok(input) => input,
                Err(err) => {
                    warn!(line = line_no, error = %err, "Malformed verification record");
                    report.errors += 1;
                    continue;
                }
            };

            if options.dry_run {
                report.record_change("verifications");
                continue;
            }

            match self.verifications.record_verification(&input).await {
                Ok(acceptance) => {
                    debug!(
                        line = line_no,
                        acceptance_id = acceptance.id,
                        score = acceptance.confidence_score,
                        "Verification applied"
                    );
                    report.record_change("verifications");
                }
                Err(err) if err.is_connectivity_loss() => return Err(err),
                Err(err) => {
                    warn!(line = line_no, npi = %input.npi, error = %err, "Verification rejected");
                    report.record_failure(&err);
                }
            }
        }

        report.complete()?;
        if !options.dry_run {
            runs::save_run(&self.db, &report).await?;
        }
        info!(run_id = %report.run_id, summary = %report.summary_line(), "Verification intake finished");

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_record_kinds() {
        let provider: ImportRecord = serde_json::from_str(
            r#"{"kind":"provider","npi":"1234567893","tier":"bulk_scrape",
                "fields":[{"field":"last_name","value":"Smith"},{"field":"credential","value":null}]}"#,
        )
        .unwrap();
        match provider {
            ImportRecord::Provider { tier, fields, .. } => {
                assert_eq!(tier, SourceTier::BulkScrape);
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0].field, ProviderField::LastName);
                assert_eq!(fields[1].value, None);
            }
            other => panic!("unexpected record {:?}", other),
        }

        let plan: ImportRecord =
            serde_json::from_str(r#"{"kind":"plan","plan_id":"P1","plan_name":"Choice","carrier_name":"Aetna"}"#)
                .unwrap();
        assert_eq!(plan.kind(), "plan");

        let observation: ImportRecord =
            serde_json::from_str(r#"{"kind":"observation","npi":"1234567893","network_name":"Aetna"}"#).unwrap();
        assert_eq!(observation.kind(), "observation");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result: std::result::Result<ImportRecord, _> =
            serde_json::from_str(r#"{"kind":"claim","npi":"1234567893"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_verification_defaults() {
        let input: VerificationInput =
            serde_json::from_str(r#"{"npi":"1234567893","plan_id":"P1","vote":"up"}"#).unwrap();
        assert_eq!(input.weight, 1);
        assert!(input.submitted_at.is_none());
    }
}
