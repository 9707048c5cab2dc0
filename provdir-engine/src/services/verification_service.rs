//! Crowd verification intake and confidence recomputation
//!
//! Recording a verification appends an immutable event and refreshes the provider-wide
//! acceptance for the (provider, plan) key. Scores are recomputed lazily on read and by an
//! idempotent sweep over every acceptance with at least one verification.

use chrono::{DateTime, Utc};
use provdir_common::db::{Acceptance, AcceptanceStatus, Vote};
use provdir_common::time::add_months;
use provdir_common::{Error, Result, SourceTier};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use super::confidence_scorer::{compute_score, tier_default, ScoreInputs, VoteTally};
use super::merge_engine::validate_npi;
use crate::config::ConfidenceSettings;
use crate::db::acceptances::{self, NewAcceptance};
use crate::db::{providers, runs, verifications};
use crate::models::{BatchKind, BatchOptions, BatchReport};
use crate::utils::RecordTransaction;

/// One crowd verification as handed over by the crowd collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationInput {
    pub npi: String,
    pub plan_id: String,
    pub vote: Vote,
    #[serde(default = "default_weight")]
    pub weight: i64,
    /// Submission time; defaults to now
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

fn default_weight() -> i64 {
    1
}

/// Confidence of one acceptance as of some instant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreReading {
    pub acceptance_id: i64,
    pub status: AcceptanceStatus,
    pub source_tier: SourceTier,
    pub stored_score: i64,
    pub current_score: i64,
    pub live_events: u64,
    pub as_of: DateTime<Utc>,
}

pub struct VerificationService {
    db: SqlitePool,
    settings: ConfidenceSettings,
}

impl VerificationService {
    pub fn new(db: SqlitePool, settings: ConfidenceSettings) -> Self {
        Self { db, settings }
    }

    /// Record one crowd verification
    ///
    /// **Algorithm:**
    /// 1. Append the event with `expires_at = submitted_at + verification TTL`
    /// 2. Create the provider-wide acceptance if the pair has none
    /// 3. Increment the count, stamp last-verified, upgrade the tier to `crowd_verified`
    /// 4. Status follows the live net vote (positive ACCEPTED, negative NOT_ACCEPTED,
    ///    zero unchanged)
    /// 5. Store the recomputed score
    ///
    /// # Returns
    /// The acceptance after the update
    pub async fn record_verification(&self, input: &VerificationInput) -> Result<Acceptance> {
        validate_npi(&input.npi)?;
        if input.plan_id.trim().is_empty() {
            return Err(Error::InvalidInput("plan_id must not be empty".to_string()));
        }
        if input.weight <= 0 {
            return Err(Error::InvalidInput(format!("weight must be positive, got {}", input.weight)));
        }

        let now = provdir_common::time::now();
        let at = input.submitted_at.unwrap_or(now);
        let event_expires = add_months(at, self.settings.verification_ttl_months)?;

        let mut tx = RecordTransaction::begin(&self.db, "record_verification").await?;

        providers::insert_provider_shell(tx.conn()?, &input.npi, now).await?;
        verifications::insert_event(
            tx.conn()?,
            &input.npi,
            &input.plan_id,
            input.vote,
            input.weight,
            at,
            event_expires,
        )
        .await?;

        let acceptance = match acceptances::find_acceptance(tx.conn()?, &input.npi, &input.plan_id, None).await? {
            Some(existing) => existing,
            None => {
                let id = acceptances::insert_acceptance(
                    tx.conn()?,
                    &NewAcceptance {
                        provider_npi: &input.npi,
                        plan_id: &input.plan_id,
                        location_id: None,
                        status: AcceptanceStatus::Pending,
                        confidence_score: tier_default(SourceTier::CrowdVerified),
                        source_tier: SourceTier::CrowdVerified,
                        expires_at: add_months(at, self.settings.acceptance_ttl_months)?,
                    },
                    now,
                )
                .await?;
                acceptances::get_acceptance(tx.conn()?, id)
                    .await?
                    .ok_or_else(|| Error::Internal(format!("Acceptance {} vanished", id)))?
            }
        };

        // Backdated submissions are scored as of now
        let as_of = at.max(now);
        let events = verifications::events_recorded_by(tx.conn()?, &input.npi, &input.plan_id, as_of).await?;
        let tally = VoteTally::from_events(&events, as_of);
        let last_verified_at = acceptance.last_verified_at.map_or(at, |last| last.max(at));

        let inputs = ScoreInputs {
            tier: SourceTier::CrowdVerified,
            verification_count: acceptance.verification_count + 1,
            last_verified_at: Some(last_verified_at),
            tally,
            lapsed: VoteTally::before_last_expiry(&events, as_of),
        };
        let score = compute_score(&inputs, as_of, self.settings.half_life_days);
        let status = match tally.direction() {
            1 => AcceptanceStatus::Accepted,
            -1 => AcceptanceStatus::NotAccepted,
            _ => acceptance.status,
        };

        acceptances::store_verification_outcome(tx.conn()?, acceptance.id, status, score, last_verified_at, now)
            .await?;
        let updated = acceptances::get_acceptance(tx.conn()?, acceptance.id)
            .await?
            .ok_or_else(|| Error::Internal(format!("Acceptance {} vanished", acceptance.id)))?;
        tx.commit().await?;

        debug!(
            npi = %input.npi,
            plan_id = %input.plan_id,
            vote = %input.vote,
            score,
            status = %status,
            "Verification recorded"
        );

        Ok(updated)
    }

    /// Score an acceptance without writing anything
    pub async fn score_acceptance(&self, acceptance: &Acceptance, as_of: DateTime<Utc>) -> Result<ScoreReading> {
        let events =
            verifications::events_recorded_by(&self.db, &acceptance.provider_npi, &acceptance.plan_id, as_of)
                .await?;
        let tally = VoteTally::from_events(&events, as_of);
        let inputs = ScoreInputs {
            tier: acceptance.source_tier,
            verification_count: acceptance.verification_count,
            last_verified_at: acceptance.last_verified_at,
            tally,
            lapsed: VoteTally::before_last_expiry(&events, as_of),
        };

        Ok(ScoreReading {
            acceptance_id: acceptance.id,
            status: acceptance.status,
            source_tier: acceptance.source_tier,
            stored_score: acceptance.confidence_score,
            current_score: compute_score(&inputs, as_of, self.settings.half_life_days),
            live_events: tally.live_events,
            as_of,
        })
    }

    /// Lazy read: the current confidence of one acceptance
    ///
    /// # Returns
    /// `None` if the pair has no acceptance in the requested scope
    pub async fn confidence_at(
        &self,
        npi: &str,
        plan_id: &str,
        location_id: Option<i64>,
        as_of: DateTime<Utc>,
    ) -> Result<Option<ScoreReading>> {
        match acceptances::find_acceptance(&self.db, npi, plan_id, location_id).await? {
            Some(acceptance) => Ok(Some(self.score_acceptance(&acceptance, as_of).await?)),
            None => Ok(None),
        }
    }

    /// Sweep every verified acceptance and store scores that changed
    ///
    /// Re-running with the same `as_of` changes nothing. Dry-run counts without writing.
    pub async fn rescore(&self, options: &BatchOptions, as_of: DateTime<Utc>) -> Result<BatchReport> {
        let mut report = BatchReport::new(BatchKind::ConfidenceSweep, options.dry_run);
        report.begin()?;
        if !options.dry_run {
            runs::save_run(&self.db, &report).await?;
        }
        info!(run_id = %report.run_id, as_of = %as_of, dry_run = options.dry_run, "Starting confidence sweep");

        let mut after_id = 0;
        'scan: loop {
            let page = acceptances::verified_page(&self.db, after_id, 200).await?;
            if page.is_empty() {
                break;
            }

            for acceptance in page {
                if options.should_stop(report.processed) {
                    report.cancelled = options.cancel.is_cancelled();
                    break 'scan;
                }
                after_id = acceptance.id;
                report.processed += 1;

                let reading = match self.score_acceptance(&acceptance, as_of).await {
                    Ok(reading) => reading,
                    Err(err) if err.is_connectivity_loss() => return Err(err),
                    Err(err) => {
                        warn!(acceptance_id = acceptance.id, error = %err, "Rescoring failed");
                        report.record_failure(&err);
                        continue;
                    }
                };

                if reading.current_score == reading.stored_score {
                    report.unchanged += 1;
                    continue;
                }

                if options.dry_run {
                    report.record_change("rescored");
                    continue;
                }

                match acceptances::store_score_if_changed(
                    &self.db,
                    acceptance.id,
                    reading.current_score,
                    provdir_common::time::now(),
                )
                .await
                {
                    Ok(true) => report.record_change("rescored"),
                    Ok(false) => report.unchanged += 1,
                    Err(err) if err.is_connectivity_loss() => return Err(err),
                    Err(err) => {
                        warn!(acceptance_id = acceptance.id, error = %err, "Storing score failed");
                        report.record_failure(&err);
                    }
                }
            }
        }

        report.complete()?;
        if !options.dry_run {
            runs::save_run(&self.db, &report).await?;
        }
        info!(
            run_id = %report.run_id,
            inspected = report.processed,
            changed = report.changed_count("rescored"),
            unchanged = report.unchanged,
            "Confidence sweep finished"
        );

        Ok(report)
    }
}
