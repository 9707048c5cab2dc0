//! Fuzzy plan matcher
//!
//! Maps free-text network names observed on provider records to canonical insurance plans
//! and creates PENDING acceptance links for confident matches.
//!
//! **Scoring** (on normalized text):
//! - Exact match: 1.0
//! - Whole-word containment in either direction: 0.85
//! - Otherwise token-set Dice coefficient: 2 × shared / (|A| + |B|)
//!
//! **Classes:** < 0.70 discarded, [0.70, 0.80) ambiguous (reported, never applied),
//! ≥ 0.80 accepted.

use chrono::{DateTime, Utc};
use provdir_common::db::InsurancePlan;
use provdir_common::time::add_months;
use provdir_common::{Result, SourceTier};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use super::confidence_scorer::tier_default;
use crate::config::ConfidenceSettings;
use crate::db::{acceptances, observations, plans, runs};
use crate::models::{BatchKind, BatchOptions, BatchReport};

pub const EXACT_SCORE: f64 = 1.0;
pub const CONTAINMENT_SCORE: f64 = 0.85;
pub const AMBIGUOUS_THRESHOLD: f64 = 0.70;
pub const ACCEPT_THRESHOLD: f64 = 0.80;

/// Tier of links created by the matcher
pub const MATCH_TIER: SourceTier = SourceTier::BulkScrape;

/// Lowercase, strip punctuation, collapse whitespace
pub fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Similarity of two raw strings in [0, 1]
pub fn similarity(a: &str, b: &str) -> f64 {
    normalized_similarity(&normalize(a), &normalize(b))
}

fn normalized_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return EXACT_SCORE;
    }

    let padded_a = format!(" {} ", a);
    let padded_b = format!(" {} ", b);
    if padded_a.contains(&padded_b) || padded_b.contains(&padded_a) {
        return CONTAINMENT_SCORE;
    }

    let tokens_a: BTreeSet<&str> = a.split(' ').collect();
    let tokens_b: BTreeSet<&str> = b.split(' ').collect();
    let shared = tokens_a.intersection(&tokens_b).count();
    2.0 * shared as f64 / (tokens_a.len() + tokens_b.len()) as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchClass {
    Discarded,
    Ambiguous,
    Accepted,
}

impl MatchClass {
    pub fn from_score(score: f64) -> Self {
        if score >= ACCEPT_THRESHOLD {
            MatchClass::Accepted
        } else if score >= AMBIGUOUS_THRESHOLD {
            MatchClass::Ambiguous
        } else {
            MatchClass::Discarded
        }
    }
}

/// Best canonical plan for one network name
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanMatch {
    pub network_name: String,
    pub plan_id: String,
    /// The plan field the name matched best (plan, carrier or issuer name)
    pub matched_text: String,
    pub score: f64,
    pub class: MatchClass,
}

struct Candidate<'p> {
    plan: &'p InsurancePlan,
    matched_text: String,
    score: f64,
    tiebreak: f64,
}

/// Find the best plan for a network name
///
/// Each plan is scored by its best field. Equal scores are broken by normalized
/// Levenshtein similarity, then by the smaller plan id.
///
/// # Returns
/// `None` when no plan has any nameable field
pub fn best_match(network_name: &str, catalog: &[InsurancePlan]) -> Option<PlanMatch> {
    let name = normalize(network_name);
    if name.is_empty() {
        return None;
    }

    let mut best: Option<Candidate> = None;
    for plan in catalog {
        let fields = [&plan.plan_name, &plan.carrier_name, &plan.issuer_name];
        for text in fields.into_iter().flatten() {
            let normalized = normalize(text);
            if normalized.is_empty() {
                continue;
            }
            let candidate = Candidate {
                plan,
                score: normalized_similarity(&name, &normalized),
                tiebreak: strsim::normalized_levenshtein(&name, &normalized),
                matched_text: text.clone(),
            };
            if best.as_ref().map_or(true, |b| outranks(&candidate, b)) {
                best = Some(candidate);
            }
        }
    }

    best.map(|c| PlanMatch {
        network_name: network_name.to_string(),
        plan_id: c.plan.plan_id.clone(),
        matched_text: c.matched_text,
        score: c.score,
        class: MatchClass::from_score(c.score),
    })
}

fn outranks(candidate: &Candidate, current: &Candidate) -> bool {
    if candidate.score != current.score {
        return candidate.score > current.score;
    }
    if candidate.tiebreak != current.tiebreak {
        return candidate.tiebreak > current.tiebreak;
    }
    candidate.plan.plan_id < current.plan.plan_id
}

/// Plans sharing the matched plan's carrier identity (issuer when no carrier is known)
pub fn plans_sharing_identity<'p>(matched: &InsurancePlan, catalog: &'p [InsurancePlan]) -> Vec<&'p InsurancePlan> {
    let key = |plan: &InsurancePlan| -> Option<(bool, String)> {
        plan.carrier_name
            .as_deref()
            .map(normalize)
            .filter(|c| !c.is_empty())
            .map(|c| (true, c))
            .or_else(|| {
                plan.issuer_name
                    .as_deref()
                    .map(normalize)
                    .filter(|i| !i.is_empty())
                    .map(|i| (false, i))
            })
    };

    match key(matched) {
        Some(identity) => catalog
            .iter()
            .filter(|plan| key(*plan).as_ref() == Some(&identity))
            .collect(),
        None => catalog
            .iter()
            .filter(|plan| plan.plan_id == matched.plan_id)
            .collect(),
    }
}

/// Outcome of one matching pass
#[derive(Debug, Clone, Serialize)]
pub struct PlanMatchRun {
    pub report: BatchReport,
    /// Names whose best match fell in the ambiguous band
    pub ambiguous: Vec<PlanMatch>,
}

pub struct PlanMatcher {
    db: SqlitePool,
    settings: ConfidenceSettings,
}

impl PlanMatcher {
    pub fn new(db: SqlitePool, settings: ConfidenceSettings) -> Self {
        Self { db, settings }
    }

    /// Match every observed network name and link accepted matches
    ///
    /// **Algorithm:**
    /// 1. Load the plan catalog once
    /// 2. Page through distinct observed network names
    /// 3. Score each against the catalog; discard or report as ambiguous below 0.80
    /// 4. Accepted: link every provider seen under the name to every plan sharing the
    ///    matched identity, skipping pairs that already have any acceptance
    ///
    /// Running twice creates nothing the second time.
    pub async fn run(&self, options: &BatchOptions) -> Result<PlanMatchRun> {
        let mut report = BatchReport::new(BatchKind::PlanMatching, options.dry_run);
        report.begin()?;
        if !options.dry_run {
            runs::save_run(&self.db, &report).await?;
        }

        let catalog = plans::list_plans(&self.db).await?;
        info!(
            run_id = %report.run_id,
            plans = catalog.len(),
            dry_run = options.dry_run,
            "Starting plan matching"
        );

        let now = provdir_common::time::now();
        let expires_at = add_months(now, self.settings.acceptance_ttl_months)?;
        let mut ambiguous = Vec::new();
        let mut after: Option<String> = None;

        'scan: loop {
            let names = observations::network_names_page(&self.db, after.as_deref(), 200).await?;
            if names.is_empty() {
                break;
            }

            for name in names {
                if options.should_stop(report.processed) {
                    report.cancelled = options.cancel.is_cancelled();
                    break 'scan;
                }
                after = Some(name.clone());
                report.processed += 1;

                let Some(found) = best_match(&name, &catalog) else {
                    report.record_change("discarded");
                    continue;
                };

                match found.class {
                    MatchClass::Discarded => {
                        debug!(network_name = %name, score = found.score, "No plan match");
                        report.record_change("discarded");
                    }
                    MatchClass::Ambiguous => {
                        warn!(
                            network_name = %name,
                            plan_id = %found.plan_id,
                            score = found.score,
                            "Ambiguous plan match, not applied"
                        );
                        report.record_change("ambiguous");
                        ambiguous.push(found);
                    }
                    MatchClass::Accepted => {
                        match self.link(&found, &catalog, options.dry_run, expires_at, now).await {
                            Ok(0) => report.unchanged += 1,
                            Ok(created) => {
                                report.record_change("matched");
                                report.add_changes("links_created", created);
                            }
                            Err(err) if err.is_connectivity_loss() => return Err(err),
                            Err(err) => {
                                warn!(network_name = %name, error = %err, "Linking plan match failed");
                                report.record_failure(&err);
                            }
                        }
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
            names = report.processed,
            links_created = report.changed_count("links_created"),
            ambiguous = ambiguous.len(),
            "Plan matching finished"
        );

        Ok(PlanMatchRun { report, ambiguous })
    }

    /// Create the PENDING links for one accepted match
    ///
    /// # Returns
    /// Number of links created (or that would be created on a dry run)
    async fn link(
        &self,
        found: &PlanMatch,
        catalog: &[InsurancePlan],
        dry_run: bool,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let Some(matched) = catalog.iter().find(|p| p.plan_id == found.plan_id) else {
            return Ok(0);
        };
        let targets = plans_sharing_identity(matched, catalog);
        let npis = observations::providers_for_network(&self.db, &found.network_name).await?;

        let mut created = 0;
        for npi in &npis {
            for plan in &targets {
                let linked = if dry_run {
                    !acceptances::pair_has_acceptance(&self.db, npi, &plan.plan_id).await?
                } else {
                    acceptances::insert_pending_if_absent(
                        &self.db,
                        npi,
                        &plan.plan_id,
                        MATCH_TIER,
                        tier_default(MATCH_TIER),
                        expires_at,
                        now,
                    )
                    .await?
                };
                if linked {
                    created += 1;
                }
            }
        }

        debug!(
            network_name = %found.network_name,
            plan_id = %found.plan_id,
            providers = npis.len(),
            plans = targets.len(),
            created,
            "Plan match linked"
        );

        Ok(created)
    }
}
