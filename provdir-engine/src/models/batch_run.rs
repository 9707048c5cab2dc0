//! Batch run state machine and report
//!
//! Every batch entry point produces one [`BatchReport`]. It is the only externally observed
//! "exit status" of a run: records processed, changes by category, unchanged, errors, and
//! the fatal cause when the run was aborted.
//!
//! State machine: NOT_STARTED → IN_PROGRESS → COMPLETED | FAILED

use chrono::{DateTime, Utc};
use provdir_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Batch run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::NotStarted => "NOT_STARTED",
            RunState::InProgress => "IN_PROGRESS",
            RunState::Completed => "COMPLETED",
            RunState::Failed => "FAILED",
        }
    }

    fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::NotStarted, RunState::InProgress)
                | (RunState::InProgress, RunState::Completed)
                | (RunState::InProgress, RunState::Failed)
                | (RunState::NotStarted, RunState::Failed)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which batch entry point produced a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    RegistryReconciliation,
    Geocoding,
    ConfidenceSweep,
    PlanMatching,
    Import,
    Verification,
    DeactivationCleanup,
}

impl BatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchKind::RegistryReconciliation => "registry_reconciliation",
            BatchKind::Geocoding => "geocoding",
            BatchKind::ConfidenceSweep => "confidence_sweep",
            BatchKind::PlanMatching => "plan_matching",
            BatchKind::Import => "import",
            BatchKind::Verification => "verification",
            BatchKind::DeactivationCleanup => "deactivation_cleanup",
        }
    }
}

/// Options accepted by every batch entry point
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Report what would happen without external calls or writes
    pub dry_run: bool,
    /// Stop after this many records
    pub limit: Option<u64>,
    /// Reconciliation only: restrict to providers never reconciled
    pub resume: bool,
    /// Cooperative cancellation, checked between records
    pub cancel: CancellationToken,
}

impl BatchOptions {
    pub fn apply() -> Self {
        Self::default()
    }

    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// True when the run must stop at this record boundary
    pub fn should_stop(&self, processed: u64) -> bool {
        self.cancel.is_cancelled() || self.limit.map(|l| processed >= l).unwrap_or(false)
    }

}

/// Outcome counters of one batch run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub kind: BatchKind,
    pub state: RunState,
    pub dry_run: bool,
    /// Records inspected
    pub processed: u64,
    /// Records inspected without any change
    pub unchanged: u64,
    /// Records skipped because of a per-record failure
    pub errors: u64,
    /// Subset of `errors` rolled back on a uniqueness or foreign-key violation
    #[serde(default)]
    pub integrity_failures: u64,
    /// Changes by category
    pub changed: BTreeMap<String, u64>,
    /// Cause of an aborted run
    pub fatal: Option<String>,
    /// Run ended early because of cancellation
    pub cancelled: bool,
    /// Dry-run estimate of external call cost
    pub estimated_cost_usd: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchReport {
    pub fn new(kind: BatchKind, dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            kind,
            state: RunState::NotStarted,
            dry_run,
            processed: 0,
            unchanged: 0,
            errors: 0,
            integrity_failures: 0,
            changed: BTreeMap::new(),
            fatal: None,
            cancelled: false,
            estimated_cost_usd: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// NOT_STARTED → IN_PROGRESS
    pub fn begin(&mut self) -> Result<()> {
        self.transition(RunState::InProgress)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// IN_PROGRESS → COMPLETED
    pub fn complete(&mut self) -> Result<()> {
        self.transition(RunState::Completed)?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// → FAILED, recording the cause
    pub fn fail(&mut self, cause: impl Into<String>) -> Result<()> {
        self.transition(RunState::Failed)?;
        self.fatal = Some(cause.into());
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "Invalid run state transition {} -> {}",
                self.state, next
            )));
        }
        tracing::debug!(run_id = %self.run_id, from = %self.state, to = %next, "Run state transition");
        self.state = next;
        Ok(())
    }

    pub fn record_change(&mut self, category: &str) {
        self.add_changes(category, 1);
    }

    pub fn add_changes(&mut self, category: &str, count: u64) {
        if count > 0 {
            *self.changed.entry(category.to_string()).or_insert(0) += count;
        }
    }

    /// Count one record whose work was rolled back
    pub fn record_failure(&mut self, err: &Error) {
        self.errors += 1;
        if err.is_integrity_violation() {
            self.integrity_failures += 1;
        }
    }

    pub fn changed_count(&self, category: &str) -> u64 {
        self.changed.get(category).copied().unwrap_or(0)
    }

    pub fn total_changed(&self) -> u64 {
        self.changed.values().sum()
    }

    /// Only fatal failures make a run a hard failure; per-record errors do not
    pub fn is_hard_failure(&self) -> bool {
        self.state == RunState::Failed
    }

    pub fn summary_line(&self) -> String {
        let changes = if self.changed.is_empty() {
            "none".to_string()
        } else {
            self.changed
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut line = format!(
            "{} {}{}: processed {}, unchanged {}, errors {} (integrity {}), changed [{}]",
            self.kind.as_str(),
            self.state,
            if self.dry_run { " (dry run)" } else { "" },
            self.processed,
            self.unchanged,
            self.errors,
            self.integrity_failures,
            changes
        );
        if let Some(cost) = self.estimated_cost_usd {
            line.push_str(&format!(", estimated cost ${:.2}", cost));
        }
        if self.cancelled {
            line.push_str(", cancelled");
        }
        if let Some(cause) = &self.fatal {
            line.push_str(&format!(", fatal: {}", cause));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut report = BatchReport::new(BatchKind::Geocoding, false);
        assert_eq!(report.state, RunState::NotStarted);
        report.begin().unwrap();
        assert_eq!(report.state, RunState::InProgress);
        report.complete().unwrap();
        assert_eq!(report.state, RunState::Completed);
        assert!(!report.is_hard_failure());
        assert!(report.finished_at.is_some());
    }

    #[test]
    fn test_completed_run_cannot_fail_or_restart() {
        let mut report = BatchReport::new(BatchKind::Geocoding, false);
        report.begin().unwrap();
        report.complete().unwrap();
        assert!(report.fail("late").is_err());
        assert!(report.begin().is_err());
    }

    #[test]
    fn test_fail_records_cause() {
        let mut report = BatchReport::new(BatchKind::RegistryReconciliation, false);
        report.begin().unwrap();
        report.fail("request denied").unwrap();
        assert!(report.is_hard_failure());
        assert!(report.summary_line().contains("fatal: request denied"));
    }

    #[test]
    fn test_change_counters() {
        let mut report = BatchReport::new(BatchKind::PlanMatching, true);
        report.record_change("ppa_created");
        report.add_changes("ppa_created", 2);
        report.add_changes("ambiguous", 0);
        assert_eq!(report.changed_count("ppa_created"), 3);
        assert_eq!(report.changed_count("ambiguous"), 0);
        assert!(!report.changed.contains_key("ambiguous"));
        assert_eq!(report.total_changed(), 3);
        assert!(report.summary_line().contains("(dry run)"));
    }

    #[test]
    fn test_failures_split_out_integrity_violations() {
        let mut report = BatchReport::new(BatchKind::Import, false);
        report.record_failure(&Error::InvalidInput("bad npi".to_string()));
        report.record_failure(&Error::NotFound("plan".to_string()));
        assert_eq!(report.errors, 2);
        assert_eq!(report.integrity_failures, 0);
        assert!(report.summary_line().contains("errors 2 (integrity 0)"));
    }

    #[test]
    fn test_options_limit_and_cancel() {
        let options = BatchOptions::apply().with_limit(2);
        assert!(!options.should_stop(1));
        assert!(options.should_stop(2));

        let options = BatchOptions::dry_run();
        assert!(!options.should_stop(1000));
        options.cancel.cancel();
        assert!(options.should_stop(0));
    }
}
