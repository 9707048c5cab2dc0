//! Confidence scoring
//!
//! Pure scoring function shared by the lazy read path and the rescoring sweep.
//!
//! **Formula:**
//! - Never verified: tier default (registry 20, bulk_scrape 35, enrichment_import 45,
//!   crowd_verified 50)
//! - agreement = net weighted votes / total weighted votes over live events, in [-1, 1]
//! - volume = min(verification_count, 5) / 5
//! - raw = 50 + 50 × agreement × volume, in [0, 100]
//! - decay = 0.5 ^ (whole days since last verification / half-life days)
//! - score = round(clamp(raw × decay, 0, 100))
//!
//! **Lapsed signal:** once every event of a verified PPA has expired, the score is
//! `min(tier default, lapsed raw) × decay`, where lapsed raw is the raw value of the tally
//! just before the most recent expiry. Decay keeps counting from the last verification, so
//! the score after expiry never exceeds the last live reading and keeps falling.
//!
//! With votes and counts held fixed the score never increases as time passes, because raw
//! is non-negative and decay is non-increasing in elapsed days.

use chrono::{DateTime, Utc};
use provdir_common::db::VerificationEvent;
use provdir_common::time::whole_days_between;
use provdir_common::SourceTier;

/// Verification count at which volume saturates
pub const VOLUME_SATURATION: i64 = 5;

/// Score of a PPA with no live crowd signal
pub fn tier_default(tier: SourceTier) -> i64 {
    match tier {
        SourceTier::Registry => 20,
        SourceTier::BulkScrape => 35,
        SourceTier::EnrichmentImport => 45,
        SourceTier::CrowdVerified => 50,
    }
}

/// Weighted votes over live events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoteTally {
    pub live_events: u64,
    /// Upvote weight minus downvote weight
    pub net_weight: i64,
    pub total_weight: i64,
}

impl VoteTally {
    /// Tally the events that are live at `at`; expired ones are ignored
    pub fn from_events(events: &[VerificationEvent], at: DateTime<Utc>) -> Self {
        Self::sum(events.iter().filter(|e| e.is_live_at(at) && e.created_at <= at))
    }

    /// Tally as it stood just before the most recent expiry at or before `at`
    ///
    /// Empty if nothing has expired yet.
    pub fn before_last_expiry(events: &[VerificationEvent], at: DateTime<Utc>) -> Self {
        let Some(expiry) = events.iter().map(|e| e.expires_at).filter(|t| *t <= at).max() else {
            return Self::default();
        };
        Self::sum(events.iter().filter(|e| e.created_at < expiry && e.expires_at >= expiry))
    }

    fn sum<'a>(events: impl Iterator<Item = &'a VerificationEvent>) -> Self {
        events.fold(Self::default(), |mut tally, event| {
            tally.live_events += 1;
            tally.net_weight += event.vote.sign() * event.weight;
            tally.total_weight += event.weight;
            tally
        })
    }

    /// Raw score in [0, 100] before decay, `None` without weighted votes
    fn raw(&self, verification_count: i64) -> Option<f64> {
        if self.live_events == 0 || self.total_weight <= 0 || verification_count <= 0 {
            return None;
        }
        let agreement = (self.net_weight as f64 / self.total_weight as f64).clamp(-1.0, 1.0);
        let volume = verification_count.min(VOLUME_SATURATION) as f64 / VOLUME_SATURATION as f64;
        Some(50.0 + 50.0 * agreement * volume)
    }

    /// -1, 0 or +1
    pub fn direction(&self) -> i64 {
        self.net_weight.signum()
    }
}

/// Everything the score depends on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreInputs {
    pub tier: SourceTier,
    pub verification_count: i64,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub tally: VoteTally,
    /// Signal at the last live instant, used once `tally` is empty
    pub lapsed: VoteTally,
}

/// Compute the confidence score as of `as_of`
///
/// # Arguments
/// * `inputs` - Tier, counters and the live vote tally
/// * `as_of` - Evaluation instant
/// * `half_life_days` - Days after which the score halves without new signal
///
/// # Returns
/// Integer score in [0, 100]
pub fn compute_score(inputs: &ScoreInputs, as_of: DateTime<Utc>, half_life_days: f64) -> i64 {
    let days = inputs
        .last_verified_at
        .map(|last| whole_days_between(last, as_of))
        .unwrap_or(0);
    let decay = if half_life_days > 0.0 {
        0.5_f64.powf(days as f64 / half_life_days)
    } else {
        1.0
    };

    let raw = match inputs.tally.raw(inputs.verification_count) {
        Some(raw) => raw,
        None if inputs.verification_count > 0 && inputs.last_verified_at.is_some() => {
            let default = tier_default(inputs.tier) as f64;
            inputs
                .lapsed
                .raw(inputs.verification_count)
                .map_or(default, |lapsed| lapsed.min(default))
        }
        None => return tier_default(inputs.tier),
    };

    (raw * decay).clamp(0.0, 100.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use provdir_common::db::Vote;

    fn event(vote: Vote, weight: i64, created: DateTime<Utc>, ttl_days: i64) -> VerificationEvent {
        VerificationEvent {
            id: 0,
            provider_npi: "1234567893".to_string(),
            plan_id: "P1".to_string(),
            vote,
            weight,
            created_at: created,
            expires_at: created + Duration::days(ttl_days),
        }
    }

    fn inputs(count: i64, net: i64, total: i64, last: Option<DateTime<Utc>>) -> ScoreInputs {
        ScoreInputs {
            tier: SourceTier::CrowdVerified,
            verification_count: count,
            last_verified_at: last,
            tally: VoteTally {
                live_events: count.max(0) as u64,
                net_weight: net,
                total_weight: total,
            },
            lapsed: VoteTally::default(),
        }
    }

    #[test]
    fn test_never_verified_uses_tier_default() {
        let now = Utc::now();
        for tier in SourceTier::ALL {
            let inputs = ScoreInputs {
                tier,
                verification_count: 0,
                last_verified_at: None,
                tally: VoteTally::default(),
                lapsed: VoteTally::default(),
            };
            assert_eq!(compute_score(&inputs, now, 90.0), tier_default(tier));
        }
        assert!(tier_default(SourceTier::Registry) < tier_default(SourceTier::CrowdVerified));
    }

    #[test]
    fn test_lapsed_signal_keeps_decaying_below_last_live_reading() {
        let now = Utc::now();
        let submitted = now - Duration::days(200);
        let events = vec![event(Vote::Up, 1, submitted, 181)];

        let live_at = submitted + Duration::days(180);
        let live = ScoreInputs {
            tier: SourceTier::CrowdVerified,
            verification_count: 1,
            last_verified_at: Some(submitted),
            tally: VoteTally::from_events(&events, live_at),
            lapsed: VoteTally::before_last_expiry(&events, live_at),
        };
        assert_eq!(live.tally.live_events, 1);
        assert_eq!(compute_score(&live, live_at, 90.0), 15);

        let expired = ScoreInputs {
            tally: VoteTally::from_events(&events, now),
            lapsed: VoteTally::before_last_expiry(&events, now),
            ..live
        };
        assert_eq!(expired.tally.live_events, 0);
        assert_eq!(expired.lapsed.net_weight, 1);
        // min(50, 60) halved past two half-lives
        assert_eq!(compute_score(&expired, now, 90.0), 11);
    }

    #[test]
    fn test_lapsed_downvote_does_not_jump_to_default() {
        let now = Utc::now();
        let submitted = now - Duration::days(182);
        let events = vec![event(Vote::Down, 1, submitted, 181)];
        let inputs = ScoreInputs {
            tier: SourceTier::CrowdVerified,
            verification_count: 1,
            last_verified_at: Some(submitted),
            tally: VoteTally::from_events(&events, now),
            lapsed: VoteTally::before_last_expiry(&events, now),
        };
        // 40 decayed, not 50
        assert_eq!(compute_score(&inputs, now, 90.0), 10);
    }

    #[test]
    fn test_expired_events_excluded_from_tally() {
        let now = Utc::now();
        let events = vec![
            event(Vote::Up, 1, now - Duration::days(210), 182),
            event(Vote::Down, 2, now - Duration::days(10), 182),
        ];
        let tally = VoteTally::from_events(&events, now);
        assert_eq!(tally.live_events, 1);
        assert_eq!(tally.net_weight, -2);
        assert_eq!(tally.total_weight, 2);
        assert_eq!(tally.direction(), -1);
    }

    #[test]
    fn test_fresh_unanimous_signal() {
        let now = Utc::now();
        assert_eq!(compute_score(&inputs(5, 5, 5, Some(now)), now, 90.0), 100);
        assert_eq!(compute_score(&inputs(5, -5, 5, Some(now)), now, 90.0), 0);
        assert_eq!(compute_score(&inputs(1, 1, 1, Some(now)), now, 90.0), 60);
        assert_eq!(compute_score(&inputs(2, 0, 2, Some(now)), now, 90.0), 50);
    }

    #[test]
    fn test_half_life_decay() {
        let now = Utc::now();
        let last = now - Duration::days(90);
        assert_eq!(compute_score(&inputs(5, 5, 5, Some(last)), now, 90.0), 50);
    }

    #[test]
    fn test_boundedness() {
        let now = Utc::now();
        for count in [0, 1, 3, 5, 50] {
            for (net, total) in [(-7, 7), (0, 4), (3, 5), (9, 9), (1000, 1000)] {
                for days in [0, 1, 45, 400, 10_000] {
                    let score = compute_score(
                        &inputs(count, net, total, Some(now - Duration::days(days))),
                        now,
                        90.0,
                    );
                    assert!((0..=100).contains(&score), "score {} out of range", score);
                }
            }
        }
    }

    #[test]
    fn test_decay_monotonicity() {
        let now = Utc::now();
        for (count, net, total) in [(1, 1, 1), (5, 5, 5), (3, -1, 3), (5, -5, 5), (4, 2, 6)] {
            let mut previous = i64::MAX;
            for days in 0..400 {
                let score = compute_score(
                    &inputs(count, net, total, Some(now - Duration::days(days))),
                    now,
                    90.0,
                );
                assert!(score <= previous, "score rose at day {}", days);
                previous = score;
            }
        }
    }
}
