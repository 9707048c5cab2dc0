//! Integration tests for the fuzzy plan matcher

mod helpers;

use helpers::*;
use provdir_common::db::AcceptanceStatus;
use provdir_common::SourceTier;
use provdir_engine::config::ConfidenceSettings;
use provdir_engine::db::{acceptances, observations};
use provdir_engine::services::{MatchClass, PlanMatcher, VerificationInput, VerificationService};
use provdir_engine::BatchOptions;
use sqlx::SqlitePool;

async fn observe(pool: &SqlitePool, npi: &str, network_name: &str) {
    let now = provdir_common::time::now();
    provdir_engine::db::providers::insert_provider_shell(pool, npi, now)
        .await
        .unwrap();
    observations::record_observation(pool, npi, network_name, now)
        .await
        .unwrap();
}

async fn seed_catalog(pool: &SqlitePool) {
    seed_plan(pool, "AET-1", "Aetna Choice POS II Plus", Some("Aetna Health Inc"), None).await;
    seed_plan(pool, "AET-2", "Aetna Medicare Advantage HMO", Some("Aetna Health Inc"), None).await;
    seed_plan(pool, "CIG-1", "Cigna Open Access Plus", Some("Cigna"), None).await;
}

#[tokio::test]
async fn test_ambiguous_match_is_reported_and_not_applied() {
    let (_dir, pool) = create_test_db().await;
    seed_catalog(&pool).await;
    observe(&pool, NPI_A, "Aetna Choice POS II Open Access").await;

    let matcher = PlanMatcher::new(pool.clone(), ConfidenceSettings::default());
    let run = matcher.run(&BatchOptions::apply()).await.unwrap();

    assert_eq!(run.report.processed, 1);
    assert_eq!(run.report.changed_count("ambiguous"), 1);
    assert_eq!(run.report.changed_count("links_created"), 0);
    assert_eq!(run.ambiguous.len(), 1);
    let found = &run.ambiguous[0];
    assert_eq!(found.plan_id, "AET-1");
    assert_eq!(found.class, MatchClass::Ambiguous);
    assert!(found.score >= 0.70 && found.score < 0.80, "score {}", found.score);

    assert_eq!(count_rows(&pool, "provider_plan_acceptance").await, 0);
}

#[tokio::test]
async fn test_accepted_match_links_every_plan_of_the_carrier() {
    let (_dir, pool) = create_test_db().await;
    seed_catalog(&pool).await;
    observe(&pool, NPI_A, "AETNA HEALTH INC.").await;
    observe(&pool, NPI_B, "AETNA HEALTH INC.").await;
    observe(&pool, NPI_C, "Blue Shield Platinum").await;

    let matcher = PlanMatcher::new(pool.clone(), ConfidenceSettings::default());
    let run = matcher.run(&BatchOptions::apply()).await.unwrap();

    assert_eq!(run.report.processed, 2);
    assert_eq!(run.report.changed_count("matched"), 1);
    assert_eq!(run.report.changed_count("discarded"), 1);
    assert_eq!(run.report.changed_count("links_created"), 4);

    for npi in [NPI_A, NPI_B] {
        for plan in ["AET-1", "AET-2"] {
            let link = acceptances::find_acceptance(&pool, npi, plan, None).await.unwrap().unwrap();
            assert_eq!(link.status, AcceptanceStatus::Pending);
            assert_eq!(link.source_tier, SourceTier::BulkScrape);
            assert_eq!(link.verification_count, 0);
        }
        assert!(!acceptances::pair_has_acceptance(&pool, npi, "CIG-1").await.unwrap());
    }
    assert_eq!(count_rows(&pool, "provider_plan_acceptance").await, 4);

    let again = matcher.run(&BatchOptions::apply()).await.unwrap();
    assert_eq!(again.report.changed_count("links_created"), 0);
    assert_eq!(again.report.unchanged, 1);
    assert_eq!(count_rows(&pool, "provider_plan_acceptance").await, 4);
}

#[tokio::test]
async fn test_existing_acceptance_is_never_touched() {
    let (_dir, pool) = create_test_db().await;
    seed_catalog(&pool).await;
    observe(&pool, NPI_A, "Cigna").await;

    let verified = VerificationService::new(pool.clone(), ConfidenceSettings::default())
        .record_verification(&VerificationInput {
            npi: NPI_A.to_string(),
            plan_id: "CIG-1".to_string(),
            vote: provdir_common::db::Vote::Down,
            weight: 1,
            submitted_at: None,
        })
        .await
        .unwrap();

    let run = PlanMatcher::new(pool.clone(), ConfidenceSettings::default())
        .run(&BatchOptions::apply())
        .await
        .unwrap();
    assert_eq!(run.report.changed_count("links_created"), 0);

    let after = acceptances::get_acceptance(&pool, verified.id).await.unwrap().unwrap();
    assert_eq!(after.status, AcceptanceStatus::NotAccepted);
    assert_eq!(after.source_tier, SourceTier::CrowdVerified);
    assert_eq!(after.confidence_score, verified.confidence_score);
}

#[tokio::test]
async fn test_dry_run_counts_links_without_writing() {
    let (_dir, pool) = create_test_db().await;
    seed_catalog(&pool).await;
    observe(&pool, NPI_A, "Aetna Health Inc").await;

    let run = PlanMatcher::new(pool.clone(), ConfidenceSettings::default())
        .run(&BatchOptions::dry_run())
        .await
        .unwrap();

    assert_eq!(run.report.changed_count("links_created"), 2);
    assert_eq!(count_rows(&pool, "provider_plan_acceptance").await, 0);
    assert_eq!(count_rows(&pool, "batch_runs").await, 0);
}
