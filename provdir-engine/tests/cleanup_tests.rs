//! Integration tests for the deactivation cleanup sweep

mod helpers;

use helpers::*;
use provdir_common::db::Vote;
use provdir_common::SourceTier;
use provdir_engine::config::ConfidenceSettings;
use provdir_engine::db::{observations, providers};
use provdir_engine::services::{DeactivationCleanup, ProviderField, VerificationInput, VerificationService};
use provdir_engine::BatchOptions;
use sqlx::SqlitePool;

async fn seed_directory(pool: &SqlitePool) {
    seed_plan(pool, "P1", "Choice POS II", Some("Aetna"), None).await;
    seed_provider(
        pool,
        NPI_A,
        SourceTier::Registry,
        &[(ProviderField::LastName, "Rivera"), (ProviderField::DeactivationDate, "2024-03-01")],
    )
    .await;
    seed_location(pool, NPI_A, &address("1 Main St", "Springfield", "IL", "62701"), SourceTier::Registry).await;
    seed_location(pool, NPI_A, &address("9 Elm Rd", "Springfield", "IL", "62704"), SourceTier::Registry).await;
    seed_location(pool, NPI_B, &address("5 Oak Ave", "Peoria", "IL", "61602"), SourceTier::Registry).await;

    let verifier = VerificationService::new(pool.clone(), ConfidenceSettings::default());
    for npi in [NPI_A, NPI_B] {
        verifier
            .record_verification(&VerificationInput {
                npi: npi.to_string(),
                plan_id: "P1".to_string(),
                vote: Vote::Up,
                weight: 1,
                submitted_at: None,
            })
            .await
            .unwrap();
    }
    observations::record_observation(pool, NPI_A, "Aetna", provdir_common::time::now())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_dry_run_counts_dependents_without_deleting() {
    let (_dir, pool) = create_test_db().await;
    seed_directory(&pool).await;

    let report = DeactivationCleanup::new(pool.clone())
        .run(&BatchOptions::dry_run())
        .await
        .unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.changed_count("providers"), 1);
    assert_eq!(report.changed_count("locations"), 2);
    assert_eq!(report.changed_count("acceptances"), 1);
    assert_eq!(report.changed_count("verifications"), 1);
    assert_eq!(count_rows(&pool, "providers").await, 2);
    assert_eq!(count_rows(&pool, "batch_runs").await, 0);
}

#[tokio::test]
async fn test_apply_deletes_deactivated_provider_and_dependents() {
    let (_dir, pool) = create_test_db().await;
    seed_directory(&pool).await;

    let report = DeactivationCleanup::new(pool.clone())
        .run(&BatchOptions::apply())
        .await
        .unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.changed_count("providers"), 1);
    assert_eq!(report.errors, 0);

    assert!(providers::get_provider(&pool, NPI_A).await.unwrap().is_none());
    assert!(providers::get_provider(&pool, NPI_B).await.unwrap().is_some());
    assert_eq!(count_rows(&pool, "practice_locations").await, 1);
    assert_eq!(count_rows(&pool, "provider_plan_acceptance").await, 1);
    assert_eq!(count_rows(&pool, "verification_events").await, 1);
    assert_eq!(count_rows(&pool, "provider_network_observations").await, 0);
    // The plan catalog is shared and stays
    assert_eq!(count_rows(&pool, "insurance_plans").await, 1);

    let again = DeactivationCleanup::new(pool.clone())
        .run(&BatchOptions::apply())
        .await
        .unwrap();
    assert_eq!(again.processed, 0);
}

#[tokio::test]
async fn test_limited_dry_run_counts_match_limited_apply() {
    let (_dir, pool) = create_test_db().await;
    seed_directory(&pool).await;
    // A second deactivated provider with one location and no votes
    seed_provider(&pool, NPI_C, SourceTier::Registry, &[(ProviderField::DeactivationDate, "2024-05-01")]).await;
    seed_location(&pool, NPI_C, &address("3 Ash Ct", "Joliet", "IL", "60431"), SourceTier::Registry).await;

    let everything = DeactivationCleanup::new(pool.clone())
        .run(&BatchOptions::dry_run())
        .await
        .unwrap();
    assert_eq!(everything.changed_count("providers"), 2);
    assert_eq!(everything.changed_count("locations"), 3);

    let dry = DeactivationCleanup::new(pool.clone())
        .run(&BatchOptions::dry_run().with_limit(1))
        .await
        .unwrap();
    assert_eq!(dry.processed, 1);
    assert_eq!(dry.changed_count("providers"), 1);
    assert_eq!(dry.changed_count("locations"), 2);
    assert_eq!(dry.changed_count("acceptances"), 1);
    assert_eq!(dry.changed_count("verifications"), 1);

    let locations_before = count_rows(&pool, "practice_locations").await;
    let applied = DeactivationCleanup::new(pool.clone())
        .run(&BatchOptions::apply().with_limit(1))
        .await
        .unwrap();
    assert_eq!(applied.changed_count("providers"), 1);
    assert!(providers::get_provider(&pool, NPI_A).await.unwrap().is_none());
    assert!(providers::get_provider(&pool, NPI_C).await.unwrap().is_some());
    assert_eq!(
        locations_before - count_rows(&pool, "practice_locations").await,
        dry.changed_count("locations") as i64
    );
}
