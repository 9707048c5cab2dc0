//! Integration tests for the geocoding batch processor

mod helpers;

use helpers::*;
use provdir_common::db::GeocodeStatus;
use provdir_common::SourceTier;
use provdir_engine::config::GeocodeSettings;
use provdir_engine::db::{locations, runs};
use provdir_engine::services::GeocodingProcessor;
use provdir_engine::utils::RetryPolicy;
use provdir_engine::{BatchOptions, RunState};
use sqlx::SqlitePool;
use std::sync::Arc;

fn processor(pool: &SqlitePool, geocoder: Arc<FakeGeocoder>) -> GeocodingProcessor {
    GeocodingProcessor::new(
        pool.clone(),
        geocoder,
        RetryPolicy::immediate(2),
        GeocodeSettings {
            cost_per_request_usd: 0.005,
            page_size: 2,
        },
    )
}

async fn geocoded_rows(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM practice_locations WHERE latitude IS NOT NULL")
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_fan_out_and_second_run_makes_no_calls() {
    let (_dir, pool) = create_test_db().await;

    // Three providers share one address, spelled differently; one has its own address
    let shared = address("200 Oak Avenue", "Columbus", "OH", "43215");
    let a = seed_location(&pool, NPI_A, &shared, SourceTier::Registry).await;
    let b = seed_location(&pool, NPI_B, &address("200 OAK AVE.", "Columbus", "oh", "43215-0001"), SourceTier::BulkScrape).await;
    let c = seed_location(&pool, NPI_C, &shared, SourceTier::Registry).await;
    seed_location(&pool, NPI_C, &address("9 Elm Road", "Dayton", "OH", "45402"), SourceTier::Registry).await;

    let geocoder = Arc::new(FakeGeocoder::new());
    let report = processor(&pool, geocoder.clone())
        .run(&BatchOptions::apply())
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(geocoder.calls(), 2);
    assert_eq!(report.processed, 2);
    assert_eq!(report.changed_count("geocoded"), 2);
    assert_eq!(report.changed_count("rows_updated"), 4);
    assert_eq!(geocoded_rows(&pool).await, 4);

    let first = locations::get_location(&pool, a).await.unwrap().unwrap();
    for id in [b, c] {
        let row = locations::get_location(&pool, id).await.unwrap().unwrap();
        assert_eq!(row.latitude, first.latitude);
        assert_eq!(row.longitude, first.longitude);
        assert_eq!(row.geocode_status, Some(GeocodeStatus::Ok));
        assert!(row.geocoded_at.is_some());
    }

    let again = processor(&pool, geocoder.clone())
        .run(&BatchOptions::apply())
        .await
        .unwrap();
    assert_eq!(geocoder.calls(), 2, "second run must not call the geocoder");
    assert_eq!(again.processed, 0);
    assert_eq!(again.total_changed(), 0);
}

#[tokio::test]
async fn test_new_row_inherits_coordinates_of_geocoded_twin() {
    let (_dir, pool) = create_test_db().await;
    let shared = address("200 Oak Avenue", "Columbus", "OH", "43215");
    let first = seed_location(&pool, NPI_A, &shared, SourceTier::Registry).await;

    let geocoder = Arc::new(FakeGeocoder::new());
    processor(&pool, geocoder.clone()).run(&BatchOptions::apply()).await.unwrap();
    assert_eq!(geocoder.calls(), 1);

    let later = seed_location(&pool, NPI_B, &shared, SourceTier::Registry).await;
    let first = locations::get_location(&pool, first).await.unwrap().unwrap();
    let later = locations::get_location(&pool, later).await.unwrap().unwrap();
    assert_eq!(later.latitude, first.latitude);
    assert_eq!(later.geocode_status, Some(GeocodeStatus::Ok));

    processor(&pool, geocoder.clone()).run(&BatchOptions::apply()).await.unwrap();
    assert_eq!(geocoder.calls(), 1);
}

#[tokio::test]
async fn test_request_denied_on_fifth_address_aborts_with_four_committed() {
    let (_dir, pool) = create_test_db().await;
    for i in 1..=7 {
        let npi = format!("100000010{}", i);
        seed_location(&pool, &npi, &address(&format!("{} Pine Street", i * 10), "Austin", "TX", "78701"), SourceTier::Registry).await;
    }

    let geocoder = Arc::new(FakeGeocoder::new().deny_at_call(5));
    let report = processor(&pool, geocoder.clone())
        .run(&BatchOptions::apply())
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Failed);
    assert!(report.is_hard_failure());
    assert!(report.fatal.as_deref().unwrap().contains("API key revoked"));
    assert_eq!(geocoder.calls(), 5, "denial is not retried and nothing runs after it");
    assert_eq!(report.changed_count("geocoded"), 4);
    assert_eq!(geocoded_rows(&pool).await, 4);

    let saved = runs::load_run(&pool, report.run_id).await.unwrap().unwrap();
    assert_eq!(saved.state, RunState::Failed);
    assert_eq!(saved.changed_count("geocoded"), 4);
}

#[tokio::test]
async fn test_no_result_is_terminal_and_transient_is_left_for_next_run() {
    let (_dir, pool) = create_test_db().await;
    seed_location(&pool, NPI_A, &address("1 Nowhere Lane", "Ghost", "NV", "89001"), SourceTier::Registry).await;
    seed_location(&pool, NPI_B, &address("5 Busy Street", "Reno", "NV", "89501"), SourceTier::Registry).await;
    seed_location(&pool, NPI_C, &address("7 Calm Street", "Reno", "NV", "89501"), SourceTier::Registry).await;

    let geocoder = Arc::new(FakeGeocoder::new().unresolvable("Nowhere").flaky("Busy"));
    let report = processor(&pool, geocoder.clone())
        .run(&BatchOptions::apply())
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.processed, 3);
    assert_eq!(report.changed_count("no_result"), 1);
    assert_eq!(report.changed_count("geocoded"), 1);
    assert_eq!(report.errors, 1);
    // Flaky address tried twice under the retry policy, the others once
    assert_eq!(geocoder.calls(), 4);

    let next = processor(&pool, geocoder.clone())
        .run(&BatchOptions::apply())
        .await
        .unwrap();
    assert_eq!(next.processed, 1, "only the transient failure is retried");
    assert!(geocoder.queries().last().unwrap().contains("Busy"));
}

#[tokio::test]
async fn test_unreadable_response_is_terminal() {
    let (_dir, pool) = create_test_db().await;
    let garbled = seed_location(&pool, NPI_A, &address("3 Static Road", "Ely", "NV", "89301"), SourceTier::Registry).await;
    seed_location(&pool, NPI_B, &address("8 Clear Road", "Ely", "NV", "89301"), SourceTier::Registry).await;

    let geocoder = Arc::new(FakeGeocoder::new().garbled("Static"));
    let report = processor(&pool, geocoder.clone())
        .run(&BatchOptions::apply())
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.changed_count("unreadable"), 1);
    assert_eq!(report.changed_count("geocoded"), 1);
    assert_eq!(report.errors, 0);
    assert_eq!(geocoder.calls(), 2, "an unreadable response is not retried");

    let row = locations::get_location(&pool, garbled).await.unwrap().unwrap();
    assert_eq!(row.geocode_status, Some(GeocodeStatus::NoResult));
    assert!(row.latitude.is_none());

    let next = processor(&pool, geocoder.clone())
        .run(&BatchOptions::apply())
        .await
        .unwrap();
    assert_eq!(next.processed, 0);
    assert_eq!(geocoder.calls(), 2);
}

#[tokio::test]
async fn test_dry_run_estimates_cost_without_calls_or_writes() {
    let (_dir, pool) = create_test_db().await;
    for i in 1..=4 {
        let npi = format!("100000020{}", i);
        seed_location(&pool, &npi, &address(&format!("{} Cedar Drive", i), "Boise", "ID", "83702"), SourceTier::Registry).await;
    }
    // Duplicate of the first address
    seed_location(&pool, NPI_A, &address("1 Cedar Dr", "Boise", "ID", "83702"), SourceTier::Registry).await;

    let geocoder = Arc::new(FakeGeocoder::new());
    let report = processor(&pool, geocoder.clone())
        .run(&BatchOptions::dry_run())
        .await
        .unwrap();

    assert_eq!(geocoder.calls(), 0);
    assert_eq!(report.processed, 4);
    assert!((report.estimated_cost_usd.unwrap() - 0.02).abs() < 1e-9);
    assert_eq!(geocoded_rows(&pool).await, 0);
    assert_eq!(count_rows(&pool, "batch_runs").await, 0);

    let limited = processor(&pool, geocoder.clone())
        .run(&BatchOptions::dry_run().with_limit(3))
        .await
        .unwrap();
    assert_eq!(limited.processed, 3);
}

#[tokio::test]
async fn test_limit_stops_between_addresses() {
    let (_dir, pool) = create_test_db().await;
    for i in 1..=5 {
        let npi = format!("100000030{}", i);
        seed_location(&pool, &npi, &address(&format!("{} Birch Court", i), "Salem", "OR", "97301"), SourceTier::Registry).await;
    }

    let geocoder = Arc::new(FakeGeocoder::new());
    let report = processor(&pool, geocoder.clone())
        .run(&BatchOptions::apply().with_limit(3))
        .await
        .unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(geocoder.calls(), 3);

    processor(&pool, geocoder.clone()).run(&BatchOptions::apply()).await.unwrap();
    assert_eq!(geocoder.calls(), 5);
    assert_eq!(geocoded_rows(&pool).await, 5);
}
