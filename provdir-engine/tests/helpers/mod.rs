//! Test Helper Utilities
//!
//! Shared fixtures for provdir-engine integration tests: an on-disk database per test,
//! seed helpers, and in-process fakes for the registry and geocoder collaborators.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provdir_common::address::AddressParts;
use provdir_common::db::{init_database, InsurancePlan};
use provdir_common::SourceTier;
use provdir_engine::db::plans;
use provdir_engine::services::{
    FieldUpdate, GeocodeError, GeocodeOutcome, Geocoder, MergeEngine, ProviderField,
    RegistryError, RegistryLookup, RegistryRecord,
};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;

pub const NPI_A: &str = "1000000001";
pub const NPI_B: &str = "1000000002";
pub const NPI_C: &str = "1000000003";

/// Create a temporary database with the full schema
///
/// Returns (TempDir, SqlitePool) - TempDir must be kept alive for duration of test
pub async fn create_test_db() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().expect("temp dir");
    let pool = init_database(&temp_dir.path().join("provdir_test.db"))
        .await
        .expect("init database");
    (temp_dir, pool)
}

pub fn ts(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

pub async fn seed_plan(
    pool: &SqlitePool,
    plan_id: &str,
    plan_name: &str,
    carrier: Option<&str>,
    issuer: Option<&str>,
) {
    let plan = InsurancePlan {
        plan_id: plan_id.to_string(),
        plan_name: Some(plan_name.to_string()),
        carrier_name: carrier.map(str::to_string),
        issuer_name: issuer.map(str::to_string),
        plan_type: None,
    };
    plans::upsert_plan(pool, &plan, provdir_common::time::now())
        .await
        .expect("seed plan");
}

/// Seed a provider through the merge engine
pub async fn seed_provider(pool: &SqlitePool, npi: &str, tier: SourceTier, fields: &[(ProviderField, &str)]) {
    let updates: Vec<_> = fields
        .iter()
        .map(|(field, value)| FieldUpdate::new(*field, *value))
        .collect();
    MergeEngine::new(pool.clone())
        .apply_provider(npi, &updates, tier)
        .await
        .expect("seed provider");
}

pub fn address(line1: &str, city: &str, state: &str, zip: &str) -> AddressParts {
    AddressParts::new(line1, None, city, state, zip)
}

/// Seed a practice location through the merge engine
pub async fn seed_location(pool: &SqlitePool, npi: &str, address: &AddressParts, tier: SourceTier) -> i64 {
    let (id, _) = MergeEngine::new(pool.clone())
        .apply_location(npi, address, &[], tier)
        .await
        .expect("seed location");
    id
}

pub async fn count_rows(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .expect("count rows")
}

/// How a fake collaborator should fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    Denied,
    Transient,
}

/// Registry fake: answers from a map, counts calls, fails on selected NPIs
#[derive(Default)]
pub struct FakeRegistry {
    records: Mutex<HashMap<String, RegistryRecord>>,
    failures: Mutex<HashMap<String, FakeFailure>>,
    calls: AtomicUsize,
    garbled: Vec<String>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(self, record: RegistryRecord) -> Self {
        self.records
            .lock()
            .unwrap()
            .insert(record.npi.clone(), record);
        self
    }

    pub fn failing(self, npi: &str, failure: FakeFailure) -> Self {
        self.failures.lock().unwrap().insert(npi.to_string(), failure);
        self
    }

    pub fn garbled(mut self, fragment: &str) -> Self {
        self.garbled.push(fragment.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryLookup for FakeRegistry {
    async fn fetch(&self, npi: &str) -> Result<Option<RegistryRecord>, RegistryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failures.lock().unwrap().get(npi) {
            Some(FakeFailure::Denied) => return Err(RegistryError::Denied(403, "forbidden".to_string())),
            Some(FakeFailure::Transient) => return Err(RegistryError::Unavailable(503)),
            None => {}
        }
        Ok(self.records.lock().unwrap().get(npi).cloned())
    }
}

/// Registry record for an individual with the usual fields filled in
pub fn registry_individual(npi: &str, first: &str, last: &str, state: &str) -> RegistryRecord {
    RegistryRecord {
        npi: npi.to_string(),
        entity_kind: Some("individual".to_string()),
        first_name: Some(first.to_string()),
        last_name: Some(last.to_string()),
        credential: Some("MD".to_string()),
        taxonomy_code: Some("207Q00000X".to_string()),
        practice_states: vec![state.to_string()],
        ..RegistryRecord::default()
    }
}

/// Geocoder fake: deterministic coordinates, call counting, optional denial at the Nth call
#[derive(Default)]
pub struct FakeGeocoder {
    calls: AtomicUsize,
    deny_at_call: Option<usize>,
    /// Address substrings answered with `NoResult`
    unresolvable: Vec<String>,
    /// Address substrings answered with a transient failure
    flaky: Vec<String>,
    /// Address substrings answered with an unparseable response
    garbled: Vec<String>,
    queries: Mutex<Vec<String>>,
}

impl FakeGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_at_call(mut self, call: usize) -> Self {
        self.deny_at_call = Some(call);
        self
    }

    pub fn unresolvable(mut self, fragment: &str) -> Self {
        self.unresolvable.push(fragment.to_string());
        self
    }

    pub fn flaky(mut self, fragment: &str) -> Self {
        self.flaky.push(fragment.to_string());
        self
    }

    pub fn garbled(mut self, fragment: &str) -> Self {
        self.garbled.push(fragment.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Geocoder for FakeGeocoder {
    async fn geocode(&self, address: &str) -> Result<GeocodeOutcome, GeocodeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.queries.lock().unwrap().push(address.to_string());

        if self.deny_at_call == Some(call) {
            return Err(GeocodeError::RequestDenied("API key revoked".to_string()));
        }
        if self.unresolvable.iter().any(|f| address.contains(f.as_str())) {
            return Ok(GeocodeOutcome::NoResult);
        }
        if self.flaky.iter().any(|f| address.contains(f.as_str())) {
            return Err(GeocodeError::OverQueryLimit);
        }
        if self.garbled.iter().any(|f| address.contains(f.as_str())) {
            return Err(GeocodeError::ParseError("Unexpected status MAINTENANCE".to_string()));
        }
        Ok(GeocodeOutcome::Found {
            latitude: 40.0 + call as f64 / 100.0,
            longitude: -75.0 - call as f64 / 100.0,
        })
    }
}
