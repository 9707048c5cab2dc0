//! Reconciliation and scoring services
//!
//! - Merge engine: the single tier-ranked write path for every ingestion source
//! - Registry auditor and its NPI registry client
//! - Geocoding processor and its geocoder client
//! - Confidence scoring, verification intake and rescoring
//! - Fuzzy plan matcher
//! - JSON-lines import and deactivation cleanup

pub mod confidence_scorer;
pub mod deactivation_cleanup;
pub mod geocoder_client;
pub mod geocoding_processor;
pub mod import_service;
pub mod merge_engine;
pub mod plan_matcher;
pub mod reconciliation;
pub mod registry_client;
pub mod verification_service;

pub use confidence_scorer::{compute_score, tier_default, ScoreInputs, VoteTally};
pub use deactivation_cleanup::DeactivationCleanup;
pub use geocoder_client::{GeocodeError, GeocodeOutcome, Geocoder, GoogleGeocoder};
pub use geocoding_processor::GeocodingProcessor;
pub use import_service::{ImportRecord, ImportService, RecordOutcome};
pub use merge_engine::{
    decide, FieldUpdate, LocationField, MergeDecision, MergeEngine, MergeOutcome, ProviderField,
};
pub use plan_matcher::{MatchClass, PlanMatch, PlanMatchRun, PlanMatcher};
pub use reconciliation::{classify_discrepancies, resolve_discrepancy, Finding, RegistryAuditor};
pub use registry_client::{NppesClient, RegistryError, RegistryLookup, RegistryRecord};
pub use verification_service::{ScoreReading, VerificationInput, VerificationService};
