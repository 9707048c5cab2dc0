//! provdir-engine library interface
//!
//! Provenance-aware reconciliation and confidence scoring for the provider directory.
//! Exposes the batch services and repositories for the `provdir` binary and for
//! integration testing.

pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod utils;

pub use models::{BatchKind, BatchOptions, BatchReport, RunState};
