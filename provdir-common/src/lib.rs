//! # Provider Directory Common Library
//!
//! Shared code for the provider directory engine and its tooling:
//! - Source tier ranking used by every ingestion path
//! - Address canonicalization (address identity hash)
//! - Database schema and row models
//! - Bootstrap configuration loading
//! - Timestamp utilities

pub mod address;
pub mod config;
pub mod db;
pub mod error;
pub mod tier;
pub mod time;

pub use error::{Error, Result};
pub use tier::SourceTier;
