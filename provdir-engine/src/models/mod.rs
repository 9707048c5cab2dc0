//! Data models for the engine
//!
//! - Batch run state machine and report shared by every batch entry point

pub mod batch_run;

pub use batch_run::{BatchKind, BatchOptions, BatchReport, RunState};
