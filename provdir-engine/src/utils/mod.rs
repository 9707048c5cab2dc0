//! Utility modules for the engine

pub mod rate_limit;
pub mod record_tx;
pub mod retry;

pub use rate_limit::RateLimiter;
pub use record_tx::RecordTransaction;
pub use retry::{Classify, FailureClass, RetryPolicy};
