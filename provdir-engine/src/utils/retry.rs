//! Retry policy for external collaborator calls
//!
//! One policy object shared by the registry and geocoding clients: bounded attempts,
//! exponential backoff, and a classifier deciding whether a failure is worth retrying.
//!
//! **Algorithm:**
//! 1. Attempt operation
//! 2. If successful, return result
//! 3. If the error is [`FailureClass::Retryable`] and attempts remain: log WARN, back off, retry
//! 4. If the error is [`FailureClass::Terminal`] or [`FailureClass::Fatal`]: return it immediately
//! 5. If attempts are exhausted: log ERROR, return the last error

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// How a failed external call should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transient (network, rate limit, server hiccup): retry with backoff
    Retryable,
    /// Permanent for this record (bad input, unparseable response): skip the record
    Terminal,
    /// Systemic misconfiguration (authorization): abort the whole run
    Fatal,
}

/// Errors that can be classified for retry purposes
pub trait Classify {
    fn classify(&self) -> FailureClass;
}

/// Bounded exponential-backoff retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    /// Policy with `max_attempts` and the default backoff curve (250ms doubling, capped at 8s)
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
            multiplier: 2,
        }
    }

    /// Policy without sleeping between attempts (tests)
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Backoff before retry number `retry` (1-based)
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `operation` under this policy
    ///
    /// # Arguments
    /// * `operation_name` - Name for logging (e.g. "registry lookup 1234567893")
    /// * `operation` - Closure producing one attempt
    ///
    /// # Returns
    /// The first success, or the error that ended the retry loop
    pub async fn run<T, E, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        E: Classify + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(
                            operation = operation_name,
                            attempt,
                            "External call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let class = err.classify();
                    if class != FailureClass::Retryable {
                        return Err(err);
                    }

                    if attempt >= self.max_attempts {
                        tracing::error!(
                            operation = operation_name,
                            attempt,
                            error = %err,
                            "External call failed: retries exhausted"
                        );
                        return Err(err);
                    }

                    let backoff = self.backoff_for(attempt);
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Transient external failure, will retry after backoff"
                    );

                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(FailureClass);

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }

    impl Classify for TestError {
        fn classify(&self) -> FailureClass {
            self.0
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10);
        assert_eq!(policy.backoff_for(1), Duration::from_millis(250));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(8));
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_attempt() {
        let result = RetryPolicy::immediate(3)
            .run("test_op", || async { Ok::<i32, TestError>(42) })
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retryable_errors_retried_until_success() {
        let attempts = AtomicU32::new(0);
        let result = RetryPolicy::immediate(3)
            .run("test_op", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(TestError(FailureClass::Retryable))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retryable_errors_exhaust_attempts() {
        let attempts = AtomicU32::new(0);
        let result = RetryPolicy::immediate(3)
            .run("test_op", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError(FailureClass::Retryable)) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_and_terminal_errors_not_retried() {
        for class in [FailureClass::Fatal, FailureClass::Terminal] {
            let attempts = AtomicU32::new(0);
            let result = RetryPolicy::immediate(5)
                .run("test_op", || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async move { Err::<(), _>(TestError(class)) }
                })
                .await;
            assert_eq!(result.unwrap_err().classify(), class);
            assert_eq!(attempts.load(Ordering::SeqCst), 1);
        }
    }
}
