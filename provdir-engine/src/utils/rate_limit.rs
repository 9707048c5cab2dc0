//! Rate limiter for external collaborator calls
//!
//! Token bucket (capacity + refill rate) backed by `governor`, optionally combined with a
//! fixed minimum interval between consecutive calls. Acquiring blocks until a token is
//! available; nothing is queued or rejected.
//!
//! Limiters are explicit objects handed to each client so independent runs and test
//! harnesses never share hidden state.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use provdir_common::{Error, Result};
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub struct RateLimiter {
    bucket: governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Token bucket holding at most `capacity` tokens, refilled at `refill_per_second`
    pub fn token_bucket(capacity: u32, refill_per_second: u32) -> Result<Self> {
        let capacity = NonZeroU32::new(capacity)
            .ok_or_else(|| Error::Config("rate limiter capacity must be > 0".to_string()))?;
        let refill = NonZeroU32::new(refill_per_second)
            .ok_or_else(|| Error::Config("rate limiter refill rate must be > 0".to_string()))?;

        let quota = Quota::per_second(refill).allow_burst(capacity);

        Ok(Self {
            bucket: governor::RateLimiter::direct(quota),
            min_interval: Duration::ZERO,
            last_call: Mutex::new(None),
        })
    }

    /// Requests-per-second ceiling with no burst, plus a fixed delay between calls
    pub fn per_second_with_delay(requests_per_second: u32, delay: Duration) -> Result<Self> {
        Ok(Self::token_bucket(1, requests_per_second)?.with_min_interval(delay))
    }

    /// Enforce a fixed minimum interval between consecutive acquisitions
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Wait until a call is permitted
    pub async fn acquire(&self) {
        let mut last = self.last_call.lock().await;

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                tracing::debug!("Rate limiting: waiting {:?} for inter-call delay", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        self.bucket.until_ready().await;

        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(RateLimiter::token_bucket(0, 5).is_err());
        assert!(RateLimiter::token_bucket(5, 0).is_err());
    }

    #[tokio::test]
    async fn test_burst_within_capacity_is_immediate() {
        let limiter = RateLimiter::token_bucket(5, 1).unwrap();
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_acquire_blocks_when_bucket_empty() {
        let limiter = RateLimiter::token_bucket(1, 10).unwrap();
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        // Two refills at 10/s need roughly 200ms
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_min_interval_spaces_calls() {
        let limiter = RateLimiter::token_bucket(10, 100)
            .unwrap()
            .with_min_interval(Duration::from_millis(100));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(190));
    }
}
