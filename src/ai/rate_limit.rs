//! Shared Rate Limiter
//!
//! One limiter is shared by every concurrent call made through the resilient
//! client. It bounds both calls in flight (semaphore) and sustained request
//! rate (token bucket with burst).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::trace;

use crate::config::RateLimitConfig;
use crate::types::{CassandraError, Result};

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_second: f64, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            tokens: capacity,
            capacity,
            per_second,
            last_refill: Instant::now(),
        }
    }

    /// Take one token, or report how long until one is available
    fn try_take(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.per_second).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(missing / self.per_second))
        }
    }
}

/// Held for the duration of one provider attempt
#[derive(Debug)]
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

pub struct RateLimiter {
    permits: Arc<Semaphore>,
    bucket: Mutex<TokenBucket>,
    max_concurrent: usize,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_concurrent", &self.max_concurrent)
            .field("available", &self.permits.available_permits())
            .finish()
    }
}

pub type SharedRateLimiter = Arc<RateLimiter>;

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            bucket: Mutex::new(TokenBucket::new(config.requests_per_second, config.burst)),
            max_concurrent,
        }
    }

    /// Effectively unlimited limiter (tests)
    pub fn unlimited() -> Self {
        Self::new(&RateLimitConfig {
            max_concurrent: Semaphore::MAX_PERMITS.min(1 << 16),
            requests_per_second: 1e9,
            burst: u32::MAX,
        })
    }

    /// Wait for a concurrency slot and a rate token
    pub async fn acquire(&self) -> Result<RatePermit> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CassandraError::Workflow("rate limiter closed".to_string()))?;

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                match bucket.try_take(Instant::now()) {
                    Ok(()) => break,
                    Err(wait) => wait,
                }
            };
            trace!(wait_ms = wait.as_millis() as u64, "Rate limited locally");
            tokio::time::sleep(wait).await;
        }

        Ok(RatePermit { _permit: permit })
    }

    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }
}
