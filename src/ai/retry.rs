//! Retry Policy
//!
//! Explicit retry policy consulted by the resilient client between attempts:
//! - Hard cap on attempts per call
//! - Per-failure-class exponential backoff (base, cap)
//! - Provider-signalled delays preferred for rate limiting
//! - Fatal and deadline failures are never retried

use std::time::Duration;

use rand::Rng;

use crate::config::{BackoffRule, ClientConfig};
use crate::constants::client as client_constants;
use crate::types::{TransportError, TransportErrorKind};

/// Outcome of consulting the policy after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then retry
    RetryAfter(Duration),
    /// Stop and surface the error
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_factor: f64,
    pub jitter: bool,
    pub transient: BackoffRule,
    pub rate_limited: BackoffRule,
    pub overloaded: BackoffRule,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_factor: config.backoff_factor,
            jitter: config.jitter,
            transient: config.transient,
            rate_limited: config.rate_limited,
            overloaded: config.overloaded,
        }
    }

    /// Policy that never waits (for tests and dry runs)
    pub fn immediate(max_attempts: u32) -> Self {
        let zero = BackoffRule::new(0, 0);
        Self {
            max_attempts: max_attempts.max(1),
            backoff_factor: 1.0,
            jitter: false,
            transient: zero,
            rate_limited: zero,
            overloaded: zero,
        }
    }

    pub fn is_retryable(&self, kind: TransportErrorKind) -> bool {
        kind.is_retryable()
    }

    fn rule_for(&self, kind: TransportErrorKind) -> Option<&BackoffRule> {
        match kind {
            TransportErrorKind::Transient => Some(&self.transient),
            TransportErrorKind::RateLimited => Some(&self.rate_limited),
            TransportErrorKind::Overloaded => Some(&self.overloaded),
            TransportErrorKind::Fatal | TransportErrorKind::DeadlineExceeded => None,
        }
    }

    /// Backoff without jitter: `min(base * factor^(attempt-1), cap)`
    pub fn base_delay(&self, kind: TransportErrorKind, attempt: u32) -> Option<Duration> {
        let rule = self.rule_for(kind)?;
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let raw_ms = rule.base_ms as f64 * self.backoff_factor.powi(exp);
        let capped = raw_ms.min(rule.cap_ms as f64);
        Some(Duration::from_millis(capped as u64))
    }

    /// Decide what to do after `attempt` (1-based) failed with `error`
    pub fn decide(&self, error: &TransportError, attempt: u32) -> RetryDecision {
        if !self.is_retryable(error.kind) || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        if error.kind == TransportErrorKind::RateLimited
            && let Some(hint) = error.retry_after
        {
            let max = Duration::from_secs(client_constants::MAX_PROVIDER_DELAY_SECS);
            return RetryDecision::RetryAfter(hint.min(max));
        }

        match self.base_delay(error.kind, attempt) {
            Some(delay) if self.jitter => RetryDecision::RetryAfter(delay + random_jitter(delay)),
            Some(delay) => RetryDecision::RetryAfter(delay),
            None => RetryDecision::GiveUp,
        }
    }
}

/// Up to 25% of the base delay
fn random_jitter(base_delay: Duration) -> Duration {
    let max_jitter_ms = (base_delay.as_millis() as u64) / 4;
    if max_jitter_ms == 0 {
        return Duration::ZERO;
    }
    let jitter_ms = rand::rng().random_range(0..max_jitter_ms);
    Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn err(kind: TransportErrorKind) -> TransportError {
        TransportError::new(kind, "boom")
    }

    #[test]
    fn test_fatal_and_deadline_never_retry() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(&err(TransportErrorKind::Fatal), 1),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy.decide(&err(TransportErrorKind::DeadlineExceeded), 1),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_attempt_cap() {
        let policy = RetryPolicy::immediate(3);
        let e = err(TransportErrorKind::Transient);
        assert_eq!(policy.decide(&e, 2), RetryDecision::RetryAfter(Duration::ZERO));
        assert_eq!(policy.decide(&e, 3), RetryDecision::GiveUp);
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let mut policy = RetryPolicy::default();
        policy.jitter = false;
        policy.transient = BackoffRule::new(1_000, 5_000);
        let kind = TransportErrorKind::Transient;
        assert_eq!(policy.base_delay(kind, 1), Some(Duration::from_millis(1_000)));
        assert_eq!(policy.base_delay(kind, 2), Some(Duration::from_millis(2_000)));
        assert_eq!(policy.base_delay(kind, 3), Some(Duration::from_millis(4_000)));
        assert_eq!(policy.base_delay(kind, 4), Some(Duration::from_millis(5_000)));
    }

    #[test]
    fn test_rate_limit_prefers_provider_hint() {
        let policy = RetryPolicy::default();
        let e = err(TransportErrorKind::RateLimited).retry_after(Duration::from_secs(7));
        assert_eq!(
            policy.decide(&e, 1),
            RetryDecision::RetryAfter(Duration::from_secs(7))
        );
    }

    proptest! {
        #[test]
        fn prop_delay_within_cap_plus_jitter(attempt in 1u32..20, base in 1u64..5_000, extra in 0u64..60_000) {
            let mut policy = RetryPolicy::default();
            policy.max_attempts = 100;
            policy.overloaded = BackoffRule::new(base, base + extra);
            let cap = Duration::from_millis(base + extra);
            match policy.decide(&err(TransportErrorKind::Overloaded), attempt) {
                RetryDecision::RetryAfter(d) => prop_assert!(d <= cap + cap / 4),
                RetryDecision::GiveUp => prop_assert!(false, "overload should retry"),
            }
        }
    }
}
