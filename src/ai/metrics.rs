//! Call Metrics Collection
//!
//! Aggregates generation call usage across a run: calls, attempts, retries,
//! failures by class, tokens and latency. Per-stage counters are keyed by the
//! stage prefix of the request label (`"mine:doc-1"` → `mine`).
//!
//! ## Usage
//!
//! ```ignore
//! let metrics = create_shared_metrics(run_id.as_str());
//! let client = ResilientClient::new(provider, policy, limiter).with_metrics(metrics.clone());
//! let summary = metrics.summary();
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::ai::provider::LlmResponse;
use crate::types::TransportErrorKind;

// =============================================================================
// Metrics Collector
// =============================================================================

/// Thread-safe metrics collector shared by every concurrent call.
pub struct MetricsCollector {
    run_id: String,
    start_time: Instant,
    /// Logical calls that succeeded
    calls_succeeded: AtomicU32,
    /// Logical calls that exhausted their attempts or failed fatally
    calls_failed: AtomicU32,
    /// Provider attempts, including retries
    attempts: AtomicU32,
    retries: AtomicU32,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    total_latency_ms: AtomicU64,
    failures_by_kind: DashMap<TransportErrorKind, u32>,
    stages: DashMap<String, StageCallStats>,
}

/// Per-stage call counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageCallStats {
    pub calls: u32,
    pub failed: u32,
    pub attempts: u32,
    pub tokens: u64,
}

/// Summary statistics for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub run_id: String,
    pub total_duration_ms: u64,
    pub calls_succeeded: u32,
    pub calls_failed: u32,
    pub attempts: u32,
    pub retries: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub avg_latency_ms: f64,
    pub failures_by_kind: BTreeMap<String, u32>,
    pub stages: BTreeMap<String, StageCallStats>,
}

fn stage_of(label: &str) -> &str {
    label.split(':').next().unwrap_or(label)
}

impl MetricsCollector {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            start_time: Instant::now(),
            calls_succeeded: AtomicU32::new(0),
            calls_failed: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            retries: AtomicU32::new(0),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            failures_by_kind: DashMap::new(),
            stages: DashMap::new(),
        }
    }

    /// Record one provider attempt (successful or not)
    pub fn record_attempt(&self, label: &str, attempt: u32) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if attempt > 1 {
            self.retries.fetch_add(1, Ordering::Relaxed);
        }
        self.stages
            .entry(stage_of(label).to_string())
            .or_default()
            .attempts += 1;
    }

    /// Record a successful call
    pub fn record_success(&self, label: &str, response: &LlmResponse) {
        self.calls_succeeded.fetch_add(1, Ordering::Relaxed);
        self.input_tokens
            .fetch_add(u64::from(response.usage.input_tokens), Ordering::Relaxed);
        self.output_tokens
            .fetch_add(u64::from(response.usage.output_tokens), Ordering::Relaxed);
        self.total_latency_ms
            .fetch_add(response.timing.total_ms, Ordering::Relaxed);

        let mut stage = self.stages.entry(stage_of(label).to_string()).or_default();
        stage.calls += 1;
        stage.tokens += u64::from(response.usage.total());
    }

    /// Record a call that ended in a classified failure
    pub fn record_failure(&self, label: &str, kind: TransportErrorKind) {
        self.calls_failed.fetch_add(1, Ordering::Relaxed);
        *self.failures_by_kind.entry(kind).or_insert(0) += 1;

        let mut stage = self.stages.entry(stage_of(label).to_string()).or_default();
        stage.calls += 1;
        stage.failed += 1;
    }

    pub fn summary(&self) -> MetricsSummary {
        let calls_succeeded = self.calls_succeeded.load(Ordering::Relaxed);
        let input_tokens = self.input_tokens.load(Ordering::Relaxed);
        let output_tokens = self.output_tokens.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);

        let avg_latency = if calls_succeeded > 0 {
            total_latency as f64 / f64::from(calls_succeeded)
        } else {
            0.0
        };

        MetricsSummary {
            run_id: self.run_id.clone(),
            total_duration_ms: self.start_time.elapsed().as_millis() as u64,
            calls_succeeded,
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            avg_latency_ms: avg_latency,
            failures_by_kind: self
                .failures_by_kind
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
            stages: self
                .stages
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }
}

impl MetricsSummary {
    /// Format summary for display
    pub fn display(&self) -> String {
        format!(
            "Run: {}\n\
             Duration: {:.1}s\n\
             Calls: {} ok, {} failed ({} attempts, {} retries)\n\
             Tokens: {} (input: {}, output: {})\n\
             Avg Latency: {:.0}ms",
            self.run_id,
            self.total_duration_ms as f64 / 1000.0,
            self.calls_succeeded,
            self.calls_failed,
            self.attempts,
            self.retries,
            self.total_tokens,
            self.input_tokens,
            self.output_tokens,
            self.avg_latency_ms,
        )
    }
}

/// Shared metrics collector for pipeline stages
pub type SharedMetrics = Arc<MetricsCollector>;

pub fn create_shared_metrics(run_id: impl Into<String>) -> SharedMetrics {
    Arc::new(MetricsCollector::new(run_id))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::provider::{ResponseTiming, TokenUsage};

    fn response(input: u32, output: u32, ms: u64) -> LlmResponse {
        LlmResponse {
            usage: TokenUsage::new(input, output),
            timing: ResponseTiming { total_ms: ms },
            ..LlmResponse::text_only("{}")
        }
    }

    #[test]
    fn test_record_success_and_failure() {
        let metrics = MetricsCollector::new("run-1");
        metrics.record_attempt("mine:doc-1", 1);
        metrics.record_success("mine:doc-1", &response(100, 50, 400));
        metrics.record_attempt("audit:fig-1", 1);
        metrics.record_attempt("audit:fig-1", 2);
        metrics.record_failure("audit:fig-1", TransportErrorKind::RateLimited);

        let summary = metrics.summary();
        assert_eq!(summary.calls_succeeded, 1);
        assert_eq!(summary.calls_failed, 1);
        assert_eq!(summary.attempts, 3);
        assert_eq!(summary.retries, 1);
        assert_eq!(summary.total_tokens, 150);
        assert_eq!(summary.failures_by_kind["RATE_LIMITED"], 1);
        assert_eq!(summary.stages["audit"].attempts, 2);
        assert_eq!(summary.stages["mine"].tokens, 150);
    }

    #[test]
    fn test_concurrent_recording() {
        let metrics = Arc::new(MetricsCollector::new("run-2"));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let m = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        m.record_attempt(&format!("stage{}:x", i % 2), 1);
                        m.record_success(&format!("stage{}:x", i % 2), &response(1, 1, 1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let summary = metrics.summary();
        assert_eq!(summary.calls_succeeded, 800);
        assert_eq!(summary.stages["stage0"].calls, 400);
    }
}
