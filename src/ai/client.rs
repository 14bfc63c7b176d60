//! Resilient Call Client
//!
//! Every generation request in the pipeline goes through [`ResilientClient::invoke`]:
//!
//! ## Features
//!
//! - **Classification**: provider failures become `TransportErrorKind`
//! - **Retry Policy**: explicit per-class backoff with jitter and an attempt cap
//! - **Deadlines**: each call carries a deadline covering all attempts
//! - **Cancellation**: checked before each attempt and during backoff sleeps
//! - **Rate Limiting**: a shared limiter gates every attempt
//!
//! One structured log record is emitted per attempt with `attempt`,
//! `classification` and `delay_ms` fields.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::metrics::SharedMetrics;
use super::provider::{GenerationRequest, LlmResponse, SharedProvider};
use super::rate_limit::{RateLimiter, SharedRateLimiter};
use super::retry::{RetryDecision, RetryPolicy};
use super::timeout::{cancellable, sleep_or_cancel, with_timeout};
use crate::types::{
    CassandraError, ErrorClassifier, Result, TransportError, TransportErrorKind,
};

#[derive(Clone)]
pub struct ResilientClient {
    provider: SharedProvider,
    policy: RetryPolicy,
    limiter: SharedRateLimiter,
    metrics: Option<SharedMetrics>,
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("provider", &self.provider.name())
            .field("model", &self.provider.model())
            .field("policy", &self.policy)
            .finish()
    }
}

impl ResilientClient {
    pub fn new(provider: SharedProvider, policy: RetryPolicy, limiter: SharedRateLimiter) -> Self {
        Self {
            provider,
            policy,
            limiter,
            metrics: None,
        }
    }

    /// Client without local rate limiting (tests, single calls)
    pub fn unlimited(provider: SharedProvider, policy: RetryPolicy) -> Self {
        Self::new(provider, policy, Arc::new(RateLimiter::unlimited()))
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    /// Execute a generation call with retry, backoff, deadline and cancellation.
    ///
    /// Returns the raw response text, `CassandraError::Transport` carrying the last
    /// classified failure, or `CassandraError::Cancelled`.
    #[instrument(skip(self, request, cancel), fields(label = %request.label, provider = %self.provider.name()))]
    pub async fn invoke(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse> {
        let provider_name = self.provider.name().to_string();
        let deadline = Instant::now() + request.deadline;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            if cancel.is_cancelled() {
                return Err(CassandraError::cancelled(&request.label));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let err = TransportError::with_provider(
                    TransportErrorKind::DeadlineExceeded,
                    format!("deadline of {:?} exhausted before attempt {}", request.deadline, attempt),
                    &provider_name,
                );
                return Err(self.give_up(request, attempt, err));
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CassandraError::cancelled(&request.label)),
                permit = self.limiter.acquire() => permit?,
            };

            if let Some(metrics) = &self.metrics {
                metrics.record_attempt(&request.label, attempt);
            }

            let outcome = cancellable(
                cancel,
                with_timeout(remaining, self.provider.generate(request), &request.label),
                &request.label,
            )
            .await;
            drop(permit);

            let error = match outcome {
                Ok(response) => {
                    debug!(
                        attempt,
                        classification = "OK",
                        delay_ms = 0u64,
                        chars = response.text.len(),
                        "Generation attempt succeeded"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_success(&request.label, &response);
                    }
                    return Ok(response);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => ErrorClassifier::classify_error(&e, &provider_name),
            };

            match self.policy.decide(&error, attempt) {
                RetryDecision::RetryAfter(delay) => {
                    if Instant::now() + delay >= deadline {
                        let err = TransportError {
                            kind: TransportErrorKind::DeadlineExceeded,
                            message: format!(
                                "retry delay {:?} would pass the call deadline; last error: {}",
                                delay, error.message
                            ),
                            ..error
                        };
                        return Err(self.give_up(request, attempt, err));
                    }

                    warn!(
                        attempt,
                        classification = %error.kind,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Generation attempt failed, retrying"
                    );

                    if !sleep_or_cancel(cancel, delay).await {
                        return Err(CassandraError::cancelled(&request.label));
                    }
                }
                RetryDecision::GiveUp => return Err(self.give_up(request, attempt, error)),
            }
        }
    }

    fn give_up(
        &self,
        request: &GenerationRequest,
        attempt: u32,
        error: TransportError,
    ) -> CassandraError {
        warn!(
            attempt,
            classification = %error.kind,
            delay_ms = 0u64,
            error = %error,
            "Generation call failed"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_failure(&request.label, error.kind);
        }
        CassandraError::Transport(error)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ai::metrics::create_shared_metrics;
    use crate::ai::provider::LlmProvider;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Provider that replays a script of outcomes, then keeps returning the fallback
    pub(crate) struct ScriptedProvider {
        script: Mutex<VecDeque<Result<String>>>,
        fallback: String,
        pub calls: AtomicU32,
        delay: Duration,
    }

    impl ScriptedProvider {
        pub(crate) fn new(script: Vec<Result<String>>, fallback: &str) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback: fallback.to_string(),
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn generate(&self, _request: &GenerationRequest) -> Result<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(text)) => Ok(LlmResponse::text_only(text)),
                Some(Err(e)) => Err(e),
                None => Ok(LlmResponse::text_only(self.fallback.clone())),
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "scripted-model"
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    type Responder = dyn Fn(&GenerationRequest) -> Result<String> + Send + Sync;

    /// Provider that answers each request through a closure (routes on label)
    pub(crate) struct RoutedProvider {
        respond: Box<Responder>,
        pub calls: AtomicU32,
    }

    impl RoutedProvider {
        pub(crate) fn new(
            respond: impl Fn(&GenerationRequest) -> Result<String> + Send + Sync + 'static,
        ) -> Self {
            Self {
                respond: Box::new(respond),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for RoutedProvider {
        async fn generate(&self, request: &GenerationRequest) -> Result<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.respond)(request).map(LlmResponse::text_only)
        }

        fn name(&self) -> &str {
            "routed"
        }

        fn model(&self) -> &str {
            "routed-model"
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    fn transport(kind: TransportErrorKind) -> Result<String> {
        Err(CassandraError::transport(kind, "scripted failure"))
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("test:item", "prompt").with_deadline(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let provider = Arc::new(ScriptedProvider::new(
            vec![transport(TransportErrorKind::Transient)],
            "ok",
        ));
        let metrics = create_shared_metrics("run");
        let client = ResilientClient::unlimited(provider.clone(), RetryPolicy::immediate(3))
            .with_metrics(metrics.clone());

        let response = client
            .invoke(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.text, "ok");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.summary().retries, 1);
    }

    #[tokio::test]
    async fn test_fatal_not_retried() {
        let provider = Arc::new(ScriptedProvider::new(
            vec![transport(TransportErrorKind::Fatal)],
            "ok",
        ));
        let client = ResilientClient::unlimited(provider.clone(), RetryPolicy::immediate(5));

        let err = client
            .invoke(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CassandraError::Transport(TransportError { kind: TransportErrorKind::Fatal, .. })
        ));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let provider = Arc::new(ScriptedProvider::new(
            vec![
                transport(TransportErrorKind::Transient),
                transport(TransportErrorKind::Overloaded),
                transport(TransportErrorKind::RateLimited),
            ],
            "ok",
        ));
        let client = ResilientClient::unlimited(provider.clone(), RetryPolicy::immediate(3));

        let err = client
            .invoke(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            CassandraError::Transport(e) => assert_eq!(e.kind, TransportErrorKind::RateLimited),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unclassified_provider_error_is_classified() {
        let provider = Arc::new(ScriptedProvider::new(
            vec![Err(CassandraError::Provider("429 quota exceeded".into()))],
            "ok",
        ));
        let client = ResilientClient::unlimited(provider.clone(), RetryPolicy::immediate(2));
        let response = client
            .invoke(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.text, "ok");
    }

    #[tokio::test]
    async fn test_deadline_exceeded_not_retried() {
        let provider = Arc::new(
            ScriptedProvider::new(Vec::new(), "late").with_delay(Duration::from_millis(200)),
        );
        let client = ResilientClient::unlimited(provider.clone(), RetryPolicy::immediate(5));
        let req = request().with_deadline(Duration::from_millis(20));

        let err = client.invoke(&req, &CancellationToken::new()).await.unwrap_err();
        match err {
            CassandraError::Transport(e) => {
                assert_eq!(e.kind, TransportErrorKind::DeadlineExceeded)
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_during_backoff() {
        let provider = Arc::new(ScriptedProvider::new(
            vec![transport(TransportErrorKind::Overloaded)],
            "ok",
        ));
        let mut policy = RetryPolicy::immediate(5);
        policy.overloaded = crate::config::BackoffRule::new(2_000, 2_000);
        let client = ResilientClient::unlimited(provider.clone(), policy);

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = client.invoke(&request(), &token).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let provider = Arc::new(ScriptedProvider::new(Vec::new(), "ok"));
        let client = ResilientClient::unlimited(provider.clone(), RetryPolicy::immediate(2));
        let token = CancellationToken::new();
        token.cancel();

        assert!(client.invoke(&request(), &token).await.unwrap_err().is_cancelled());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }
}
