//! AI Integration Layer
//!
//! Everything between the pipeline and the external generation service:
//! providers, the resilient call client, output repair and context budgeting.

pub mod client;
pub mod context;
pub mod metrics;
pub mod provider;
pub mod rate_limit;
pub mod retry;
pub mod timeout;
pub mod validation;

pub use client::ResilientClient;
pub use context::{BudgetCounts, BudgetedContext, ContextBudgeter};
pub use metrics::{
    MetricsCollector, MetricsSummary, SharedMetrics, StageCallStats, create_shared_metrics,
};
pub use provider::{
    Attachment, GeminiProvider, GenerationRequest, LlmProvider, LlmResponse, OpenAiProvider,
    OutputMode, ResponseMetadata, ResponseTiming, SharedProvider, TokenUsage, create_provider,
};
pub use rate_limit::{RateLimiter, RatePermit, SharedRateLimiter};
pub use retry::{RetryDecision, RetryPolicy};
pub use timeout::{cancellable, sleep_or_cancel, with_timeout};
pub use validation::{ExpectedShape, ParseOutcome, RepairAction, RepairStrategy, RepairTrace, repair};
