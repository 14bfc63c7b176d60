//! Unified Error Type System
//!
//! Centralized error types for the entire application.
//! Provides failure classification for retry decisions and per-item failure records.
//!
//! ## Error Taxonomy
//!
//! - **TransportError**: a generation call failed (transient, rate limited, overloaded,
//!   fatal, deadline exceeded)
//! - **ParseError**: structured output could not be repaired
//! - **ExtractionError**: source content could not be read (encrypted, image-only, corrupted)
//! - **StageStartError**: a mandatory upstream stage did not produce a result
//!
//! Item-level errors are captured into failure records and never abort sibling items.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::client as client_constants;

// =============================================================================
// Transport Errors
// =============================================================================

/// Failure classes of a generation call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// Network hiccup or 5xx - retry with backoff
    Transient,
    /// Provider throttled the request - retry after the signalled delay
    RateLimited,
    /// Provider is overloaded - retry with capped backoff
    Overloaded,
    /// Request rejected - never retried
    Fatal,
    /// Call deadline passed - never retried
    DeadlineExceeded,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "TRANSIENT"),
            Self::RateLimited => write!(f, "RATE_LIMITED"),
            Self::Overloaded => write!(f, "OVERLOADED"),
            Self::Fatal => write!(f, "FATAL"),
            Self::DeadlineExceeded => write!(f, "DEADLINE_EXCEEDED"),
        }
    }
}

impl TransportErrorKind {
    /// Check if this class may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited | Self::Overloaded)
    }
}

/// Classified generation call failure with retry hints
#[derive(Debug, Clone)]
pub struct TransportError {
    /// Failure class for retry decisions
    pub kind: TransportErrorKind,
    /// Detailed error message
    pub message: String,
    /// Provider that produced the error
    pub provider: Option<String>,
    /// Provider-signalled wait before retry
    pub retry_after: Option<Duration>,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(provider) = &self.provider {
            write!(f, "[{}:{}] {}", provider, self.kind, self.message)
        } else {
            write!(f, "[{}] {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for TransportError {}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            provider: None,
            retry_after: None,
        }
    }

    pub fn with_provider(
        kind: TransportErrorKind,
        message: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            provider: Some(provider.into()),
            retry_after: None,
        }
    }

    /// Add provider context to existing error
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Add provider-signalled retry delay
    pub fn retry_after(mut self, duration: Duration) -> Self {
        self.retry_after = Some(duration);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

// =============================================================================
// Error Classifier
// =============================================================================

/// Maps raw provider failures onto [`TransportErrorKind`]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify an error message from any provider
    pub fn classify(message: &str, provider: &str) -> TransportError {
        let lower = message.to_lowercase();

        if lower.contains("rate limit")
            || lower.contains("429")
            || lower.contains("too many requests")
            || lower.contains("quota exceeded")
            || lower.contains("resource_exhausted")
            || lower.contains("resource exhausted")
        {
            let err = TransportError::with_provider(TransportErrorKind::RateLimited, message, provider);
            return match parse_retry_delay(message) {
                Some(delay) => err.retry_after(delay),
                None => err,
            };
        }

        if lower.contains("overloaded")
            || lower.contains("503")
            || lower.contains("service unavailable")
            || lower.contains("capacity")
        {
            return TransportError::with_provider(TransportErrorKind::Overloaded, message, provider);
        }

        if lower.contains("deadline") || lower.contains("timed out") || lower.contains("timeout") {
            return TransportError::with_provider(
                TransportErrorKind::DeadlineExceeded,
                message,
                provider,
            );
        }

        if lower.contains("401")
            || lower.contains("403")
            || lower.contains("400")
            || lower.contains("api key")
            || lower.contains("unauthorized")
            || lower.contains("permission denied")
            || lower.contains("invalid argument")
            || lower.contains("bad request")
            || lower.contains("safety")
            || lower.contains("blocked")
        {
            return TransportError::with_provider(TransportErrorKind::Fatal, message, provider);
        }

        // Connection resets, 5xx and unrecognized failures are retried conservatively
        TransportError::with_provider(TransportErrorKind::Transient, message, provider)
    }

    /// Classify HTTP status code directly (more accurate than string matching)
    pub fn classify_http_status(
        status: u16,
        message: &str,
        provider: &str,
        retry_after: Option<Duration>,
    ) -> TransportError {
        let err = match status {
            429 => TransportError::with_provider(TransportErrorKind::RateLimited, message, provider),
            503 | 529 => {
                TransportError::with_provider(TransportErrorKind::Overloaded, message, provider)
            }
            408 | 504 => TransportError::with_provider(
                TransportErrorKind::DeadlineExceeded,
                message,
                provider,
            ),
            500..=599 => {
                TransportError::with_provider(TransportErrorKind::Transient, message, provider)
            }
            _ => TransportError::with_provider(TransportErrorKind::Fatal, message, provider),
        };

        match retry_after.or_else(|| parse_retry_delay(message)) {
            Some(delay) if err.kind == TransportErrorKind::RateLimited => err.retry_after(delay),
            _ => err,
        }
    }

    /// Classify an application error raised while calling a provider
    pub fn classify_error(err: &CassandraError, provider: &str) -> TransportError {
        match err {
            CassandraError::Transport(inner) => {
                let mut inner = inner.clone();
                if inner.provider.is_none() {
                    inner.provider = Some(provider.to_string());
                }
                inner
            }
            CassandraError::Timeout { .. } => TransportError::with_provider(
                TransportErrorKind::DeadlineExceeded,
                err.to_string(),
                provider,
            ),
            CassandraError::Io(_) => TransportError::with_provider(
                TransportErrorKind::Transient,
                err.to_string(),
                provider,
            ),
            CassandraError::Provider(msg) => Self::classify(msg, provider),
            _ => TransportError::with_provider(TransportErrorKind::Fatal, err.to_string(), provider),
        }
    }
}

/// Extract a provider-signalled delay such as "retry in 12s" or "retryDelay: 30s"
pub fn parse_retry_delay(message: &str) -> Option<Duration> {
    let lower = message.to_lowercase();
    let start = ["retrydelay", "retry after", "retry in", "try again in", "wait "]
        .iter()
        .find_map(|pat| lower.find(pat).map(|pos| pos + pat.len()))?;

    let digits: String = lower[start..]
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let secs: f64 = digits.parse().ok()?;
    if !secs.is_finite() || secs <= 0.0 {
        return None;
    }

    let capped = secs.min(client_constants::MAX_PROVIDER_DELAY_SECS as f64);
    Some(Duration::from_millis((capped * 1000.0) as u64))
}

// =============================================================================
// Parse / Extraction / Stage Errors
// =============================================================================

/// Structured output that no repair strategy could recover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseError {
    pub message: String,
    /// Byte offset into the input where parsing stopped
    pub position: usize,
    pub line: usize,
    pub column: usize,
    /// Bounded excerpt around `position`
    pub excerpt: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unrepairable output at line {} column {}: {} (near `{}`)",
            self.line, self.column, self.message, self.excerpt
        )
    }
}

impl std::error::Error for ParseError {}

/// Why source content could not be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionErrorKind {
    Encrypted,
    ImageOnly,
    Corrupted,
}

impl std::fmt::Display for ExtractionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encrypted => write!(f, "ENCRYPTED"),
            Self::ImageOnly => write!(f, "IMAGE_ONLY"),
            Self::Corrupted => write!(f, "CORRUPTED"),
        }
    }
}

/// A stage could not start because a mandatory upstream did not complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStartError {
    pub stage: String,
    pub missing_upstream: Vec<String>,
}

impl std::fmt::Display for StageStartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "stage '{}' missing required upstream: {}",
            self.stage,
            self.missing_upstream.join(", ")
        )
    }
}

impl std::error::Error for StageStartError {}

// =============================================================================
// Application Error
// =============================================================================

#[derive(Debug, Error)]
pub enum CassandraError {
    // -------------------------------------------------------------------------
    // System Errors (auto From impl)
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // -------------------------------------------------------------------------
    // Call Errors
    // -------------------------------------------------------------------------
    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// Unclassified provider failure (classified by the client)
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Parse error: {0}")]
    Parse(ParseError),

    #[error("Timeout after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    // -------------------------------------------------------------------------
    // Pipeline Errors
    // -------------------------------------------------------------------------
    #[error("Extraction failed for {source_ref}: {kind}")]
    Extraction {
        source_ref: String,
        kind: ExtractionErrorKind,
    },

    #[error("{0}")]
    StageStart(StageStartError),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Invalid response: {0}")]
    Validation(String),

    // -------------------------------------------------------------------------
    // Domain Errors
    // -------------------------------------------------------------------------
    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<TransportError> for CassandraError {
    fn from(err: TransportError) -> Self {
        CassandraError::Transport(err)
    }
}

impl From<ParseError> for CassandraError {
    fn from(err: ParseError) -> Self {
        CassandraError::Parse(err)
    }
}

impl From<StageStartError> for CassandraError {
    fn from(err: StageStartError) -> Self {
        CassandraError::StageStart(err)
    }
}

pub type Result<T> = std::result::Result<T, CassandraError>;

// =============================================================================
// Helper Functions
// =============================================================================

impl CassandraError {
    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn extraction(source_ref: impl Into<String>, kind: ExtractionErrorKind) -> Self {
        Self::Extraction {
            source_ref: source_ref.into(),
            kind,
        }
    }

    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::Transport(TransportError::new(kind, message))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Context extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn with_context<C: Into<String>>(self, context: C) -> Result<T>;

    /// Add context using a closure (lazy evaluation)
    fn with_context_fn<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn with_context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| CassandraError::Storage(format!("{}: {}", context.into(), e)))
    }

    fn with_context_fn<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| CassandraError::Storage(format!("{}: {}", f().into(), e)))
    }
}

// =============================================================================
// Tests
// =============================================================================
