//! Generation Provider Abstraction
//!
//! Defines the `LlmProvider` trait used for every external generation call.
//! A request carries a prompt, an optional binary attachment and the output
//! shape the caller expects; providers return raw text plus usage metrics.
//!
//! Providers perform exactly one attempt. Retry, backoff and rate limiting
//! live in [`crate::ai::client::ResilientClient`].

mod gemini;
mod openai;

pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::types::{
    CassandraError, ErrorClassifier, Result, TransportError, TransportErrorKind,
};

// =============================================================================
// Requests
// =============================================================================

/// Binary payload sent alongside the prompt (e.g. an extracted figure)
#[derive(Clone)]
pub struct Attachment {
    pub mime_type: String,
    pub bytes: Arc<[u8]>,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Attachment {
    pub fn new(mime_type: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}

/// Output shape requested from the provider
#[derive(Debug, Clone, PartialEq)]
pub enum OutputMode {
    FreeText,
    /// Schema-constrained JSON output
    Structured { schema: Value },
}

impl OutputMode {
    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Structured { .. })
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Short label used in logs and metrics (e.g. "mine:doc-2:chunk-1")
    pub label: String,
    pub prompt: String,
    pub system: Option<String>,
    pub attachment: Option<Attachment>,
    pub output_mode: OutputMode,
    pub max_output_tokens: u32,
    pub temperature: Option<f32>,
    /// Deadline for the call including retries
    pub deadline: Duration,
}

impl GenerationRequest {
    pub fn new(label: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            prompt: prompt.into(),
            system: None,
            attachment: None,
            output_mode: OutputMode::FreeText,
            max_output_tokens: 4096,
            temperature: None,
            deadline: Duration::from_secs(crate::constants::client::DEFAULT_CALL_DEADLINE_SECS),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn structured(mut self, schema: Value) -> Self {
        self.output_mode = OutputMode::Structured { schema };
        self
    }

    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = max;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Raw generation output with usage metrics
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Generated text, possibly malformed in structured mode
    pub text: String,
    pub usage: TokenUsage,
    pub timing: ResponseTiming,
    pub metadata: ResponseMetadata,
}

impl LlmResponse {
    /// Create response with text only (usage unknown)
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: TokenUsage::default(),
            timing: ResponseTiming::default(),
            metadata: ResponseMetadata::default(),
        }
    }
}

/// Token usage metrics
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Response timing metrics
#[derive(Debug, Clone, Default)]
pub struct ResponseTiming {
    /// Total response time in milliseconds (wall clock)
    pub total_ms: u64,
}

impl ResponseTiming {
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            total_ms: duration.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResponseMetadata {
    pub model: String,
    pub provider: String,
    /// Provider finish reason (e.g. "STOP", "MAX_TOKENS")
    pub finish_reason: Option<String>,
}

/// Shared provider type for concurrent access across pipeline stages.
pub type SharedProvider = Arc<dyn LlmProvider + Send + Sync>;

// =============================================================================
// LLM Provider Trait
// =============================================================================

/// A single-attempt generation backend
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Perform one generation attempt.
    ///
    /// Failures should be returned as `CassandraError::Transport` when the
    /// provider can classify them (HTTP status), otherwise `CassandraError::Provider`.
    async fn generate(&self, request: &GenerationRequest) -> Result<LlmResponse>;

    /// Provider name for logging
    fn name(&self) -> &str;

    /// Model name currently in use
    fn model(&self) -> &str;

    /// Check if the provider is reachable
    async fn health_check(&self) -> Result<bool>;
}

/// Create a shared provider from configuration
pub fn create_provider(config: &LlmConfig) -> Result<SharedProvider> {
    match config.provider.as_str() {
        "gemini" => Ok(Arc::new(GeminiProvider::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiProvider::new(config)?)),
        _ => Err(CassandraError::Config(format!(
            "Unknown provider: {}. Supported: gemini, openai",
            config.provider
        ))),
    }
}

// =============================================================================
// HTTP helpers shared by providers
// =============================================================================

/// Build the HTTP client used by REST providers
pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(
            crate::constants::network::CONNECTION_TIMEOUT_SECS,
        ))
        .build()
        .map_err(|e| CassandraError::Config(format!("Failed to create HTTP client: {}", e)))
}

/// Classify a transport-level reqwest failure
pub(crate) fn send_error(err: reqwest::Error, provider: &str) -> CassandraError {
    let kind = if err.is_timeout() {
        TransportErrorKind::DeadlineExceeded
    } else if err.is_builder() {
        TransportErrorKind::Fatal
    } else {
        TransportErrorKind::Transient
    };
    CassandraError::Transport(TransportError::with_provider(
        kind,
        format!("request failed: {}", err),
        provider,
    ))
}

/// Turn a non-success HTTP response into a classified error
pub(crate) async fn status_error(response: reqwest::Response, provider: &str) -> CassandraError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();

    CassandraError::Transport(ErrorClassifier::classify_http_status(
        status,
        &format!("{} API error ({}): {}", provider, status, body),
        provider,
        retry_after,
    ))
}

/// System instruction used in structured mode
pub(crate) fn structured_instruction(system: Option<&str>, schema: &Value) -> String {
    let schema_str =
        serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    format!(
        "{}\n\nRespond ONLY with valid JSON matching this schema:\n\n```json\n{}\n```",
        system.unwrap_or("You are a meticulous research analyst."),
        schema_str
    )
}
