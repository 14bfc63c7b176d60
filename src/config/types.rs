//! Configuration Types
//!
//! All configuration structures with sensible defaults.
//! Supports global (~/.config/cassandra/) and project (.cassandra/) level configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    client, context, network, pipeline, rate_limit, scoring, synthesis,
};
use crate::types::{CassandraError, Result};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration version
    pub version: String,

    /// Generation provider settings
    pub llm: LlmConfig,

    /// Retry and backoff policy for generation calls
    pub client: ClientConfig,

    /// Shared request budget across all concurrent calls
    pub rate_limit: RateLimitConfig,

    /// Stage DAG settings
    pub pipeline: PipelineConfig,

    /// Synthesis context sizing
    pub context: ContextConfig,

    /// Risk scoring weights and scales
    pub scoring: ScoringConfig,

    /// Segmented report generation
    pub synthesis: SynthesisConfig,

    /// Finding persistence
    pub storage: StorageConfig,

    /// Report output
    pub output: OutputConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            llm: LlmConfig::default(),
            client: ClientConfig::default(),
            rate_limit: RateLimitConfig::default(),
            pipeline: PipelineConfig::default(),
            context: ContextConfig::default(),
            scoring: ScoringConfig::default(),
            synthesis: SynthesisConfig::default(),
            storage: StorageConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Config {
    /// Validate configuration values are within acceptable ranges.
    /// Returns `CassandraError::Config` on validation failure.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(CassandraError::Config(format!(
                "LLM temperature must be between 0.0 and 2.0, got {}",
                self.llm.temperature
            )));
        }

        if self.llm.timeout_secs == 0 {
            return Err(CassandraError::Config(
                "LLM timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.client.max_attempts == 0 {
            return Err(CassandraError::Config(
                "client.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.client.backoff_factor < 1.0 {
            return Err(CassandraError::Config(format!(
                "client.backoff_factor must be >= 1.0, got {}",
                self.client.backoff_factor
            )));
        }

        for (name, rule) in [
            ("transient", &self.client.transient),
            ("rate_limited", &self.client.rate_limited),
            ("overloaded", &self.client.overloaded),
        ] {
            if rule.base_ms > rule.cap_ms {
                return Err(CassandraError::Config(format!(
                    "client.{}: base_ms ({}) exceeds cap_ms ({})",
                    name, rule.base_ms, rule.cap_ms
                )));
            }
        }

        if self.rate_limit.max_concurrent == 0 || self.rate_limit.burst == 0 {
            return Err(CassandraError::Config(
                "rate_limit.max_concurrent and rate_limit.burst must be greater than 0"
                    .to_string(),
            ));
        }

        let rps = self.rate_limit.requests_per_second;
        if !rps.is_finite() || rps <= 0.0 {
            return Err(CassandraError::Config(format!(
                "rate_limit.requests_per_second must be positive, got {}",
                self.rate_limit.requests_per_second
            )));
        }

        if self.pipeline.default_concurrency == 0
            || self.pipeline.concurrency.values().any(|&c| c == 0)
        {
            return Err(CassandraError::Config(
                "pipeline concurrency limits must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.chunk_overlap_pct >= 50 {
            return Err(CassandraError::Config(format!(
                "pipeline.chunk_overlap_pct must be below 50, got {}",
                self.pipeline.chunk_overlap_pct
            )));
        }

        if self.context.max_chars == 0 {
            return Err(CassandraError::Config(
                "context.max_chars must be greater than 0".to_string(),
            ));
        }

        self.scoring.weights.validate()?;

        Ok(())
    }
}

// =============================================================================
// LLM Configuration
// =============================================================================

/// Generation provider settings
///
/// Note: the API key is never serialized to output and is redacted in debug output.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider type: "gemini", "openai"
    pub provider: String,

    /// Model name
    pub model: String,

    /// API key (falls back to the provider's environment variable)
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// HTTP request timeout in seconds
    pub timeout_secs: u64,

    /// Default temperature when a call does not set its own
    pub temperature: f32,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_base", &self.api_base)
            .field("timeout_secs", &self.timeout_secs)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            model: "gemini-2.0-flash".to_string(),
            api_key: None,
            api_base: None,
            timeout_secs: network::DEFAULT_TIMEOUT_SECS,
            temperature: 0.3,
        }
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Exponential backoff rule for one failure class
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackoffRule {
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl BackoffRule {
    pub const fn new(base_ms: u64, cap_ms: u64) -> Self {
        Self { base_ms, cap_ms }
    }

    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn cap(&self) -> Duration {
        Duration::from_millis(self.cap_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Hard cap on attempts per call
    pub max_attempts: u32,

    /// Multiplier applied per attempt
    pub backoff_factor: f64,

    /// Add random jitter to computed delays
    pub jitter: bool,

    pub transient: BackoffRule,
    pub rate_limited: BackoffRule,
    pub overloaded: BackoffRule,

    /// Deadline for one call including its retries, in seconds
    pub call_deadline_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_attempts: client::MAX_ATTEMPTS,
            backoff_factor: client::BACKOFF_FACTOR,
            jitter: true,
            transient: BackoffRule::new(client::TRANSIENT_BASE_MS, client::TRANSIENT_CAP_MS),
            rate_limited: BackoffRule::new(
                client::RATE_LIMITED_BASE_MS,
                client::RATE_LIMITED_CAP_MS,
            ),
            overloaded: BackoffRule::new(client::OVERLOADED_BASE_MS, client::OVERLOADED_CAP_MS),
            call_deadline_secs: client::DEFAULT_CALL_DEADLINE_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum calls in flight across all stages
    pub max_concurrent: usize,

    /// Sustained call rate
    pub requests_per_second: f64,

    /// Calls allowed back-to-back before the sustained rate applies
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent: rate_limit::MAX_CONCURRENT_CALLS,
            requests_per_second: rate_limit::REQUESTS_PER_SECOND,
            burst: rate_limit::BURST,
        }
    }
}

// =============================================================================
// Pipeline Configuration
// =============================================================================

/// Override for the mandatory flag of one DAG edge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyConfig {
    pub stage: String,
    pub upstream: String,
    pub mandatory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Work item concurrency per stage name
    pub concurrency: BTreeMap<String, usize>,

    /// Concurrency for stages without an explicit entry
    pub default_concurrency: usize,

    /// Documents handed to each analysis stage
    pub max_documents: usize,

    /// Documents requested from search
    pub max_search_results: usize,

    /// Whole-run timeout in seconds
    pub timeout_secs: u64,

    /// Evidence mining chunk size in characters
    pub chunk_chars: usize,

    /// Overlap between chunks in percent
    pub chunk_overlap_pct: usize,

    /// Mandatory flag overrides for DAG edges
    pub dependencies: Vec<DependencyConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: BTreeMap::new(),
            default_concurrency: pipeline::DEFAULT_STAGE_CONCURRENCY,
            max_documents: pipeline::MAX_DOCUMENTS_PER_ANALYSIS,
            max_search_results: pipeline::MAX_SEARCH_RESULTS,
            timeout_secs: pipeline::DEFAULT_TIMEOUT_SECS,
            chunk_chars: pipeline::CHUNK_CHARS,
            chunk_overlap_pct: pipeline::CHUNK_OVERLAP_PCT,
            dependencies: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn concurrency_for(&self, stage: &str) -> usize {
        self.concurrency
            .get(stage)
            .copied()
            .unwrap_or(self.default_concurrency)
    }

    /// Mandatory flag for an edge, falling back to the declared default
    pub fn is_mandatory(&self, stage: &str, upstream: &str, default: bool) -> bool {
        self.dependencies
            .iter()
            .find(|d| d.stage == stage && d.upstream == upstream)
            .map(|d| d.mandatory)
            .unwrap_or(default)
    }
}

// =============================================================================
// Context Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Budget for one synthesis context blob in characters
    pub max_chars: usize,

    /// Critical findings may exceed the budget up to this multiple before truncation
    pub critical_overflow_factor: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_chars: context::DEFAULT_MAX_CHARS,
            critical_overflow_factor: context::CRITICAL_OVERFLOW_FACTOR,
        }
    }
}

// =============================================================================
// Scoring Configuration
// =============================================================================

/// Weights of the four risk dimensions; must sum to 1.0
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskWeights {
    pub clinical: f64,
    pub dark_data: f64,
    pub forensic: f64,
    pub literature: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            clinical: scoring::CLINICAL_WEIGHT,
            dark_data: scoring::DARK_DATA_WEIGHT,
            forensic: scoring::FORENSIC_WEIGHT,
            literature: scoring::LITERATURE_WEIGHT,
        }
    }
}

impl RiskWeights {
    pub fn sum(&self) -> f64 {
        self.clinical + self.dark_data + self.forensic + self.literature
    }

    pub fn validate(&self) -> Result<()> {
        let all = [self.clinical, self.dark_data, self.forensic, self.literature];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(CassandraError::Config(format!(
                "scoring.weights must be non-negative numbers, got {:?}",
                self
            )));
        }
        if (self.sum() - 1.0).abs() > scoring::WEIGHT_SUM_TOLERANCE {
            return Err(CassandraError::Config(format!(
                "scoring.weights must sum to 1.0, got {:.4}",
                self.sum()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: RiskWeights,

    /// Literature dimension estimate
    pub literature_baseline: f64,

    /// Points per unit of trial failure rate
    pub clinical_multiplier: f64,

    /// Points per high-severity finding
    pub dark_data_multiplier: f64,

    /// Points per suspicious image
    pub forensic_multiplier: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
            literature_baseline: scoring::LITERATURE_BASELINE,
            clinical_multiplier: scoring::CLINICAL_MULTIPLIER,
            dark_data_multiplier: scoring::DARK_DATA_MULTIPLIER,
            forensic_multiplier: scoring::FORENSIC_MULTIPLIER,
        }
    }
}

// =============================================================================
// Synthesis Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Retries per section on repair or validation failure
    pub section_retries: u32,

    /// Key-facts carry-over budget in characters
    pub carry_over_chars: usize,

    /// Below this run confidence, compound-level sections fall back
    pub min_confidence_for_facts: f64,

    /// Custom report template (placeholders are checked at load)
    pub template_path: Option<PathBuf>,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            section_retries: synthesis::SECTION_RETRIES,
            carry_over_chars: synthesis::CARRY_OVER_CHARS,
            min_confidence_for_facts: synthesis::MIN_CONFIDENCE_FOR_FACTS,
            template_path: None,
        }
    }
}

// =============================================================================
// Storage / Output Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Persist work items and findings to SQLite
    pub enabled: bool,

    /// Database path (relative to the working directory)
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from(".cassandra/findings.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory for generated reports
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("reports"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.llm.provider, "gemini");
        config.validate().unwrap();
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = Config::default();
        config.scoring.weights.literature = 0.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn test_backoff_base_above_cap_rejected() {
        let mut config = Config::default();
        config.client.overloaded = BackoffRule::new(10_000, 1_000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = Config::default();
        config.pipeline.concurrency.insert("mine".into(), 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dependency_override() {
        let mut config = PipelineConfig::default();
        assert!(config.is_mandatory("mine", "collect", true));
        config.dependencies.push(DependencyConfig {
            stage: "mine".into(),
            upstream: "collect".into(),
            mandatory: false,
        });
        assert!(!config.is_mandatory("mine", "collect", true));
        assert!(!config.is_mandatory("aggregate", "mine", false));
    }

    #[test]
    fn test_concurrency_for_falls_back() {
        let mut config = PipelineConfig::default();
        config.concurrency.insert("audit".into(), 6);
        assert_eq!(config.concurrency_for("audit"), 6);
        assert_eq!(config.concurrency_for("mine"), config.default_concurrency);
    }

    #[test]
    fn test_api_key_redacted_and_not_serialized() {
        let llm = LlmConfig {
            api_key: Some("secret-key".into()),
            ..LlmConfig::default()
        };
        assert!(!format!("{:?}", llm).contains("secret-key"));
        let toml = toml::to_string(&llm).unwrap();
        assert!(!toml.contains("secret-key"));
    }
}
