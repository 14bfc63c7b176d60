//! Global Constants
//!
//! Centralized constants for configuration and tuning.
//! All magic numbers should be defined here with documentation.

/// Resilient call client constants
pub mod client {
    /// Hard cap on attempts per call (first attempt included)
    pub const MAX_ATTEMPTS: u32 = 5;

    /// Backoff multiplier
    pub const BACKOFF_FACTOR: f64 = 2.0;

    /// Transient network failures: base delay (milliseconds)
    pub const TRANSIENT_BASE_MS: u64 = 1_000;

    /// Transient network failures: maximum delay (milliseconds)
    pub const TRANSIENT_CAP_MS: u64 = 60_000;

    /// Rate-limited responses without a provider hint: base delay (milliseconds)
    pub const RATE_LIMITED_BASE_MS: u64 = 5_000;

    /// Rate-limited responses: maximum delay (milliseconds)
    pub const RATE_LIMITED_CAP_MS: u64 = 120_000;

    /// Server overload: base delay (milliseconds)
    pub const OVERLOADED_BASE_MS: u64 = 2_000;

    /// Server overload: maximum delay (milliseconds)
    pub const OVERLOADED_CAP_MS: u64 = 30_000;

    /// Upper bound for a provider-signalled retry delay (seconds)
    pub const MAX_PROVIDER_DELAY_SECS: u64 = 300;

    /// Default deadline for a single call including retries (seconds)
    pub const DEFAULT_CALL_DEADLINE_SECS: u64 = 180;
}

/// Shared rate limiter constants
pub mod rate_limit {
    /// Maximum generation calls in flight across the whole run
    pub const MAX_CONCURRENT_CALLS: usize = 4;

    /// Sustained request rate (requests per second)
    pub const REQUESTS_PER_SECOND: f64 = 2.0;

    /// Token bucket capacity
    pub const BURST: u32 = 4;
}

/// Output repair constants
pub mod repair {
    /// Sentinel written into required fields the model left out
    pub const UNKNOWN_SENTINEL: &str = "UNKNOWN";

    /// Characters of context on each side of a parse error position
    pub const ERROR_CONTEXT_RADIUS: usize = 50;

    /// Upper bound on a parse error excerpt
    pub const MAX_EXCERPT_CHARS: usize = 200;

    /// Window searched for a structural delimiter when closing a string
    pub const STRING_CLOSE_WINDOW: usize = 200;
}

/// Context budgeter constants
pub mod context {
    /// Default budget for a synthesis context blob (characters)
    pub const DEFAULT_MAX_CHARS: usize = 24_000;

    /// Critical findings may overflow the budget up to this multiple before truncation
    pub const CRITICAL_OVERFLOW_FACTOR: f64 = 2.0;

    /// Quote preview length in one-line summaries
    pub const SUMMARY_QUOTE_CHARS: usize = 100;
}

/// Pipeline constants
pub mod pipeline {
    /// Default per-stage work item concurrency
    pub const DEFAULT_STAGE_CONCURRENCY: usize = 3;

    /// Documents handed to each analysis stage
    pub const MAX_DOCUMENTS_PER_ANALYSIS: usize = 3;

    /// Documents requested from the search client
    pub const MAX_SEARCH_RESULTS: usize = 20;

    /// Whole-run timeout (seconds)
    pub const DEFAULT_TIMEOUT_SECS: u64 = 1_800;

    /// Text chunk size for evidence mining (characters, ~3 chars per token)
    pub const CHUNK_CHARS: usize = 90_000;

    /// Overlap between consecutive chunks (percent)
    pub const CHUNK_OVERLAP_PCT: usize = 10;

    /// Extracted text shorter than this is treated as empty
    pub const MIN_TEXT_CHARS: usize = 100;

    /// Quote prefix used to fingerprint duplicate evidence
    pub const DEDUP_FINGERPRINT_CHARS: usize = 100;

    /// Tampering score at or above which a suspicious image is critical
    pub const HIGH_TAMPERING_SCORE: f64 = 0.7;

    /// Trial statuses counted as failed
    pub const FAILED_TRIAL_STATUSES: &[&str] = &["TERMINATED", "SUSPENDED", "WITHDRAWN"];
}

/// Risk scoring constants
pub mod scoring {
    /// Clinical dimension weight
    pub const CLINICAL_WEIGHT: f64 = 0.30;
    /// Dark-data dimension weight
    pub const DARK_DATA_WEIGHT: f64 = 0.35;
    /// Forensic dimension weight
    pub const FORENSIC_WEIGHT: f64 = 0.20;
    /// Literature dimension weight
    pub const LITERATURE_WEIGHT: f64 = 0.15;

    /// Literature dimension estimate when no literature signal is scored
    pub const LITERATURE_BASELINE: f64 = 5.0;

    /// Points per unit of trial failure rate
    pub const CLINICAL_MULTIPLIER: f64 = 20.0;
    /// Points per high-severity finding
    pub const DARK_DATA_MULTIPLIER: f64 = 2.0;
    /// Points per suspicious image
    pub const FORENSIC_MULTIPLIER: f64 = 3.0;

    /// Upper bound of every dimension and of the composite
    pub const MAX_SCORE: f64 = 10.0;

    /// Allowed deviation of the weight sum from 1.0
    pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;
}

/// Segmented synthesis constants
pub mod synthesis {
    /// Retries per section on repair or validation failure
    pub const SECTION_RETRIES: u32 = 2;

    /// Budget for the key-facts carry-over passed to later sections (characters)
    pub const CARRY_OVER_CHARS: usize = 2_000;

    /// Maximum length of one key fact (characters)
    pub const KEY_FACT_CHARS: usize = 200;

    /// Key facts kept per section
    pub const KEY_FACTS_PER_SECTION: usize = 5;

    /// Below this run confidence, compound-level sections are not generated
    pub const MIN_CONFIDENCE_FOR_FACTS: f64 = 3.0;

    /// Marker used for sections that could not be generated
    pub const INSUFFICIENT_DATA_MARKER: &str = "[INSUFFICIENT DATA]";
}

/// Per-engine generation settings
pub mod generation {
    /// Evidence mining temperature
    pub const MINING_TEMPERATURE: f32 = 0.4;
    /// Evidence mining output tokens
    pub const MINING_MAX_TOKENS: u32 = 8_192;
    /// Forensic audit temperature
    pub const FORENSIC_TEMPERATURE: f32 = 0.2;
    /// Forensic audit output tokens
    pub const FORENSIC_MAX_TOKENS: u32 = 4_096;
    /// Report writing temperature
    pub const REPORT_TEMPERATURE: f32 = 0.7;
}

/// HTTP/Network constants
pub mod network {
    /// Default request timeout (seconds)
    pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

    /// Connection timeout (seconds)
    pub const CONNECTION_TIMEOUT_SECS: u64 = 30;
}

/// Progress channel constants
pub mod progress {
    /// Broadcast channel capacity
    pub const CHANNEL_CAPACITY: usize = 256;
}
