//! Cassandra - Resilient Orchestration for Evidence-Driven Research Reports
//!
//! Runs a query through a DAG of stages (collect, mine, audit, aggregate,
//! write) that call an unreliable generation service, and turns whatever
//! evidence survived into a scored, sectioned risk report.
//!
//! ## Core Features
//!
//! - **Resilient Call Client**: classified retries, shared rate limiting, deadlines
//! - **Output Repair**: structured output recovered from malformed model text
//! - **Context Budgeter**: severity-tiered context that fits a character budget
//! - **Stage Runner**: dependency-driven concurrency with failure isolation
//! - **Scoring**: deterministic confidence and weighted risk
//! - **Segmented Synthesis**: per-section generation with carry-over and fallbacks
//!
//! ## Quick Start
//!
//! ```ignore
//! use cassandra::{ConfigLoader, ResearchPipeline};
//! use cassandra::ai::create_provider;
//!
//! let config = Arc::new(ConfigLoader::load(None)?);
//! let pipeline = ResearchPipeline::new(
//!     Arc::clone(&config),
//!     create_provider(&config.llm)?,
//!     Arc::new(ManifestSearchClient::load(Path::new("corpus.json"))?),
//!     Arc::new(FsContentExtractor::new()),
//!     Arc::new(FileArtifactSink::new("reports")),
//! )?;
//! let outcome = pipeline.run("drug x", &CancellationToken::new()).await?;
//! ```
//!
//! ## Modules
//!
//! - [`ai`]: providers, resilient client, output repair, context budgeting
//! - [`workflow`]: stage DAG, runner and progress events
//! - [`pipeline`]: the five research stages and their collaborators
//! - [`synthesis`]: sectioned report generation and rendering
//! - [`storage`]: SQLite findings and file artifacts

pub mod ai;
pub mod cli;
pub mod config;
pub mod constants;
pub mod pipeline;
pub mod scoring;
pub mod storage;
pub mod synthesis;
pub mod types;
pub mod workflow;

// =============================================================================
// Core Re-exports
// =============================================================================

// Configuration
pub use config::{Config, ConfigLoader};

// Error Types
pub use types::error::{CassandraError, ErrorClassifier, Result, ResultExt};

// Storage
pub use storage::{Database, FileArtifactSink, SharedDatabase, SqliteFindingSink};

// =============================================================================
// Pipeline Re-exports
// =============================================================================

pub use pipeline::{
    FsContentExtractor, ManifestSearchClient, ResearchOutcome, ResearchPipeline,
};
pub use workflow::{PipelineState, PipelineStatus, ProgressTracker, Workflow, WorkflowRunner};

// =============================================================================
// AI Re-exports
// =============================================================================

pub use ai::{
    LlmProvider, MetricsCollector, ResilientClient, RetryPolicy, SharedMetrics, SharedProvider,
    create_provider,
};
