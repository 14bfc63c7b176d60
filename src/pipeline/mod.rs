//! Research pipeline
//!
//! Wires the five stages into the default DAG and runs them against the
//! configured collaborators:
//!
//! ```text
//!             ┌──▶ mine ───┐
//! collect ────┼──▶ audit ──┼──▶ aggregate ──▶ write
//!             └────────────┘
//! ```
//!
//! `collect` is mandatory for every analysis stage; `mine` and `audit` are
//! optional inputs of `aggregate`, so a failed analysis stage degrades the
//! report instead of blocking it.

pub mod aggregate;
pub mod audit;
pub mod collect;
pub mod fs_extractor;
pub mod manifest;
pub mod mine;
pub mod prompts;
pub mod sources;
pub mod write;

pub use aggregate::{AggregateReport, AggregateStage, StageSummary};
pub use audit::AuditStage;
pub use collect::{CollectPayload, CollectStage};
pub use fs_extractor::FsContentExtractor;
pub use manifest::ManifestSearchClient;
pub use mine::{AnalysisSettings, MineStage};
pub use sources::{
    ArtifactSink, ContentExtractor, DocumentKind, ExtractedImage, Extraction, FindingSink,
    SearchClient, SharedArtifactSink, SharedExtractor, SharedFindingSink, SharedSearchClient,
    SourceDocument,
};
pub use write::{WritePayload, WriteStage};

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ai::client::ResilientClient;
use crate::ai::context::ContextBudgeter;
use crate::ai::metrics::{MetricsSummary, SharedMetrics, create_shared_metrics};
use crate::ai::provider::SharedProvider;
use crate::ai::rate_limit::RateLimiter;
use crate::ai::retry::RetryPolicy;
use crate::config::Config;
use crate::scoring::RiskScorer;
use crate::synthesis::{ReportArtifact, Synthesizer, Template};
use crate::types::{Result, RunId};
use crate::workflow::{PipelineState, PipelineStatus, ProgressTracker, Workflow, WorkflowRunner};

pub mod stage_names {
    pub const COLLECT: &str = "collect";
    pub const MINE: &str = "mine";
    pub const AUDIT: &str = "audit";
    pub const AGGREGATE: &str = "aggregate";
    pub const WRITE: &str = "write";
}

use stage_names::{AGGREGATE, AUDIT, COLLECT, MINE, WRITE};

/// `(upstream, downstream, mandatory)` before configuration overrides
pub const DEFAULT_EDGES: &[(&str, &str, bool)] = &[
    (COLLECT, MINE, true),
    (COLLECT, AUDIT, true),
    (COLLECT, AGGREGATE, true),
    (MINE, AGGREGATE, false),
    (AUDIT, AGGREGATE, false),
    (AGGREGATE, WRITE, true),
];

/// Everything a finished run produced
#[derive(Debug)]
pub struct ResearchOutcome {
    pub state: PipelineState,
    pub artifact: Option<ReportArtifact>,
    pub locations: Vec<String>,
    pub metrics: MetricsSummary,
}

impl ResearchOutcome {
    pub fn succeeded(&self) -> bool {
        self.state.status() == PipelineStatus::Done
    }
}

pub struct ResearchPipeline {
    config: Arc<Config>,
    provider: SharedProvider,
    limiter: Arc<RateLimiter>,
    template: Template,
    search: SharedSearchClient,
    extractor: SharedExtractor,
    artifact_sink: SharedArtifactSink,
    finding_sink: Option<SharedFindingSink>,
    progress: ProgressTracker,
}

impl ResearchPipeline {
    pub fn new(
        config: Arc<Config>,
        provider: SharedProvider,
        search: SharedSearchClient,
        extractor: SharedExtractor,
        artifact_sink: SharedArtifactSink,
    ) -> Result<Self> {
        config.validate()?;
        let template = match &config.synthesis.template_path {
            Some(path) => Template::parse(&std::fs::read_to_string(path)?)?,
            None => Template::builtin(),
        };
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));

        Ok(Self {
            config,
            provider,
            limiter,
            template,
            search,
            extractor,
            artifact_sink,
            finding_sink: None,
            progress: ProgressTracker::new(),
        })
    }

    pub fn with_finding_sink(mut self, sink: SharedFindingSink) -> Self {
        self.finding_sink = Some(sink);
        self
    }

    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Build the stage DAG for one run
    pub fn workflow(&self, metrics: &SharedMetrics) -> Result<Workflow> {
        let config = &self.config;
        let client = ResilientClient::new(
            Arc::clone(&self.provider),
            RetryPolicy::from_config(&config.client),
            Arc::clone(&self.limiter),
        )
        .with_metrics(Arc::clone(metrics));
        let call_deadline = Duration::from_secs(config.client.call_deadline_secs);
        let settings = |stage: &str| AnalysisSettings {
            concurrency: config.pipeline.concurrency_for(stage),
            max_documents: config.pipeline.max_documents,
            call_deadline,
        };

        let mut aggregate = AggregateStage::new(
            RiskScorer::new(config.scoring.clone()),
            ContextBudgeter::from_config(&config.context),
            vec![MINE.to_string(), AUDIT.to_string()],
        );
        if let Some(sink) = &self.finding_sink {
            aggregate = aggregate.with_sink(Arc::clone(sink));
        }

        let synthesizer = Synthesizer::new(
            client.clone(),
            config.synthesis.clone(),
            self.template.clone(),
            call_deadline,
        );

        let mut builder = Workflow::builder()
            .stage(Arc::new(CollectStage::new(
                Arc::clone(&self.search),
                config.pipeline.max_search_results,
            )))
            .stage(Arc::new(MineStage::new(
                client.clone(),
                Arc::clone(&self.extractor),
                settings(MINE),
                config.pipeline.chunk_chars,
                config.pipeline.chunk_overlap_pct,
            )))
            .stage(Arc::new(AuditStage::new(
                client,
                Arc::clone(&self.extractor),
                settings(AUDIT),
            )))
            .stage(Arc::new(aggregate))
            .stage(Arc::new(
                WriteStage::new(synthesizer, Arc::clone(&self.artifact_sink))
                    .with_metrics(Arc::clone(metrics)),
            ));
        for (upstream, downstream, mandatory) in DEFAULT_EDGES {
            builder = builder.edge(upstream, downstream, *mandatory);
        }
        builder.overrides(&config.pipeline.dependencies).build()
    }

    async fn record_run(&self, run_id: &RunId, query: &str, status: &str) {
        if let Some(sink) = &self.finding_sink
            && let Err(e) = sink.record_run(run_id, query, status).await
        {
            warn!(run_id = %run_id, error = %e, "Failed to record run");
        }
    }

    pub async fn run(&self, query: &str, cancel: &CancellationToken) -> Result<ResearchOutcome> {
        let run_id = RunId::generate();
        let metrics = create_shared_metrics(run_id.as_str());
        let workflow = self.workflow(&metrics)?;

        self.record_run(&run_id, query, PipelineStatus::Collecting.as_str())
            .await;

        let runner = WorkflowRunner::new(workflow)
            .with_timeout(Duration::from_secs(self.config.pipeline.timeout_secs))
            .with_progress(self.progress.clone());
        let state = runner.run(run_id.clone(), query, cancel).await;

        self.record_run(&run_id, query, state.status().as_str()).await;

        let (artifact, locations) = match state.result(WRITE).and_then(|r| WritePayload::from_result(r)) {
            Some(payload) => (Some(payload.artifact), payload.locations),
            None => (None, Vec::new()),
        };
        let summary = metrics.summary();
        info!(
            run_id = %run_id,
            status = %state.status(),
            calls = summary.calls_succeeded + summary.calls_failed,
            retries = summary.retries,
            tokens = summary.total_tokens,
            "Run finished"
        );

        Ok(ResearchOutcome {
            state,
            artifact,
            locations,
            metrics: summary,
        })
    }
}
