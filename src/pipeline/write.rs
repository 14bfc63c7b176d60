//! Write stage: segmented synthesis, assembly and publishing

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::aggregate::AggregateReport;
use super::sources::SharedArtifactSink;
use super::stage_names::WRITE;
use crate::ai::metrics::SharedMetrics;
use crate::synthesis::{ReportArtifact, Synthesizer};
use crate::types::{Result, StageResult};
use crate::workflow::{PipelineStatus, Stage, StageContext};

/// Structured payload of the write stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WritePayload {
    pub artifact: ReportArtifact,
    /// Where the sink published the artifact
    pub locations: Vec<String>,
}

impl WritePayload {
    pub fn from_result(result: &StageResult) -> Option<Self> {
        serde_json::from_value(result.payload.clone()?).ok()
    }
}

pub struct WriteStage {
    synthesizer: Synthesizer,
    sink: SharedArtifactSink,
    metrics: Option<SharedMetrics>,
}

impl WriteStage {
    pub fn new(synthesizer: Synthesizer, sink: SharedArtifactSink) -> Self {
        Self {
            synthesizer,
            sink,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl Stage for WriteStage {
    fn name(&self) -> &str {
        WRITE
    }

    fn phase(&self) -> PipelineStatus {
        PipelineStatus::Writing
    }

    #[instrument(skip(self, ctx), fields(stage = WRITE, run_id = %ctx.run_id))]
    async fn run(&self, ctx: StageContext) -> Result<StageResult> {
        let report = AggregateReport::from_context(&ctx)?;
        let sections = self
            .synthesizer
            .synthesize(&ctx.query, &report, &ctx.cancel, &ctx.progress)
            .await?;

        let metrics = self.metrics.as_ref().map(|m| m.summary());
        let artifact = ReportArtifact::assemble(
            self.synthesizer.template(),
            &ctx.run_id,
            &ctx.query,
            &report,
            sections,
            metrics,
        );
        let locations = self.sink.publish(&artifact).await?;

        info!(
            recommendation = %artifact.recommendation,
            confidence = artifact.confidence.value,
            risk = artifact.risk_score,
            fallbacks = artifact.fallback_sections.len(),
            corrections = artifact.corrections.len(),
            locations = ?locations,
            "Report published"
        );

        let payload = serde_json::to_value(WritePayload {
            artifact,
            locations,
        })?;
        Ok(StageResult::from_items(WRITE, Vec::new(), Vec::new()).with_payload(payload))
    }
}
