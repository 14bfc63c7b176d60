//! Fan-in stage: merged findings, scores and the budgeted context
//!
//! This is the only place sibling outputs are read together. The result is a
//! structured [`AggregateReport`] payload consumed by the write stage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::sources::SharedFindingSink;
use super::stage_names::AGGREGATE;
use crate::ai::context::{BudgetedContext, ContextBudgeter};
use crate::scoring::{ConfidenceScore, RiskAssessment, RiskInputs, RiskScorer};
use crate::types::{
    CassandraError, FailureRecord, Finding, Result, RunId, StageResult, StageStatus,
};
use crate::workflow::{MessageLevel, PipelineStatus, Stage, StageContext};

/// Per-stage counts carried into the report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: String,
    pub status: StageStatus,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub findings: usize,
}

impl From<&StageResult> for StageSummary {
    fn from(result: &StageResult) -> Self {
        Self {
            stage: result.stage.clone(),
            status: result.status,
            attempted: result.attempted,
            succeeded: result.succeeded,
            failed: result.failed_count(),
            findings: result.findings.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub confidence: ConfidenceScore,
    pub risk: RiskAssessment,
    pub context: BudgetedContext,
    /// Every item- and stage-level failure upstream, in stage order
    pub failures: Vec<FailureRecord>,
    pub stages: Vec<StageSummary>,
    pub total_findings: usize,
}

impl AggregateReport {
    pub fn from_context(ctx: &StageContext) -> Result<Self> {
        let payload = ctx
            .upstream(AGGREGATE)
            .and_then(|r| r.payload.clone())
            .ok_or_else(|| {
                CassandraError::Workflow("aggregate stage produced no report".to_string())
            })?;
        Ok(serde_json::from_value(payload)?)
    }
}

pub struct AggregateStage {
    scorer: RiskScorer,
    budgeter: ContextBudgeter,
    /// Stages whose unit counts feed run confidence
    analysis_stages: Vec<String>,
    sink: Option<SharedFindingSink>,
}

impl AggregateStage {
    pub fn new(
        scorer: RiskScorer,
        budgeter: ContextBudgeter,
        analysis_stages: Vec<String>,
    ) -> Self {
        Self {
            scorer,
            budgeter,
            analysis_stages,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: SharedFindingSink) -> Self {
        self.sink = Some(sink);
        self
    }

    async fn persist(&self, ctx: &StageContext, findings: &[Finding]) {
        let Some(sink) = &self.sink else {
            return;
        };
        let run_id: &RunId = &ctx.run_id;
        for result in ctx.upstream_results() {
            if let Err(e) = sink.record_work_items(run_id, &result.stage, &result.items).await {
                warn!(stage = %result.stage, error = %e, "Failed to persist work items");
                ctx.progress.message(
                    MessageLevel::Warning,
                    format!("Persistence unavailable for {}: {}", result.stage, e),
                );
            }
        }
        if let Err(e) = sink.record_findings(run_id, findings).await {
            warn!(error = %e, "Failed to persist findings");
            ctx.progress.message(
                MessageLevel::Warning,
                format!("Findings were not persisted: {}", e),
            );
        }
    }
}

#[async_trait]
impl Stage for AggregateStage {
    fn name(&self) -> &str {
        AGGREGATE
    }

    fn phase(&self) -> PipelineStatus {
        PipelineStatus::Aggregating
    }

    #[instrument(skip(self, ctx), fields(stage = AGGREGATE, run_id = %ctx.run_id))]
    async fn run(&self, ctx: StageContext) -> Result<StageResult> {
        let findings = ctx.merged_findings();
        let upstream = ctx.upstream_results();

        let confidence = ConfidenceScore::from_results(
            upstream
                .iter()
                .filter(|r| self.analysis_stages.contains(&r.stage))
                .map(|r| r.as_ref()),
        );
        let risk = self.scorer.assess(RiskInputs::from_findings(&findings));
        let context = self.budgeter.build(&findings);

        let failures: Vec<FailureRecord> = upstream
            .iter()
            .flat_map(|r| r.failures.iter().cloned())
            .collect();
        let stages: Vec<StageSummary> = upstream
            .iter()
            .map(|r| StageSummary::from(r.as_ref()))
            .collect();

        info!(
            findings = findings.len(),
            confidence = confidence.value,
            risk = risk.total,
            context_chars = context.char_len(),
            critical_overflow = context.critical_overflow,
            failures = failures.len(),
            "Aggregation complete"
        );

        self.persist(&ctx, &findings).await;

        let report = AggregateReport {
            confidence,
            risk,
            context,
            failures,
            stages,
            total_findings: findings.len(),
        };
        Ok(StageResult::from_items(AGGREGATE, Vec::new(), Vec::new())
            .with_payload(serde_json::to_value(&report)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExtractionErrorKind, FindingKind, Severity, SourceOrder, WorkItem};
    use crate::workflow::ProgressTracker;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    struct FlakySink {
        calls: AtomicU32,
    }

    #[async_trait]
    impl crate::pipeline::sources::FindingSink for FlakySink {
        async fn record_work_items(
            &self,
            _run_id: &RunId,
            _stage: &str,
            _items: &[WorkItem],
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CassandraError::Storage("disk full".into()))
        }

        async fn record_findings(&self, _run_id: &RunId, _findings: &[Finding]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn stage_result(stage: &str, doc: usize, ok: usize, failed: usize) -> StageResult {
        let mut items = Vec::new();
        let mut findings = Vec::new();
        for i in 0..ok + failed {
            let item = WorkItem::new(
                format!("{stage}-{i}"),
                format!("doc-{i}"),
                SourceOrder::new(doc, i),
            );
            if i < ok {
                findings.push(Finding::new(
                    stage,
                    &item,
                    0,
                    FindingKind::TextEvidence,
                    Severity::High,
                    format!("{stage} quote {i}"),
                ));
                items.push(item.succeed());
            } else {
                items.push(item.fail_with(
                    stage,
                    &CassandraError::extraction("doc", ExtractionErrorKind::ImageOnly),
                ));
            }
        }
        StageResult::from_items(stage, items, findings)
    }

    #[tokio::test]
    async fn test_aggregate_scores_analysis_stages_only() {
        let sink = Arc::new(FlakySink {
            calls: AtomicU32::new(0),
        });
        let stage = AggregateStage::new(
            RiskScorer::default(),
            ContextBudgeter::new(10_000, 2.0),
            vec!["mine".to_string(), "audit".to_string()],
        )
        .with_sink(sink.clone());

        let ctx = StageContext::new(
            RunId::new("run"),
            "q",
            vec![
                Arc::new(stage_result("collect", 0, 5, 0)),
                Arc::new(stage_result("mine", 1, 1, 2)),
                Arc::new(stage_result("audit", 2, 2, 1)),
            ],
            CancellationToken::new(),
            ProgressTracker::new(),
        );
        let result = stage.run(ctx.clone()).await.unwrap();
        assert_eq!(result.status, StageStatus::Completed);

        let downstream = StageContext::new(
            RunId::new("run"),
            "q",
            vec![Arc::new(result)],
            CancellationToken::new(),
            ProgressTracker::new(),
        );
        let report = AggregateReport::from_context(&downstream).unwrap();
        assert_eq!(report.confidence.attempted, 6);
        assert_eq!(report.confidence.succeeded, 3);
        assert_eq!(report.confidence.value, 5.0);
        assert_eq!(report.failures.len(), 3);
        assert_eq!(report.total_findings, 8);
        assert_eq!(report.stages.len(), 3);
        assert!(report.context.text.contains("mine quote 0"));
        // Sink errors are tolerated: 3 work item batches + 1 findings batch
        assert_eq!(sink.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_missing_report_is_workflow_error() {
        let ctx = StageContext::new(
            RunId::new("run"),
            "q",
            Vec::new(),
            CancellationToken::new(),
            ProgressTracker::new(),
        );
        assert!(matches!(
            AggregateReport::from_context(&ctx),
            Err(CassandraError::Workflow(_))
        ));
    }
}
