//! Stage Abstraction
//!
//! A stage is one DAG node. It receives the run query, the terminal results of
//! its upstream stages and the run's cancellation token, and returns its own
//! `StageResult`. Stages never see or mutate the pipeline state.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::progress::ProgressTracker;
use super::state::PipelineStatus;
use crate::types::{Finding, Result, RunId, StageResult};

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Pipeline status while this stage runs
    fn phase(&self) -> PipelineStatus {
        PipelineStatus::Analyzing
    }

    /// Returning `Err` marks the stage failed; item-level failures belong in the result
    async fn run(&self, ctx: StageContext) -> Result<StageResult>;
}

pub type SharedStage = Arc<dyn Stage>;

/// Everything a stage may read
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run_id: RunId,
    pub query: String,
    /// Terminal upstream results in stage declaration order
    upstream: Vec<Arc<StageResult>>,
    pub cancel: CancellationToken,
    pub progress: ProgressTracker,
}

impl StageContext {
    pub fn new(
        run_id: RunId,
        query: impl Into<String>,
        upstream: Vec<Arc<StageResult>>,
        cancel: CancellationToken,
        progress: ProgressTracker,
    ) -> Self {
        Self {
            run_id,
            query: query.into(),
            upstream,
            cancel,
            progress,
        }
    }

    pub fn upstream(&self, stage: &str) -> Option<&Arc<StageResult>> {
        self.upstream.iter().find(|r| r.stage == stage)
    }

    pub fn upstream_results(&self) -> &[Arc<StageResult>] {
        &self.upstream
    }

    /// Fan-in merge ordered by (stage declaration order, source order)
    pub fn merged_findings(&self) -> Vec<Finding> {
        self.upstream
            .iter()
            .flat_map(|r| r.findings.iter().cloned())
            .collect()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
