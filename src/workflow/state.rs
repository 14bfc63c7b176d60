//! Pipeline State
//!
//! The single mutable object of a run. Only the runner's join loop writes to
//! it; stages see upstream results through immutable `Arc<StageResult>`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::types::{RunId, StageResult, StageStatus};

/// Run-level status; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Collecting,
    Analyzing,
    Aggregating,
    Writing,
    Done,
    Failed,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collecting => "collecting",
            Self::Analyzing => "analyzing",
            Self::Aggregating => "aggregating",
            Self::Writing => "writing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineState {
    pub run_id: RunId,
    pub query: String,
    status: PipelineStatus,
    /// Stage names in declaration order
    order: Vec<String>,
    stage_status: BTreeMap<String, StageStatus>,
    results: BTreeMap<String, Arc<StageResult>>,
    cancelled: bool,
    timed_out: bool,
}

impl PipelineState {
    pub fn new(run_id: RunId, query: impl Into<String>, stages: &[String]) -> Self {
        Self {
            run_id,
            query: query.into(),
            status: PipelineStatus::Collecting,
            order: stages.to_vec(),
            stage_status: stages
                .iter()
                .map(|s| (s.clone(), StageStatus::Idle))
                .collect(),
            results: BTreeMap::new(),
            cancelled: false,
            timed_out: false,
        }
    }

    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    /// Move forward to `to`; backwards and post-terminal moves are ignored
    pub fn advance(&mut self, to: PipelineStatus) -> bool {
        if self.status.is_terminal() || to <= self.status {
            return false;
        }
        self.status = to;
        true
    }

    pub fn stage_status(&self, stage: &str) -> Option<StageStatus> {
        self.stage_status.get(stage).copied()
    }

    pub fn stage_names(&self) -> &[String] {
        &self.order
    }

    pub(crate) fn mark_running(&mut self, stage: &str) {
        if let Some(status) = self.stage_status.get_mut(stage) {
            *status = StageStatus::Running;
        }
    }

    /// Store a terminal result; returns the shared handle
    pub(crate) fn record(&mut self, result: StageResult) -> Arc<StageResult> {
        let result = Arc::new(result);
        self.stage_status
            .insert(result.stage.clone(), result.status);
        self.results.insert(result.stage.clone(), Arc::clone(&result));
        result
    }

    pub fn result(&self, stage: &str) -> Option<&Arc<StageResult>> {
        self.results.get(stage)
    }

    /// Terminal results in declaration order
    pub fn results_in_order(&self) -> Vec<Arc<StageResult>> {
        self.order
            .iter()
            .filter_map(|s| self.results.get(s).cloned())
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.stage_status.values().all(StageStatus::is_terminal)
    }

    pub(crate) fn mark_cancelled(&mut self, timed_out: bool) {
        self.cancelled = true;
        self.timed_out |= timed_out;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Done when nothing was cancelled and every stage produced output
    pub(crate) fn finish(&mut self) -> PipelineStatus {
        let all_produced = self
            .order
            .iter()
            .all(|s| self.stage_status(s).is_some_and(|st| st.produced_output()));
        let final_status = if !self.cancelled && all_produced {
            PipelineStatus::Done
        } else {
            PipelineStatus::Failed
        };
        self.advance(final_status);
        self.status
    }

    pub fn failed_stages(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|s| {
                matches!(
                    self.stage_status(s),
                    Some(StageStatus::Failed) | Some(StageStatus::Cancelled)
                )
            })
            .map(String::as_str)
            .collect()
    }
}
