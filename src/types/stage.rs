use serde::{Deserialize, Serialize};

use super::error::StageStartError;
use super::finding::Finding;
use super::work::{FailureKind, FailureRecord, ItemStatus, WorkItem};

/// Lifecycle of one DAG node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Idle,
    Running,
    Completed,
    /// Ran, but some work items failed or were cancelled
    Degraded,
    /// Could not start or could not produce anything
    Failed,
    /// Never started because the run was cancelled
    Cancelled,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Idle | Self::Running)
    }

    /// Whether dependents may consume this stage's output
    pub fn produced_output(&self) -> bool {
        matches!(self, Self::Completed | Self::Degraded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate output of one DAG node, read-only once produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub status: StageStatus,
    /// Findings in source order
    pub findings: Vec<Finding>,
    /// Terminal work items in source order
    pub items: Vec<WorkItem>,
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<FailureRecord>,
    /// Stage-specific structured output
    pub payload: Option<serde_json::Value>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl StageResult {
    /// Assemble a result from terminal items; order is restored from `SourceOrder`
    pub fn from_items(stage: &str, mut items: Vec<WorkItem>, mut findings: Vec<Finding>) -> Self {
        items.sort_by_key(|item| item.order);
        findings.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));

        let items: Vec<WorkItem> = items
            .into_iter()
            .map(|item| {
                if item.is_terminal() {
                    item
                } else {
                    item.cancel(stage)
                }
            })
            .collect();

        let attempted = items.len();
        let succeeded = items
            .iter()
            .filter(|i| i.status() == ItemStatus::Success)
            .count();
        let failures: Vec<FailureRecord> =
            items.iter().filter_map(|i| i.failure().cloned()).collect();

        let status = if succeeded == attempted {
            StageStatus::Completed
        } else {
            StageStatus::Degraded
        };

        Self {
            stage: stage.to_string(),
            status,
            findings,
            items,
            attempted,
            succeeded,
            failures,
            payload: None,
            error: None,
            elapsed_ms: 0,
        }
    }

    /// Result for a stage that was never invoked
    pub fn start_failed(err: &StageStartError) -> Self {
        Self::failed(&err.stage, err.to_string())
    }

    /// Result for a stage whose body returned an error
    pub fn failed(stage: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            stage: stage.to_string(),
            status: StageStatus::Failed,
            findings: Vec::new(),
            items: Vec::new(),
            attempted: 0,
            succeeded: 0,
            failures: vec![FailureRecord {
                stage: stage.to_string(),
                item_id: stage.to_string(),
                source_ref: stage.to_string(),
                kind: FailureKind::Internal,
                message: message.clone(),
            }],
            payload: None,
            error: Some(message),
            elapsed_ms: 0,
        }
    }

    pub fn cancelled(stage: &str) -> Self {
        Self {
            status: StageStatus::Cancelled,
            error: Some("run cancelled before stage start".to_string()),
            failures: Vec::new(),
            ..Self::failed(stage, "")
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    pub fn failed_count(&self) -> usize {
        self.attempted - self.succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::finding::{FindingKind, Severity};
    use crate::types::work::SourceOrder;

    fn item(id: &str, doc: usize) -> WorkItem {
        WorkItem::new(id, format!("{}.pdf", id), SourceOrder::document(doc))
    }

    #[test]
    fn test_from_items_restores_source_order() {
        let b = item("b", 1).succeed();
        let a = item("a", 0).succeed();
        let fb = Finding::new("mine", &b, 0, FindingKind::TextEvidence, Severity::Low, "b");
        let fa = Finding::new("mine", &a, 0, FindingKind::TextEvidence, Severity::Low, "a");

        let result = StageResult::from_items("mine", vec![b, a], vec![fb, fa]);
        assert_eq!(result.items[0].id, "a");
        assert_eq!(result.findings[0].quote, "a");
        assert_eq!(result.status, StageStatus::Completed);
    }

    #[test]
    fn test_degraded_when_any_item_fails() {
        let ok = item("a", 0).succeed();
        let bad = item("b", 1).fail("mine", FailureKind::Parse, "garbled");
        let result = StageResult::from_items("mine", vec![ok, bad], Vec::new());
        assert_eq!(result.status, StageStatus::Degraded);
        assert_eq!(result.attempted, 2);
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failures.len(), 1);
    }

    #[test]
    fn test_pending_items_become_cancelled() {
        let result = StageResult::from_items("audit", vec![item("x", 0)], Vec::new());
        assert_eq!(result.items[0].status(), ItemStatus::Cancelled);
        assert_eq!(result.status, StageStatus::Degraded);
    }

    #[test]
    fn test_empty_stage_completes() {
        let result = StageResult::from_items("mine", Vec::new(), Vec::new());
        assert_eq!(result.status, StageStatus::Completed);
        assert_eq!(result.attempted, 0);
    }

    #[test]
    fn test_start_failed() {
        let err = StageStartError {
            stage: "aggregate".into(),
            missing_upstream: vec!["collect".into()],
        };
        let result = StageResult::start_failed(&err);
        assert_eq!(result.status, StageStatus::Failed);
        assert!(result.error.unwrap().contains("collect"));
    }
}
