use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::error::{
    CassandraError, ErrorClassifier, ExtractionErrorKind, TransportErrorKind,
};

/// Position of a unit in its source listing (document index, unit within document)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SourceOrder {
    pub document: usize,
    pub unit: usize,
}

impl SourceOrder {
    pub const fn new(document: usize, unit: usize) -> Self {
        Self { document, unit }
    }

    pub const fn document(document: usize) -> Self {
        Self { document, unit: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Classification attached to every failed or cancelled work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureKind {
    Transport(TransportErrorKind),
    Parse,
    Extraction(ExtractionErrorKind),
    Cancelled,
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(kind) => write!(f, "TRANSPORT:{}", kind),
            Self::Parse => write!(f, "PARSE"),
            Self::Extraction(kind) => write!(f, "EXTRACTION:{}", kind),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl FailureKind {
    pub fn from_error(err: &CassandraError) -> Self {
        match err {
            CassandraError::Transport(e) => Self::Transport(e.kind),
            CassandraError::Timeout { .. } => Self::Transport(TransportErrorKind::DeadlineExceeded),
            CassandraError::Provider(msg) => {
                Self::Transport(ErrorClassifier::classify(msg, "unknown").kind)
            }
            CassandraError::Parse(_) | CassandraError::Validation(_) | CassandraError::Json(_) => {
                Self::Parse
            }
            CassandraError::Extraction { kind, .. } => Self::Extraction(*kind),
            CassandraError::Cancelled { .. } => Self::Cancelled,
            _ => Self::Internal,
        }
    }
}

/// Why a work item did not succeed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub stage: String,
    pub item_id: String,
    pub source_ref: String,
    pub kind: FailureKind,
    pub message: String,
}

/// One input unit (a source document or an extracted image)
///
/// Status transitions consume the item, and a terminal item ignores further transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub source_ref: String,
    pub order: SourceOrder,
    pub payload_ref: Option<PathBuf>,
    status: ItemStatus,
    failure: Option<FailureRecord>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, source_ref: impl Into<String>, order: SourceOrder) -> Self {
        Self {
            id: id.into(),
            source_ref: source_ref.into(),
            order,
            payload_ref: None,
            status: ItemStatus::Pending,
            failure: None,
        }
    }

    pub fn with_payload(mut self, payload_ref: impl Into<PathBuf>) -> Self {
        self.payload_ref = Some(payload_ref.into());
        self
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn failure(&self) -> Option<&FailureRecord> {
        self.failure.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Success
    }

    pub fn succeed(mut self) -> Self {
        if !self.is_terminal() {
            self.status = ItemStatus::Success;
        }
        self
    }

    pub fn fail(mut self, stage: &str, kind: FailureKind, message: impl Into<String>) -> Self {
        if self.is_terminal() {
            return self;
        }
        self.status = if kind == FailureKind::Cancelled {
            ItemStatus::Cancelled
        } else {
            ItemStatus::Failed
        };
        self.failure = Some(FailureRecord {
            stage: stage.to_string(),
            item_id: self.id.clone(),
            source_ref: self.source_ref.clone(),
            kind,
            message: message.into(),
        });
        self
    }

    pub fn fail_with(self, stage: &str, err: &CassandraError) -> Self {
        self.fail(stage, FailureKind::from_error(err), err.to_string())
    }

    pub fn cancel(self, stage: &str) -> Self {
        self.fail(stage, FailureKind::Cancelled, "cancelled before completion")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::error::TransportError;

    #[test]
    fn test_terminal_item_is_immutable() {
        let item = WorkItem::new("doc-1", "paper.pdf", SourceOrder::document(0)).succeed();
        let item = item.fail("mine", FailureKind::Parse, "late failure");
        assert_eq!(item.status(), ItemStatus::Success);
        assert!(item.failure().is_none());
    }

    #[test]
    fn test_cancel_records_failure() {
        let item = WorkItem::new("img-3", "fig.png", SourceOrder::new(1, 3)).cancel("audit");
        assert_eq!(item.status(), ItemStatus::Cancelled);
        let record = item.failure().unwrap();
        assert_eq!(record.kind, FailureKind::Cancelled);
        assert_eq!(record.stage, "audit");
    }

    #[test]
    fn test_failure_kind_from_error() {
        let err = CassandraError::extraction("scan.pdf", ExtractionErrorKind::ImageOnly);
        assert_eq!(
            FailureKind::from_error(&err),
            FailureKind::Extraction(ExtractionErrorKind::ImageOnly)
        );

        let err = CassandraError::Transport(TransportError::new(
            TransportErrorKind::RateLimited,
            "slow down",
        ));
        assert_eq!(
            FailureKind::from_error(&err),
            FailureKind::Transport(TransportErrorKind::RateLimited)
        );
        assert_eq!(
            FailureKind::from_error(&err).to_string(),
            "TRANSPORT:RATE_LIMITED"
        );
    }

    #[test]
    fn test_source_order_sorting() {
        let mut orders = vec![
            SourceOrder::new(1, 0),
            SourceOrder::new(0, 2),
            SourceOrder::new(0, 1),
        ];
        orders.sort();
        assert_eq!(orders[0], SourceOrder::new(0, 1));
        assert_eq!(orders[2], SourceOrder::new(1, 0));
    }
}
