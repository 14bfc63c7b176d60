pub mod error;
pub mod finding;
pub mod stage;
pub mod work;

pub use error::{
    CassandraError, ErrorClassifier, ExtractionErrorKind, ParseError, Result, ResultExt,
    StageStartError, TransportError, TransportErrorKind,
};
pub use finding::{Finding, FindingKind, Severity, SeverityTier, fingerprint};
pub use stage::{StageResult, StageStatus};
pub use work::{FailureKind, FailureRecord, ItemStatus, SourceOrder, WorkItem};

// =============================================================================
// Domain Newtypes
// =============================================================================

use std::fmt;

/// Type-safe wrapper for run IDs
///
/// Prevents accidental mixing of run IDs with other string types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
