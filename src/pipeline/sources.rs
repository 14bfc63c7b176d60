//! Collaborator Interfaces
//!
//! The pipeline delegates search, extraction, persistence and publishing to
//! these traits. Local implementations live in `manifest`, `fs_extractor` and
//! `crate::storage`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::synthesis::ReportArtifact;
use crate::types::{ExtractionErrorKind, Finding, Result, RunId, WorkItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Paper,
    Trial,
}

/// One search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    pub title: String,
    pub kind: DocumentKind,
    /// Downloaded full text or PDF, when available
    #[serde(default)]
    pub local_content_ref: Option<PathBuf>,
    /// Registry status for trials (e.g. `TERMINATED`)
    #[serde(default)]
    pub trial_status: Option<String>,
    #[serde(default)]
    pub why_stopped: Option<String>,
}

impl SourceDocument {
    pub fn has_content(&self) -> bool {
        self.local_content_ref.is_some()
    }

    pub fn is_failed_trial(&self) -> bool {
        self.kind == DocumentKind::Trial
            && self.trial_status.as_deref().is_some_and(|status| {
                crate::constants::pipeline::FAILED_TRIAL_STATUSES
                    .iter()
                    .any(|failed| status.eq_ignore_ascii_case(failed))
            })
    }
}

/// Text extraction outcome; `error` is set instead of failing the call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub text: String,
    pub error: Option<ExtractionErrorKind>,
}

impl Extraction {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            error: None,
        }
    }

    pub fn failed(kind: ExtractionErrorKind) -> Self {
        Self {
            text: String::new(),
            error: Some(kind),
        }
    }
}

#[derive(Clone)]
pub struct ExtractedImage {
    pub id: String,
    pub path: PathBuf,
    pub page: Option<u32>,
    pub mime: String,
    pub bytes: Arc<[u8]>,
}

impl std::fmt::Debug for ExtractedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractedImage")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("page", &self.page)
            .field("mime", &self.mime)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SourceDocument>>;
}

#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract_text(&self, content_ref: &std::path::Path) -> Result<Extraction>;

    async fn extract_images(&self, content_ref: &std::path::Path) -> Result<Vec<ExtractedImage>>;
}

/// Optional durable sink for work items and findings
///
/// Errors are logged by the caller and never fail the run.
#[async_trait]
pub trait FindingSink: Send + Sync {
    /// Upsert the run row with its current pipeline status
    async fn record_run(&self, _run_id: &RunId, _query: &str, _status: &str) -> Result<()> {
        Ok(())
    }

    async fn record_work_items(&self, run_id: &RunId, stage: &str, items: &[WorkItem])
    -> Result<()>;

    async fn record_findings(&self, run_id: &RunId, findings: &[Finding]) -> Result<()>;
}

/// Final report destination; returns where the artifact was published
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn publish(&self, artifact: &ReportArtifact) -> Result<Vec<String>>;
}

pub type SharedSearchClient = Arc<dyn SearchClient>;
pub type SharedExtractor = Arc<dyn ContentExtractor>;
pub type SharedFindingSink = Arc<dyn FindingSink>;
pub type SharedArtifactSink = Arc<dyn ArtifactSink>;

#[cfg(test)]
mod tests {
    use super::*;

    fn trial(status: Option<&str>) -> SourceDocument {
        SourceDocument {
            id: "NCT01".into(),
            title: "Trial".into(),
            kind: DocumentKind::Trial,
            local_content_ref: None,
            trial_status: status.map(String::from),
            why_stopped: None,
        }
    }

    #[test]
    fn test_failed_trial_statuses() {
        assert!(trial(Some("TERMINATED")).is_failed_trial());
        assert!(trial(Some("withdrawn")).is_failed_trial());
        assert!(!trial(Some("COMPLETED")).is_failed_trial());
        assert!(!trial(None).is_failed_trial());

        let mut paper = trial(Some("TERMINATED"));
        paper.kind = DocumentKind::Paper;
        assert!(!paper.is_failed_trial());
    }

    #[test]
    fn test_document_deserializes_with_defaults() {
        let doc: SourceDocument =
            serde_json::from_str(r#"{"id":"p1","title":"A","kind":"paper"}"#).unwrap();
        assert!(!doc.has_content());
        assert_eq!(doc.kind, DocumentKind::Paper);
    }
}
