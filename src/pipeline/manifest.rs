//! Search over a local JSON corpus manifest
//!
//! ```json
//! {
//!   "query": "drug x",
//!   "documents": [
//!     {"id": "PMC1", "title": "...", "kind": "paper", "local_content_ref": "papers/pmc1.pdf"},
//!     {"id": "NCT01", "title": "...", "kind": "trial", "trial_status": "TERMINATED"}
//!   ]
//! }
//! ```
//!
//! Relative content paths resolve against the manifest's directory. A bare
//! array of documents is accepted as well.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::sources::{SearchClient, SourceDocument};
use crate::types::{CassandraError, Result};

#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestFile {
    Full {
        #[serde(default)]
        query: Option<String>,
        documents: Vec<SourceDocument>,
    },
    Bare(Vec<SourceDocument>),
}

#[derive(Debug, Clone)]
pub struct ManifestSearchClient {
    path: PathBuf,
    query: Option<String>,
    documents: Vec<SourceDocument>,
}

impl ManifestSearchClient {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CassandraError::Config(format!("Cannot read corpus manifest {}: {}", path.display(), e))
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&content, base).map(|mut client| {
            client.path = path.to_path_buf();
            client
        })
    }

    pub fn parse(content: &str, base: &Path) -> Result<Self> {
        let (query, mut documents) = match serde_json::from_str(content)? {
            ManifestFile::Full { query, documents } => (query, documents),
            ManifestFile::Bare(documents) => (None, documents),
        };
        for doc in &mut documents {
            if let Some(content_ref) = &doc.local_content_ref
                && content_ref.is_relative()
            {
                doc.local_content_ref = Some(base.join(content_ref));
            }
        }
        Ok(Self {
            path: base.to_path_buf(),
            query,
            documents,
        })
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl SearchClient for ManifestSearchClient {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SourceDocument>> {
        if let Some(expected) = &self.query
            && !expected.eq_ignore_ascii_case(query.trim())
        {
            warn!(
                manifest = %self.path.display(),
                manifest_query = %expected,
                query,
                "Corpus manifest was collected for a different query"
            );
        }
        let hits: Vec<SourceDocument> = self.documents.iter().take(max_results).cloned().collect();
        debug!(hits = hits.len(), available = self.documents.len(), "Manifest search");
        Ok(hits)
    }
}
