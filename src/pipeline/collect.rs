//! Collection stage: search, then one trial/document finding per hit

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::sources::{DocumentKind, SharedSearchClient, SourceDocument};
use super::stage_names::COLLECT;
use crate::types::{
    CassandraError, Finding, FindingKind, Result, Severity, SourceOrder, StageResult, WorkItem,
};
use crate::workflow::{PipelineStatus, Stage, StageContext};

/// Structured payload of the collect stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectPayload {
    pub documents: Vec<SourceDocument>,
}

impl CollectPayload {
    /// Documents collected upstream; empty when collection produced no payload
    pub fn from_context(ctx: &StageContext) -> Result<Self> {
        let Some(payload) = ctx.upstream(COLLECT).and_then(|r| r.payload.clone()) else {
            return Ok(Self::default());
        };
        Ok(serde_json::from_value(payload)?)
    }

    /// First `limit` documents with local content, with their collection index
    pub fn analysis_targets(&self, limit: usize) -> Vec<(usize, &SourceDocument)> {
        self.documents
            .iter()
            .enumerate()
            .filter(|(_, doc)| doc.has_content())
            .take(limit)
            .collect()
    }
}

pub struct CollectStage {
    search: SharedSearchClient,
    max_results: usize,
}

impl CollectStage {
    pub fn new(search: SharedSearchClient, max_results: usize) -> Self {
        Self {
            search,
            max_results,
        }
    }
}

fn document_finding(item: &WorkItem, doc: &SourceDocument) -> Finding {
    match doc.kind {
        DocumentKind::Trial => {
            let status = doc.trial_status.as_deref().unwrap_or("UNKNOWN");
            let severity = if doc.is_failed_trial() {
                Severity::High
            } else {
                Severity::Low
            };
            let explanation = match &doc.why_stopped {
                Some(reason) => format!("Trial {} ({}): {}", doc.id, status, reason),
                None => format!("Trial {} registry status {}", doc.id, status),
            };
            Finding::new(
                COLLECT,
                item,
                0,
                FindingKind::TrialRecord,
                severity,
                doc.title.clone(),
            )
            .with_tag(status.to_uppercase())
            .with_explanation(explanation)
        }
        DocumentKind::Paper => {
            let explanation = if doc.has_content() {
                "full text available"
            } else {
                "metadata only"
            };
            Finding::new(
                COLLECT,
                item,
                0,
                FindingKind::Document,
                Severity::Clean,
                doc.title.clone(),
            )
            .with_tag("paper")
            .with_explanation(explanation)
        }
    }
}

#[async_trait]
impl Stage for CollectStage {
    fn name(&self) -> &str {
        COLLECT
    }

    fn phase(&self) -> PipelineStatus {
        PipelineStatus::Collecting
    }

    #[instrument(skip(self, ctx), fields(stage = COLLECT, run_id = %ctx.run_id))]
    async fn run(&self, ctx: StageContext) -> Result<StageResult> {
        let documents = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(CassandraError::cancelled("collect search")),
            found = self.search.search(&ctx.query, self.max_results) => found?,
        };

        let mut items = Vec::with_capacity(documents.len());
        let mut findings = Vec::with_capacity(documents.len());
        for (index, doc) in documents.iter().enumerate() {
            let mut item = WorkItem::new(&doc.id, &doc.title, SourceOrder::document(index));
            if let Some(path) = &doc.local_content_ref {
                item = item.with_payload(path);
            }
            findings.push(document_finding(&item, doc));
            items.push(item.succeed());
        }

        let trials = documents
            .iter()
            .filter(|d| d.kind == DocumentKind::Trial)
            .count();
        info!(
            documents = documents.len(),
            trials,
            with_content = documents.iter().filter(|d| d.has_content()).count(),
            "Collection complete"
        );

        let payload = serde_json::to_value(CollectPayload { documents })?;
        Ok(StageResult::from_items(COLLECT, items, findings).with_payload(payload))
    }
}
