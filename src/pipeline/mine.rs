//! Evidence mining stage
//!
//! Each analysed document is one work item. Long text is split into
//! overlapping chunks mined with separate calls; a failed chunk is skipped and
//! the item fails only when every chunk failed. Evidence from overlapping
//! chunks is deduplicated on a quote fingerprint.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::collect::CollectPayload;
use super::prompts::{EVIDENCE_MINER_SYSTEM, evidence_prompt, evidence_schema, evidence_shape};
use super::sources::SharedExtractor;
use super::stage_names::MINE;
use crate::ai::client::ResilientClient;
use crate::ai::provider::GenerationRequest;
use crate::ai::validation::repair;
use crate::constants::generation::{MINING_MAX_TOKENS, MINING_TEMPERATURE};
use crate::constants::pipeline::{DEDUP_FINGERPRINT_CHARS, MIN_TEXT_CHARS};
use crate::constants::repair::UNKNOWN_SENTINEL;
use crate::types::{
    CassandraError, ExtractionErrorKind, Finding, FindingKind, Result, Severity, SourceOrder,
    StageResult, WorkItem,
};
use crate::workflow::{Stage, StageContext, process_items};

/// Settings shared by the per-document analysis stages
#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub concurrency: usize,
    pub max_documents: usize,
    pub call_deadline: Duration,
}

#[derive(Debug, Clone, PartialEq)]
struct EvidenceItem {
    source: String,
    page_estimate: String,
    quote: String,
    risk_level: String,
    risk_type: String,
    explanation: String,
}

fn text_field(obj: &Value, key: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) if s != UNKNOWN_SENTINEL => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

impl EvidenceItem {
    fn from_value(obj: &Value) -> Option<Self> {
        let quote = text_field(obj, "quote");
        if quote.is_empty() {
            return None;
        }
        Some(Self {
            source: text_field(obj, "source"),
            page_estimate: text_field(obj, "page_estimate"),
            quote,
            risk_level: text_field(obj, "risk_level"),
            risk_type: text_field(obj, "risk_type"),
            explanation: text_field(obj, "explanation"),
        })
    }

    fn dedup_key(&self) -> String {
        self.quote
            .chars()
            .take(DEDUP_FINGERPRINT_CHARS)
            .collect::<String>()
            .to_lowercase()
            .trim()
            .to_string()
    }

    fn into_finding(self, item: &WorkItem, unit: usize) -> Finding {
        let severity = match Severity::parse_lenient(&self.risk_level) {
            Severity::Clean => Severity::Low,
            other => other,
        };
        let tag = if self.risk_type.is_empty() {
            "other".to_string()
        } else {
            self.risk_type.to_lowercase()
        };
        let explanation = if self.source.is_empty() {
            self.explanation
        } else {
            format!("{} [{}]", self.explanation, self.source)
        };
        let finding = Finding::new(
            MINE,
            item,
            unit,
            FindingKind::TextEvidence,
            severity,
            self.quote,
        )
        .with_tag(tag)
        .with_explanation(explanation.trim());
        if self.page_estimate.is_empty() {
            finding
        } else {
            finding.with_location(self.page_estimate)
        }
    }
}

/// Split text into chunks of `chunk_chars` characters overlapping by `overlap_pct` percent
pub fn split_chunks(text: &str, chunk_chars: usize, overlap_pct: usize) -> Vec<&str> {
    let chunk_chars = chunk_chars.max(1);
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total = boundaries.len() - 1;
    if total <= chunk_chars {
        return vec![text];
    }

    let overlap = (chunk_chars * overlap_pct.min(90)) / 100;
    let step = (chunk_chars - overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < total {
        let end = (start + chunk_chars).min(total);
        chunks.push(&text[boundaries[start]..boundaries[end]]);
        if end == total {
            break;
        }
        start += step;
    }
    chunks
}

fn dedup(items: Vec<EvidenceItem>) -> Vec<EvidenceItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.dedup_key()))
        .collect()
}

pub struct MineStage {
    client: ResilientClient,
    extractor: SharedExtractor,
    settings: AnalysisSettings,
    chunk_chars: usize,
    overlap_pct: usize,
}

impl MineStage {
    pub fn new(
        client: ResilientClient,
        extractor: SharedExtractor,
        settings: AnalysisSettings,
        chunk_chars: usize,
        overlap_pct: usize,
    ) -> Self {
        Self {
            client,
            extractor,
            settings,
            chunk_chars,
            overlap_pct,
        }
    }

    async fn mine_item(
        &self,
        query: &str,
        cancel: &CancellationToken,
        item: WorkItem,
    ) -> Result<Vec<Finding>> {
        let Some(path) = item.payload_ref.as_deref() else {
            return Err(CassandraError::extraction(
                &item.source_ref,
                ExtractionErrorKind::Corrupted,
            ));
        };
        let extraction = self.extractor.extract_text(path).await?;
        if let Some(kind) = extraction.error {
            return Err(CassandraError::extraction(&item.source_ref, kind));
        }
        if extraction.text.trim().chars().count() < MIN_TEXT_CHARS {
            return Err(CassandraError::extraction(
                &item.source_ref,
                ExtractionErrorKind::ImageOnly,
            ));
        }

        let chunks = split_chunks(&extraction.text, self.chunk_chars, self.overlap_pct);
        let mut evidence = Vec::new();
        let mut mined_chunks = 0;
        let mut last_error = None;
        for (index, chunk) in chunks.iter().enumerate() {
            let request = GenerationRequest::new(
                format!("{}:{}:chunk-{}", MINE, item.id, index),
                evidence_prompt(query, &item.source_ref, chunk, index, chunks.len()),
            )
            .with_system(EVIDENCE_MINER_SYSTEM)
            .structured(evidence_schema())
            .with_max_output_tokens(MINING_MAX_TOKENS)
            .with_temperature(MINING_TEMPERATURE)
            .with_deadline(self.settings.call_deadline);

            match self.mine_chunk(&request, cancel).await {
                Ok(found) => {
                    mined_chunks += 1;
                    evidence.extend(found);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(item = %item.id, chunk = index, error = %e, "Chunk failed, skipping");
                    last_error = Some(e);
                }
            }
        }

        if mined_chunks == 0 {
            return Err(last_error.unwrap_or_else(|| {
                CassandraError::Workflow(format!("no chunks mined for {}", item.id))
            }));
        }

        let raw = evidence.len();
        let evidence = dedup(evidence);
        debug!(item = %item.id, chunks = chunks.len(), raw, unique = evidence.len(), "Mined evidence");

        Ok(evidence
            .into_iter()
            .enumerate()
            .map(|(unit, ev)| ev.into_finding(&item, unit))
            .collect())
    }

    async fn mine_chunk(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<EvidenceItem>> {
        let response = self.client.invoke(request, cancel).await?;
        let outcome = repair(&response.text, &evidence_shape());
        if let Some(trace) = outcome.trace() {
            debug!(label = %request.label, strategy = ?trace.strategy, filled = trace.filled_fields.len(), "Repaired evidence output");
        }
        let value = outcome.into_result()?;
        Ok(value
            .get("evidence_items")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(EvidenceItem::from_value).collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Stage for MineStage {
    fn name(&self) -> &str {
        MINE
    }

    #[instrument(skip(self, ctx), fields(stage = MINE, run_id = %ctx.run_id))]
    async fn run(&self, ctx: StageContext) -> Result<StageResult> {
        let collected = CollectPayload::from_context(&ctx)?;
        let items: Vec<WorkItem> = collected
            .analysis_targets(self.settings.max_documents)
            .into_iter()
            .filter_map(|(index, doc)| {
                let path = doc.local_content_ref.as_ref()?;
                Some(
                    WorkItem::new(&doc.id, &doc.title, SourceOrder::document(index))
                        .with_payload(path),
                )
            })
            .collect();

        info!(documents = items.len(), "Mining evidence");
        let query = ctx.query.as_str();
        let result = process_items(
            MINE,
            items,
            self.settings.concurrency,
            &ctx.cancel,
            |item| self.mine_item(query, &ctx.cancel, item),
        )
        .await;
        info!(
            succeeded = result.succeeded,
            failed = result.failed_count(),
            findings = result.findings.len(),
            "Mining complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::client::tests::RoutedProvider;
    use crate::ai::retry::RetryPolicy;
    use crate::pipeline::collect::tests::doc;
    use crate::pipeline::sources::{ContentExtractor, DocumentKind, ExtractedImage, Extraction};
    use crate::types::{FailureKind, RunId, StageStatus};
    use crate::workflow::ProgressTracker;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    struct TextExtractor;

    #[async_trait]
    impl ContentExtractor for TextExtractor {
        async fn extract_text(&self, content_ref: &Path) -> Result<Extraction> {
            let name = content_ref.to_string_lossy();
            if name.contains("locked") {
                return Ok(Extraction::failed(ExtractionErrorKind::Encrypted));
            }
            if name.contains("long") {
                return Ok(Extraction::text("x".repeat(250)));
            }
            Ok(Extraction::text(format!("{} {}", name, "body text ".repeat(20))))
        }

        async fn extract_images(&self, _content_ref: &Path) -> Result<Vec<ExtractedImage>> {
            Ok(Vec::new())
        }
    }

    const EVIDENCE: &str = r#"```json
{"evidence_items": [
  {"source": "Table 2", "page_estimate": "p. 4", "quote": "Grade 3 hepatotoxicity in 4/20 subjects", "risk_level": "HIGH", "risk_type": "Toxicity", "explanation": "dismissed"},
  {"source": "Methods", "quote": "Primary endpoint changed in amendment 3", "risk_level": "MEDIUM", "risk_type": "endpoint_change", "explanation": "post hoc"}
]}
```"#;

    fn settings() -> AnalysisSettings {
        AnalysisSettings {
            concurrency: 2,
            max_documents: 3,
            call_deadline: Duration::from_secs(5),
        }
    }

    fn upstream(docs: Vec<crate::pipeline::sources::SourceDocument>) -> StageContext {
        let collect = StageResult::from_items("collect", Vec::new(), Vec::new()).with_payload(
            serde_json::to_value(CollectPayload { documents: docs }).unwrap(),
        );
        StageContext::new(
            RunId::new("run"),
            "drug x",
            vec![Arc::new(collect)],
            CancellationToken::new(),
            ProgressTracker::new(),
        )
    }

    #[test]
    fn test_split_chunks_overlap() {
        let text = "abcdefghij".repeat(3);
        let chunks = split_chunks(&text, 10, 10);
        assert_eq!(chunks[0], "abcdefghij");
        assert_eq!(chunks[1], "jabcdefghi");
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert!(text.ends_with(chunks.last().unwrap()));

        assert_eq!(split_chunks("short", 10, 10), vec!["short"]);
        assert_eq!(split_chunks("ééééé", 2, 0), vec!["éé", "éé", "é"]);
    }

    #[test]
    fn test_dedup_on_quote_prefix() {
        let item = |quote: &str| EvidenceItem {
            source: String::new(),
            page_estimate: String::new(),
            quote: quote.to_string(),
            risk_level: "HIGH".into(),
            risk_type: String::new(),
            explanation: String::new(),
        };
        let unique = dedup(vec![item("Adverse Event X"), item("adverse event x"), item("other")]);
        assert_eq!(unique.len(), 2);
    }

    #[tokio::test]
    async fn test_mine_extracts_and_classifies() {
        let provider = Arc::new(RoutedProvider::new(|_req| Ok(EVIDENCE.to_string())));
        let client = ResilientClient::unlimited(provider, RetryPolicy::immediate(1));
        let stage = MineStage::new(client, Arc::new(TextExtractor), settings(), 1_000, 10);

        let ctx = upstream(vec![
            doc("a", DocumentKind::Paper, None, true),
            doc("locked", DocumentKind::Paper, None, true),
            doc("b", DocumentKind::Paper, None, false),
        ]);
        let result = stage.run(ctx).await.unwrap();

        assert_eq!(result.attempted, 2);
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.status, StageStatus::Degraded);
        assert_eq!(
            result.failures[0].kind,
            FailureKind::Extraction(ExtractionErrorKind::Encrypted)
        );

        assert_eq!(result.findings.len(), 2);
        assert_eq!(result.findings[0].severity, Severity::High);
        assert_eq!(result.findings[0].tag, "toxicity");
        assert_eq!(result.findings[0].location.as_deref(), Some("p. 4"));
        assert_eq!(result.findings[1].severity, Severity::Medium);
        assert!(result.findings[1].location.is_none());
    }

    #[tokio::test]
    async fn test_item_fails_only_when_every_chunk_fails() {
        let provider = Arc::new(RoutedProvider::new(|req| {
            if req.label.ends_with("chunk-0") {
                Ok("not json at all".to_string())
            } else {
                Ok(EVIDENCE.to_string())
            }
        }));
        let client = ResilientClient::unlimited(provider.clone(), RetryPolicy::immediate(1));
        let stage = MineStage::new(client, Arc::new(TextExtractor), settings(), 120, 10);

        let result = stage
            .run(upstream(vec![doc("long", DocumentKind::Paper, None, true)]))
            .await
            .unwrap();
        assert_eq!(result.status, StageStatus::Completed);
        assert!(provider.calls.load(Ordering::SeqCst) >= 2);
        // Overlapping chunks returned the same quotes
        assert_eq!(result.findings.len(), 2);

        let provider = Arc::new(RoutedProvider::new(|_req| {
            Ok("no structured output here".to_string())
        }));
        let client = ResilientClient::unlimited(provider, RetryPolicy::immediate(1));
        let stage = MineStage::new(client, Arc::new(TextExtractor), settings(), 120, 10);
        let result = stage
            .run(upstream(vec![doc("long", DocumentKind::Paper, None, true)]))
            .await
            .unwrap();
        assert_eq!(result.succeeded, 0);
        assert_eq!(result.failures[0].kind, FailureKind::Parse);
    }
}
