//! Forensic image audit stage
//!
//! Every figure extracted from an analysed document becomes its own work item
//! and is sent to the model as a binary attachment.

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::collect::CollectPayload;
use super::mine::AnalysisSettings;
use super::prompts::{FORENSIC_AUDITOR_SYSTEM, forensic_prompt, forensic_schema, forensic_shape};
use super::sources::{ExtractedImage, SharedExtractor};
use super::stage_names::AUDIT;
use crate::ai::client::ResilientClient;
use crate::ai::provider::{Attachment, GenerationRequest};
use crate::ai::validation::repair;
use crate::constants::generation::{FORENSIC_MAX_TOKENS, FORENSIC_TEMPERATURE};
use crate::constants::pipeline::HIGH_TAMPERING_SCORE;
use crate::types::{
    CassandraError, Finding, FindingKind, Result, Severity, SourceOrder, StageResult, WorkItem,
};
use crate::workflow::{Stage, StageContext, process_items};

static PAGE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_p(\d+)").expect("page pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuditStatus {
    Clean,
    Suspicious,
}

/// Parsed forensic verdict for one image
#[derive(Debug, Clone, PartialEq)]
struct Verdict {
    status: AuditStatus,
    tampering_score: f64,
    findings: String,
    model_confidence: Option<f64>,
}

/// Numeric score, or one of the text labels high/medium/low/clean
fn tampering_score(value: &Value) -> Option<f64> {
    let score = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "high" => Some(0.9),
            "medium" => Some(0.5),
            "low" => Some(0.1),
            "clean" | "none" => Some(0.0),
            other => other.parse::<f64>().ok(),
        },
        _ => None,
    };
    score
        .filter(|score| score.is_finite())
        .map(|score| score.clamp(0.0, 1.0))
}

impl Verdict {
    fn from_value(value: &Value, image_id: &str) -> Result<Self> {
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_uppercase();
        let findings = value
            .get("findings")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();

        let status = match status.as_str() {
            "CLEAN" => AuditStatus::Clean,
            "SUSPICIOUS" => AuditStatus::Suspicious,
            "ERROR" => {
                return Err(CassandraError::Validation(format!(
                    "forensic analysis reported ERROR for {}: {}",
                    image_id, findings
                )));
            }
            other => {
                return Err(CassandraError::Validation(format!(
                    "unrecognized forensic status '{}' for {}",
                    other, image_id
                )));
            }
        };

        let default_score = match status {
            AuditStatus::Clean => 0.0,
            AuditStatus::Suspicious => 0.5,
        };
        let score = value
            .get("tampering_risk_score")
            .and_then(tampering_score)
            .unwrap_or(default_score);
        let model_confidence = value
            .get("model_confidence")
            .or_else(|| value.get("confidence"))
            .and_then(tampering_score);

        Ok(Self {
            status,
            tampering_score: score,
            findings,
            model_confidence,
        })
    }

    fn severity(&self) -> Severity {
        match self.status {
            AuditStatus::Suspicious if self.tampering_score >= HIGH_TAMPERING_SCORE => {
                Severity::High
            }
            AuditStatus::Suspicious => Severity::Medium,
            AuditStatus::Clean => Severity::Clean,
        }
    }
}

/// Page number from an `_p<N>` marker in the image name
pub fn page_from_name(name: &str) -> Option<u32> {
    PAGE_PATTERN
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub struct AuditStage {
    client: ResilientClient,
    extractor: SharedExtractor,
    settings: AnalysisSettings,
}

impl AuditStage {
    pub fn new(
        client: ResilientClient,
        extractor: SharedExtractor,
        settings: AnalysisSettings,
    ) -> Self {
        Self {
            client,
            extractor,
            settings,
        }
    }

    async fn audit_image(
        &self,
        images: &HashMap<String, ExtractedImage>,
        cancel: &CancellationToken,
        item: WorkItem,
    ) -> Result<Vec<Finding>> {
        let image = images.get(&item.id).ok_or_else(|| {
            CassandraError::Workflow(format!("no image registered for work item {}", item.id))
        })?;

        let request = GenerationRequest::new(
            format!("{}:{}", AUDIT, item.id),
            forensic_prompt(&image.id, &item.source_ref),
        )
        .with_system(FORENSIC_AUDITOR_SYSTEM)
        .with_attachment(Attachment::new(image.mime.clone(), image.bytes.clone()))
        .structured(forensic_schema())
        .with_max_output_tokens(FORENSIC_MAX_TOKENS)
        .with_temperature(FORENSIC_TEMPERATURE)
        .with_deadline(self.settings.call_deadline);

        let response = self.client.invoke(&request, cancel).await?;
        let value = repair(&response.text, &forensic_shape()).into_result()?;
        let verdict = Verdict::from_value(&value, &image.id)?;
        debug!(image = %image.id, status = ?verdict.status, score = verdict.tampering_score, "Audited image");

        let page = image.page.or_else(|| {
            image
                .path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(page_from_name)
                .or_else(|| page_from_name(&image.id))
        });
        let location = match page {
            Some(page) => format!("p. {} ({})", page, image.id),
            None => image.id.clone(),
        };
        let quote = if verdict.findings.is_empty() {
            "No suspicious patterns detected".to_string()
        } else {
            verdict.findings.clone()
        };
        let mut explanation = format!("tampering risk {:.2}", verdict.tampering_score);
        if let Some(confidence) = verdict.model_confidence {
            explanation.push_str(&format!(", model confidence {:.2}", confidence));
        }
        let tag = match verdict.status {
            AuditStatus::Suspicious => "image_manipulation",
            AuditStatus::Clean => "clean",
        };

        Ok(vec![
            Finding::new(AUDIT, &item, 0, FindingKind::ImageAudit, verdict.severity(), quote)
                .with_tag(tag)
                .with_explanation(explanation)
                .with_location(location)
                .with_score(verdict.tampering_score),
        ])
    }
}

#[async_trait]
impl Stage for AuditStage {
    fn name(&self) -> &str {
        AUDIT
    }

    #[instrument(skip(self, ctx), fields(stage = AUDIT, run_id = %ctx.run_id))]
    async fn run(&self, ctx: StageContext) -> Result<StageResult> {
        let collected = CollectPayload::from_context(&ctx)?;

        let mut images = HashMap::new();
        let mut items = Vec::new();
        let mut listing_failures = Vec::new();
        for (index, doc) in collected.analysis_targets(self.settings.max_documents) {
            if ctx.is_cancelled() {
                break;
            }
            let Some(path) = doc.local_content_ref.as_deref() else {
                continue;
            };
            match self.extractor.extract_images(path).await {
                Ok(extracted) => {
                    for (unit, image) in extracted.into_iter().enumerate() {
                        let id = format!("{}:{}", doc.id, image.id);
                        items.push(
                            WorkItem::new(&id, &doc.title, SourceOrder::new(index, unit))
                                .with_payload(&image.path),
                        );
                        images.insert(id, image);
                    }
                }
                Err(e) => {
                    warn!(document = %doc.id, error = %e, "Image extraction failed");
                    let item = WorkItem::new(
                        format!("{}:figures", doc.id),
                        &doc.title,
                        SourceOrder::document(index),
                    );
                    listing_failures.push(item.fail_with(AUDIT, &e));
                }
            }
        }

        info!(images = items.len(), "Auditing images");
        let result = process_items(
            AUDIT,
            items,
            self.settings.concurrency,
            &ctx.cancel,
            |item| self.audit_image(&images, &ctx.cancel, item),
        )
        .await;

        let result = if listing_failures.is_empty() {
            result
        } else {
            let mut all_items = result.items;
            all_items.extend(listing_failures);
            StageResult::from_items(AUDIT, all_items, result.findings)
        };
        info!(
            succeeded = result.succeeded,
            failed = result.failed_count(),
            suspicious = result
                .findings
                .iter()
                .filter(|f| f.severity != Severity::Clean)
                .count(),
            "Audit complete"
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
    use crate::pipeline::sources::{ContentExtractor, DocumentKind, Extraction};
    use crate::types::{ExtractionErrorKind, FailureKind, RunId, StageStatus};
    use crate::workflow::ProgressTracker;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    struct FigureExtractor;

    #[async_trait]
    impl ContentExtractor for FigureExtractor {
        async fn extract_text(&self, _content_ref: &Path) -> Result<Extraction> {
            Ok(Extraction::default())
        }

        async fn extract_images(&self, content_ref: &Path) -> Result<Vec<ExtractedImage>> {
            if content_ref.to_string_lossy().contains("broken") {
                return Err(CassandraError::extraction(
                    "broken",
                    ExtractionErrorKind::Corrupted,
                ));
            }
            Ok(["fig_p3", "fig_p7", "fig_p9"]
                .iter()
                .map(|name| ExtractedImage {
                    id: name.to_string(),
                    path: PathBuf::from(format!("/figures/{name}.png")),
                    page: None,
                    mime: "image/png".into(),
                    bytes: Arc::from(vec![0u8; 4]),
                })
                .collect())
        }
    }

    fn settings() -> AnalysisSettings {
        AnalysisSettings {
            concurrency: 2,
            max_documents: 3,
            call_deadline: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_tampering_labels() {
        assert_eq!(tampering_score(&json!("High")), Some(0.9));
        assert_eq!(tampering_score(&json!("medium")), Some(0.5));
        assert_eq!(tampering_score(&json!("0.75")), Some(0.75));
        assert_eq!(tampering_score(&json!(3.0)), Some(1.0));
        assert_eq!(tampering_score(&json!("n/a")), None);
    }

    #[test]
    fn test_verdict_severity() {
        let verdict = |status: &str, score: f64| {
            Verdict::from_value(
                &json!({"status": status, "tampering_risk_score": score, "findings": "x"}),
                "img",
            )
        };
        assert_eq!(verdict("SUSPICIOUS", 0.8).unwrap().severity(), Severity::High);
        assert_eq!(verdict("suspicious", 0.4).unwrap().severity(), Severity::Medium);
        assert_eq!(verdict("CLEAN", 0.9).unwrap().severity(), Severity::Clean);
        assert!(matches!(verdict("ERROR", 0.0), Err(CassandraError::Validation(_))));
        assert!(verdict("UNKNOWN", 0.0).is_err());
    }

    #[test]
    fn test_verdict_parses_model_confidence_and_default_score() {
        let verdict = Verdict::from_value(
            &json!({"status": "SUSPICIOUS", "findings": "cloned band", "model_confidence": "high"}),
            "img",
        )
        .unwrap();
        assert_eq!(verdict.model_confidence, Some(0.9));
        assert_eq!(verdict.tampering_score, 0.5);
        assert_eq!(verdict.findings, "cloned band");

        let verdict = Verdict::from_value(
            &json!({"status": "CLEAN", "tampering_risk_score": "low", "confidence": 0.8}),
            "img",
        )
        .unwrap();
        assert_eq!(verdict.tampering_score, 0.1);
        assert_eq!(verdict.model_confidence, Some(0.8));
    }

    #[test]
    fn test_page_from_name() {
        assert_eq!(page_from_name("paper_p12_img3"), Some(12));
        assert_eq!(page_from_name("figure1"), None);
    }

    #[tokio::test]
    async fn test_audit_images_individually() {
        let provider = Arc::new(RoutedProvider::new(|req| {
            assert!(req.attachment.is_some());
            if req.label.contains("fig_p3") {
                Ok(r#"{"status": "SUSPICIOUS", "tampering_risk_score": "high", "findings": "duplicated lanes"}"#.into())
            } else if req.label.contains("fig_p7") {
                Ok(r#"{"status": "ERROR", "tampering_risk_score": 0, "findings": "unreadable"}"#.into())
            } else {
                Ok(r#"{"status": "CLEAN", "tampering_risk_score": 0.05, "findings": ""}"#.into())
            }
        }));
        let client = ResilientClient::unlimited(provider, RetryPolicy::immediate(1));
        let stage = AuditStage::new(client, Arc::new(FigureExtractor), settings());

        let collect = StageResult::from_items("collect", Vec::new(), Vec::new()).with_payload(
            serde_json::to_value(CollectPayload {
                documents: vec![
                    doc("a", DocumentKind::Paper, None, true),
                    doc("broken", DocumentKind::Paper, None, true),
                ],
            })
            .unwrap(),
        );
        let ctx = StageContext::new(
            RunId::new("run"),
            "q",
            vec![Arc::new(collect)],
            tokio_util::sync::CancellationToken::new(),
            ProgressTracker::new(),
        );
        let result = stage.run(ctx).await.unwrap();

        assert_eq!(result.attempted, 4);
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.status, StageStatus::Degraded);
        let kinds: Vec<_> = result.failures.iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&FailureKind::Parse));
        assert!(kinds.contains(&FailureKind::Extraction(ExtractionErrorKind::Corrupted)));

        assert_eq!(result.findings.len(), 2);
        assert_eq!(result.findings[0].severity, Severity::High);
        assert_eq!(result.findings[0].location.as_deref(), Some("p. 3 (fig_p3)"));
        assert_eq!(result.findings[0].score, Some(0.9));
        assert_eq!(result.findings[1].severity, Severity::Clean);
    }
}
