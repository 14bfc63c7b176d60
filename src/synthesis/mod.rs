//! Segmented Synthesizer
//!
//! The report is generated one section at a time, in declaration order. Every
//! call sees the budgeted context, the key facts of earlier sections and the
//! computed scores. A section that keeps failing validation ends in a
//! deterministic fallback instead of failing the run.
//!
//! ## Evidence gate
//!
//! Sections that state compound-level facts are skipped when run confidence is
//! below `synthesis.min_confidence_for_facts` or no analysis unit succeeded.

pub mod artifact;
pub mod facts;
pub mod guard;
pub mod render;
pub mod sections;

pub use artifact::ReportArtifact;
pub use facts::KeyFactLedger;
pub use guard::{NumberCorrection, NumberGuard, ScoreKind};
pub use render::{DEFAULT_TEMPLATE, Placeholder, ReportContext, Template};
pub use sections::{
    GeneratingSection, PendingSection, ReportSection, SECTIONS, SectionKey, SectionSpec,
    SectionState,
};

use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::ai::client::ResilientClient;
use crate::ai::provider::GenerationRequest;
use crate::ai::validation::{ExpectedShape, repair};
use crate::config::SynthesisConfig;
use crate::constants::generation::REPORT_TEMPERATURE;
use crate::constants::repair::UNKNOWN_SENTINEL;
use crate::pipeline::aggregate::AggregateReport;
use crate::types::{CassandraError, Result};
use crate::workflow::{MessageLevel, ProgressTracker};

pub const REPORT_WRITER_SYSTEM: &str = "You are a senior biotech investment risk analyst writing one section of a due-diligence report. \
Use only the evidence provided. Quote the confidence and risk numbers exactly as given; never recompute them. \
When the evidence does not support a statement, say so plainly instead of guessing. \
Respond with a single JSON object containing every requested field as a markdown string.";

fn section_schema(spec: &SectionSpec) -> Value {
    let properties: Map<String, Value> = spec
        .fields
        .iter()
        .map(|f| (f.to_string(), json!({"type": "string"})))
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": spec.fields,
    })
}

fn section_prompt(
    spec: &SectionSpec,
    query: &str,
    report: &AggregateReport,
    ledger: &KeyFactLedger,
) -> String {
    let risk = &report.risk;
    format!(
        "Research question: {query}\n\n\
         Section: {title}\n{guidance}\n\n\
         Computed scores (quote exactly):\n\
         - Confidence: {confidence}\n\
         - Risk score: {risk_score:.1}/10 ({level})\n\
         - Recommendation: {recommendation}\n\n\
         Facts established in earlier sections:\n{facts}\n\n\
         Evidence:\n{context}\n\n\
         Return a JSON object with these string fields: {fields}",
        query = query,
        title = spec.title,
        guidance = spec.guidance,
        confidence = report.confidence,
        risk_score = risk.total,
        level = risk.level,
        recommendation = risk.recommendation,
        facts = ledger.render().trim_end(),
        context = if report.context.is_empty() {
            "(no findings)"
        } else {
            report.context.text.as_str()
        },
        fields = spec.fields.join(", "),
    )
}

/// Accept a repaired response only if every field was actually present and non-empty
fn validate_fields(spec: &SectionSpec, raw: &str) -> Result<Map<String, Value>> {
    let outcome = repair(raw, &ExpectedShape::object(spec.fields));
    if let Some(trace) = outcome.trace()
        && !trace.filled_fields.is_empty()
    {
        return Err(CassandraError::Validation(format!(
            "missing fields: {}",
            trace.filled_fields.join(", ")
        )));
    }
    let Value::Object(fields) = outcome.into_result()? else {
        return Err(CassandraError::Validation("expected a JSON object".into()));
    };

    let blank: Vec<&str> = spec
        .fields
        .iter()
        .copied()
        .filter(|name| match fields.get(*name) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty() || s.trim() == UNKNOWN_SENTINEL,
            Some(Value::Array(items)) => items.is_empty(),
            Some(_) => false,
        })
        .collect();
    if !blank.is_empty() {
        return Err(CassandraError::Validation(format!(
            "empty or unknown fields: {}",
            blank.join(", ")
        )));
    }
    Ok(fields)
}

pub struct Synthesizer {
    client: ResilientClient,
    config: SynthesisConfig,
    template: Template,
    call_deadline: Duration,
}

impl Synthesizer {
    pub fn new(
        client: ResilientClient,
        config: SynthesisConfig,
        template: Template,
        call_deadline: Duration,
    ) -> Self {
        Self {
            client,
            config,
            template,
            call_deadline,
        }
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    /// Why compound-level sections must not be generated, if they must not
    pub fn gate_reason(&self, report: &AggregateReport) -> Option<String> {
        if !report.confidence.any_succeeded() {
            return Some("no analysis unit succeeded".to_string());
        }
        if report.confidence.value < self.config.min_confidence_for_facts {
            return Some(format!(
                "run confidence {} is below {:.1}",
                report.confidence, self.config.min_confidence_for_facts
            ));
        }
        None
    }

    /// Generate every section in order; only cancellation is an error
    #[instrument(skip(self, report, cancel, progress), fields(confidence = report.confidence.value))]
    pub async fn synthesize(
        &self,
        query: &str,
        report: &AggregateReport,
        cancel: &CancellationToken,
        progress: &ProgressTracker,
    ) -> Result<Vec<ReportSection>> {
        let guard = NumberGuard::new(report.confidence.value, report.risk.total);
        let gate = self.gate_reason(report);
        let mut ledger = KeyFactLedger::new(self.config.carry_over_chars);
        let mut sections = Vec::with_capacity(SECTIONS.len());

        for spec in SECTIONS {
            if cancel.is_cancelled() {
                return Err(CassandraError::cancelled(format!("write:{}", spec.key)));
            }
            let pending = PendingSection::new(spec);

            let section = match &gate {
                Some(reason) if spec.key.states_compound_facts() => {
                    info!(section = %spec.key, reason = %reason, "Section gated");
                    pending.skip(reason.clone())
                }
                _ => {
                    self.generate(pending, query, report, &ledger, &guard, cancel)
                        .await?
                }
            };

            if section.is_fallback() {
                progress.message(
                    MessageLevel::Warning,
                    format!(
                        "{} fell back: {}",
                        section.title,
                        section.fallback_reason.as_deref().unwrap_or("unknown")
                    ),
                );
            } else {
                progress.message(
                    MessageLevel::Info,
                    format!("{} written ({} attempt(s))", section.title, section.attempts),
                );
            }
            for correction in &section.corrections {
                warn!(
                    section = %section.key,
                    field = %correction.field,
                    found = correction.found,
                    expected = correction.expected,
                    "Corrected misquoted score"
                );
            }

            ledger.push_section(&section);
            sections.push(section);
        }

        Ok(sections)
    }

    async fn generate(
        &self,
        pending: PendingSection,
        query: &str,
        report: &AggregateReport,
        ledger: &KeyFactLedger,
        guard: &NumberGuard,
        cancel: &CancellationToken,
    ) -> Result<ReportSection> {
        let spec = pending.spec();
        let request = GenerationRequest::new(
            format!("write:{}", spec.key),
            section_prompt(spec, query, report, ledger),
        )
        .with_system(REPORT_WRITER_SYSTEM)
        .structured(section_schema(spec))
        .with_max_output_tokens(spec.max_tokens)
        .with_temperature(REPORT_TEMPERATURE)
        .with_deadline(self.call_deadline);

        let mut generating = pending.start();
        let max_attempts = 1 + self.config.section_retries;
        let mut last_error = None;

        while generating.attempts() < max_attempts {
            let attempt = generating.record_attempt();
            let result = match self.client.invoke(&request, cancel).await {
                Ok(response) => validate_fields(spec, &response.text),
                Err(e) => Err(e),
            };
            match result {
                Ok(fields) => {
                    debug!(section = %spec.key, attempt, "Section accepted");
                    return Ok(generating.finish(fields, guard));
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(section = %spec.key, attempt, max_attempts, error = %e, "Section attempt failed");
                    last_error = Some(e);
                }
            }
        }

        let reason = match last_error {
            Some(e) => format!("generation failed after {} attempt(s): {}", generating.attempts(), e),
            None => "no attempts allowed".to_string(),
        };
        Ok(generating.fallback(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::client::tests::RoutedProvider;
    use crate::ai::context::ContextBudgeter;
    use crate::ai::retry::RetryPolicy;
    use crate::constants::synthesis::INSUFFICIENT_DATA_MARKER;
    use crate::scoring::{ConfidenceScore, RiskInputs, RiskScorer};
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    fn report(succeeded: usize, attempted: usize) -> AggregateReport {
        AggregateReport {
            confidence: ConfidenceScore::new(succeeded, attempted),
            risk: RiskScorer::default().assess(RiskInputs {
                total_trials: 4,
                failed_trials: 2,
                high_severity_findings: 3,
                suspicious_images: 1,
            }),
            context: ContextBudgeter::new(1_000, 2.0).build(&[]),
            failures: Vec::new(),
            stages: Vec::new(),
            total_findings: 0,
        }
    }

    fn section_key(label: &str) -> &str {
        label.strip_prefix("write:").unwrap_or(label)
    }

    fn valid_fields(label: &str) -> String {
        let spec = SECTIONS
            .iter()
            .find(|s| s.key.as_str() == section_key(label))
            .unwrap();
        let fields: Map<String, Value> = spec
            .fields
            .iter()
            .map(|f| (f.to_string(), json!(format!("{} content", f))))
            .collect();
        Value::Object(fields).to_string()
    }

    fn synthesizer(provider: Arc<RoutedProvider>) -> Synthesizer {
        Synthesizer::new(
            ResilientClient::unlimited(provider, RetryPolicy::immediate(1)),
            SynthesisConfig::default(),
            Template::builtin(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_all_sections_generated_with_carry_over() {
        let provider = Arc::new(RoutedProvider::new(|req| {
            if req.label == "write:scenarios" && !req.prompt.contains("- [metadata] compound_name") {
                return Err(CassandraError::Validation("facts were not carried".into()));
            }
            Ok(valid_fields(&req.label))
        }));
        let sections = synthesizer(provider.clone())
            .synthesize("drug x", &report(9, 10), &CancellationToken::new(), &ProgressTracker::new())
            .await
            .unwrap();

        assert_eq!(sections.len(), 6);
        assert!(sections.iter().all(|s| s.state == SectionState::Done));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 6);
        assert!(sections[1].body.contains("### Executive Summary"));
    }

    #[tokio::test]
    async fn test_evidence_gate_skips_compound_sections() {
        let provider = Arc::new(RoutedProvider::new(|req| Ok(valid_fields(&req.label))));
        let sections = synthesizer(provider.clone())
            .synthesize("drug x", &report(3, 27), &CancellationToken::new(), &ProgressTracker::new())
            .await
            .unwrap();

        let fallbacks: Vec<SectionKey> = sections
            .iter()
            .filter(|s| s.is_fallback())
            .map(|s| s.key)
            .collect();
        assert_eq!(fallbacks, vec![SectionKey::Metadata, SectionKey::Analysis]);
        assert_eq!(sections[0].attempts, 0);
        assert!(sections[0].body.starts_with(INSUFFICIENT_DATA_MARKER));
        assert!(sections[0].fallback_reason.as_deref().unwrap().contains("1.1/10"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_section_retries_then_falls_back() {
        let counts = Arc::new(Mutex::new(HashMap::<String, u32>::new()));
        let seen = counts.clone();
        let provider = Arc::new(RoutedProvider::new(move |req| {
            *seen.lock().unwrap().entry(req.label.clone()).or_default() += 1;
            if req.label == "write:summary" {
                return Ok(r#"{"executive_summary": "Only one field", "red_flags_list": "UNKNOWN"}"#.to_string());
            }
            Ok(valid_fields(&req.label))
        }));
        let sections = synthesizer(provider)
            .synthesize("drug x", &report(10, 10), &CancellationToken::new(), &ProgressTracker::new())
            .await
            .unwrap();

        let summary = &sections[1];
        assert_eq!(summary.state, SectionState::Fallback);
        assert_eq!(summary.attempts, 3);
        assert!(summary.key_facts.is_empty());
        assert_eq!(counts.lock().unwrap()["write:summary"], 3);
        assert_eq!(counts.lock().unwrap()["write:risk"], 1);
        assert_eq!(sections[4].state, SectionState::Done);
    }

    #[tokio::test]
    async fn test_misquoted_scores_are_corrected() {
        let provider = Arc::new(RoutedProvider::new(|req| {
            if req.label == "write:summary" {
                return Ok(json!({
                    "executive_summary": "We hold a confidence of 9.5/10 in this thesis.",
                    "red_flags_list": "- none",
                    "decision_factors": "data"
                })
                .to_string());
            }
            Ok(valid_fields(&req.label))
        }));
        let sections = synthesizer(provider)
            .synthesize("drug x", &report(8, 10), &CancellationToken::new(), &ProgressTracker::new())
            .await
            .unwrap();

        let summary = &sections[1];
        assert!(summary.body.contains("confidence of 8.0/10"));
        assert_eq!(summary.corrections.len(), 1);
        assert_eq!(summary.corrections[0].found, 9.5);
    }

    #[tokio::test]
    async fn test_cancelled_synthesis_errors() {
        let provider = Arc::new(RoutedProvider::new(|req| Ok(valid_fields(&req.label))));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = synthesizer(provider)
            .synthesize("drug x", &report(10, 10), &cancel, &ProgressTracker::new())
            .await;
        assert!(matches!(result, Err(e) if e.is_cancelled()));
    }

    #[test]
    fn test_validate_fields_rejects_blank() {
        let spec = sections::spec(SectionKey::Risk);
        assert!(validate_fields(spec, r#"{"risk_cascade_narrative": "a", "failure_timeline": ""}"#).is_err());
        assert!(validate_fields(spec, r#"{"risk_cascade_narrative": "a", "failure_timeline": "b"}"#).is_ok());
        assert!(validate_fields(spec, "prose only").is_err());
    }
}
