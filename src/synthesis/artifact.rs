use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::guard::NumberCorrection;
use super::render::{ReportContext, Template, disclosure_block, risk_table, sections_markdown};
use super::sections::{ReportSection, SectionKey};
use crate::ai::MetricsSummary;
use crate::pipeline::aggregate::{AggregateReport, StageSummary};
use crate::scoring::{ConfidenceScore, Recommendation, RiskAssessment, RiskLevel};
use crate::types::{FailureRecord, RunId};

/// Final output handed to the artifact sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportArtifact {
    pub run_id: RunId,
    pub query: String,
    pub generated_at: DateTime<Utc>,
    pub markdown: String,
    pub recommendation: Recommendation,
    pub confidence: ConfidenceScore,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub risk: RiskAssessment,
    pub sections: Vec<ReportSection>,
    pub fallback_sections: Vec<SectionKey>,
    pub failures: Vec<FailureRecord>,
    pub stages: Vec<StageSummary>,
    pub corrections: Vec<NumberCorrection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSummary>,
}

impl ReportArtifact {
    pub fn assemble(
        template: &Template,
        run_id: &RunId,
        query: &str,
        report: &AggregateReport,
        sections: Vec<ReportSection>,
        metrics: Option<MetricsSummary>,
    ) -> Self {
        let generated_at = Utc::now();
        let risk = report.risk;

        let ctx = ReportContext {
            title: format!("Cassandra Risk Report: {}", query),
            query: query.to_string(),
            generated_at: generated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            run_id: run_id.to_string(),
            recommendation: risk.recommendation.to_string(),
            confidence: report.confidence.to_string(),
            risk_score: format!("{:.1}", risk.total),
            risk_level: risk.level.to_string(),
            risk_table: risk_table(&risk),
            sections: sections_markdown(&sections),
            disclosure: disclosure_block(&sections, &report.failures),
        };

        let fallback_sections = sections
            .iter()
            .filter(|s| s.is_fallback())
            .map(|s| s.key)
            .collect();
        let corrections = sections
            .iter()
            .flat_map(|s| s.corrections.iter().cloned())
            .collect();

        Self {
            run_id: run_id.clone(),
            query: query.to_string(),
            generated_at,
            markdown: template.render(&ctx),
            recommendation: risk.recommendation,
            confidence: report.confidence,
            risk_score: risk.total,
            risk_level: risk.level,
            risk,
            sections,
            fallback_sections,
            failures: report.failures.clone(),
            stages: report.stages.clone(),
            corrections,
            metrics,
        }
    }
}
