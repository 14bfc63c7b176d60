//! Report template
//!
//! Templates use `{{placeholder}}` markers. The set of placeholders is closed:
//! [`Template::parse`] rejects unknown names and unterminated markers, so a
//! typo can never render as an empty string.

use crate::scoring::RiskAssessment;
use crate::types::{CassandraError, FailureRecord, Result};

use super::sections::ReportSection;

pub const DEFAULT_TEMPLATE: &str = "# {{title}}

**Query:** {{query}}
**Generated:** {{generated_at}}
**Run:** {{run_id}}

## Recommendation: {{recommendation}}

| Metric | Value |
|---|---|
| Confidence | {{confidence}} |
| Risk score | {{risk_score}}/10 ({{risk_level}}) |

{{risk_table}}

{{sections}}

## Disclosure

{{disclosure}}
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    Title,
    Query,
    GeneratedAt,
    RunId,
    Recommendation,
    Confidence,
    RiskScore,
    RiskLevel,
    RiskTable,
    Sections,
    Disclosure,
}

impl Placeholder {
    pub const ALL: &'static [Placeholder] = &[
        Self::Title,
        Self::Query,
        Self::GeneratedAt,
        Self::RunId,
        Self::Recommendation,
        Self::Confidence,
        Self::RiskScore,
        Self::RiskLevel,
        Self::RiskTable,
        Self::Sections,
        Self::Disclosure,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Query => "query",
            Self::GeneratedAt => "generated_at",
            Self::RunId => "run_id",
            Self::Recommendation => "recommendation",
            Self::Confidence => "confidence",
            Self::RiskScore => "risk_score",
            Self::RiskLevel => "risk_level",
            Self::RiskTable => "risk_table",
            Self::Sections => "sections",
            Self::Disclosure => "disclosure",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.name() == name)
    }
}

/// Values substituted into a [`Template`]
#[derive(Debug, Clone, Default)]
pub struct ReportContext {
    pub title: String,
    pub query: String,
    pub generated_at: String,
    pub run_id: String,
    pub recommendation: String,
    pub confidence: String,
    pub risk_score: String,
    pub risk_level: String,
    pub risk_table: String,
    pub sections: String,
    pub disclosure: String,
}

impl ReportContext {
    fn value(&self, placeholder: Placeholder) -> &str {
        match placeholder {
            Placeholder::Title => &self.title,
            Placeholder::Query => &self.query,
            Placeholder::GeneratedAt => &self.generated_at,
            Placeholder::RunId => &self.run_id,
            Placeholder::Recommendation => &self.recommendation,
            Placeholder::Confidence => &self.confidence,
            Placeholder::RiskScore => &self.risk_score,
            Placeholder::RiskLevel => &self.risk_level,
            Placeholder::RiskTable => &self.risk_table,
            Placeholder::Sections => &self.sections,
            Placeholder::Disclosure => &self.disclosure,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Slot(Placeholder),
}

/// A parsed template; parsing happens once, rendering cannot fail
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                return Err(CassandraError::Validation(format!(
                    "unterminated placeholder at byte {}",
                    offset + start
                )));
            };
            let name = after[..end].trim();
            let placeholder = Placeholder::from_name(name).ok_or_else(|| {
                CassandraError::Validation(format!(
                    "unknown placeholder '{{{{{}}}}}' at byte {}",
                    name,
                    offset + start
                ))
            })?;
            segments.push(Segment::Slot(placeholder));

            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    pub fn builtin() -> Self {
        // The built-in template only uses known placeholders
        Self::parse(DEFAULT_TEMPLATE).unwrap_or_else(|_| Self {
            segments: vec![Segment::Literal(String::new())],
        })
    }

    pub fn placeholders(&self) -> Vec<Placeholder> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Slot(p) => Some(*p),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    pub fn render(&self, ctx: &ReportContext) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Slot(p) => out.push_str(ctx.value(*p)),
            }
        }
        out
    }
}

pub fn risk_table(risk: &RiskAssessment) -> String {
    let rows = [
        ("Clinical", risk.dimensions.clinical, risk.weights.clinical),
        ("Dark data", risk.dimensions.dark_data, risk.weights.dark_data),
        ("Forensic", risk.dimensions.forensic, risk.weights.forensic),
        ("Literature", risk.dimensions.literature, risk.weights.literature),
    ];
    let mut out = String::from("| Dimension | Score | Weight | Contribution |\n|---|---|---|---|\n");
    for (name, score, weight) in rows {
        out.push_str(&format!(
            "| {} | {:.1} | {:.0}% | {:.2} |\n",
            name,
            score,
            weight * 100.0,
            score * weight
        ));
    }
    out.push_str(&format!(
        "| **Total** | **{:.1}** | | |\n\n_{} of {} trials failed, {} high-severity findings, {} suspicious images._",
        risk.total,
        risk.inputs.failed_trials,
        risk.inputs.total_trials,
        risk.inputs.high_severity_findings,
        risk.inputs.suspicious_images,
    ));
    out
}

pub fn sections_markdown(sections: &[ReportSection]) -> String {
    sections
        .iter()
        .map(|s| format!("## {}\n\n{}", s.title, s.body))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Every fallback section and every recorded failure
pub fn disclosure_block(sections: &[ReportSection], failures: &[FailureRecord]) -> String {
    let fallbacks: Vec<&ReportSection> = sections.iter().filter(|s| s.is_fallback()).collect();
    if fallbacks.is_empty() && failures.is_empty() {
        return "All sections generated from available evidence.".to_string();
    }

    let mut out = String::new();
    if !fallbacks.is_empty() {
        out.push_str("### Sections without sufficient data\n\n");
        for section in fallbacks {
            out.push_str(&format!(
                "- **{}** ({}): {}\n",
                section.title,
                section.key,
                section.fallback_reason.as_deref().unwrap_or("no reason recorded")
            ));
        }
    }
    if !failures.is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("### Unprocessed inputs ({})\n\n", failures.len()));
        for failure in failures {
            out.push_str(&format!(
                "- `{}` {} [{}]: {}\n",
                failure.stage, failure.source_ref, failure.kind, failure.message
            ));
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::sections::{PendingSection, SectionKey, spec};
    use crate::types::{ExtractionErrorKind, FailureKind};

    #[test]
    fn test_builtin_parses_every_placeholder() {
        let template = Template::parse(DEFAULT_TEMPLATE).unwrap();
        let used = template.placeholders();
        for p in Placeholder::ALL {
            assert!(used.contains(p), "missing {}", p.name());
        }
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        let err = Template::parse("# {{title}}\n{{confidance}}").unwrap_err();
        assert!(matches!(err, CassandraError::Validation(msg) if msg.contains("confidance")));
    }

    #[test]
    fn test_unterminated_placeholder_rejected() {
        assert!(Template::parse("Hello {{title").is_err());
    }

    #[test]
    fn test_render_substitutes_values() {
        let template = Template::parse("{{ title }}: {{confidence}} / {{risk_level}}!").unwrap();
        let ctx = ReportContext {
            title: "Report".into(),
            confidence: "1.1/10".into(),
            risk_level: "HIGH".into(),
            ..Default::default()
        };
        assert_eq!(template.render(&ctx), "Report: 1.1/10 / HIGH!");
    }

    #[test]
    fn test_disclosure_lists_fallbacks_and_failures() {
        let sections = vec![PendingSection::new(spec(SectionKey::Metadata)).skip("confidence 1.1/10")];
        let failures = vec![FailureRecord {
            stage: "mine".into(),
            item_id: "p1".into(),
            source_ref: "p1".into(),
            kind: FailureKind::Extraction(ExtractionErrorKind::ImageOnly),
            message: "no text".into(),
        }];
        let block = disclosure_block(&sections, &failures);
        assert!(block.contains("**Compound Profile** (metadata): confidence 1.1/10"));
        assert!(block.contains("Unprocessed inputs (1)"));
        assert!(block.contains("EXTRACTION:"));

        assert_eq!(
            disclosure_block(&[], &[]),
            "All sections generated from available evidence."
        );
    }
}
