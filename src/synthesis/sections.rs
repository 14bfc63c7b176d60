//! Report sections and their lifecycle
//!
//! `pending → generating → {done, fallback}`. Transitions consume the section,
//! so a finalized [`ReportSection`] can never be regenerated.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::guard::{NumberCorrection, NumberGuard};
use crate::constants::synthesis::{INSUFFICIENT_DATA_MARKER, KEY_FACT_CHARS, KEY_FACTS_PER_SECTION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKey {
    Metadata,
    Summary,
    Analysis,
    Evidence,
    Risk,
    Scenarios,
}

impl SectionKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Summary => "summary",
            Self::Analysis => "analysis",
            Self::Evidence => "evidence",
            Self::Risk => "risk",
            Self::Scenarios => "scenarios",
        }
    }

    /// Sections that state compound-level facts and sit behind the evidence gate
    pub fn states_compound_facts(&self) -> bool {
        matches!(self, Self::Metadata | Self::Analysis)
    }
}

impl std::fmt::Display for SectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of one section
#[derive(Debug)]
pub struct SectionSpec {
    pub key: SectionKey,
    pub title: &'static str,
    pub fields: &'static [&'static str],
    pub max_tokens: u32,
    pub guidance: &'static str,
}

/// Generation order
pub const SECTIONS: &[SectionSpec] = &[
    SectionSpec {
        key: SectionKey::Metadata,
        title: "Compound Profile",
        fields: &[
            "compound_name",
            "moa_description",
            "target_description",
            "development_stage",
            "sponsor_company",
            "market_context",
        ],
        max_tokens: 1500,
        guidance: "Identify the compound, its mechanism of action, its target, development stage, sponsor and market context. State only what the evidence supports.",
    },
    SectionSpec {
        key: SectionKey::Summary,
        title: "Executive Summary",
        fields: &["executive_summary", "red_flags_list", "decision_factors"],
        max_tokens: 2000,
        guidance: "Summarize the investment risk for a non-specialist reader. List the red flags as a markdown bullet list and name the factors that decide the case.",
    },
    SectionSpec {
        key: SectionKey::Analysis,
        title: "Scientific and Clinical Analysis",
        fields: &["scientific_rationale", "clinical_trial_analysis"],
        max_tokens: 2500,
        guidance: "Assess the scientific rationale and the clinical trial record, including terminated or withdrawn trials.",
    },
    SectionSpec {
        key: SectionKey::Evidence,
        title: "Evidence Review",
        fields: &["dark_data_synthesis", "forensic_findings"],
        max_tokens: 2000,
        guidance: "Synthesize the buried negative evidence and the image forensics results. Quote the evidence; do not invent findings.",
    },
    SectionSpec {
        key: SectionKey::Risk,
        title: "Risk Assessment",
        fields: &["risk_cascade_narrative", "failure_timeline"],
        max_tokens: 2000,
        guidance: "Explain how the identified risks could compound, and lay out a plausible failure timeline.",
    },
    SectionSpec {
        key: SectionKey::Scenarios,
        title: "Scenarios and Verdict",
        fields: &["bull_case", "bear_case", "black_swan_case", "analyst_verdict"],
        max_tokens: 2000,
        guidance: "Describe bull, bear and black swan scenarios, then give a verdict consistent with the recommendation.",
    },
];

pub fn spec(key: SectionKey) -> &'static SectionSpec {
    SECTIONS
        .iter()
        .find(|s| s.key == key)
        .unwrap_or(&SECTIONS[0])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionState {
    Pending,
    Generating,
    Done,
    Fallback,
}

impl SectionState {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Done | Self::Fallback)
    }
}

/// A finalized section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSection {
    pub key: SectionKey,
    pub title: String,
    pub body: String,
    /// Bounded facts later sections may rely on; empty for fallbacks
    pub key_facts: Vec<String>,
    pub state: SectionState,
    pub attempts: u32,
    pub fallback_reason: Option<String>,
    pub corrections: Vec<NumberCorrection>,
}

impl ReportSection {
    pub fn is_fallback(&self) -> bool {
        self.state == SectionState::Fallback
    }
}

#[derive(Debug)]
pub struct PendingSection {
    spec: &'static SectionSpec,
}

impl PendingSection {
    pub fn new(spec: &'static SectionSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &'static SectionSpec {
        self.spec
    }

    pub fn state(&self) -> SectionState {
        SectionState::Pending
    }

    pub fn start(self) -> GeneratingSection {
        GeneratingSection {
            spec: self.spec,
            attempts: 0,
        }
    }

    /// Finalize without generating (evidence gate)
    pub fn skip(self, reason: impl Into<String>) -> ReportSection {
        fallback_section(self.spec, 0, reason.into())
    }
}

#[derive(Debug)]
pub struct GeneratingSection {
    spec: &'static SectionSpec,
    attempts: u32,
}

impl GeneratingSection {
    pub fn spec(&self) -> &'static SectionSpec {
        self.spec
    }

    pub fn state(&self) -> SectionState {
        SectionState::Generating
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Render validated fields, correcting any misquoted score
    pub fn finish(self, mut fields: Map<String, Value>, guard: &NumberGuard) -> ReportSection {
        let mut corrections = Vec::new();
        for name in self.spec.fields {
            if let Some(value) = fields.get_mut(*name) {
                corrections.extend(guard.correct_value(name, value));
            }
        }

        let body = render_fields(self.spec, &fields);
        let key_facts = self
            .spec
            .fields
            .iter()
            .filter_map(|name| {
                let text = plain_text(fields.get(*name)?);
                (!text.is_empty())
                    .then(|| format!("{}: {}", name, truncate_chars(&text, KEY_FACT_CHARS)))
            })
            .take(KEY_FACTS_PER_SECTION)
            .collect();

        ReportSection {
            key: self.spec.key,
            title: self.spec.title.to_string(),
            body,
            key_facts,
            state: SectionState::Done,
            attempts: self.attempts,
            fallback_reason: None,
            corrections,
        }
    }

    pub fn fallback(self, reason: impl Into<String>) -> ReportSection {
        fallback_section(self.spec, self.attempts, reason.into())
    }
}

fn fallback_section(spec: &SectionSpec, attempts: u32, reason: String) -> ReportSection {
    ReportSection {
        key: spec.key,
        title: spec.title.to_string(),
        body: format!("{} {}", INSUFFICIENT_DATA_MARKER, reason),
        key_facts: Vec::new(),
        state: SectionState::Fallback,
        attempts,
        fallback_reason: Some(reason),
        corrections: Vec::new(),
    }
}

/// `red_flags_list` -> `Red Flags List`
pub fn field_title(field: &str) -> String {
    field
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn plain_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .map(plain_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("; "),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| format!("- {}", plain_text(item)))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(_) => serde_json::to_string_pretty(value).unwrap_or_default(),
        other => plain_text(other),
    }
}

fn render_fields(spec: &SectionSpec, fields: &Map<String, Value>) -> String {
    spec.fields
        .iter()
        .filter_map(|name| {
            let value = fields.get(*name)?;
            Some(format!("### {}\n\n{}", field_title(name), render_value(value)))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
