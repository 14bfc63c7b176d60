use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::work::{SourceOrder, WorkItem};

/// Severity assigned to a finding by the analysis that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    High,
    Medium,
    Low,
    Clean,
}

/// Priority tier used when budgeting context
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SeverityTier {
    Critical,
    Medium,
    Low,
}

impl Severity {
    pub fn tier(&self) -> SeverityTier {
        match self {
            Self::High => SeverityTier::Critical,
            Self::Medium => SeverityTier::Medium,
            Self::Low | Self::Clean => SeverityTier::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
            Self::Clean => "CLEAN",
        }
    }

    /// Lenient parse of model output; unrecognized labels map to `Low`
    pub fn parse_lenient(label: &str) -> Self {
        match label.trim().to_uppercase().as_str() {
            "HIGH" | "CRITICAL" | "SEVERE" => Self::High,
            "MEDIUM" | "MODERATE" => Self::Medium,
            "CLEAN" | "NONE" => Self::Clean,
            _ => Self::Low,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// Quote mined from document text
    TextEvidence,
    /// Forensic verdict on an extracted image
    ImageAudit,
    /// Registry record of a clinical trial
    TrialRecord,
    /// Collected source document metadata
    Document,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextEvidence => "text_evidence",
            Self::ImageAudit => "image_audit",
            Self::TrialRecord => "trial_record",
            Self::Document => "document",
        }
    }
}

/// One extracted signal, always attributable to a successful work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub stage: String,
    pub item_id: String,
    pub source_ref: String,
    pub order: SourceOrder,
    pub kind: FindingKind,
    pub severity: Severity,
    /// Risk type label (e.g. `safety_signal`, `TERMINATED`)
    pub tag: String,
    pub quote: String,
    pub explanation: String,
    /// Page or figure location inside the source
    pub location: Option<String>,
    /// Kind-specific score used to rank findings of equal tier
    pub score: Option<f64>,
}

impl Finding {
    pub fn new(
        stage: &str,
        item: &WorkItem,
        unit: usize,
        kind: FindingKind,
        severity: Severity,
        quote: impl Into<String>,
    ) -> Self {
        let quote = quote.into();
        let order = SourceOrder::new(item.order.document, item.order.unit + unit);
        Self {
            id: fingerprint(&[stage, &item.id, &unit.to_string(), &quote]),
            stage: stage.to_string(),
            item_id: item.id.clone(),
            source_ref: item.source_ref.clone(),
            order,
            kind,
            severity,
            tag: "other".to_string(),
            quote,
            explanation: String::new(),
            location: None,
            score: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = explanation.into();
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }
}

/// Short stable hex digest over the given parts
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_tiers() {
        assert_eq!(Severity::High.tier(), SeverityTier::Critical);
        assert_eq!(Severity::Medium.tier(), SeverityTier::Medium);
        assert_eq!(Severity::Clean.tier(), SeverityTier::Low);
        assert!(SeverityTier::Critical < SeverityTier::Low);
    }

    #[test]
    fn test_parse_lenient() {
        assert_eq!(Severity::parse_lenient(" high "), Severity::High);
        assert_eq!(Severity::parse_lenient("moderate"), Severity::Medium);
        assert_eq!(Severity::parse_lenient("???"), Severity::Low);
    }

    #[test]
    fn test_finding_id_is_stable() {
        let item = WorkItem::new("doc-1", "a.pdf", SourceOrder::document(2));
        let a = Finding::new("mine", &item, 1, FindingKind::TextEvidence, Severity::High, "q");
        let b = Finding::new("mine", &item, 1, FindingKind::TextEvidence, Severity::High, "q");
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 16);
        assert_eq!(a.order, SourceOrder::new(2, 1));
    }
}
