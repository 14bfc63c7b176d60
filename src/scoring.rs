//! Confidence & Risk Scoring
//!
//! Pure functions over unit-level counts and severity tags. Nothing here reads
//! generated text: the same inputs always give the same numbers.
//!
//! - Confidence: `round(succeeded / attempted * 10, 1)`, `0.0` when nothing was attempted
//! - Risk: weighted sum of four dimensions, each clamped to `[0, 10]`

use serde::{Deserialize, Serialize};

use crate::config::{RiskWeights, ScoringConfig};
use crate::constants::scoring::MAX_SCORE;
use crate::types::{Finding, FindingKind, Severity, StageResult};

/// Round to one decimal place
fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn confidence(succeeded: usize, attempted: usize) -> f64 {
    if attempted == 0 {
        return 0.0;
    }
    let ratio = succeeded.min(attempted) as f64 / attempted as f64;
    round1(ratio * MAX_SCORE)
}

/// Confidence derived from StageResult counts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceScore {
    pub value: f64,
    pub succeeded: usize,
    pub attempted: usize,
}

impl ConfidenceScore {
    pub fn new(succeeded: usize, attempted: usize) -> Self {
        Self {
            value: confidence(succeeded, attempted),
            succeeded,
            attempted,
        }
    }

    /// Sum counts across stage results
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a StageResult>) -> Self {
        let (succeeded, attempted) = results
            .into_iter()
            .fold((0, 0), |(s, a), r| (s + r.succeeded, a + r.attempted));
        Self::new(succeeded, attempted)
    }

    pub fn any_succeeded(&self) -> bool {
        self.succeeded > 0
    }
}

impl std::fmt::Display for ConfidenceScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.1}/10", self.value)
    }
}

// =============================================================================
// Risk
// =============================================================================

/// Raw counts feeding the risk dimensions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskInputs {
    pub total_trials: usize,
    pub failed_trials: usize,
    pub high_severity_findings: usize,
    pub suspicious_images: usize,
}

impl RiskInputs {
    /// Trial records count toward the clinical dimension (HIGH = failed trial),
    /// HIGH text evidence toward dark data, and non-clean image audits toward forensics.
    pub fn from_findings<'a>(findings: impl IntoIterator<Item = &'a Finding>) -> Self {
        let mut inputs = Self::default();
        for finding in findings {
            match finding.kind {
                FindingKind::TrialRecord => {
                    inputs.total_trials += 1;
                    if finding.severity == Severity::High {
                        inputs.failed_trials += 1;
                    }
                }
                FindingKind::TextEvidence if finding.severity == Severity::High => {
                    inputs.high_severity_findings += 1;
                }
                FindingKind::ImageAudit
                    if matches!(finding.severity, Severity::High | Severity::Medium) =>
                {
                    inputs.suspicious_images += 1;
                }
                _ => {}
            }
        }
        inputs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recommendation {
    #[serde(rename = "STRONG AVOID")]
    StrongAvoid,
    #[serde(rename = "AVOID")]
    Avoid,
    #[serde(rename = "PROCEED WITH EXTREME CAUTION")]
    ExtremeCaution,
    #[serde(rename = "PROCEED WITH CAUTION")]
    Caution,
}

impl Recommendation {
    pub fn from_score(risk: f64) -> Self {
        if risk >= 7.0 {
            Self::StrongAvoid
        } else if risk >= 5.0 {
            Self::Avoid
        } else if risk >= 3.0 {
            Self::ExtremeCaution
        } else {
            Self::Caution
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StrongAvoid => "STRONG AVOID",
            Self::Avoid => "AVOID",
            Self::ExtremeCaution => "PROCEED WITH EXTREME CAUTION",
            Self::Caution => "PROCEED WITH CAUTION",
        }
    }
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    High,
    Medium,
    Low,
}

impl RiskLevel {
    pub fn from_score(risk: f64) -> Self {
        if risk >= 7.0 {
            Self::High
        } else if risk >= 4.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-dimension scores, each in `[0, 10]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskDimensions {
    pub clinical: f64,
    pub dark_data: f64,
    pub forensic: f64,
    pub literature: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub inputs: RiskInputs,
    pub dimensions: RiskDimensions,
    pub weights: RiskWeights,
    /// Weighted total rounded to one decimal
    pub total: f64,
    pub recommendation: Recommendation,
    pub level: RiskLevel,
}

fn clamp_score(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, MAX_SCORE)
    } else {
        0.0
    }
}

#[derive(Debug, Clone)]
pub struct RiskScorer {
    config: ScoringConfig,
}

impl Default for RiskScorer {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}

impl RiskScorer {
    /// Weights are expected to be validated at config load
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn dimensions(&self, inputs: &RiskInputs) -> RiskDimensions {
        let clinical = if inputs.total_trials > 0 {
            inputs.failed_trials as f64 / inputs.total_trials as f64
                * self.config.clinical_multiplier
        } else {
            0.0
        };

        RiskDimensions {
            clinical: clamp_score(clinical),
            dark_data: clamp_score(
                inputs.high_severity_findings as f64 * self.config.dark_data_multiplier,
            ),
            forensic: clamp_score(inputs.suspicious_images as f64 * self.config.forensic_multiplier),
            literature: clamp_score(self.config.literature_baseline),
        }
    }

    pub fn assess(&self, inputs: RiskInputs) -> RiskAssessment {
        let dimensions = self.dimensions(&inputs);
        let w = self.config.weights;
        let raw = dimensions.clinical * w.clinical
            + dimensions.dark_data * w.dark_data
            + dimensions.forensic * w.forensic
            + dimensions.literature * w.literature;
        let total = round1(clamp_score(raw));

        RiskAssessment {
            inputs,
            dimensions,
            weights: w,
            total,
            recommendation: Recommendation::from_score(total),
            level: RiskLevel::from_score(total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SourceOrder, WorkItem};
    use proptest::prelude::*;

    #[test]
    fn test_confidence_examples() {
        assert_eq!(confidence(3, 27), 1.1);
        assert_eq!(confidence(0, 0), 0.0);
        assert_eq!(confidence(5, 5), 10.0);
        assert_eq!(confidence(1, 3), 3.3);
    }

    #[test]
    fn test_confidence_from_results() {
        let mut a = StageResult::cancelled("mine");
        a.attempted = 2;
        a.succeeded = 1;
        let mut b = StageResult::cancelled("audit");
        b.attempted = 3;
        b.succeeded = 2;
        let score = ConfidenceScore::from_results([&a, &b]);
        assert_eq!(score.attempted, 5);
        assert_eq!(score.value, 6.0);
        assert_eq!(score.to_string(), "6.0/10");
    }

    #[test]
    fn test_default_risk_assessment() {
        let scorer = RiskScorer::default();
        let assessment = scorer.assess(RiskInputs {
            total_trials: 8,
            failed_trials: 1,
            high_severity_findings: 2,
            suspicious_images: 1,
        });
        // clinical 2.5, dark 4.0, forensic 3.0, literature 5.0
        assert_eq!(assessment.dimensions.clinical, 2.5);
        assert_eq!(assessment.dimensions.dark_data, 4.0);
        assert_eq!(assessment.total, 3.5);
        assert_eq!(assessment.recommendation, Recommendation::ExtremeCaution);
        assert_eq!(assessment.level, RiskLevel::Low);
    }

    #[test]
    fn test_dimensions_clamped() {
        let scorer = RiskScorer::default();
        let assessment = scorer.assess(RiskInputs {
            total_trials: 1,
            failed_trials: 1,
            high_severity_findings: 50,
            suspicious_images: 50,
        });
        assert_eq!(assessment.dimensions.clinical, 10.0);
        assert_eq!(assessment.dimensions.dark_data, 10.0);
        assert!((9.2..=9.3).contains(&assessment.total));
        assert_eq!(assessment.recommendation, Recommendation::StrongAvoid);
        assert_eq!(assessment.level, RiskLevel::High);
    }

    #[test]
    fn test_no_evidence_is_baseline_only() {
        let assessment = RiskScorer::default().assess(RiskInputs::default());
        assert!(assessment.total < 1.0);
        assert_eq!(assessment.recommendation, Recommendation::Caution);
        assert_eq!(assessment.level, RiskLevel::Low);
    }

    #[test]
    fn test_recommendation_serializes_with_spaces() {
        let json = serde_json::to_string(&Recommendation::ExtremeCaution).unwrap();
        assert_eq!(json, "\"PROCEED WITH EXTREME CAUTION\"");
    }

    #[test]
    fn test_inputs_from_findings() {
        let item = WorkItem::new("t", "NCT1", SourceOrder::document(0));
        let findings = vec![
            Finding::new("collect", &item, 0, FindingKind::TrialRecord, Severity::High, "TERMINATED"),
            Finding::new("collect", &item, 1, FindingKind::TrialRecord, Severity::Low, "COMPLETED"),
            Finding::new("mine", &item, 0, FindingKind::TextEvidence, Severity::High, "q"),
            Finding::new("mine", &item, 1, FindingKind::TextEvidence, Severity::Medium, "q"),
            Finding::new("audit", &item, 0, FindingKind::ImageAudit, Severity::Medium, "blot"),
            Finding::new("audit", &item, 1, FindingKind::ImageAudit, Severity::Clean, "ok"),
        ];
        let inputs = RiskInputs::from_findings(&findings);
        assert_eq!(
            inputs,
            RiskInputs {
                total_trials: 2,
                failed_trials: 1,
                high_severity_findings: 1,
                suspicious_images: 1,
            }
        );
    }

    proptest! {
        #[test]
        fn prop_confidence_matches_formula(attempted in 0usize..10_000, frac in 0.0f64..=1.0) {
            let succeeded = (attempted as f64 * frac).floor() as usize;
            let c = confidence(succeeded, attempted);
            prop_assert!((0.0..=10.0).contains(&c));
            if attempted == 0 {
                prop_assert_eq!(c, 0.0);
            } else {
                let expected = (succeeded as f64 / attempted as f64 * 10.0 * 10.0).round() / 10.0;
                prop_assert_eq!(c, expected);
            }
        }

        #[test]
        fn prop_risk_total_bounded(
            total in 0usize..50,
            failed in 0usize..50,
            high in 0usize..100,
            images in 0usize..100,
        ) {
            let assessment = RiskScorer::default().assess(RiskInputs {
                total_trials: total,
                failed_trials: failed.min(total),
                high_severity_findings: high,
                suspicious_images: images,
            });
            prop_assert!((0.0..=10.0).contains(&assessment.total));
            prop_assert_eq!(assessment.level, RiskLevel::from_score(assessment.total));
        }
    }
}
