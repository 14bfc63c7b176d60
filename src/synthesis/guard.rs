//! Score consistency guard
//!
//! Sections receive the literal confidence and risk numbers. Any confidence
//! or risk figure the model writes ("Confidence: 9.0", "risk level 2/10",
//! "overall risk of 2.0/10") that disagrees with them is rewritten to the
//! computed value and recorded as a correction. Percentages, values above 10
//! and bare counts ("risk of 3 deaths") are left alone.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::scoring::MAX_SCORE;

/// `<subject> [level|rating|score] [of|is|at|was] [:|=] <n>[/10|%]`
fn score_pattern(subject: &str) -> String {
    format!(
        r"(?i)(?P<pre>\b(?:overall\s+)?{subject}(?:\s+(?P<word>level|rating|score))?(?:\s+(?:of|is|at|was))?\s*(?P<sep>[:=])?\s*)(?P<num>\d{{1,2}}(?:\.\d+)?)\b(?P<suf>\s*/\s*10|\s*%)?"
    )
}

static CONFIDENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&score_pattern("confidence")).expect("confidence pattern is valid")
});

static RISK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&score_pattern("risk")).expect("risk pattern is valid"));

const TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreKind {
    Confidence,
    Risk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberCorrection {
    pub field: String,
    pub kind: ScoreKind,
    pub found: f64,
    pub expected: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct NumberGuard {
    confidence: f64,
    risk: f64,
}

impl NumberGuard {
    pub fn new(confidence: f64, risk: f64) -> Self {
        Self { confidence, risk }
    }

    /// Correct one string; returns the fixed text and what changed
    pub fn correct_text(&self, field: &str, text: &str) -> (String, Vec<NumberCorrection>) {
        let mut corrections = Vec::new();
        let text = replace_scores(
            &CONFIDENCE_PATTERN,
            text,
            ScoreKind::Confidence,
            self.confidence,
            field,
            &mut corrections,
        );
        let text = replace_scores(
            &RISK_PATTERN,
            &text,
            ScoreKind::Risk,
            self.risk,
            field,
            &mut corrections,
        );
        (text, corrections)
    }

    /// Correct every string inside `value` in place
    pub fn correct_value(&self, field: &str, value: &mut Value) -> Vec<NumberCorrection> {
        match value {
            Value::String(s) => {
                let (fixed, corrections) = self.correct_text(field, s);
                if !corrections.is_empty() {
                    *s = fixed;
                }
                corrections
            }
            Value::Array(items) => items
                .iter_mut()
                .flat_map(|item| self.correct_value(field, item))
                .collect(),
            Value::Object(map) => map
                .values_mut()
                .flat_map(|item| self.correct_value(field, item))
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn replace_scores(
    pattern: &Regex,
    text: &str,
    kind: ScoreKind,
    expected: f64,
    field: &str,
    corrections: &mut Vec<NumberCorrection>,
) -> String {
    pattern
        .replace_all(text, |caps: &Captures| {
            let suffix = caps.name("suf").map_or("", |m| m.as_str());
            // Without "/10", a score word or a separator the number may be a count
            let scored = !suffix.is_empty()
                || caps.name("word").is_some()
                || caps.name("sep").is_some();
            let found: f64 = match caps["num"].parse() {
                Ok(found) => found,
                Err(_) => return caps[0].to_string(),
            };
            if !scored
                || suffix.trim_start().starts_with('%')
                || found > MAX_SCORE
                || (found - expected).abs() <= TOLERANCE
            {
                return caps[0].to_string();
            }
            corrections.push(NumberCorrection {
                field: field.to_string(),
                kind,
                found,
                expected,
            });
            format!("{}{:.1}{}", &caps["pre"], expected, suffix)
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_corrects_misquoted_scores() {
        let guard = NumberGuard::new(1.1, 7.3);
        let (text, corrections) = guard.correct_text(
            "executive_summary",
            "With a confidence of 8.5/10 and a risk score: 4.0, we are bullish.",
        );
        assert_eq!(
            text,
            "With a confidence of 1.1/10 and a risk score: 7.3, we are bullish."
        );
        assert_eq!(corrections.len(), 2);
        assert_eq!(corrections[0].kind, ScoreKind::Confidence);
        assert_eq!(corrections[0].found, 8.5);
        assert_eq!(corrections[1].expected, 7.3);
    }

    #[test]
    fn test_leaves_matching_and_unrelated_numbers() {
        let guard = NumberGuard::new(1.1, 7.3);
        let input = "Confidence 1.1/10, risk score 7.3/10, 95% confidence interval 2.1 to 3.4";
        let (text, corrections) = guard.correct_text("f", input);
        assert_eq!(text, input);
        assert!(corrections.is_empty());
    }

    #[test]
    fn test_corrects_common_phrasings() {
        let guard = NumberGuard::new(1.1, 6.4);
        let cases = [
            ("Risk Score: 2.0/10", "Risk Score: 6.4/10", ScoreKind::Risk),
            ("Confidence: 9.0", "Confidence: 1.1", ScoreKind::Confidence),
            ("confidence level: 9.0/10", "confidence level: 1.1/10", ScoreKind::Confidence),
            ("Risk: 2.0/10", "Risk: 6.4/10", ScoreKind::Risk),
            ("an overall risk of 2.0/10", "an overall risk of 6.4/10", ScoreKind::Risk),
            ("confidence rating is 7", "confidence rating is 1.1", ScoreKind::Confidence),
        ];
        for (input, expected, kind) in cases {
            let (text, corrections) = guard.correct_text("f", input);
            assert_eq!(text, expected, "input: {input}");
            assert_eq!(corrections.len(), 1, "input: {input}");
            assert_eq!(corrections[0].kind, kind);
        }
    }

    #[test]
    fn test_ignores_counts_and_percentages() {
        let guard = NumberGuard::new(1.1, 6.4);
        for input in [
            "a risk of 3 deaths per 1000",
            "confidence of 95%",
            "risk: 100 events",
            "95% confidence interval 2.1 to 3.4",
        ] {
            let (text, corrections) = guard.correct_text("f", input);
            assert_eq!(text, input);
            assert!(corrections.is_empty(), "input: {input}");
        }
    }

    #[test]
    fn test_correct_value_walks_arrays() {
        let guard = NumberGuard::new(5.0, 6.0);
        let mut value = json!(["risk score 9", {"note": "confidence: 9/10"}, 3]);
        let corrections = guard.correct_value("red_flags_list", &mut value);
        assert_eq!(corrections.len(), 2);
        assert_eq!(value, json!(["risk score 6.0", {"note": "confidence: 5.0/10"}, 3]));
    }
}
