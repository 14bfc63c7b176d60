//! Context Budgeting
//!
//! Turns the findings of every analysis stage into one size-bounded text blob
//! for a synthesis call. Sizes are counted in characters.
//!
//! ## Tiers
//!
//! | Tier | Severities | Treatment |
//! |------|------------|-----------|
//! | critical | HIGH | always included in full, source order |
//! | medium | MEDIUM | score descending then source order, while each fits |
//! | low | LOW, CLEAN | one summary line per source, while it fits |
//!
//! Critical findings may push the blob past the budget (`critical_overflow`);
//! past the hard ceiling the critical block itself is truncated with an
//! explicit marker.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::config::ContextConfig;
use crate::constants::context::SUMMARY_QUOTE_CHARS;
use crate::types::{Finding, Severity, SeverityTier};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetCounts {
    pub critical_total: usize,
    pub critical_included: usize,
    pub medium_total: usize,
    pub medium_included: usize,
    pub low_total: usize,
    /// Sources whose low/clean summary line made it in
    pub low_sources_included: usize,
    pub low_sources_total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetedContext {
    pub text: String,
    /// Critical block was hard-truncated at the ceiling
    pub truncated: bool,
    /// Critical block alone exceeded the budget
    pub critical_overflow: bool,
    pub counts: BudgetCounts,
}

impl BudgetedContext {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContextBudgeter {
    max_chars: usize,
    overflow_factor: f64,
}

impl ContextBudgeter {
    pub fn new(max_chars: usize, overflow_factor: f64) -> Self {
        Self {
            max_chars,
            overflow_factor: overflow_factor.max(1.0),
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.max_chars, config.critical_overflow_factor)
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Hard ceiling for the critical block
    pub fn ceiling(&self) -> usize {
        (self.max_chars as f64 * self.overflow_factor).floor() as usize
    }

    pub fn build(&self, findings: &[Finding]) -> BudgetedContext {
        let mut critical: Vec<&Finding> = Vec::new();
        let mut medium: Vec<&Finding> = Vec::new();
        let mut low: Vec<&Finding> = Vec::new();
        for finding in findings {
            match finding.severity.tier() {
                SeverityTier::Critical => critical.push(finding),
                SeverityTier::Medium => medium.push(finding),
                SeverityTier::Low => low.push(finding),
            }
        }

        critical.sort_by(|a, b| source_order(a, b));
        medium.sort_by(|a, b| {
            let sa = a.score.unwrap_or(0.0);
            let sb = b.score.unwrap_or(0.0);
            sb.total_cmp(&sa).then_with(|| source_order(a, b))
        });
        low.sort_by(|a, b| source_order(a, b));

        let mut counts = BudgetCounts {
            critical_total: critical.len(),
            medium_total: medium.len(),
            low_total: low.len(),
            ..Default::default()
        };

        // Critical block, unconditionally
        let mut text = String::new();
        for finding in &critical {
            text.push_str(&render_line(finding));
        }
        counts.critical_included = critical.len();

        let mut used = text.chars().count();
        let critical_overflow = used > self.max_chars;
        let mut truncated = false;

        if used > self.ceiling() {
            let (cut, shown) = truncate_critical(&critical, self.ceiling());
            text = cut;
            counts.critical_included = shown;
            used = text.chars().count();
            truncated = true;
        }

        // Medium findings while each whole line fits
        let mut remaining = self.max_chars.saturating_sub(used);
        for finding in &medium {
            let line = render_line(finding);
            let len = line.chars().count();
            if len > remaining {
                break;
            }
            text.push_str(&line);
            remaining -= len;
            counts.medium_included += 1;
        }

        // Low and clean findings, compressed per source
        let summaries = summarize_by_source(&low);
        counts.low_sources_total = summaries.len();
        for line in summaries {
            let len = line.chars().count();
            if len > remaining {
                break;
            }
            text.push_str(&line);
            remaining -= len;
            counts.low_sources_included += 1;
        }

        BudgetedContext {
            text,
            truncated,
            critical_overflow,
            counts,
        }
    }
}

fn source_order(a: &Finding, b: &Finding) -> Ordering {
    a.order
        .cmp(&b.order)
        .then_with(|| a.stage.cmp(&b.stage))
        .then_with(|| a.id.cmp(&b.id))
}

fn render_line(finding: &Finding) -> String {
    let mut line = format!("[{}] {}", finding.severity, finding.source_ref);
    if let Some(location) = &finding.location {
        line.push_str(&format!(" ({})", location));
    }
    line.push_str(&format!(" [{}]: \"{}\"", finding.tag, finding.quote.trim()));
    if !finding.explanation.is_empty() {
        line.push_str(&format!(" - {}", finding.explanation.trim()));
    }
    line.push('\n');
    line
}

/// Whole critical lines up to the ceiling, then a marker naming what was cut
fn truncate_critical(critical: &[&Finding], ceiling: usize) -> (String, usize) {
    let total = critical.len();
    let marker_for = |shown: usize| {
        format!(
            "[TRUNCATED: {} of {} critical findings omitted]\n",
            total - shown,
            total
        )
    };

    let mut text = String::new();
    let mut used = 0;
    let mut shown = 0;
    for finding in critical {
        let line = render_line(finding);
        let len = line.chars().count();
        if used + len + marker_for(shown + 1).chars().count() > ceiling {
            break;
        }
        text.push_str(&line);
        used += len;
        shown += 1;
    }

    // A single oversized finding still gets its head shown
    if shown == 0
        && let Some(first) = critical.first()
    {
        let marker = marker_for(1);
        let room = ceiling.saturating_sub(marker.chars().count() + 1);
        // Ceiling too small for any of the finding next to its marker
        if room == 0 {
            return (marker_for(0), 0);
        }
        text = render_line(first).chars().take(room).collect();
        text.push('\n');
        text.push_str(&marker);
        return (text, 1);
    }

    text.push_str(&marker_for(shown));
    (text, shown)
}

fn summarize_by_source(low: &[&Finding]) -> Vec<String> {
    let mut groups: Vec<(&str, Vec<&Finding>)> = Vec::new();
    for &finding in low {
        match groups.iter_mut().find(|(source, _)| *source == finding.source_ref) {
            Some((_, members)) => members.push(finding),
            None => groups.push((finding.source_ref.as_str(), vec![finding])),
        }
    }

    groups
        .into_iter()
        .map(|(source, members)| {
            let clean = members
                .iter()
                .filter(|f| f.severity == Severity::Clean)
                .count();
            let lows = members.len() - clean;
            let sample: String = members
                .iter()
                .find(|f| !f.quote.trim().is_empty())
                .map(|f| f.quote.trim().chars().take(SUMMARY_QUOTE_CHARS).collect())
                .unwrap_or_default();
            if sample.is_empty() {
                format!("[LOW] {}: {} low, {} clean\n", source, lows, clean)
            } else {
                format!(
                    "[LOW] {}: {} low, {} clean; e.g. \"{}\"\n",
                    source, lows, clean, sample
                )
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FindingKind, SourceOrder, WorkItem};
    use proptest::prelude::*;

    fn finding(doc: usize, unit: usize, severity: Severity, quote: &str) -> Finding {
        let item = WorkItem::new(
            format!("doc-{doc}"),
            format!("paper-{doc}.pdf"),
            SourceOrder::document(doc),
        );
        Finding::new("mine", &item, unit, FindingKind::TextEvidence, severity, quote)
    }

    #[test]
    fn test_empty_input() {
        let ctx = ContextBudgeter::new(100, 2.0).build(&[]);
        assert!(ctx.is_empty());
        assert!(!ctx.truncated);
        assert!(!ctx.critical_overflow);
    }

    #[test]
    fn test_critical_first_in_source_order() {
        let findings = vec![
            finding(1, 0, Severity::Medium, "medium one"),
            finding(2, 0, Severity::High, "second critical"),
            finding(0, 0, Severity::High, "first critical"),
        ];
        let ctx = ContextBudgeter::new(10_000, 2.0).build(&findings);
        let first = ctx.text.find("first critical").unwrap();
        let second = ctx.text.find("second critical").unwrap();
        let medium = ctx.text.find("medium one").unwrap();
        assert!(first < second && second < medium);
        assert_eq!(ctx.counts.critical_included, 2);
        assert_eq!(ctx.counts.medium_included, 1);
    }

    #[test]
    fn test_medium_by_score_then_stops_at_first_misfit() {
        let findings = vec![
            finding(0, 0, Severity::Medium, "low score").with_score(0.2),
            finding(1, 0, Severity::Medium, &"x".repeat(200)).with_score(0.5),
            finding(2, 0, Severity::Medium, "top score").with_score(0.9),
        ];
        let ctx = ContextBudgeter::new(120, 2.0).build(&findings);
        assert!(ctx.text.contains("top score"));
        // The oversized second item blocks everything after it
        assert!(!ctx.text.contains("low score"));
        assert_eq!(ctx.counts.medium_included, 1);
    }

    #[test]
    fn test_low_findings_summarized_per_source() {
        let findings = vec![
            finding(0, 0, Severity::Low, "a"),
            finding(0, 1, Severity::Clean, "b"),
            finding(1, 0, Severity::Clean, ""),
        ];
        let ctx = ContextBudgeter::new(10_000, 2.0).build(&findings);
        assert_eq!(ctx.text.lines().count(), 2);
        assert!(ctx.text.contains("[LOW] paper-0.pdf: 1 low, 1 clean; e.g. \"a\""));
        assert!(ctx.text.contains("[LOW] paper-1.pdf: 0 low, 1 clean"));
        assert_eq!(ctx.counts.low_sources_included, 2);
    }

    #[test]
    fn test_critical_overflow_and_truncation() {
        let findings: Vec<Finding> = (0..10)
            .map(|i| finding(i, 0, Severity::High, &"q".repeat(40)))
            .collect();

        let overflow = ContextBudgeter::new(400, 2.0).build(&findings);
        assert!(overflow.critical_overflow);
        assert!(!overflow.truncated);
        assert_eq!(overflow.counts.critical_included, 10);

        let cut = ContextBudgeter::new(200, 2.0).build(&findings);
        assert!(cut.critical_overflow);
        assert!(cut.truncated);
        assert!(cut.text.contains("[TRUNCATED:"));
        assert!(cut.char_len() <= 400);
    }

    #[test]
    fn test_tiny_budget_keeps_only_marker() {
        let findings = vec![
            finding(0, 0, Severity::High, "cloned western blot band"),
            finding(1, 0, Severity::High, "duplicated micrograph"),
        ];
        let ctx = ContextBudgeter::new(10, 2.0).build(&findings);
        assert!(ctx.truncated);
        assert_eq!(ctx.counts.critical_included, 0);
        assert_eq!(ctx.text, "[TRUNCATED: 2 of 2 critical findings omitted]\n");
        assert!(!ctx.text.contains("cloned"));
    }

    fn arb_finding() -> impl Strategy<Value = Finding> {
        (
            0usize..6,
            0usize..4,
            prop_oneof![
                Just(Severity::High),
                Just(Severity::Medium),
                Just(Severity::Low),
                Just(Severity::Clean)
            ],
            "[a-z ]{0,80}",
            prop::option::of(0.0f64..1.0),
        )
            .prop_map(|(doc, unit, severity, quote, score)| {
                let f = finding(doc, unit, severity, &quote);
                match score {
                    Some(s) => f.with_score(s),
                    None => f,
                }
            })
    }

    proptest! {
        #[test]
        fn prop_bounded_and_deterministic(
            findings in prop::collection::vec(arb_finding(), 0..30),
            max in 50usize..2_000,
        ) {
            let budgeter = ContextBudgeter::new(max, 2.0);
            let a = budgeter.build(&findings);
            let b = budgeter.build(&findings);
            prop_assert_eq!(&a, &b);

            prop_assert!(a.char_len() <= budgeter.ceiling());
            if !a.critical_overflow {
                prop_assert!(a.char_len() <= max);
            }
        }
    }
}
