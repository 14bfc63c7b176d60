//! Structured Output Repair and Validation
//!
//! Turns raw model text into a value of the expected shape, or a precise
//! parse error. Strategies run in order and the first success wins:
//!
//! 1. Strict parse
//! 2. Strip wrapping artifacts (BOM, code fences, surrounding prose)
//! 3. First balanced `{...}` / `[...]` span
//! 4. Heuristic repair (unquoted keys, unterminated strings, trailing commas,
//!    dangling members, unbalanced brackets)
//!
//! A root-kind mismatch counts as a strategy failure. Required fields the
//! model left out are filled with `UNKNOWN` and reported in the trace.

mod json_repair;
mod shape;

pub use json_repair::{
    Unwrapped, close_open_containers, close_unterminated_strings, cut_to_last_complete_member,
    drop_trailing_commas, first_balanced_span, quote_unquoted_keys, strip_wrappers,
};
pub use shape::{ExpectedShape, RootKind};

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::constants::repair::{ERROR_CONTEXT_RADIUS, MAX_EXCERPT_CHARS};
use crate::types::{CassandraError, ParseError, Result};

/// Which strategy produced the value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    Direct,
    StripWrapping,
    BalancedSpan,
    Heuristic,
}

impl RepairStrategy {
    fn base_confidence(self) -> f64 {
        match self {
            Self::Direct => 1.0,
            Self::StripWrapping => 0.95,
            Self::BalancedSpan => 0.85,
            Self::Heuristic => 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    StrippedBom,
    StrippedCodeFence,
    StrippedProse,
    ExtractedSpan,
    QuotedKeys(usize),
    ClosedStrings(usize),
    DroppedCommas(usize),
    ClosedContainers(usize),
    CutDanglingTail,
}

/// What was done to recover a value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairTrace {
    pub strategy: RepairStrategy,
    pub actions: Vec<RepairAction>,
    /// Required fields filled with the sentinel
    pub filled_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// Strict parse, shape satisfied without changes
    Parsed(Value),
    Repaired { value: Value, trace: RepairTrace },
    Failed(ParseError),
}

impl ParseOutcome {
    /// Confidence in the recovered value, 0.0 for failures
    pub fn confidence(&self) -> f64 {
        match self {
            Self::Parsed(_) => 1.0,
            Self::Repaired { trace, .. } => {
                let penalty = 0.1 * trace.filled_fields.len() as f64;
                (trace.strategy.base_confidence() - penalty).max(0.1)
            }
            Self::Failed(_) => 0.0,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Parsed(value) | Self::Repaired { value, .. } => Some(value),
            Self::Failed(_) => None,
        }
    }

    pub fn is_repaired(&self) -> bool {
        matches!(self, Self::Repaired { .. })
    }

    pub fn trace(&self) -> Option<&RepairTrace> {
        match self {
            Self::Repaired { trace, .. } => Some(trace),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<Value> {
        match self {
            Self::Parsed(value) | Self::Repaired { value, .. } => Ok(value),
            Self::Failed(err) => Err(CassandraError::Parse(err)),
        }
    }
}

/// Run every strategy in order against `raw`
pub fn repair(raw: &str, shape: &ExpectedShape) -> ParseOutcome {
    let strict_error = match serde_json::from_str::<Value>(raw) {
        Ok(value) => {
            if let Some(outcome) = accept(value, shape, RepairStrategy::Direct, Vec::new()) {
                return outcome;
            }
            None
        }
        Err(e) => Some(e),
    };

    let unwrapped = strip_wrappers(raw);
    let mut wrap_actions = Vec::new();
    if unwrapped.stripped_bom {
        wrap_actions.push(RepairAction::StrippedBom);
    }
    if unwrapped.stripped_fence {
        wrap_actions.push(RepairAction::StrippedCodeFence);
    }
    if unwrapped.stripped_prose {
        wrap_actions.push(RepairAction::StrippedProse);
    }

    if unwrapped.changed()
        && let Ok(value) = serde_json::from_str::<Value>(&unwrapped.sliced)
        && let Some(outcome) = accept(
            value,
            shape,
            RepairStrategy::StripWrapping,
            wrap_actions.clone(),
        )
    {
        return outcome;
    }

    if let Some(span) = first_balanced_span(&unwrapped.body)
        && let Ok(value) = serde_json::from_str::<Value>(span)
    {
        let mut actions = wrap_actions.clone();
        actions.push(RepairAction::ExtractedSpan);
        if let Some(outcome) = accept(value, shape, RepairStrategy::BalancedSpan, actions) {
            return outcome;
        }
    }

    if let Some(outcome) = heuristic(&unwrapped.body, shape, wrap_actions) {
        return outcome;
    }

    let error = match strict_error {
        Some(e) => parse_error(raw, &e.to_string(), e.line(), e.column()),
        None => parse_error(raw, "root kind does not match the expected shape", 1, 1),
    };
    debug!(line = error.line, column = error.column, "Structured output unrepairable");
    ParseOutcome::Failed(error)
}

fn heuristic(
    body: &str,
    shape: &ExpectedShape,
    mut actions: Vec<RepairAction>,
) -> Option<ParseOutcome> {
    let (keyed, quoted) = quote_unquoted_keys(body);
    if quoted > 0 {
        actions.push(RepairAction::QuotedKeys(quoted));
    }

    let (closed, strings) = close_unterminated_strings(&keyed);
    let (trimmed, commas) = drop_trailing_commas(&closed);
    let (balanced, closers) = close_open_containers(&trimmed);

    if let Ok(value) = serde_json::from_str::<Value>(&balanced) {
        let mut full = actions.clone();
        if strings > 0 {
            full.push(RepairAction::ClosedStrings(strings));
        }
        if commas > 0 {
            full.push(RepairAction::DroppedCommas(commas));
        }
        if closers > 0 {
            full.push(RepairAction::ClosedContainers(closers));
        }
        if let Some(outcome) = accept(value, shape, RepairStrategy::Heuristic, full) {
            return Some(outcome);
        }
    }

    let cut = cut_to_last_complete_member(&keyed)?;
    let (cut, commas) = drop_trailing_commas(&cut);
    let value = serde_json::from_str::<Value>(&cut).ok()?;
    actions.push(RepairAction::CutDanglingTail);
    if commas > 0 {
        actions.push(RepairAction::DroppedCommas(commas));
    }
    accept(value, shape, RepairStrategy::Heuristic, actions)
}

fn accept(
    mut value: Value,
    shape: &ExpectedShape,
    strategy: RepairStrategy,
    actions: Vec<RepairAction>,
) -> Option<ParseOutcome> {
    if !shape.matches_root(&value) {
        return None;
    }
    let filled_fields = shape.fill(&mut value);
    if strategy == RepairStrategy::Direct && filled_fields.is_empty() {
        return Some(ParseOutcome::Parsed(value));
    }
    debug!(?strategy, filled = filled_fields.len(), "Repaired structured output");
    Some(ParseOutcome::Repaired {
        value,
        trace: RepairTrace {
            strategy,
            actions,
            filled_fields,
        },
    })
}

fn parse_error(raw: &str, message: &str, line: usize, column: usize) -> ParseError {
    let position = byte_offset(raw, line, column);
    ParseError {
        message: message.to_string(),
        position,
        line,
        column,
        excerpt: excerpt_around(raw, position),
    }
}

/// Byte offset of a 1-based line/column pair, clamped to the input
fn byte_offset(text: &str, line: usize, column: usize) -> usize {
    let line_start: usize = text
        .split_inclusive('\n')
        .take(line.saturating_sub(1))
        .map(str::len)
        .sum();
    let mut pos = (line_start + column.saturating_sub(1)).min(text.len());
    while !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn excerpt_around(text: &str, position: usize) -> String {
    let mut start = position.saturating_sub(ERROR_CONTEXT_RADIUS);
    while !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (position + ERROR_CONTEXT_RADIUS).min(text.len());
    while !text.is_char_boundary(end) {
        end += 1;
    }
    text[start..end].chars().take(MAX_EXCERPT_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_direct_parse() {
        let outcome = repair(r#"{"a": 1}"#, &ExpectedShape::any());
        assert_eq!(outcome, ParseOutcome::Parsed(json!({"a": 1})));
        assert_eq!(outcome.confidence(), 1.0);
    }

    #[test]
    fn test_fenced_with_prose() {
        let raw = "Here is the analysis:\n```json\n{\"verdict\": \"AVOID\"}\n```\nLet me know!";
        let outcome = repair(raw, &ExpectedShape::object(&["verdict"]));
        let trace = outcome.trace().unwrap();
        assert_eq!(trace.strategy, RepairStrategy::StripWrapping);
        assert!(trace.actions.contains(&RepairAction::StrippedCodeFence));
        assert_eq!(outcome.value().unwrap()["verdict"], "AVOID");
    }

    #[test]
    fn test_balanced_span_with_trailing_braces_in_prose() {
        let raw = r#"Result: {"a": [1, 2]} and also {oops}"#;
        let outcome = repair(raw, &ExpectedShape::any());
        assert_eq!(outcome.trace().unwrap().strategy, RepairStrategy::BalancedSpan);
        assert_eq!(outcome.value().unwrap(), &json!({"a": [1, 2]}));
    }

    #[test]
    fn test_heuristic_fixes() {
        let raw = "{name: \"x\", items: [1, 2,], note: \"unterminated";
        let outcome = repair(raw, &ExpectedShape::any());
        let trace = outcome.trace().unwrap();
        assert_eq!(trace.strategy, RepairStrategy::Heuristic);
        assert_eq!(
            outcome.value().unwrap(),
            &json!({"name": "x", "items": [1, 2], "note": "unterminated"})
        );
        assert!(outcome.confidence() < 0.95);
    }

    #[test]
    fn test_truncated_after_key_drops_member() {
        let raw = r#"{"evidence_items": [{"quote": "a", "risk_level": "HIGH"}], "summ"#;
        let outcome = repair(raw, &ExpectedShape::object(&["summary"]));
        let value = outcome.value().unwrap();
        assert_eq!(value["evidence_items"][0]["quote"], "a");
        assert_eq!(value["summary"], "UNKNOWN");
        assert_eq!(outcome.trace().unwrap().filled_fields, vec!["summary"]);
    }

    #[test]
    fn test_required_fill_marks_repaired() {
        let outcome = repair(r#"{"a": 1}"#, &ExpectedShape::object(&["b"]));
        assert!(outcome.is_repaired());
        let trace = outcome.trace().unwrap();
        assert_eq!(trace.strategy, RepairStrategy::Direct);
        assert_eq!(trace.filled_fields, vec!["b"]);
    }

    #[test]
    fn test_root_mismatch_fails() {
        let outcome = repair("[1, 2, 3]", &ExpectedShape::object(&[]));
        assert!(matches!(outcome, ParseOutcome::Failed(_)));
        assert_eq!(outcome.confidence(), 0.0);
    }

    #[test]
    fn test_failure_reports_position_and_excerpt() {
        let raw = format!("{}\nthis is not json at all: ::: ", "x".repeat(300));
        let outcome = repair(&raw, &ExpectedShape::any());
        let ParseOutcome::Failed(err) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(err.line, 1);
        assert!(err.excerpt.chars().count() <= MAX_EXCERPT_CHARS);
        assert!(err.position <= raw.len());
        assert!(matches!(
            repair(&raw, &ExpectedShape::any()).into_result(),
            Err(CassandraError::Parse(_))
        ));
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        let raw = format!("{}é{}", "ü".repeat(80), "ö".repeat(80));
        let excerpt = excerpt_around(&raw, 161);
        assert!(!excerpt.is_empty());
    }

    fn simple_object() -> impl Strategy<Value = Value> {
        prop::collection::btree_map("[a-z]{1,8}", "[ -~]{0,24}", 1..6).prop_map(|m| {
            Value::Object(m.into_iter().map(|(k, v)| (k, Value::String(v))).collect())
        })
    }

    proptest! {
        #[test]
        fn prop_fenced_output_recovers_exactly(obj in simple_object(), pretty in any::<bool>()) {
            let body = if pretty {
                serde_json::to_string_pretty(&obj).unwrap()
            } else {
                serde_json::to_string(&obj).unwrap()
            };
            let raw = format!("Here you go\n```json\n{}\n```\nthanks", body);
            let outcome = repair(&raw, &ExpectedShape::object(&[]));
            prop_assert_eq!(outcome.value(), Some(&obj));
        }

        #[test]
        fn prop_truncation_never_invents_data(obj in simple_object(), cut in 0usize..200) {
            let full = serde_json::to_string(&obj).unwrap();
            let truncated: String = full.chars().take(cut).collect();
            let outcome = repair(&truncated, &ExpectedShape::any());

            if let Some(Value::Object(recovered)) = outcome.value() {
                for (key, value) in recovered {
                    let original = obj.get(key);
                    prop_assert!(original.is_some(), "invented key {}", key);
                    let (Some(got), Some(want)) =
                        (value.as_str(), original.and_then(Value::as_str))
                    else {
                        continue;
                    };
                    prop_assert!(want.starts_with(got), "{:?} is not a prefix of {:?}", got, want);

                    let pair = format!(
                        "{}:{}",
                        serde_json::to_string(key).unwrap(),
                        serde_json::to_string(want).unwrap()
                    );
                    if truncated.contains(&pair) {
                        prop_assert_eq!(got, want);
                    }
                }
            }
        }
    }
}
