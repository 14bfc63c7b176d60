//! JSON Repair Passes
//!
//! String-aware text passes used by the repair pipeline. Every pass scans the
//! input once, tracks string/escape state, and never edits string contents
//! except to terminate an unterminated string.
//!
//! Handles common model output issues:
//! - Markdown code fence wrapping (```json ... ```), BOM, surrounding prose
//! - Unquoted object keys
//! - Unterminated strings (newline or end of input inside a string)
//! - Trailing and dangling commas
//! - Missing closing braces/brackets
//! - Truncated members (dangling key, colon or partial scalar)

use crate::constants::repair::STRING_CLOSE_WINDOW;

/// Text after unwrapping, in two flavours
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unwrapped {
    /// BOM/fences removed, leading prose dropped up to the first opener
    pub body: String,
    /// `body` additionally cut after the last closer
    pub sliced: String,
    pub stripped_bom: bool,
    pub stripped_fence: bool,
    pub stripped_prose: bool,
}

impl Unwrapped {
    pub fn changed(&self) -> bool {
        self.stripped_bom || self.stripped_fence || self.stripped_prose
    }
}

/// Remove BOM, code fences and prose around the payload
pub fn strip_wrappers(raw: &str) -> Unwrapped {
    let without_bom = raw.trim_start_matches('\u{feff}');
    let stripped_bom = without_bom.len() != raw.len();
    let mut s = without_bom.trim();

    let mut stripped_fence = false;
    if let Some(inner) = fenced_block(s) {
        s = inner.trim();
        stripped_fence = true;
    }

    let mut stripped_prose = false;
    let (body, sliced) = match s.find(['{', '[']) {
        Some(start) => {
            let body = &s[start..];
            let end = body.rfind(['}', ']']).map(|e| e + 1).unwrap_or(body.len());
            stripped_prose = start > 0 || end < body.len();
            (body.to_string(), body[..end].to_string())
        }
        None => (s.to_string(), s.to_string()),
    };

    Unwrapped {
        body,
        sliced,
        stripped_bom,
        stripped_fence,
        stripped_prose,
    }
}

/// Content of the first ``` fenced block; an unterminated fence runs to the end
fn fenced_block(s: &str) -> Option<&str> {
    let open = s.find("```")?;
    let after_open = &s[open + 3..];
    // Skip the language tag line
    let content_start = after_open.find('\n').map(|n| n + 1).unwrap_or(after_open.len());
    let content = &after_open[content_start..];
    match content.find("```") {
        Some(close) => Some(&content[..close]),
        None => Some(content),
    }
}

/// First balanced `{...}` or `[...]` span, ignoring brackets inside strings
pub fn first_balanced_span(s: &str) -> Option<&str> {
    let start = s.find(['{', '['])?;
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape = false;

    for (i, ch) in s[start..].char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(&s[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Wrap bare identifiers used as object keys in quotes. Returns (text, keys quoted).
pub fn quote_unquoted_keys(s: &str) -> (String, usize) {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 16);
    let mut in_string = false;
    let mut escape = false;
    let mut prev_sig: Option<char> = None;
    let mut quoted = 0;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if in_string {
            out.push(ch);
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
                prev_sig = Some('"');
            }
            i += 1;
            continue;
        }

        if (ch.is_ascii_alphabetic() || ch == '_') && matches!(prev_sig, Some('{') | Some(',')) {
            let start = i;
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '-')
            {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            let mut j = i;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && chars[j] == ':' {
                out.push('"');
                out.push_str(&ident);
                out.push('"');
                quoted += 1;
            } else {
                out.push_str(&ident);
            }
            prev_sig = Some('a');
            continue;
        }

        if ch == '"' {
            in_string = true;
        }
        if !ch.is_whitespace() {
            prev_sig = Some(ch);
        }
        out.push(ch);
        i += 1;
    }

    (out, quoted)
}

/// Terminate strings that hit a raw newline or the end of input.
///
/// At a newline the string is closed before a trailing structural delimiter
/// (`,` `}` `]`) when one ends the string content within the close window.
/// At end of input a dangling escape is dropped and the string is closed.
/// Returns (text, strings closed).
pub fn close_unterminated_strings(s: &str) -> (String, usize) {
    let mut out = String::with_capacity(s.len() + 8);
    let mut in_string = false;
    let mut escape = false;
    let mut string_start = 0;
    let mut closed = 0;

    for ch in s.chars() {
        if !in_string {
            if ch == '"' {
                in_string = true;
                string_start = out.len();
            }
            out.push(ch);
            continue;
        }

        if escape {
            escape = false;
            out.push(ch);
            continue;
        }

        match ch {
            '\\' => {
                escape = true;
                out.push(ch);
            }
            '"' => {
                in_string = false;
                out.push(ch);
            }
            '\n' | '\r' => {
                close_before_delimiter(&mut out, string_start);
                in_string = false;
                closed += 1;
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }

    if in_string {
        if escape {
            out.pop();
        }
        out.push('"');
        closed += 1;
    }

    (out, closed)
}

fn close_before_delimiter(out: &mut String, string_start: usize) {
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    let content_len = out.len() - (string_start + 1);
    if content_len <= STRING_CLOSE_WINDOW
        && let Some(last) = out.chars().last()
        && matches!(last, ',' | '}' | ']')
        && content_len > 0
    {
        let pos = out.len() - last.len_utf8();
        out.insert(pos, '"');
        return;
    }
    out.push('"');
}

/// Drop commas followed by a closer or the end of input. Returns (text, commas dropped).
pub fn drop_trailing_commas(s: &str) -> (String, usize) {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escape = false;
    let mut dropped = 0;

    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            continue;
        }

        if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, None | Some('}') | Some(']')) {
                dropped += 1;
                continue;
            }
        }
        if ch == '"' {
            in_string = true;
        }
        out.push(ch);
    }

    (out, dropped)
}

/// Append the closers needed for every container left open. Returns (text, closers added).
pub fn close_open_containers(s: &str) -> (String, usize) {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape = false;

    for ch in s.chars() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut out = s.trim_end().to_string();
    if in_string {
        out.push('"');
    }
    let added = stack.len();
    out.extend(stack.into_iter().rev());
    (out, added)
}

#[derive(Debug)]
struct Frame {
    closer: char,
    is_object: bool,
    awaiting_value: bool,
}

fn closers(stack: &[Frame]) -> String {
    stack.iter().rev().map(|f| f.closer).collect()
}

fn mark_value_complete(stack: &mut [Frame]) {
    if let Some(top) = stack.last_mut()
        && top.is_object
    {
        top.awaiting_value = false;
    }
}

/// Cut back to the last complete member and close the containers open there.
///
/// Used for truncated output: a dangling key, colon, partial scalar or
/// unterminated string after the last complete value is discarded.
/// Returns `None` when no complete prefix exists.
pub fn cut_to_last_complete_member(s: &str) -> Option<String> {
    let mut stack: Vec<Frame> = Vec::new();
    let mut safe: Option<(usize, String)> = None;
    let mut in_string = false;
    let mut string_is_key = false;
    let mut escape = false;
    let mut in_scalar = false;

    for (i, ch) in s.char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
                if !string_is_key {
                    mark_value_complete(&mut stack);
                    safe = Some((i + 1, closers(&stack)));
                }
            }
            continue;
        }

        if in_scalar {
            if matches!(ch, ',' | '}' | ']' | ':') || ch.is_whitespace() {
                in_scalar = false;
                mark_value_complete(&mut stack);
                safe = Some((i, closers(&stack)));
            } else {
                continue;
            }
        }

        match ch {
            '{' | '[' => {
                stack.push(Frame {
                    closer: if ch == '{' { '}' } else { ']' },
                    is_object: ch == '{',
                    awaiting_value: ch == '[',
                });
                safe = Some((i + 1, closers(&stack)));
            }
            '}' | ']' => {
                stack.pop();
                mark_value_complete(&mut stack);
                safe = Some((i + 1, closers(&stack)));
            }
            '"' => {
                in_string = true;
                string_is_key = matches!(stack.last(), Some(f) if f.is_object && !f.awaiting_value);
            }
            ':' => {
                if let Some(top) = stack.last_mut() {
                    top.awaiting_value = true;
                }
            }
            ',' => {
                if let Some(top) = stack.last_mut()
                    && top.is_object
                {
                    top.awaiting_value = false;
                }
            }
            c if c.is_whitespace() => {}
            _ => in_scalar = true,
        }
    }

    let (end, close) = safe?;
    let mut out = s[..end].trim_end().to_string();
    out.push_str(&close);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fence_and_prose() {
        let u = strip_wrappers("Sure! Here it is:\n```json\n{\"a\": 1}\n```\nAnything else?");
        assert!(u.stripped_fence);
        assert_eq!(u.sliced, "{\"a\": 1}");
    }

    #[test]
    fn test_strip_bom() {
        let u = strip_wrappers("\u{feff}{\"a\": 1}");
        assert!(u.stripped_bom);
        assert_eq!(u.sliced, "{\"a\": 1}");
    }

    #[test]
    fn test_unterminated_fence() {
        let u = strip_wrappers("```json\n{\"a\": [1, 2");
        assert!(u.stripped_fence);
        assert_eq!(u.body, "{\"a\": [1, 2");
    }

    #[test]
    fn test_first_balanced_span_ignores_string_brackets() {
        let s = r#"note {"a": "}{", "b": [1]} trailing {"c": 2}"#;
        assert_eq!(first_balanced_span(s), Some(r#"{"a": "}{", "b": [1]}"#));
        assert_eq!(first_balanced_span("{\"a\": 1"), None);
    }

    #[test]
    fn test_quote_unquoted_keys() {
        let (out, n) = quote_unquoted_keys(r#"{name: "x", risk_level : "HIGH", list: [true, null]}"#);
        assert_eq!(n, 3);
        assert_eq!(
            out,
            r#"{"name": "x", "risk_level" : "HIGH", "list": [true, null]}"#
        );
    }

    #[test]
    fn test_quote_keys_leaves_strings_alone() {
        let input = r#"{"text": "a, b: c"}"#;
        let (out, n) = quote_unquoted_keys(input);
        assert_eq!(n, 0);
        assert_eq!(out, input);
    }

    #[test]
    fn test_close_string_at_newline_before_delimiter() {
        let (out, n) = close_unterminated_strings("{\"a\": \"open,\n\"b\": 1}");
        assert_eq!(n, 1);
        assert_eq!(out, "{\"a\": \"open\",\n\"b\": 1}");
    }

    #[test]
    fn test_close_string_at_eof_drops_dangling_escape() {
        let (out, n) = close_unterminated_strings("{\"a\": \"abc\\");
        assert_eq!(n, 1);
        assert_eq!(out, "{\"a\": \"abc\"");
    }

    #[test]
    fn test_drop_trailing_commas() {
        let (out, n) = drop_trailing_commas(r#"{"a": [1, 2,], "b": "x,}",}"#);
        assert_eq!(n, 2);
        assert_eq!(out, r#"{"a": [1, 2], "b": "x,}"}"#);
    }

    #[test]
    fn test_close_open_containers_nested() {
        let (out, n) = close_open_containers(r#"{"a": [{"b": 1"#);
        assert_eq!(n, 3);
        assert_eq!(out, r#"{"a": [{"b": 1}]}"#);
    }

    #[test]
    fn test_cut_dangling_key() {
        let out = cut_to_last_complete_member(r#"{"a": "x", "ke"#).unwrap();
        assert_eq!(out, r#"{"a": "x"}"#);
    }

    #[test]
    fn test_cut_dangling_colon_and_scalar() {
        assert_eq!(
            cut_to_last_complete_member(r#"{"a": 1, "b":"#).unwrap(),
            r#"{"a": 1}"#
        );
        assert_eq!(
            cut_to_last_complete_member(r#"{"a": 1, "b": 12"#).unwrap(),
            r#"{"a": 1}"#
        );
        assert_eq!(
            cut_to_last_complete_member(r#"[{"a": 1}, {"b": tr"#).unwrap(),
            r#"[{"a": 1}, {}]"#
        );
    }
}
