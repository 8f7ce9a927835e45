//! Best-effort recovery of structured data from model output.
//!
//! Models asked for JSON sometimes wrap it in code fences, surround it with prose, or stop
//! mid-document when they hit a token limit. [`parse_json_object`] tries, in order:
//!
//! 1. the text with surrounding code fences removed,
//! 2. the outermost `{ ... }` span,
//! 3. the first complete value at the start of that span,
//! 4. the span after [`repair_json`] closed whatever was left open.
//!
//! [`parse_summary`] builds on that and falls back to [`SummaryData::Unstructured`] so a
//! malformed summary is still shown to the user instead of failing the request.

use serde_json::Value;
use std::error::Error;
use std::fmt;

use crate::focusgroup::model::{ActionItem, DiscussionSummary, Priority, SummaryData};

/// Maximum number of key insights kept from a summary.
pub const MAX_KEY_INSIGHTS: usize = 6;

/// How many cut-back points [`repair_json`] tries before giving up.
const MAX_REPAIR_ATTEMPTS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The text contains no `{` at all.
    NoStructuredData,
    /// Every parse attempt failed; carries the last parser error.
    Malformed(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::NoStructuredData => write!(f, "no structured data found in output"),
            ParseError::Malformed(msg) => write!(f, "malformed structured output: {}", msg),
        }
    }
}

impl Error for ParseError {}

/// Remove a leading ```` ```lang ```` line and a trailing ```` ``` ```` if present.
pub fn strip_code_fences(text: &str) -> &str {
    let mut s = text.trim();
    if let Some(rest) = s.strip_prefix("```") {
        s = match rest.find('\n') {
            Some(pos) => &rest[pos + 1..],
            None => "",
        };
    }
    if let Some(rest) = s.trim_end().strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

/// The span from the first `{` to the last `}`, or to the end of the text when the object
/// was never closed.
pub fn extract_object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    match text.rfind('}') {
        Some(end) if end > start => Some(&text[start..=end]),
        _ => Some(&text[start..]),
    }
}

#[derive(Debug, Default)]
struct Scan {
    in_string: bool,
    escape: bool,
    /// Closers still owed, innermost last.
    closers: Vec<char>,
    /// Whether the most recently opened string is an object key.
    last_string_is_key: bool,
    /// Byte offsets of commas outside strings.
    commas: Vec<usize>,
}

fn scan(text: &str) -> Scan {
    let mut st = Scan::default();
    let mut prev_significant: Option<char> = None;

    for (i, c) in text.char_indices() {
        if st.in_string {
            if st.escape {
                st.escape = false;
            } else if c == '\\' {
                st.escape = true;
            } else if c == '"' {
                st.in_string = false;
                prev_significant = Some('"');
            }
            continue;
        }
        match c {
            '"' => {
                st.in_string = true;
                st.last_string_is_key = st.closers.last() == Some(&'}')
                    && matches!(prev_significant, Some('{') | Some(','));
            }
            '{' => st.closers.push('}'),
            '[' => st.closers.push(']'),
            '}' | ']' => {
                if st.closers.last() == Some(&c) {
                    st.closers.pop();
                }
            }
            ',' => st.commas.push(i),
            _ => {}
        }
        if !c.is_whitespace() {
            prev_significant = Some(c);
        }
    }
    st
}

/// Close whatever `prefix` left open: strings, escapes, dangling separators and brackets.
fn close_prefix(prefix: &str) -> String {
    let st = scan(prefix);
    let mut out = prefix.trim_end().to_string();

    if st.in_string {
        if st.escape {
            out.pop();
        }
        out.push('"');
        if st.last_string_is_key {
            out.push_str(":null");
        }
    } else {
        let literal_start = out
            .trim_end_matches(|c: char| c.is_ascii_alphabetic())
            .len();
        if !matches!(&out[literal_start..], "" | "true" | "false" | "null") {
            out.truncate(literal_start);
        }
        loop {
            let trimmed = out.trim_end();
            if let Some(rest) = trimmed.strip_suffix(',') {
                out = rest.to_string();
            } else {
                out.truncate(trimmed.len());
                break;
            }
        }
        if out.ends_with(':') {
            out.push_str("null");
        } else if out.ends_with('"') && st.last_string_is_key {
            out.push_str(":null");
        }
    }

    for closer in st.closers.iter().rev() {
        out.push(*closer);
    }
    out
}

/// Heuristically complete a truncated JSON document.
///
/// The whole text is closed first. If that still does not parse, the text is cut back to each
/// comma outside a string, newest first, and closed again. The result always parses when the
/// input starts with `{`, degrading to `{}` in the worst case.
pub fn repair_json(text: &str) -> String {
    let closed = close_prefix(text);
    if serde_json::from_str::<Value>(&closed).is_ok() {
        return closed;
    }

    let commas = scan(text).commas;
    for &pos in commas.iter().rev().take(MAX_REPAIR_ATTEMPTS) {
        let candidate = close_prefix(&text[..pos]);
        if serde_json::from_str::<Value>(&candidate).is_ok() {
            return candidate;
        }
    }

    if text.trim_start().starts_with('{') {
        "{}".to_string()
    } else {
        closed
    }
}

/// Parse model output that should be a JSON object.
pub fn parse_json_object(text: &str) -> Result<Value, ParseError> {
    let stripped = strip_code_fences(text);
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(stripped) {
        return Ok(value);
    }

    let span = extract_object_span(stripped).ok_or(ParseError::NoStructuredData)?;
    if let Ok(value) = serde_json::from_str::<Value>(span) {
        return Ok(value);
    }

    let mut leading = serde_json::Deserializer::from_str(span).into_iter::<Value>();
    if let Some(Ok(value)) = leading.next() {
        return Ok(value);
    }

    let repaired = repair_json(span);
    serde_json::from_str::<Value>(&repaired).map_err(|e| {
        log::debug!(
            "focusgroup::structured_output: repair failed ({}): {}",
            e,
            repaired
        );
        ParseError::Malformed(e.to_string())
    })
}

/// Map a parsed object onto [`DiscussionSummary`], tolerating loose typing.
///
/// Returns `None` when there is no usable `summary` field.
pub fn summary_from_value(value: &Value) -> Option<DiscussionSummary> {
    let obj = value.as_object()?;
    let summary = obj.get("summary")?.as_str()?.trim().to_string();

    let key_insights = obj
        .get("keyInsights")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                    Value::Null => None,
                    Value::String(_) => None,
                    other => Some(other.to_string()),
                })
                .take(MAX_KEY_INSIGHTS)
                .collect()
        })
        .unwrap_or_default();

    let todos = obj
        .get("todos")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(action_item).collect())
        .unwrap_or_default();

    let dissent = obj
        .get("dissent")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Some(DiscussionSummary {
        summary,
        key_insights,
        todos,
        dissent,
    })
}

fn action_item(value: &Value) -> Option<ActionItem> {
    match value {
        Value::String(task) if !task.trim().is_empty() => Some(ActionItem {
            task: task.trim().to_string(),
            priority: Priority::default(),
            rationale: String::new(),
        }),
        Value::Object(obj) => {
            let task = obj.get("task")?.as_str()?.trim();
            if task.is_empty() {
                return None;
            }
            Some(ActionItem {
                task: task.to_string(),
                priority: obj
                    .get("priority")
                    .and_then(Value::as_str)
                    .map(Priority::from_label)
                    .unwrap_or_default(),
                rationale: obj
                    .get("rationale")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
            })
        }
        _ => None,
    }
}

/// Parse a summary, falling back to the raw text when nothing structured can be recovered.
pub fn parse_summary(text: &str) -> SummaryData {
    match parse_json_object(text) {
        Ok(value) => match summary_from_value(&value) {
            Some(summary) => SummaryData::Structured(summary),
            None => SummaryData::Unstructured {
                raw: text.trim().to_string(),
            },
        },
        Err(err) => {
            log::warn!(
                "focusgroup::structured_output::parse_summary: falling back to raw text: {}",
                err
            );
            SummaryData::Unstructured {
                raw: text.trim().to_string(),
            }
        }
    }
}

/// Extract a JSON array from model output (first `[` to last `]`), e.g. generated personas.
pub fn extract_json_array(text: &str) -> Result<Vec<Value>, ParseError> {
    let stripped = strip_code_fences(text);
    let candidate = match (stripped.find('['), stripped.rfind(']')) {
        (Some(start), Some(end)) if end > start => &stripped[start..=end],
        _ => stripped,
    };
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(_) => Err(ParseError::Malformed("expected a JSON array".to_string())),
        Err(e) => Err(ParseError::Malformed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{"summary":"ok","keyInsights":["a","b \"q\""],"todos":[{"task":"t1","priority":"high","rationale":"r"},{"task":"t2","priority":"low","rationale":"s"}],"dissent":"none","score":1.5,"done":true}"#;

    #[test]
    fn strips_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn finds_object_inside_prose() {
        let value = parse_json_object("Here you go:\n{\"summary\":\"x\"}\nThanks!").unwrap();
        assert_eq!(value["summary"], "x");
    }

    #[test]
    fn truncated_mid_array_keeps_summary() {
        let data = parse_summary(r#"{"summary":"ok","keyInsights":["a","b"#);
        match data {
            SummaryData::Structured(s) => {
                assert_eq!(s.summary, "ok");
                assert_eq!(s.key_insights, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected structured, got {:?}", other),
        }
    }

    #[test]
    fn every_truncation_point_repairs_to_valid_json() {
        for (cut, _) in FULL.char_indices().skip(1) {
            let prefix = &FULL[..cut];
            let repaired = repair_json(prefix);
            assert!(
                serde_json::from_str::<Value>(&repaired).is_ok(),
                "cut at {} produced {}",
                cut,
                repaired
            );
        }
    }

    #[test]
    fn summary_survives_every_truncation_after_it() {
        let after_summary = FULL.find(",\"keyInsights\"").unwrap();
        for (cut, _) in FULL.char_indices().filter(|(i, _)| *i > after_summary) {
            match parse_summary(&FULL[..cut]) {
                SummaryData::Structured(s) => assert_eq!(s.summary, "ok", "cut at {}", cut),
                other => panic!("cut at {} gave {:?}", cut, other),
            }
        }
    }

    #[test]
    fn dangling_escape_and_literals_are_closed() {
        assert_eq!(close_prefix(r#"{"a":"x\"#), r#"{"a":"x"}"#);
        assert_eq!(close_prefix(r#"{"a":tr"#), r#"{"a":null}"#);
        assert_eq!(close_prefix(r#"{"a":true"#), r#"{"a":true}"#);
        assert_eq!(close_prefix(r#"{"a":1,"ke"#), r#"{"a":1,"ke":null}"#);
        assert_eq!(close_prefix(r#"{"a":[1,"#), r#"{"a":[1]}"#);
    }

    #[test]
    fn unrecoverable_text_falls_back_to_raw() {
        let data = parse_summary("The panel agreed on nothing.");
        assert_eq!(
            data,
            SummaryData::Unstructured {
                raw: "The panel agreed on nothing.".to_string()
            }
        );
    }

    #[test]
    fn lenient_summary_mapping() {
        let value: Value = serde_json::from_str(
            r#"{"summary":" s ","keyInsights":["1","2","3","4","5","6","7"],"todos":["just do it",{"task":"","priority":"high"},{"task":"x","priority":"URGENT"}],"dissent":""}"#,
        )
        .unwrap();
        let s = summary_from_value(&value).unwrap();
        assert_eq!(s.summary, "s");
        assert_eq!(s.key_insights.len(), MAX_KEY_INSIGHTS);
        assert_eq!(s.todos.len(), 2);
        assert_eq!(s.todos[1].priority, Priority::High);
        assert_eq!(s.dissent, None);
    }

    #[test]
    fn array_extraction() {
        let items = extract_json_array("Sure:\n```json\n[{\"name\":\"A\"}]\n```").unwrap();
        assert_eq!(items.len(), 1);
        assert!(extract_json_array("{\"name\":\"A\"}").is_err());
    }
}
