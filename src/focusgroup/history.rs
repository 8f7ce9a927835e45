//! Bounded rendering of "the discussion so far".
//!
//! The most recent [`KEEP_RECENT`] messages are always rendered verbatim. Older messages are
//! added newest-first while the token budget allows and the walk stops at the first message
//! that does not fit. The output is chronological, prefixed with [`OMITTED_MARKER`] when at
//! least one older message was dropped.
//!
//! Token cost is estimated as `ceil(chars / 4)`; it is a cheap proxy, not a tokenizer.

use crate::focusgroup::model::DiscussionMessage;

/// Number of trailing messages that are always kept.
pub const KEEP_RECENT: usize = 8;

/// Default budget for per-turn prompts.
pub const DEFAULT_TURN_BUDGET: usize = 12_000;

/// Budget used when rendering the transcript for the final summary.
pub const DEFAULT_SUMMARY_BUDGET: usize = 16_000;

pub const OMITTED_MARKER: &str = "[Earlier discussion omitted]";

const SEPARATOR: &str = "\n\n";

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Render a single log entry the way it appears in prompts.
///
/// System notes are not part of the discussion and render as `None`.
pub fn render_message(message: &DiscussionMessage) -> Option<String> {
    match message {
        DiscussionMessage::System(_) => None,
        DiscussionMessage::User(note) => {
            Some(format!("[MODERATOR - User Intervention]: {}", note.content))
        }
        DiscussionMessage::Search(note) => {
            let findings = note
                .results
                .iter()
                .map(|r| format!("{} - {}", r.title, r.description))
                .collect::<Vec<_>>()
                .join("; ");
            Some(format!(
                "[RESEARCH NOTE]: {} searched for \"{}\" and found: {}",
                note.agent_name, note.query, findings
            ))
        }
        DiscussionMessage::Agent(msg) => Some(format!(
            "[{} - {}]: {}",
            msg.agent_name, msg.agent_role, msg.content
        )),
    }
}

/// Compress `messages` into at most roughly `budget` estimated tokens plus the recent window.
pub fn compress(messages: &[DiscussionMessage], budget: usize) -> String {
    let rendered: Vec<String> = messages.iter().filter_map(render_message).collect();
    compress_rendered(&rendered, budget, KEEP_RECENT)
}

/// Same policy as [`compress`] over already-rendered entries and an explicit recent window.
pub fn compress_rendered(rendered: &[String], budget: usize, keep_recent: usize) -> String {
    if rendered.is_empty() {
        return String::new();
    }

    let split = rendered.len().saturating_sub(keep_recent);
    let (older, recent) = rendered.split_at(split);
    let recent_text = recent.join(SEPARATOR);

    let mut remaining = budget as i64 - estimate_tokens(&recent_text) as i64;
    if remaining <= 0 || older.is_empty() {
        return recent_text;
    }

    let mut included: Vec<&str> = Vec::new();
    for text in older.iter().rev() {
        let cost = estimate_tokens(text) as i64;
        if remaining - cost < 0 {
            break;
        }
        remaining -= cost;
        included.push(text);
    }
    included.reverse();

    let mut parts: Vec<&str> = Vec::with_capacity(included.len() + 2);
    if included.len() < older.len() {
        parts.push(OMITTED_MARKER);
    }
    parts.extend(included);
    parts.push(&recent_text);
    parts.join(SEPARATOR)
}
