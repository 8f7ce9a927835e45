//! Streaming relay protocol between a running turn (or summary) and its observers.
//!
//! Each relayed generation is an ordered sequence of zero or more [`RelayEvent::Chunk`] events
//! followed by exactly one terminal event, [`RelayEvent::Done`] or [`RelayEvent::Error`]. Chunks
//! are deltas; the full text is their concatenation.
//!
//! On the wire every event is one server-sent-events frame: `data: {json}\n\n`.
//!
//! The consumer side ([`read_relay_stream`]) decodes frames from raw bytes, reassembles the text
//! and applies an idle timeout. A stream that ends or stalls without a terminal event is reported
//! as [`RelayOutcome::Failed`].

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::focusgroup::model::Source;

/// Consumers give up after this long without a frame.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayEvent {
    Chunk {
        content: String,
    },
    Done {
        content: String,
        #[serde(default)]
        sources: Vec<Source>,
    },
    Error {
        error: String,
    },
}

impl RelayEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RelayEvent::Chunk { .. })
    }

    /// Encode as a single server-sent-events frame.
    pub fn to_sse_frame(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => format!("data: {}\n\n", json),
            Err(err) => format!(
                "data: {{\"type\":\"error\",\"error\":\"relay encoding failed: {}\"}}\n\n",
                err
            ),
        }
    }
}

/// Receives relay events as a generation progresses.
pub trait RelaySink: Send + Sync {
    fn send(&self, event: RelayEvent);
}

/// Discards every event.
pub struct NullSink;

impl RelaySink for NullSink {
    fn send(&self, _event: RelayEvent) {}
}

impl RelaySink for mpsc::UnboundedSender<RelayEvent> {
    fn send(&self, event: RelayEvent) {
        // A dropped receiver means nobody is watching any more.
        let _ = mpsc::UnboundedSender::send(self, event);
    }
}

/// Splits a byte stream into lines without breaking multi-byte characters across reads.
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    pending: Vec<u8>,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every line completed by them, without the line terminator.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Flush whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string())
    }
}

/// Payload of an SSE `data:` line, if the line is one.
pub fn sse_data(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Decode one relay frame line. Non-data lines and malformed payloads yield `None`.
pub fn parse_relay_line(line: &str) -> Option<RelayEvent> {
    let data = sse_data(line)?;
    match serde_json::from_str(data) {
        Ok(event) => Some(event),
        Err(err) => {
            log::warn!(
                "focusgroup::relay::parse_relay_line: skipping malformed frame ({}): {}",
                err,
                line
            );
            None
        }
    }
}

/// Result of consuming one relayed generation.
#[derive(Clone, Debug, PartialEq)]
pub enum RelayOutcome {
    Completed {
        content: String,
        sources: Vec<Source>,
    },
    /// Error event, transport failure, idle timeout, or end of stream without a terminal event.
    /// `partial` holds the text assembled before the failure.
    Failed { error: String, partial: String },
}

/// Consume a relay byte stream until its terminal event.
///
/// `on_chunk` receives the text assembled so far and the newest delta. When a `done` frame
/// carries empty content the concatenated chunks are used instead.
pub async fn read_relay_stream<S, B, E, F>(
    mut stream: S,
    idle_timeout: Duration,
    mut on_chunk: F,
) -> RelayOutcome
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
    F: FnMut(&str, &str),
{
    let mut decoder = SseLineDecoder::new();
    let mut assembled = String::new();

    loop {
        let next = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                return RelayOutcome::Failed {
                    error: format!("relay stream idle for {}s", idle_timeout.as_secs()),
                    partial: assembled,
                }
            }
        };

        let (lines, exhausted) = match next {
            Some(Ok(bytes)) => (decoder.feed(bytes.as_ref()), false),
            Some(Err(err)) => {
                return RelayOutcome::Failed {
                    error: err.to_string(),
                    partial: assembled,
                }
            }
            None => (decoder.finish().into_iter().collect(), true),
        };

        for line in lines {
            match parse_relay_line(&line) {
                Some(RelayEvent::Chunk { content }) => {
                    assembled.push_str(&content);
                    on_chunk(&assembled, &content);
                }
                Some(RelayEvent::Done { content, sources }) => {
                    let content = if content.is_empty() { assembled } else { content };
                    return RelayOutcome::Completed { content, sources };
                }
                Some(RelayEvent::Error { error }) => {
                    return RelayOutcome::Failed {
                        error,
                        partial: assembled,
                    }
                }
                None => {}
            }
        }

        if exhausted {
            return RelayOutcome::Failed {
                error: "relay stream ended without a terminal event".to_string(),
                partial: assembled,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_tagged_json() {
        let frame = RelayEvent::Chunk {
            content: "hi".into(),
        }
        .to_sse_frame();
        assert_eq!(frame, "data: {\"type\":\"chunk\",\"content\":\"hi\"}\n\n");

        let done = RelayEvent::Done {
            content: "x".into(),
            sources: vec![],
        };
        assert!(done.is_terminal());
    }

    #[test]
    fn decoder_keeps_split_utf8_intact() {
        let text = "data: {\"type\":\"chunk\",\"content\":\"é\"}\n";
        let bytes = text.as_bytes();
        let split = text.find('é').unwrap() + 1; // middle of the two-byte sequence
        let mut decoder = SseLineDecoder::new();
        assert!(decoder.feed(&bytes[..split]).is_empty());
        let lines = decoder.feed(&bytes[split..]);
        assert_eq!(lines, vec![text.trim_end().to_string()]);
        assert_eq!(
            parse_relay_line(&lines[0]),
            Some(RelayEvent::Chunk {
                content: "é".into()
            })
        );
    }

    #[test]
    fn decoder_handles_crlf_and_flush() {
        let mut decoder = SseLineDecoder::new();
        assert_eq!(decoder.feed(b"a\r\nb"), vec!["a".to_string()]);
        assert_eq!(decoder.finish(), Some("b".to_string()));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn non_data_and_malformed_lines_are_skipped() {
        assert_eq!(parse_relay_line(": keep-alive"), None);
        assert_eq!(parse_relay_line("data: {not json"), None);
    }
}
