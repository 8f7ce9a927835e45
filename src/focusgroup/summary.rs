//! Single-shot discussion summary.
//!
//! [`SummaryGate`] admits at most one generation per session at a time and none once the
//! session's `summary_generated` flag is set. Admission hands out a [`SummaryPermit`] whose
//! drop releases the in-flight marker, so every exit path (success, error, cancellation of
//! the future) frees it.
//!
//! [`SummaryGenerator`] runs the admitted generation: it stops the discussion, streams the
//! summary to a [`RelaySink`], and sets the flag only after the stream completed. A failed or
//! interrupted stream leaves the session eligible for another attempt.

use futures_util::StreamExt;
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::focusgroup::client_wrapper::{ClientWrapper, GenerationOptions, Message, StreamEvent};
use crate::focusgroup::history::{self, DEFAULT_SUMMARY_BUDGET};
use crate::focusgroup::model::SummaryData;
use crate::focusgroup::prompt::PromptBuilder;
use crate::focusgroup::relay::{RelayEvent, RelaySink};
use crate::focusgroup::session_store::SessionHandle;
use crate::focusgroup::structured_output::parse_summary;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryError {
    AlreadyGenerated,
    /// Another summary for the same session is in flight.
    Busy,
    SessionNotFound,
    Generation(String),
}

impl fmt::Display for SummaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SummaryError::AlreadyGenerated => {
                write!(f, "summary already generated for this session")
            }
            SummaryError::Busy => write!(f, "summary generation already in progress"),
            SummaryError::SessionNotFound => write!(f, "session not found"),
            SummaryError::Generation(msg) => write!(f, "summary generation failed: {}", msg),
        }
    }
}

impl Error for SummaryError {}

/// Held for the duration of one summary generation.
pub struct SummaryPermit {
    session_id: Uuid,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl SummaryPermit {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

impl Drop for SummaryPermit {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.session_id);
    }
}

impl fmt::Debug for SummaryPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SummaryPermit")
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Tracks which sessions have a summary in flight.
#[derive(Clone, Default)]
pub struct SummaryGate {
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl SummaryGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a summary request for the session.
    ///
    /// The sticky flag is checked and the marker taken under the same lock, so two concurrent
    /// requests can never both be admitted.
    pub fn admit(&self, handle: &SessionHandle) -> Result<SummaryPermit, SummaryError> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if handle.lock().summary_generated {
            return Err(SummaryError::AlreadyGenerated);
        }
        if !in_flight.insert(handle.id()) {
            return Err(SummaryError::Busy);
        }
        Ok(SummaryPermit {
            session_id: handle.id(),
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn is_busy(&self, session_id: &Uuid) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(session_id)
    }
}

/// Produces the structured summary of a session.
pub struct SummaryGenerator {
    client: Arc<dyn ClientWrapper>,
    gate: SummaryGate,
    prompts: PromptBuilder,
    transcript_budget: usize,
    idle_timeout: Duration,
    max_completion_tokens: u32,
    temperature: f32,
}

impl SummaryGenerator {
    pub fn new(client: Arc<dyn ClientWrapper>) -> Self {
        Self {
            client,
            gate: SummaryGate::new(),
            prompts: PromptBuilder::default(),
            transcript_budget: DEFAULT_SUMMARY_BUDGET,
            idle_timeout: Duration::from_secs(60),
            max_completion_tokens: 4096,
            temperature: 0.7,
        }
    }

    pub fn with_transcript_budget(mut self, budget: usize) -> Self {
        self.transcript_budget = budget;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn gate(&self) -> &SummaryGate {
        &self.gate
    }

    /// Generate, relay and store the summary of `handle`'s session.
    ///
    /// Admission errors are returned before anything is sent to `sink` or to the client.
    pub async fn generate(
        &self,
        handle: &SessionHandle,
        sink: &dyn RelaySink,
    ) -> Result<SummaryData, SummaryError> {
        let permit = self.gate.admit(handle)?;
        log::info!(
            "focusgroup::summary: generating summary for session {}",
            permit.session_id()
        );

        if handle.control().is_running() {
            handle.control().halt();
        }

        let (system, user) = {
            let session = handle.lock();
            let transcript = history::compress(&session.messages, self.transcript_budget);
            self.prompts
                .summary_prompts(&session.topic, &session.agents, &transcript)
        };

        match self.stream(&system, &user, sink).await {
            Ok(content) => {
                let data = parse_summary(&content);
                {
                    let mut session = handle.lock();
                    session.summary_generated = true;
                    session.summary_data = Some(data.clone());
                }
                sink.send(RelayEvent::Done {
                    content,
                    sources: Vec::new(),
                });
                Ok(data)
            }
            Err(err) => {
                log::error!(
                    "focusgroup::summary: session {}: {}",
                    permit.session_id(),
                    err
                );
                sink.send(RelayEvent::Error {
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn stream(
        &self,
        system: &str,
        user: &str,
        sink: &dyn RelaySink,
    ) -> Result<String, SummaryError> {
        let options = GenerationOptions::default()
            .with_max_completion_tokens(self.max_completion_tokens)
            .with_temperature(self.temperature);
        let messages = [Message::system(system), Message::user(user)];
        let opened = tokio::time::timeout(
            self.idle_timeout,
            self.client.send_message_stream(&messages, &options),
        )
        .await
        .map_err(|_| {
            SummaryError::Generation(format!(
                "stream did not open within {}s",
                self.idle_timeout.as_secs()
            ))
        })?;
        let mut stream = opened.map_err(|err| SummaryError::Generation(err.to_string()))?;

        let mut assembled = String::new();
        loop {
            let next = tokio::time::timeout(self.idle_timeout, stream.next())
                .await
                .map_err(|_| {
                    SummaryError::Generation(format!(
                        "no output for {}s",
                        self.idle_timeout.as_secs()
                    ))
                })?;
            match next {
                Some(Ok(StreamEvent::Delta(delta))) => {
                    assembled.push_str(&delta);
                    sink.send(RelayEvent::Chunk { content: delta });
                }
                Some(Ok(StreamEvent::Completed { content, .. })) => {
                    let content = if content.is_empty() { assembled } else { content };
                    if content.trim().is_empty() {
                        return Err(SummaryError::Generation(
                            "empty summary response".to_string(),
                        ));
                    }
                    return Ok(content);
                }
                Some(Err(err)) => return Err(SummaryError::Generation(err.to_string())),
                None => {
                    return Err(SummaryError::Generation(
                        "stream ended before completion".to_string(),
                    ))
                }
            }
        }
    }
}
