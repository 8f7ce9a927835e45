//! Execution of a single agent turn.
//!
//! [`TurnExecutor::execute`] renders the prompts, optionally runs a search first, streams the
//! generation while relaying every delta to a [`RelaySink`], and classifies failures as
//! [`TurnError`]. The relay always ends with exactly one terminal event.
//!
//! On success the executor commits the turn to its session when the session is still tracked.
//! Commits are keyed by turn id, so the scheduler committing the same turn again is a no-op.

use chrono::Utc;
use futures_util::StreamExt;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::focusgroup::client_wrapper::{
    ClientWrapper, GenerationOptions, Message, StreamEvent,
};
use crate::focusgroup::knowledge::has_inline_citation;
use crate::focusgroup::model::{
    Agent, DiscussionMessage, FocusGroupMode, SearchResult, Session, Source, TurnContext,
};
use crate::focusgroup::prompt::{PromptBuilder, PromptContext, TurnPrompt};
use crate::focusgroup::relay::{RelayEvent, RelaySink};
use crate::focusgroup::run_state::RunControl;
use crate::focusgroup::search::SearchCapability;
use crate::focusgroup::session_store::SessionHandle;

/// Query recorded for sources that came from the model's own search.
pub const NATIVE_SEARCH_QUERY: &str = "web search";

/// Why a turn produced no message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnError {
    /// The stream did not complete within the deadline.
    Timeout(Duration),
    /// The generation service failed to start or broke mid-stream.
    Transport(String),
    /// The stream completed with no content.
    EmptyResult,
    /// The run was stopped while the turn was in flight.
    Cancelled,
}

impl TurnError {
    /// Whether an operator retry makes sense.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TurnError::Cancelled)
    }
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnError::Timeout(d) => write!(f, "generation timed out after {}s", d.as_secs()),
            TurnError::Transport(msg) => write!(f, "generation failed: {}", msg),
            TurnError::EmptyResult => write!(f, "generation returned an empty response"),
            TurnError::Cancelled => write!(f, "turn cancelled"),
        }
    }
}

impl Error for TurnError {}

/// Everything one turn needs, detached from the session lock.
#[derive(Clone, Debug)]
pub struct TurnInput {
    pub turn_id: Uuid,
    pub agent_index: usize,
    pub agent: Agent,
    pub panel: Vec<Agent>,
    pub topic: String,
    pub mode: FocusGroupMode,
    pub goal: Option<String>,
    pub timezone: String,
    pub search_enabled: bool,
    pub brief: Option<String>,
    /// Log as the prompt builder sees it for this turn.
    pub history: Vec<DiscussionMessage>,
    pub context: TurnContext,
    /// Commit target; `None` for detached turns.
    pub session: Option<Weak<SessionHandle>>,
}

impl TurnInput {
    /// Build the input for `agent_index` from a session snapshot.
    ///
    /// Returns `None` when the index is out of range. Opening-round turns see no peer turns.
    pub fn from_session(
        session: &Session,
        agent_index: usize,
        context: TurnContext,
        prompts: &PromptBuilder,
    ) -> Option<Self> {
        let agent = session.agents.get(agent_index)?.clone();
        let hide_peers = prompts.policy().hides_peer_turns(context.round);
        Some(Self {
            turn_id: Uuid::new_v4(),
            agent_index,
            brief: session.agent_briefs.get(&agent.name).cloned(),
            agent,
            panel: session.agents.clone(),
            topic: session.topic.clone(),
            mode: session.focus_group_mode,
            goal: session.goal_measurement.clone(),
            timezone: session.session_timezone.clone(),
            search_enabled: session.search_enabled,
            history: session.history_for_turn(hide_peers),
            context,
            session: None,
        })
    }

    pub fn with_session(mut self, handle: &Arc<SessionHandle>) -> Self {
        self.session = Some(Arc::downgrade(handle));
        self
    }
}

/// A finished turn.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnOutput {
    pub turn_id: Uuid,
    pub agent_index: usize,
    pub content: String,
    pub sources: Vec<Source>,
    /// Search record to log ahead of the agent message, if any.
    pub search_note: Option<DiscussionMessage>,
    pub message: DiscussionMessage,
}

impl TurnOutput {
    /// Messages to append, in log order.
    pub fn messages(&self) -> Vec<DiscussionMessage> {
        self.search_note
            .iter()
            .cloned()
            .chain(std::iter::once(self.message.clone()))
            .collect()
    }
}

/// Executes turns against one generation client.
pub struct TurnExecutor {
    client: Arc<dyn ClientWrapper>,
    search: Option<Arc<dyn SearchCapability>>,
    prompts: PromptBuilder,
    history_budget: usize,
    stream_timeout: Duration,
    max_completion_tokens: Option<u32>,
}

impl TurnExecutor {
    pub fn new(client: Arc<dyn ClientWrapper>) -> Self {
        Self {
            client,
            search: None,
            prompts: PromptBuilder::default(),
            history_budget: crate::focusgroup::history::DEFAULT_TURN_BUDGET,
            stream_timeout: Duration::from_secs(60),
            max_completion_tokens: Some(1000),
        }
    }

    pub fn with_search(mut self, search: Arc<dyn SearchCapability>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_prompts(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_history_budget(mut self, budget: usize) -> Self {
        self.history_budget = budget;
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn with_max_completion_tokens(mut self, tokens: Option<u32>) -> Self {
        self.max_completion_tokens = tokens;
        self
    }

    pub fn prompts(&self) -> &PromptBuilder {
        &self.prompts
    }

    /// Run one turn to completion, relaying its stream to `sink`.
    pub async fn execute(
        &self,
        input: TurnInput,
        sink: &dyn RelaySink,
        control: &RunControl,
    ) -> Result<TurnOutput, TurnError> {
        let result = self.run(&input, sink, control).await;
        match &result {
            Ok(output) => {
                sink.send(RelayEvent::Done {
                    content: output.content.clone(),
                    sources: output.sources.clone(),
                });
                if let Some(handle) = input.session.as_ref().and_then(Weak::upgrade) {
                    handle.commit_turn(output.turn_id, output.messages());
                }
            }
            Err(err) => {
                log::warn!(
                    "focusgroup::turn::TurnExecutor::execute: {} failed: {}",
                    input.agent.name,
                    err
                );
                sink.send(RelayEvent::Error {
                    error: err.to_string(),
                });
            }
        }
        result
    }

    async fn run(
        &self,
        input: &TurnInput,
        sink: &dyn RelaySink,
        control: &RunControl,
    ) -> Result<TurnOutput, TurnError> {
        if control.is_aborted() {
            return Err(TurnError::Cancelled);
        }

        let system = self.prompts.system_instructions(&PromptContext {
            agent: &input.agent,
            topic: &input.topic,
            panel: &input.panel,
            mode: input.mode,
            goal: input.goal.as_deref(),
            search_enabled: input.search_enabled,
            round: input.context.round,
            brief: input.brief.as_deref(),
            accumulated_insights: input.agent.accumulated_insights.as_deref(),
            timezone: &input.timezone,
            now: Utc::now(),
        });
        let mut content = self.prompts.turn_content(&TurnPrompt {
            topic: &input.topic,
            history: &input.history,
            history_budget: self.history_budget,
            round: input.context.round,
            interjection: input.context.interjection.as_deref(),
            panel_size: input.panel.len(),
        });

        let research = match (&self.search, input.search_enabled) {
            (Some(search), true) => {
                let query = format!("{} {}", input.topic, input.agent.role);
                let response = search.search(&query).await;
                log::debug!(
                    "focusgroup::turn: search for {} via {} returned {} result(s)",
                    input.agent.name,
                    response.source,
                    response.results.len()
                );
                if response.results.is_empty() {
                    None
                } else {
                    content.push_str(&self.prompts.research_note(&query, &response.results));
                    Some((query, response.results))
                }
            }
            _ => None,
        };

        let options = GenerationOptions {
            search_enabled: input.search_enabled,
            max_completion_tokens: self.max_completion_tokens,
            temperature: None,
        };
        let messages = [Message::system(system), Message::user(content)];

        let (text, citations) = self.stream(&messages, &options, sink, control).await?;
        if text.trim().is_empty() {
            return Err(TurnError::EmptyResult);
        }

        let mut sources: Vec<Source> = citations
            .into_iter()
            .map(|c| Source {
                url: c.url,
                title: c.title,
            })
            .collect();
        let mut query = NATIVE_SEARCH_QUERY.to_string();
        if sources.is_empty() {
            if let Some((research_query, results)) = &research {
                sources = results
                    .iter()
                    .map(|r| Source {
                        url: r.url.clone(),
                        title: r.title.clone(),
                    })
                    .collect();
                query = research_query.clone();
            }
        }

        let search_note = if !sources.is_empty() && !has_inline_citation(&text) {
            let results = sources
                .iter()
                .map(|s| SearchResult {
                    title: s.title.clone(),
                    url: s.url.clone(),
                    description: String::new(),
                })
                .collect();
            Some(DiscussionMessage::search(&input.agent.name, query, results))
        } else {
            None
        };

        Ok(TurnOutput {
            turn_id: input.turn_id,
            agent_index: input.agent_index,
            message: DiscussionMessage::agent(&input.agent, text.clone(), sources.clone()),
            content: text,
            sources,
            search_note,
        })
    }

    /// Drive the generation stream until completion, deadline or abort.
    ///
    /// The stream is dropped on every exit path, which closes the underlying transport.
    async fn stream(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
        sink: &dyn RelaySink,
        control: &RunControl,
    ) -> Result<(String, Vec<crate::focusgroup::client_wrapper::Citation>), TurnError> {
        let deadline = Instant::now() + self.stream_timeout;
        let aborted = control.aborted();
        tokio::pin!(aborted);

        let mut stream = tokio::select! {
            biased;
            _ = &mut aborted => return Err(TurnError::Cancelled),
            opened = tokio::time::timeout_at(
                deadline,
                self.client.send_message_stream(messages, options),
            ) => match opened {
                Err(_) => return Err(TurnError::Timeout(self.stream_timeout)),
                Ok(Err(err)) => return Err(TurnError::Transport(err.to_string())),
                Ok(Ok(stream)) => stream,
            },
        };

        let mut assembled = String::new();
        loop {
            tokio::select! {
                biased;
                _ = &mut aborted => return Err(TurnError::Cancelled),
                next = tokio::time::timeout_at(deadline, stream.next()) => match next {
                    Err(_) => return Err(TurnError::Timeout(self.stream_timeout)),
                    Ok(None) => {
                        return Err(TurnError::Transport(
                            "stream ended without a completion event".to_string(),
                        ))
                    }
                    Ok(Some(Err(err))) => return Err(TurnError::Transport(err.to_string())),
                    Ok(Some(Ok(StreamEvent::Delta(delta)))) => {
                        assembled.push_str(&delta);
                        sink.send(RelayEvent::Chunk { content: delta });
                    }
                    Ok(Some(Ok(StreamEvent::Completed { content, citations }))) => {
                        let text = if content.is_empty() { assembled } else { content };
                        return Ok((text, citations));
                    }
                },
            }
        }
    }
}
