//! Cross-session knowledge accumulation for persistent agents.
//!
//! After a run (or a feedback round) ends, every agent backed by a stored record gets its
//! contributions and cited sources folded into its `accumulatedInsights` by one generation
//! call. The merged text replaces the old one wholesale; topic history and the capped source
//! list are updated by the [`AgentStore`].
//!
//! Merges run concurrently and independently. A failure is logged and reported for that agent
//! only.

use chrono::Utc;
use futures_util::future::join_all;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use crate::focusgroup::agent_store::{AgentStore, KnowledgeUpdate, PersistentAgentRecord, StoreError};
use crate::focusgroup::client_wrapper::{ClientWrapper, GenerationOptions, Message};
use crate::focusgroup::model::{Agent, AgentMessage, DiscussionMessage, Session, Source};
use crate::focusgroup::prompt::{PromptBuilder, KNOWLEDGE_MERGE_SYSTEM};

/// Contributions are cut to this many characters before merging.
pub const CONTRIBUTION_CHAR_CAP: usize = 2_000;

lazy_static! {
    static ref INLINE_LINK: Option<Regex> =
        Regex::new(r"\[([^\]]+)\]\((https?://[^\s)]+)\)").ok();
}

/// True when the text cites at least one source as `[title](url)`.
pub fn has_inline_citation(text: &str) -> bool {
    INLINE_LINK.as_ref().is_some_and(|re| re.is_match(text))
}

/// Every `[title](url)` link in the text, in order of appearance.
pub fn inline_sources(text: &str) -> Vec<Source> {
    let Some(re) = INLINE_LINK.as_ref() else {
        return Vec::new();
    };
    re.captures_iter(text)
        .map(|caps| Source {
            title: caps[1].to_string(),
            url: caps[2].to_string(),
        })
        .collect()
}

/// The agent's own turns joined by `---` separators, cut to `cap` characters.
pub fn collect_contributions(session: &Session, agent_name: &str, cap: usize) -> String {
    let joined = session
        .agent_messages()
        .filter(|m| m.agent_name == agent_name)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n---\n");
    joined.chars().take(cap).collect()
}

/// Sources tied to the agent, in three groups: those attached to its turns, then links cited
/// inline in them, then results of its searches. Deduplicated by url, first occurrence wins.
pub fn collect_sources(session: &Session, agent_name: &str) -> Vec<Source> {
    let turns: Vec<&AgentMessage> = session
        .agent_messages()
        .filter(|m| m.agent_name == agent_name)
        .collect();
    let attached = turns.iter().flat_map(|m| m.sources.iter().cloned());
    let inline = turns.iter().flat_map(|m| inline_sources(&m.content));
    let searched = session
        .messages
        .iter()
        .filter_map(|message| match message {
            DiscussionMessage::Search(note) if note.agent_name == agent_name => Some(note),
            _ => None,
        })
        .flat_map(|note| {
            note.results.iter().map(|r| Source {
                url: r.url.clone(),
                title: r.title.clone(),
            })
        });

    let mut seen = HashSet::new();
    attached
        .chain(inline)
        .chain(searched)
        .filter(|source| !source.url.is_empty() && seen.insert(source.url.clone()))
        .collect()
}

/// Material from one session for one agent.
#[derive(Clone, Debug, PartialEq)]
pub struct LearnRequest {
    pub topic: String,
    pub session_id: String,
    pub contributions: String,
    pub sources: Vec<Source>,
}

impl LearnRequest {
    /// Gather what `agent` contributed to `session`.
    pub fn from_session(session: &Session, agent: &Agent, char_cap: usize) -> Self {
        Self {
            topic: session.topic.clone(),
            session_id: session.id.to_string(),
            contributions: collect_contributions(session, &agent.name, char_cap),
            sources: collect_sources(session, &agent.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnowledgeError {
    AgentNotFound(String),
    Store(StoreError),
    Generation(String),
}

impl fmt::Display for KnowledgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnowledgeError::AgentNotFound(id) => write!(f, "agent {} not found", id),
            KnowledgeError::Store(err) => write!(f, "agent store error: {}", err),
            KnowledgeError::Generation(msg) => write!(f, "knowledge merge failed: {}", msg),
        }
    }
}

impl Error for KnowledgeError {}

impl From<StoreError> for KnowledgeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => KnowledgeError::AgentNotFound(id),
            other => KnowledgeError::Store(other),
        }
    }
}

/// Outcome of merging one agent.
#[derive(Debug)]
pub struct MergeReport {
    pub agent_id: String,
    pub agent_name: String,
    pub result: Result<PersistentAgentRecord, KnowledgeError>,
}

/// Folds session contributions into persistent agent records.
pub struct KnowledgeMerger {
    client: Arc<dyn ClientWrapper>,
    store: Arc<dyn AgentStore>,
    prompts: PromptBuilder,
    contribution_cap: usize,
    max_completion_tokens: u32,
    temperature: f32,
}

impl KnowledgeMerger {
    pub fn new(client: Arc<dyn ClientWrapper>, store: Arc<dyn AgentStore>) -> Self {
        Self {
            client,
            store,
            prompts: PromptBuilder::default(),
            contribution_cap: CONTRIBUTION_CHAR_CAP,
            max_completion_tokens: 600,
            temperature: 0.5,
        }
    }

    pub fn with_contribution_cap(mut self, cap: usize) -> Self {
        self.contribution_cap = cap;
        self
    }

    /// Merge one session's material into the stored record `agent_id`.
    ///
    /// An empty merge result keeps the stored insights and still records the topic and sources.
    pub async fn learn(
        &self,
        agent_id: &str,
        request: LearnRequest,
    ) -> Result<PersistentAgentRecord, KnowledgeError> {
        let record = self
            .store
            .get(agent_id)
            .await?
            .ok_or_else(|| KnowledgeError::AgentNotFound(agent_id.to_string()))?;

        let prompt = self.prompts.knowledge_merge_prompt(
            &record.to_agent(),
            Some(record.accumulated_insights.as_str()),
            &request.topic,
            &request.contributions,
            &request.sources,
            Utc::now(),
        );
        let options = GenerationOptions::default()
            .with_max_completion_tokens(self.max_completion_tokens)
            .with_temperature(self.temperature);
        let reply = self
            .client
            .send_message(
                &[Message::system(KNOWLEDGE_MERGE_SYSTEM), Message::user(prompt)],
                &options,
            )
            .await
            .map_err(|err| KnowledgeError::Generation(err.to_string()))?;

        let merged = reply.content.trim();
        let updated = self
            .store
            .update_knowledge(
                agent_id,
                KnowledgeUpdate {
                    topic: request.topic,
                    session_id: request.session_id,
                    new_insights: (!merged.is_empty()).then(|| merged.to_string()),
                    sources: request.sources,
                },
            )
            .await?;

        log::info!(
            "focusgroup::knowledge: merged session knowledge into {} ({} sources kept)",
            updated.name,
            updated.knowledge_sources.len()
        );
        Ok(updated)
    }

    /// Merge every persistent agent of the session that contributed at least once.
    pub async fn learn_from_session(&self, session: &Session) -> Vec<MergeReport> {
        let jobs = session.agents.iter().filter_map(|agent| {
            let id = agent.id.clone()?;
            let request = LearnRequest::from_session(session, agent, self.contribution_cap);
            if request.contributions.trim().is_empty() {
                return None;
            }
            let name = agent.name.clone();
            Some(async move {
                let result = self.learn(&id, request).await;
                if let Err(err) = &result {
                    log::warn!(
                        "focusgroup::knowledge: merge for {} ({}) failed: {}",
                        name,
                        id,
                        err
                    );
                }
                MergeReport {
                    agent_id: id,
                    agent_name: name,
                    result,
                }
            })
        });
        join_all(jobs).await
    }
}
