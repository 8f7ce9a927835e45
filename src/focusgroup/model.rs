//! Data model shared by the scheduler, the prompt builder and the relay surface.
//!
//! Field names serialize in camelCase so the same values can be handed to a browser UI or
//! written to the agent store without a translation layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Color given to personas that do not specify one.
pub const DEFAULT_AGENT_COLOR: &str = "#607D8B";

fn default_color() -> String {
    DEFAULT_AGENT_COLOR.to_string()
}

/// A panel participant.
///
/// `id` is only present when the persona is backed by a record in an
/// [`AgentStore`](crate::focusgroup::agent_store::AgentStore).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub perspective: String,
    #[serde(default = "default_color")]
    pub color: String,
    /// Merged expertise carried over from earlier sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accumulated_insights: Option<String>,
}

impl Agent {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            role: role.into(),
            background: String::new(),
            perspective: String::new(),
            color: default_color(),
            accumulated_insights: None,
        }
    }

    pub fn with_background(mut self, background: impl Into<String>) -> Self {
        self.background = background.into();
        self
    }

    pub fn with_perspective(mut self, perspective: impl Into<String>) -> Self {
        self.perspective = perspective.into();
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_accumulated_insights(mut self, insights: impl Into<String>) -> Self {
        self.accumulated_insights = Some(insights.into());
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.id.is_some()
    }
}

/// A citation attached to an agent turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
    #[serde(default)]
    pub title: String,
}

/// One ranked hit returned by a [`SearchCapability`](crate::focusgroup::search::SearchCapability).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemNote {
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModeratorNote {
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchNote {
    pub agent_name: String,
    pub query: String,
    #[serde(default)]
    pub results: Vec<SearchResult>,
    pub timestamp: DateTime<Utc>,
}

/// A finished agent turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub agent_name: String,
    pub agent_role: String,
    pub agent_color: String,
    pub content: String,
    #[serde(default)]
    pub sources: Vec<Source>,
    pub timestamp: DateTime<Utc>,
}

/// An entry of the append-only discussion log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DiscussionMessage {
    /// Informational; never sent back to the generation service.
    System(SystemNote),
    /// Moderator interjection.
    User(ModeratorNote),
    /// Record of a search capability invocation.
    Search(SearchNote),
    Agent(AgentMessage),
}

impl DiscussionMessage {
    pub fn system(content: impl Into<String>) -> Self {
        DiscussionMessage::System(SystemNote {
            content: content.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn moderator(content: impl Into<String>) -> Self {
        DiscussionMessage::User(ModeratorNote {
            content: content.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn search(
        agent_name: impl Into<String>,
        query: impl Into<String>,
        results: Vec<SearchResult>,
    ) -> Self {
        DiscussionMessage::Search(SearchNote {
            agent_name: agent_name.into(),
            query: query.into(),
            results,
            timestamp: Utc::now(),
        })
    }

    pub fn agent(agent: &Agent, content: impl Into<String>, sources: Vec<Source>) -> Self {
        DiscussionMessage::Agent(AgentMessage {
            agent_name: agent.name.clone(),
            agent_role: agent.role.clone(),
            agent_color: agent.color.clone(),
            content: content.into(),
            sources,
            timestamp: Utc::now(),
        })
    }

    pub fn is_system(&self) -> bool {
        matches!(self, DiscussionMessage::System(_))
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, DiscussionMessage::Agent(_))
    }

    pub fn as_agent(&self) -> Option<&AgentMessage> {
        match self {
            DiscussionMessage::Agent(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DiscussionMessage::System(n) => n.timestamp,
            DiscussionMessage::User(n) => n.timestamp,
            DiscussionMessage::Search(n) => n.timestamp,
            DiscussionMessage::Agent(m) => m.timestamp,
        }
    }
}

/// Style of discussion the panel is asked to hold.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusGroupMode {
    #[default]
    SharePerspectives,
    Brainstorm,
    Debate,
}

impl FocusGroupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FocusGroupMode::SharePerspectives => "share_perspectives",
            FocusGroupMode::Brainstorm => "brainstorm",
            FocusGroupMode::Debate => "debate",
        }
    }
}

/// Position of a turn inside a scheduled run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundInfo {
    pub round: u32,
    pub total_rounds: u32,
}

/// Everything that varies between two turns of the same agent, besides the log itself.
///
/// Feedback rounds carry no round metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<RoundInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interjection: Option<String>,
}

/// Operator-triggered retry affordance left behind by a failed turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryTicket {
    pub id: Uuid,
    pub agent_index: usize,
    pub agent_name: String,
    pub context: TurnContext,
    pub error: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Lenient mapping used when parsing model output.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "high" | "critical" | "urgent" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub task: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub rationale: String,
}

/// Parsed form of the end-of-discussion summary.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscussionSummary {
    pub summary: String,
    #[serde(default)]
    pub key_insights: Vec<String>,
    #[serde(default)]
    pub todos: Vec<ActionItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dissent: Option<String>,
}

/// What was stored on the session after a summary run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum SummaryData {
    Structured(DiscussionSummary),
    /// The model output could not be repaired into structured data.
    Unstructured { raw: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Setup,
    Running,
    Completed,
    Stopped,
}

/// A discussion and its append-only log.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub topic: String,
    pub agents: Vec<Agent>,
    pub messages: Vec<DiscussionMessage>,
    pub rounds: u32,
    pub current_round: u32,
    pub focus_group_mode: FocusGroupMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_measurement: Option<String>,
    pub session_timezone: String,
    pub search_enabled: bool,
    pub summary_generated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_data: Option<SummaryData>,
    #[serde(default)]
    pub agent_briefs: HashMap<String, String>,
    #[serde(default)]
    pub pending_retries: Vec<RetryTicket>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    committed_turns: HashSet<Uuid>,
    #[serde(skip)]
    ended: bool,
}

impl Session {
    pub fn new(topic: impl Into<String>, agents: Vec<Agent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            agents,
            messages: Vec::new(),
            rounds: 3,
            current_round: 0,
            focus_group_mode: FocusGroupMode::default(),
            goal_measurement: None,
            session_timezone: "UTC".to_string(),
            search_enabled: false,
            summary_generated: false,
            summary_data: None,
            agent_briefs: HashMap::new(),
            pending_retries: Vec::new(),
            status: SessionStatus::Setup,
            created_at: Utc::now(),
            committed_turns: HashSet::new(),
            ended: false,
        }
    }

    pub fn with_rounds(mut self, rounds: u32) -> Self {
        self.rounds = rounds;
        self
    }

    pub fn with_mode(mut self, mode: FocusGroupMode) -> Self {
        self.focus_group_mode = mode;
        self
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal_measurement = Some(goal.into());
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.session_timezone = timezone.into();
        self
    }

    pub fn with_search(mut self, enabled: bool) -> Self {
        self.search_enabled = enabled;
        self
    }

    pub fn push(&mut self, message: DiscussionMessage) {
        self.messages.push(message);
    }

    /// Append the messages produced by one turn.
    ///
    /// Returns `false` without touching the log when the turn was already committed or the
    /// session has ended, so the executor and the scheduler can both call this for the same
    /// turn and exactly one append happens.
    pub fn commit_turn(&mut self, turn_id: Uuid, messages: Vec<DiscussionMessage>) -> bool {
        if self.ended || !self.committed_turns.insert(turn_id) {
            return false;
        }
        self.messages.extend(messages);
        true
    }

    pub fn is_committed(&self, turn_id: &Uuid) -> bool {
        self.committed_turns.contains(turn_id)
    }

    /// Mark the session as no longer accepting turn results.
    pub fn end(&mut self) {
        self.ended = true;
    }

    pub fn has_ended(&self) -> bool {
        self.ended
    }

    /// The log as fed to the prompt builder: system notes removed, and agent turns removed
    /// as well when the turn belongs to an opening round.
    pub fn history_for_turn(&self, exclude_agent_turns: bool) -> Vec<DiscussionMessage> {
        self.messages
            .iter()
            .filter(|m| !m.is_system())
            .filter(|m| !(exclude_agent_turns && m.is_agent()))
            .cloned()
            .collect()
    }

    pub fn agent_messages(&self) -> impl Iterator<Item = &AgentMessage> {
        self.messages.iter().filter_map(|m| m.as_agent())
    }

    pub fn take_retry(&mut self, ticket_id: &Uuid) -> Option<RetryTicket> {
        let index = self
            .pending_retries
            .iter()
            .position(|ticket| &ticket.id == ticket_id)?;
        Some(self.pending_retries.remove(index))
    }
}
