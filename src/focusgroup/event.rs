//! Discussion event system.
//!
//! Provides a callback-based observability layer for discussion runs. Implement
//! [`EventHandler`] to receive real-time notifications about:
//!
//! - **Session lifecycle**: creation, preparation briefs, run start and completion
//! - **Round boundaries** and per-turn start, relay and failure
//! - **Log appends**: every message added to a session's discussion log
//! - **Control actions**: pause, resume and moderator interjections
//! - **Post-discussion work**: summary relay, roster saves and knowledge merges
//!
//! The handler is wrapped in `Arc<dyn EventHandler>` and registered on a
//! [`DiscussionOrchestrator`](crate::focusgroup::orchestrator::DiscussionOrchestrator) via
//! [`with_event_handler`](crate::focusgroup::orchestrator::DiscussionOrchestrator::with_event_handler).
//! Every event carries the session id so one handler can serve many sessions.
//!
//! # Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use focusgroup::event::{DiscussionEvent, EventHandler};
//! use focusgroup::relay::RelayEvent;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_discussion_event(&self, event: &DiscussionEvent) {
//!         match event {
//!             DiscussionEvent::RoundStarted { round, total_rounds, .. } => {
//!                 println!("--- Round {} of {} ---", round, total_rounds);
//!             }
//!             DiscussionEvent::TurnRelay { agent_name, relay: RelayEvent::Chunk { content }, .. } => {
//!                 print!("[{}] {}", agent_name, content);
//!             }
//!             _ => {}
//!         }
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::focusgroup::model::DiscussionMessage;
use crate::focusgroup::relay::RelayEvent;

/// Events emitted while a discussion is set up, run and finalised.
///
/// # Event Flow (during a typical run)
///
/// ```text
/// RunStarted
///   └─ RoundStarted { round: 1 }
///       ├─ TurnStarted { agent_index: 0 }
///       ├─ TurnRelay { Chunk } ... TurnRelay { Done }
///       ├─ MessageAppended
///       ├─ TurnStarted { agent_index: 1 }
///       └─ TurnRelay { Error } → MessageAppended (system) → TurnFailed
///   └─ RoundStarted { round: 2 } ...
/// RunCompleted
/// ```
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DiscussionEvent {
    SessionCreated {
        session_id: Uuid,
        agent_count: usize,
    },
    /// One preparation brief settled. `prepared` is false when generation failed.
    BriefPrepared {
        session_id: Uuid,
        agent_name: String,
        prepared: bool,
    },
    RunStarted {
        session_id: Uuid,
        total_rounds: u32,
    },
    RoundStarted {
        session_id: Uuid,
        round: u32,
        total_rounds: u32,
    },
    TurnStarted {
        session_id: Uuid,
        agent_index: usize,
        agent_name: String,
        round: Option<u32>,
    },
    /// One relay event of an in-flight turn.
    TurnRelay {
        session_id: Uuid,
        agent_index: usize,
        agent_name: String,
        relay: RelayEvent,
    },
    MessageAppended {
        session_id: Uuid,
        message: DiscussionMessage,
    },
    /// A turn failed and left a retry ticket behind.
    TurnFailed {
        session_id: Uuid,
        agent_index: usize,
        agent_name: String,
        error: String,
        ticket_id: Uuid,
    },
    Paused {
        session_id: Uuid,
    },
    Resumed {
        session_id: Uuid,
        with_feedback: bool,
    },
    InterjectionQueued {
        session_id: Uuid,
        content: String,
    },
    RunCompleted {
        session_id: Uuid,
        /// False when the run was stopped before its last round.
        completed: bool,
    },
    SummaryRelay {
        session_id: Uuid,
        relay: RelayEvent,
    },
    AgentsSaved {
        session_id: Uuid,
        created: usize,
    },
    KnowledgeMerged {
        session_id: Uuid,
        agent_id: String,
        agent_name: String,
    },
    KnowledgeMergeFailed {
        session_id: Uuid,
        agent_id: String,
        agent_name: String,
        error: String,
    },
}

impl DiscussionEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            DiscussionEvent::SessionCreated { session_id, .. }
            | DiscussionEvent::BriefPrepared { session_id, .. }
            | DiscussionEvent::RunStarted { session_id, .. }
            | DiscussionEvent::RoundStarted { session_id, .. }
            | DiscussionEvent::TurnStarted { session_id, .. }
            | DiscussionEvent::TurnRelay { session_id, .. }
            | DiscussionEvent::MessageAppended { session_id, .. }
            | DiscussionEvent::TurnFailed { session_id, .. }
            | DiscussionEvent::Paused { session_id }
            | DiscussionEvent::Resumed { session_id, .. }
            | DiscussionEvent::InterjectionQueued { session_id, .. }
            | DiscussionEvent::RunCompleted { session_id, .. }
            | DiscussionEvent::SummaryRelay { session_id, .. }
            | DiscussionEvent::AgentsSaved { session_id, .. }
            | DiscussionEvent::KnowledgeMerged { session_id, .. }
            | DiscussionEvent::KnowledgeMergeFailed { session_id, .. } => *session_id,
        }
    }
}

/// Trait for receiving discussion events.
///
/// The default implementation is a no-op, so implementors only handle what they need.
/// Handlers are awaited inline by the emitting flow; keep them short or hand work off to a
/// channel.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for every [`DiscussionEvent`].
    async fn on_discussion_event(&self, _event: &DiscussionEvent) {}
}
