//! # focusgroup
//!
//! focusgroup runs simulated panel discussions: several independent agent personas take turns
//! answering a topic through a remote Large Language Model, while a moderator can pause,
//! resume, interject, retry failed turns and finally ask for a structured summary.
//!
//! The crate provides layered pieces that can be used on their own or through the
//! orchestrator:
//!
//! * **Discussion Orchestration**: [`DiscussionOrchestrator`] owns sessions and exposes the
//!   control surface (setup, prepare, start, pause, resume, interject, retry, summary, stop).
//! * **Scheduling**: [`scheduler::RoundScheduler`] sequences rounds and turns honouring the
//!   per-session [`run_state::RunControl`].
//! * **Streaming Turns**: [`turn::TurnExecutor`] streams one agent's reply, relays deltas as
//!   [`relay::RelayEvent`]s and classifies failures.
//! * **Bounded Context**: [`history::compress`] renders "the discussion so far" within a token
//!   budget; [`prompt::PromptBuilder`] turns it into round-aware instructions.
//! * **Single-shot Summary**: [`summary::SummaryGate`] guarantees one summary per session and
//!   [`structured_output`] repairs truncated JSON replies.
//! * **Agent Memory**: [`agent_store::AgentStore`] persists personas and
//!   [`knowledge::KnowledgeMerger`] folds each session into their accumulated insights.
//! * **Provider Flexibility**: [`ClientWrapper`] is implemented for OpenAI-compatible chat
//!   completions in [`clients::openai`]; tests plug in their own implementations.
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use focusgroup::agent_store::InMemoryAgentStore;
//! use focusgroup::clients::openai::{Model, OpenAIClient};
//! use focusgroup::event::{DiscussionEvent, EventHandler};
//! use focusgroup::orchestrator::DiscussionSetup;
//! use focusgroup::relay::RelayEvent;
//! use focusgroup::{DiscussionOrchestrator, FocusGroupConfig};
//! use std::sync::Arc;
//!
//! struct Console;
//!
//! #[async_trait::async_trait]
//! impl EventHandler for Console {
//!     async fn on_discussion_event(&self, event: &DiscussionEvent) {
//!         if let DiscussionEvent::TurnRelay { relay: RelayEvent::Chunk { content }, .. } = event {
//!             print!("{}", content);
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     focusgroup::init_logger();
//!
//!     let api_key = std::env::var("OPENAI_API_KEY")?;
//!     let client = Arc::new(OpenAIClient::new_with_model_enum(&api_key, Model::GPT5Mini));
//!     let orchestrator = DiscussionOrchestrator::new(
//!         client,
//!         Arc::new(InMemoryAgentStore::new()),
//!         FocusGroupConfig::default(),
//!     )
//!     .with_event_handler(Arc::new(Console));
//!
//!     let session = orchestrator
//!         .setup_discussion(DiscussionSetup::new("Is remote work here to stay?", 3).with_rounds(2))
//!         .await?;
//!     orchestrator.run(session.id).await?;
//!     Ok(())
//! }
//! ```

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Applications embedding focusgroup can opt in to `RUST_LOG` driven diagnostics without
/// choosing a logging backend upfront.
///
/// ```rust
/// focusgroup::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `focusgroup` module.
pub mod focusgroup;

// Re-exporting key items for easier external access.
pub use focusgroup::agent_store;
pub use focusgroup::client_wrapper;
pub use focusgroup::client_wrapper::{ClientWrapper, Message, MessageChunkStream, Role, StreamEvent};
pub use focusgroup::clients;
pub use focusgroup::config;
pub use focusgroup::config::FocusGroupConfig;
pub use focusgroup::event;
pub use focusgroup::event::{DiscussionEvent, EventHandler};
pub use focusgroup::history;
pub use focusgroup::knowledge;
pub use focusgroup::model;
pub use focusgroup::model::{Agent, DiscussionMessage, FocusGroupMode, Session};
pub use focusgroup::orchestrator;
pub use focusgroup::orchestrator::DiscussionOrchestrator;
pub use focusgroup::prompt;
pub use focusgroup::relay;
pub use focusgroup::run_state;
pub use focusgroup::scheduler;
pub use focusgroup::search;
#[cfg(feature = "server")]
pub use focusgroup::server;
pub use focusgroup::session_store;
pub use focusgroup::structured_output;
pub use focusgroup::summary;
pub use focusgroup::turn;
