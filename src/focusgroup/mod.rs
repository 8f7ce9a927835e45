// src/focusgroup/mod.rs

pub mod agent_store;
pub mod client_wrapper;
pub mod clients;
pub mod config;
pub mod event;
pub mod history;
pub mod knowledge;
pub mod model;
pub mod orchestrator;
pub mod prompt;
pub mod relay;
pub mod run_state;
pub mod scheduler;
pub mod search;
#[cfg(feature = "server")]
pub mod server;
pub mod session_store;
pub mod structured_output;
pub mod summary;
pub mod turn;

// Export the orchestrator at focusgroup::focusgroup::DiscussionOrchestrator as well.
pub use orchestrator::DiscussionOrchestrator;
