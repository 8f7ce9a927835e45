//! Configuration for focus group runs.
//!
//! [`FocusGroupConfig`] is a plain struct: construct it by hand, start from
//! [`Default`], or read the few deployment settings from the environment with
//! [`FocusGroupConfig::from_env`]. No config-file parsing dependencies are introduced.
//!
//! # Example
//!
//! ```rust
//! use focusgroup::FocusGroupConfig;
//! use std::time::Duration;
//!
//! let config = FocusGroupConfig::default()
//!     .with_model("gpt-4.1-mini")
//!     .with_inter_turn_delay(Duration::from_millis(0));
//! assert_eq!(config.history_budget, 12_000);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::focusgroup::agent_store::KNOWLEDGE_SOURCE_CAP;
use crate::focusgroup::history::{DEFAULT_SUMMARY_BUDGET, DEFAULT_TURN_BUDGET};
use crate::focusgroup::knowledge::CONTRIBUTION_CHAR_CAP;
use crate::focusgroup::prompt::RoundPhasePolicy;

/// Settings shared by every session an orchestrator runs.
#[derive(Clone, Debug, PartialEq)]
pub struct FocusGroupConfig {
    /// Chat model used for turns, briefs, summaries and merges.
    pub model: String,
    pub openai_api_key: Option<String>,
    /// Enables [`BraveSearch`](crate::focusgroup::search::BraveSearch); without it search
    /// falls back to the mock provider.
    pub brave_api_key: Option<String>,
    /// Where the agent roster file lives.
    pub data_dir: PathBuf,
    pub port: u16,

    pub history_budget: usize,
    pub summary_budget: usize,
    pub inter_turn_delay: Duration,
    pub stream_timeout: Duration,
    /// Completion cap for a single turn.
    pub turn_max_tokens: u32,

    pub session_ttl: Duration,
    pub max_sessions: usize,
    pub sweep_interval: Duration,

    pub knowledge_source_cap: usize,
    pub contribution_char_cap: usize,
    pub max_feedback_respondents: usize,
    pub round_phase_policy: RoundPhasePolicy,

    pub max_topic_chars: usize,
    pub max_goal_chars: usize,
    pub min_agents: usize,
    pub max_agents: usize,
}

impl Default for FocusGroupConfig {
    fn default() -> Self {
        Self {
            model: "gpt-5-mini".to_string(),
            openai_api_key: None,
            brave_api_key: None,
            data_dir: PathBuf::from("data"),
            port: 3001,
            history_budget: DEFAULT_TURN_BUDGET,
            summary_budget: DEFAULT_SUMMARY_BUDGET,
            inter_turn_delay: Duration::from_millis(500),
            stream_timeout: Duration::from_secs(60),
            turn_max_tokens: 1000,
            session_ttl: Duration::from_secs(24 * 60 * 60),
            max_sessions: 100,
            sweep_interval: Duration::from_secs(30 * 60),
            knowledge_source_cap: KNOWLEDGE_SOURCE_CAP,
            contribution_char_cap: CONTRIBUTION_CHAR_CAP,
            max_feedback_respondents: 5,
            round_phase_policy: RoundPhasePolicy::default(),
            max_topic_chars: 2_000,
            max_goal_chars: 1_000,
            min_agents: 2,
            max_agents: 5,
        }
    }
}

impl FocusGroupConfig {
    /// Defaults overridden by `OPENAI_MODEL`, `OPENAI_API_KEY`, `BRAVE_SEARCH_API_KEY`,
    /// `FOCUSGROUP_DATA_DIR` and `PORT`. Empty variables are ignored.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        let mut config = Self::default();
        if let Some(model) = var("OPENAI_MODEL") {
            config.model = model;
        }
        config.openai_api_key = var("OPENAI_API_KEY");
        config.brave_api_key = var("BRAVE_SEARCH_API_KEY");
        if let Some(dir) = var("FOCUSGROUP_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(port) = var("PORT") {
            match port.parse() {
                Ok(port) => config.port = port,
                Err(_) => log::warn!(
                    "focusgroup::config: ignoring invalid PORT value {:?}",
                    port
                ),
            }
        }
        config
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_brave_api_key(mut self, key: impl Into<String>) -> Self {
        self.brave_api_key = Some(key.into());
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_inter_turn_delay(mut self, delay: Duration) -> Self {
        self.inter_turn_delay = delay;
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn with_history_budget(mut self, budget: usize) -> Self {
        self.history_budget = budget;
        self
    }

    pub fn with_round_phase_policy(mut self, policy: RoundPhasePolicy) -> Self {
        self.round_phase_policy = policy;
        self
    }

    pub fn with_session_limits(mut self, ttl: Duration, max_sessions: usize) -> Self {
        self.session_ttl = ttl;
        self.max_sessions = max_sessions;
        self
    }

    /// Whether a panel of `count` agents is allowed.
    pub fn panel_size_ok(&self, count: usize) -> bool {
        (self.min_agents..=self.max_agents).contains(&count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = FocusGroupConfig::default();
        assert_eq!(config.model, "gpt-5-mini");
        assert_eq!(config.knowledge_source_cap, 50);
        assert!(config.panel_size_ok(2));
        assert!(config.panel_size_ok(5));
        assert!(!config.panel_size_ok(1));
        assert!(!config.panel_size_ok(6));
    }
}
