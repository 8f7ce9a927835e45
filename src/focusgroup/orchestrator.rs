//! The discussion control surface.
//!
//! [`DiscussionOrchestrator`] owns the session registry, the turn executor, the summary
//! generator and the knowledge merger, and exposes the operations a UI or HTTP layer needs:
//! setup, preparation, start, pause, resume, interjection, retry, summary, stop and delete.
//!
//! The orchestrator is cheap to clone; every clone shares the same sessions.
//!
//! # Example
//!
//! ```rust,no_run
//! use focusgroup::agent_store::InMemoryAgentStore;
//! use focusgroup::clients::openai::OpenAIClient;
//! use focusgroup::orchestrator::{DiscussionOrchestrator, DiscussionSetup};
//! use focusgroup::FocusGroupConfig;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let client = Arc::new(OpenAIClient::new_with_model_string("sk-...", "gpt-5-mini"));
//! let orchestrator = DiscussionOrchestrator::new(
//!     client,
//!     Arc::new(InMemoryAgentStore::new()),
//!     FocusGroupConfig::default(),
//! );
//!
//! let session = orchestrator
//!     .setup_discussion(DiscussionSetup::new("Should our city ban cars downtown?", 3))
//!     .await?;
//! orchestrator.prepare_agents(session.id).await?;
//! let report = orchestrator.run(session.id).await?;
//! println!("{} turns logged", report.turns_appended);
//! # Ok(())
//! # }
//! ```

use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::focusgroup::agent_store::{
    AgentStore, JsonFileAgentStore, PersistentAgentRecord, StoreError,
};
use crate::focusgroup::client_wrapper::{ClientWrapper, GenerationOptions, Message};
use crate::focusgroup::clients::openai::OpenAIClient;
use crate::focusgroup::config::FocusGroupConfig;
use crate::focusgroup::event::{DiscussionEvent, EventHandler};
use crate::focusgroup::knowledge::{KnowledgeMerger, MergeReport};
use crate::focusgroup::model::{
    Agent, DiscussionMessage, FocusGroupMode, Session, SummaryData,
};
use crate::focusgroup::prompt::{PromptBuilder, ROLE_GENERATION_SYSTEM};
use crate::focusgroup::relay::{RelayEvent, RelaySink};
use crate::focusgroup::scheduler::{pick_feedback_respondents, RoundScheduler, RunReport, TurnResolution};
use crate::focusgroup::search::{search_from_key, SearchCapability};
use crate::focusgroup::session_store::{RegistryLimits, SessionHandle, SessionRegistry};
use crate::focusgroup::structured_output::extract_json_array;
use crate::focusgroup::summary::{SummaryError, SummaryGenerator};
use crate::focusgroup::turn::TurnExecutor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    SessionNotFound(Uuid),
    InvalidRequest(String),
    AlreadyRunning,
    /// Pause or resume was requested in a state that does not allow it.
    NotRunning,
    RetryNotFound(Uuid),
    Store(StoreError),
    Generation(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::SessionNotFound(id) => write!(f, "session {} not found", id),
            OrchestratorError::InvalidRequest(msg) => write!(f, "invalid request: {}", msg),
            OrchestratorError::AlreadyRunning => write!(f, "discussion is already running"),
            OrchestratorError::NotRunning => {
                write!(f, "discussion is not in a state that allows this")
            }
            OrchestratorError::RetryNotFound(id) => write!(f, "retry ticket {} not found", id),
            OrchestratorError::Store(err) => write!(f, "{}", err),
            OrchestratorError::Generation(msg) => write!(f, "generation failed: {}", msg),
        }
    }
}

impl Error for OrchestratorError {}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        OrchestratorError::Store(err)
    }
}

/// Parameters of a new discussion.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscussionSetup {
    pub topic: String,
    pub agent_count: usize,
    #[serde(default)]
    pub goal_measurement: Option<String>,
    #[serde(default)]
    pub focus_group_mode: FocusGroupMode,
    /// Stored agents to seat first; unknown ids are skipped.
    #[serde(default)]
    pub selected_agent_ids: Vec<String>,
    /// Personas to generate; defaults to the seats left after the selected agents.
    #[serde(default)]
    pub generate_count: Option<usize>,
    #[serde(default)]
    pub session_timezone: Option<String>,
    #[serde(default)]
    pub rounds: Option<u32>,
    #[serde(default)]
    pub search_enabled: bool,
}

impl DiscussionSetup {
    pub fn new(topic: impl Into<String>, agent_count: usize) -> Self {
        Self {
            topic: topic.into(),
            agent_count,
            ..Self::default()
        }
    }

    pub fn with_selected_agents(mut self, ids: Vec<String>) -> Self {
        self.selected_agent_ids = ids;
        self
    }

    pub fn with_generate_count(mut self, count: usize) -> Self {
        self.generate_count = Some(count);
        self
    }

    pub fn with_rounds(mut self, rounds: u32) -> Self {
        self.rounds = Some(rounds);
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

    pub fn with_search(mut self, enabled: bool) -> Self {
        self.search_enabled = enabled;
        self
    }

    /// IANA zone name or fixed offset used for the clock shown to agents.
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.session_timezone = Some(timezone.into());
        self
    }
}

/// What an interjection set in motion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterjectionOutcome {
    /// A paused run was resumed.
    pub resumed: bool,
    /// The discussion was idle, so a feedback round was started.
    pub feedback_round: bool,
}

#[derive(Clone)]
pub struct DiscussionOrchestrator {
    config: Arc<FocusGroupConfig>,
    client: Arc<dyn ClientWrapper>,
    store: Arc<dyn AgentStore>,
    search: Option<Arc<dyn SearchCapability>>,
    registry: Arc<SessionRegistry>,
    executor: Arc<TurnExecutor>,
    summaries: Arc<SummaryGenerator>,
    knowledge: Arc<KnowledgeMerger>,
    prompts: PromptBuilder,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl DiscussionOrchestrator {
    pub fn new(
        client: Arc<dyn ClientWrapper>,
        store: Arc<dyn AgentStore>,
        config: FocusGroupConfig,
    ) -> Self {
        let prompts = PromptBuilder::new(config.round_phase_policy);
        let registry = Arc::new(SessionRegistry::new(RegistryLimits {
            idle_ttl: config.session_ttl,
            max_sessions: config.max_sessions,
        }));
        let summaries = SummaryGenerator::new(client.clone())
            .with_transcript_budget(config.summary_budget)
            .with_idle_timeout(config.stream_timeout);
        let knowledge = KnowledgeMerger::new(client.clone(), store.clone())
            .with_contribution_cap(config.contribution_char_cap);
        let executor = Self::build_executor(&config, &client, None, prompts);

        Self {
            config: Arc::new(config),
            client,
            store,
            search: None,
            registry,
            executor: Arc::new(executor),
            summaries: Arc::new(summaries),
            knowledge: Arc::new(knowledge),
            prompts,
            event_handler: None,
        }
    }

    /// Wire up the OpenAI client, the JSON-file roster and the search provider described by
    /// `config`.
    pub fn from_config(config: FocusGroupConfig) -> Result<Self, OrchestratorError> {
        let api_key = config.openai_api_key.clone().ok_or_else(|| {
            OrchestratorError::InvalidRequest("OPENAI_API_KEY is not set".to_string())
        })?;
        let client: Arc<dyn ClientWrapper> =
            Arc::new(OpenAIClient::new_with_model_string(&api_key, &config.model));
        let store: Arc<dyn AgentStore> = Arc::new(
            JsonFileAgentStore::in_dir(&config.data_dir)
                .with_source_cap(config.knowledge_source_cap),
        );
        let search: Arc<dyn SearchCapability> =
            Arc::from(search_from_key(config.brave_api_key.as_deref()));
        Ok(Self::new(client, store, config).with_search(search))
    }

    fn build_executor(
        config: &FocusGroupConfig,
        client: &Arc<dyn ClientWrapper>,
        search: Option<Arc<dyn SearchCapability>>,
        prompts: PromptBuilder,
    ) -> TurnExecutor {
        let executor = TurnExecutor::new(client.clone())
            .with_prompts(prompts)
            .with_history_budget(config.history_budget)
            .with_stream_timeout(config.stream_timeout)
            .with_max_completion_tokens(Some(config.turn_max_tokens));
        match search {
            Some(search) => executor.with_search(search),
            None => executor,
        }
    }

    /// Run a search before each turn of sessions that enable it.
    pub fn with_search(mut self, search: Arc<dyn SearchCapability>) -> Self {
        self.executor = Arc::new(Self::build_executor(
            &self.config,
            &self.client,
            Some(search.clone()),
            self.prompts,
        ));
        self.search = Some(search);
        self
    }

    /// Register an observer for every session this orchestrator runs.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn config(&self) -> &FocusGroupConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn AgentStore> {
        &self.store
    }

    pub fn search(&self) -> Option<&Arc<dyn SearchCapability>> {
        self.search.as_ref()
    }

    pub fn knowledge(&self) -> &KnowledgeMerger {
        &self.knowledge
    }

    fn scheduler(&self) -> RoundScheduler {
        let scheduler = RoundScheduler::new(self.executor.clone())
            .with_inter_turn_delay(self.config.inter_turn_delay);
        match &self.event_handler {
            Some(handler) => scheduler.with_event_handler(handler.clone()),
            None => scheduler,
        }
    }

    async fn emit(&self, event: DiscussionEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_discussion_event(&event).await;
        }
    }

    async fn append(&self, handle: &SessionHandle, message: DiscussionMessage) {
        handle.push(message.clone());
        self.emit(DiscussionEvent::MessageAppended {
            session_id: handle.id(),
            message,
        })
        .await;
    }

    fn handle(&self, session_id: Uuid) -> Result<Arc<SessionHandle>, OrchestratorError> {
        self.registry
            .get(&session_id)
            .ok_or(OrchestratorError::SessionNotFound(session_id))
    }

    fn validate(&self, setup: &DiscussionSetup) -> Result<(), OrchestratorError> {
        let invalid = |msg: &str| Err(OrchestratorError::InvalidRequest(msg.to_string()));
        if setup.topic.trim().is_empty() {
            return invalid("topic is required");
        }
        if setup.topic.chars().count() > self.config.max_topic_chars {
            return invalid("topic is too long");
        }
        if !self.config.panel_size_ok(setup.agent_count) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "agentCount must be between {} and {}",
                self.config.min_agents, self.config.max_agents
            )));
        }
        if setup
            .goal_measurement
            .as_deref()
            .is_some_and(|g| g.chars().count() > self.config.max_goal_chars)
        {
            return invalid("goalMeasurement is too long");
        }
        if setup.rounds == Some(0) {
            return invalid("rounds must be at least 1");
        }
        Ok(())
    }

    /// Validate the setup, seat the selected stored agents, generate the remaining personas and
    /// register a new session.
    pub async fn setup_discussion(
        &self,
        setup: DiscussionSetup,
    ) -> Result<Session, OrchestratorError> {
        self.validate(&setup)?;

        let mut agents = Vec::new();
        for id in &setup.selected_agent_ids {
            match self.store.get(id).await? {
                Some(record) => agents.push(record.to_agent()),
                None => log::warn!("focusgroup::orchestrator: selected agent {} not found", id),
            }
        }

        let to_generate = setup
            .generate_count
            .unwrap_or_else(|| setup.agent_count.saturating_sub(agents.len()));
        if to_generate > 0 {
            agents.extend(self.generate_agents(&setup.topic, to_generate).await?);
        }
        if agents.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "no agents selected or generated".to_string(),
            ));
        }

        let mut session = Session::new(setup.topic.trim(), agents)
            .with_rounds(setup.rounds.unwrap_or(3))
            .with_mode(setup.focus_group_mode)
            .with_search(setup.search_enabled);
        if let Some(goal) = setup.goal_measurement.filter(|g| !g.trim().is_empty()) {
            session = session.with_goal(goal);
        }
        if let Some(timezone) = setup.session_timezone.filter(|t| !t.trim().is_empty()) {
            session = session.with_timezone(timezone);
        }

        let snapshot = session.clone();
        self.registry.insert(session);
        self.registry.sweep(Utc::now());
        log::info!(
            "focusgroup::orchestrator: created session {} with {} agent(s)",
            snapshot.id,
            snapshot.agents.len()
        );
        self.emit(DiscussionEvent::SessionCreated {
            session_id: snapshot.id,
            agent_count: snapshot.agents.len(),
        })
        .await;
        Ok(snapshot)
    }

    /// Ask the generation service for `count` personas on `topic`.
    pub async fn generate_agents(
        &self,
        topic: &str,
        count: usize,
    ) -> Result<Vec<Agent>, OrchestratorError> {
        let reply = self
            .client
            .send_message(
                &[
                    Message::system(ROLE_GENERATION_SYSTEM),
                    Message::user(self.prompts.role_generation_prompt(topic, count)),
                ],
                &GenerationOptions::default().with_max_completion_tokens(2000),
            )
            .await
            .map_err(|err| OrchestratorError::Generation(err.to_string()))?;

        let personas = extract_json_array(&reply.content).map_err(|err| {
            OrchestratorError::Generation(format!("failed to parse generated roles: {}", err))
        })?;
        if personas.is_empty() {
            return Err(OrchestratorError::Generation(
                "generated roles are empty".to_string(),
            ));
        }
        personas.iter().map(persona_from_value).collect()
    }

    /// Prepare a private brief for every agent concurrently.
    ///
    /// Returns how many briefs were prepared; a failed brief only leaves that agent without one.
    pub async fn prepare_agents(&self, session_id: Uuid) -> Result<usize, OrchestratorError> {
        let handle = self.handle(session_id)?;
        let session = handle.snapshot();
        let options = GenerationOptions::default()
            .with_search(session.search_enabled)
            .with_max_completion_tokens(600)
            .with_temperature(0.9);
        let prompt = self.prompts.brief_prompt(
            &session.topic,
            session.goal_measurement.as_deref(),
            session.search_enabled,
        );

        let briefs = join_all(session.agents.iter().map(|agent| {
            let messages = [
                Message::system(self.prompts.brief_system(agent)),
                Message::user(&prompt),
            ];
            let options = &options;
            async move {
                let result = self.client.send_message(&messages, options).await;
                (agent.name.clone(), result)
            }
        }))
        .await;

        let mut prepared = 0;
        for (agent_name, result) in briefs {
            let brief = match result {
                Ok(reply) if !reply.content.trim().is_empty() => Some(reply.content.to_string()),
                Ok(_) => {
                    log::warn!(
                        "focusgroup::orchestrator: empty brief for {}, continuing without one",
                        agent_name
                    );
                    None
                }
                Err(err) => {
                    log::warn!(
                        "focusgroup::orchestrator: brief for {} failed, continuing without one: {}",
                        agent_name,
                        err
                    );
                    None
                }
            };
            let ok = brief.is_some();
            if let Some(brief) = brief {
                handle.lock().agent_briefs.insert(agent_name.clone(), brief);
                prepared += 1;
            }
            self.emit(DiscussionEvent::BriefPrepared {
                session_id,
                agent_name,
                prepared: ok,
            })
            .await;
        }
        Ok(prepared)
    }

    fn begin(&self, session_id: Uuid) -> Result<Arc<SessionHandle>, OrchestratorError> {
        let handle = self.handle(session_id)?;
        if handle.lock().agents.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "session has no agents".to_string(),
            ));
        }
        if !handle.control().start() {
            return Err(OrchestratorError::AlreadyRunning);
        }
        Ok(handle)
    }

    /// Run the whole discussion and wait for it to end.
    ///
    /// Post-discussion work (saving new agents, merging knowledge) is spawned in the
    /// background once the run ends, whether completed or stopped, as long as an agent spoke.
    pub async fn run(&self, session_id: Uuid) -> Result<RunReport, OrchestratorError> {
        let handle = self.begin(session_id)?;
        Ok(self.drive(handle).await)
    }

    /// Start the discussion in the background.
    pub fn start(&self, session_id: Uuid) -> Result<JoinHandle<RunReport>, OrchestratorError> {
        let handle = self.begin(session_id)?;
        let this = self.clone();
        Ok(tokio::spawn(async move { this.drive(handle).await }))
    }

    async fn drive(&self, handle: Arc<SessionHandle>) -> RunReport {
        let report = self.scheduler().run(&handle).await;
        let spoke = handle.lock().agent_messages().next().is_some();
        if spoke && !handle.has_ended() {
            self.spawn_post_run(handle, true);
        }
        report
    }

    fn spawn_post_run(&self, handle: Arc<SessionHandle>, save_agents: bool) {
        let this = self.clone();
        tokio::spawn(async move {
            if save_agents {
                if let Err(err) = this.save_session_agents(&handle).await {
                    log::error!(
                        "focusgroup::orchestrator: saving agents of session {} failed: {}",
                        handle.id(),
                        err
                    );
                }
            }
            this.merge_knowledge(&handle).await;
        });
    }

    pub async fn pause(&self, session_id: Uuid) -> Result<(), OrchestratorError> {
        let handle = self.handle(session_id)?;
        if !handle.control().pause() {
            return Err(OrchestratorError::NotRunning);
        }
        self.append(&handle, DiscussionMessage::system("Discussion paused by moderator"))
            .await;
        self.emit(DiscussionEvent::Paused { session_id }).await;
        Ok(())
    }

    pub async fn resume(&self, session_id: Uuid) -> Result<(), OrchestratorError> {
        let handle = self.handle(session_id)?;
        if !handle.control().resume() {
            return Err(OrchestratorError::NotRunning);
        }
        self.append(&handle, DiscussionMessage::system("Discussion resumed"))
            .await;
        self.emit(DiscussionEvent::Resumed {
            session_id,
            with_feedback: false,
        })
        .await;
        Ok(())
    }

    /// Log a moderator interjection and deliver it to the next turn.
    ///
    /// A paused run is resumed. When no run is in progress a feedback round starts in the
    /// background instead.
    pub async fn interject(
        &self,
        session_id: Uuid,
        text: &str,
    ) -> Result<InterjectionOutcome, OrchestratorError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "interjection is empty".to_string(),
            ));
        }
        let handle = self.handle(session_id)?;
        self.append(&handle, DiscussionMessage::moderator(text)).await;

        let control = handle.control();
        let resumed = control.queue_interjection(text);
        self.emit(DiscussionEvent::InterjectionQueued {
            session_id,
            content: text.to_string(),
        })
        .await;
        if resumed {
            self.append(
                &handle,
                DiscussionMessage::system("Discussion resumed with moderator feedback"),
            )
            .await;
            self.emit(DiscussionEvent::Resumed {
                session_id,
                with_feedback: true,
            })
            .await;
        }

        let mut outcome = InterjectionOutcome {
            resumed,
            feedback_round: false,
        };
        if !control.is_running() {
            let respondents = {
                let session = handle.lock();
                pick_feedback_respondents(
                    &session,
                    self.config.max_feedback_respondents,
                    &mut rand::thread_rng(),
                )
            };
            if !respondents.is_empty() {
                outcome.feedback_round = true;
                let this = self.clone();
                let feedback = text.to_string();
                tokio::spawn(async move {
                    let report = this
                        .scheduler()
                        .run_feedback_round(&handle, &respondents, &feedback)
                        .await;
                    if report.is_some() {
                        this.spawn_post_run(handle, false);
                    }
                });
            }
        }
        Ok(outcome)
    }

    /// Re-run a failed turn with the parameters it originally had.
    pub async fn retry_turn(
        &self,
        session_id: Uuid,
        ticket_id: Uuid,
    ) -> Result<TurnResolution, OrchestratorError> {
        let handle = self.handle(session_id)?;
        let ticket = handle
            .lock()
            .take_retry(&ticket_id)
            .ok_or(OrchestratorError::RetryNotFound(ticket_id))?;
        handle.control().clear_abort();
        log::info!(
            "focusgroup::orchestrator: retrying turn of {} in session {}",
            ticket.agent_name,
            session_id
        );
        Ok(self
            .scheduler()
            .run_turn(&handle, ticket.agent_index, ticket.context)
            .await)
    }

    /// Generate the session summary, relaying it to `sink` and to the event handler.
    ///
    /// Stops a running discussion first.
    pub async fn request_summary(
        &self,
        session_id: Uuid,
        sink: &dyn RelaySink,
    ) -> Result<SummaryData, SummaryError> {
        let handle = self
            .registry
            .get(&session_id)
            .ok_or(SummaryError::SessionNotFound)?;

        let (tx, mut rx) = mpsc::unbounded_channel::<RelayEvent>();
        let tee = Tee { outer: sink, tx };
        let summaries = &self.summaries;
        let generate = async move {
            let result = summaries.generate(&handle, &tee).await;
            drop(tee);
            result
        };
        let forward = async {
            while let Some(relay) = rx.recv().await {
                self.emit(DiscussionEvent::SummaryRelay { session_id, relay })
                    .await;
            }
        };
        let (result, ()) = tokio::join!(generate, forward);
        result
    }

    /// Whether a summary request would be admitted right now, without reserving it.
    pub fn check_summary(&self, session_id: Uuid) -> Result<(), SummaryError> {
        let handle = self
            .registry
            .get(&session_id)
            .ok_or(SummaryError::SessionNotFound)?;
        if handle.lock().summary_generated {
            return Err(SummaryError::AlreadyGenerated);
        }
        if self.summaries.gate().is_busy(&session_id) {
            return Err(SummaryError::Busy);
        }
        Ok(())
    }

    /// Stop the run; an in-flight turn is cancelled and its stream closed.
    pub fn stop(&self, session_id: Uuid) -> Result<(), OrchestratorError> {
        let handle = self.handle(session_id)?;
        handle.control().abort();
        log::info!("focusgroup::orchestrator: stop requested for session {}", session_id);
        Ok(())
    }

    /// Stop and forget a session. Late turn results are dropped.
    pub fn delete_session(&self, session_id: Uuid) -> Result<(), OrchestratorError> {
        self.registry
            .remove(&session_id)
            .map(|_| ())
            .ok_or(OrchestratorError::SessionNotFound(session_id))
    }

    pub fn get_session(&self, session_id: Uuid) -> Result<Session, OrchestratorError> {
        Ok(self.handle(session_id)?.snapshot())
    }

    /// Persist every session agent that has no stored record yet and backfill the new ids by
    /// position.
    pub async fn save_agents(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<Option<PersistentAgentRecord>>, OrchestratorError> {
        let handle = self.handle(session_id)?;
        self.save_session_agents(&handle).await
    }

    async fn save_session_agents(
        &self,
        handle: &SessionHandle,
    ) -> Result<Vec<Option<PersistentAgentRecord>>, OrchestratorError> {
        let agents = handle.lock().agents.clone();
        if agents.iter().all(Agent::is_persistent) {
            return Ok(vec![None; agents.len()]);
        }
        let created = self.store.save_from_session(&agents).await?;
        let count = {
            let mut session = handle.lock();
            let mut count = 0;
            for (agent, record) in session.agents.iter_mut().zip(&created) {
                if let Some(record) = record {
                    agent.id = Some(record.id.clone());
                    count += 1;
                }
            }
            count
        };
        log::info!(
            "focusgroup::orchestrator: saved {} new agent(s) from session {}",
            count,
            handle.id()
        );
        self.emit(DiscussionEvent::AgentsSaved {
            session_id: handle.id(),
            created: count,
        })
        .await;
        Ok(created)
    }

    /// Fold the session into the memory of every persistent agent that spoke.
    pub async fn merge_knowledge(&self, handle: &SessionHandle) -> Vec<MergeReport> {
        let session = handle.snapshot();
        let reports = self.knowledge.learn_from_session(&session).await;
        for report in &reports {
            let event = match &report.result {
                Ok(record) => {
                    let mut session = handle.lock();
                    if let Some(agent) = session
                        .agents
                        .iter_mut()
                        .find(|a| a.id.as_deref() == Some(record.id.as_str()))
                    {
                        agent.accumulated_insights = Some(record.accumulated_insights.clone())
                            .filter(|s| !s.trim().is_empty());
                    }
                    DiscussionEvent::KnowledgeMerged {
                        session_id: handle.id(),
                        agent_id: report.agent_id.clone(),
                        agent_name: report.agent_name.clone(),
                    }
                }
                Err(err) => DiscussionEvent::KnowledgeMergeFailed {
                    session_id: handle.id(),
                    agent_id: report.agent_id.clone(),
                    agent_name: report.agent_name.clone(),
                    error: err.to_string(),
                },
            };
            self.emit(event).await;
        }
        reports
    }
}

/// Sends every relay event to the caller's sink and to the event forwarder.
struct Tee<'a> {
    outer: &'a dyn RelaySink,
    tx: mpsc::UnboundedSender<RelayEvent>,
}

impl RelaySink for Tee<'_> {
    fn send(&self, event: RelayEvent) {
        self.outer.send(event.clone());
        let _ = self.tx.send(event);
    }
}

fn persona_from_value(value: &Value) -> Result<Agent, OrchestratorError> {
    let field = |name: &str| -> Result<String, OrchestratorError> {
        value
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                OrchestratorError::Generation(format!("generated agent missing field: {}", name))
            })
    };
    Ok(Agent::new(field("name")?, field("role")?)
        .with_background(field("background")?)
        .with_perspective(field("perspective")?)
        .with_color(field("color")?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn persona_requires_every_field() {
        let full = json!({
            "name": "Dr. Lena Ortiz",
            "role": "Researcher",
            "background": "Public health",
            "perspective": "evidence first",
            "color": "#2196F3"
        });
        let agent = persona_from_value(&full).unwrap();
        assert_eq!(agent.color, "#2196F3");
        assert!(agent.id.is_none());

        let missing = json!({"name": "X", "role": "Y", "background": "", "perspective": "p", "color": "#fff"});
        assert!(matches!(
            persona_from_value(&missing),
            Err(OrchestratorError::Generation(msg)) if msg.contains("background")
        ));
    }

    #[test]
    fn setup_deserializes_from_camel_case() {
        let setup: DiscussionSetup = serde_json::from_value(json!({
            "topic": "four-day week",
            "agentCount": 3,
            "focusGroupMode": "debate",
            "selectedAgentIds": ["a1"],
            "searchEnabled": true
        }))
        .unwrap();
        assert_eq!(setup.agent_count, 3);
        assert_eq!(setup.focus_group_mode, FocusGroupMode::Debate);
        assert_eq!(setup.selected_agent_ids, vec!["a1".to_string()]);
        assert!(setup.generate_count.is_none());
    }
}
