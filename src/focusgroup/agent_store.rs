//! Persistent agent roster.
//!
//! [`AgentStore`] is the keyed-record CRUD seam. Two implementations are provided:
//!
//! - [`InMemoryAgentStore`] for tests and ephemeral deployments.
//! - [`JsonFileAgentStore`] which keeps the roster in one JSON file, loads it lazily, and
//!   writes atomically (temp file plus rename, falling back to a direct write).
//!
//! Both delegate the actual record rules to [`AgentRoster`], so field-level updates, the
//! knowledge-source cap and batch saves behave the same everywhere. Every mutation is a
//! read-modify-write against the latest roster under one lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::focusgroup::model::{Agent, Source, DEFAULT_AGENT_COLOR};

/// Maximum number of knowledge sources kept per agent.
pub const KNOWLEDGE_SOURCE_CAP: usize = 50;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicEntry {
    pub topic: String,
    pub session_id: String,
    pub date: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeBase {
    #[serde(default)]
    pub topics_discussed: Vec<TopicEntry>,
    #[serde(default)]
    pub session_count: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeSource {
    pub url: String,
    #[serde(default)]
    pub title: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub session_topic: String,
}

/// Durable form of an [`Agent`] plus what it has learned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentAgentRecord {
    pub id: String,
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub perspective: String,
    pub color: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub knowledge_base: KnowledgeBase,
    #[serde(default)]
    pub accumulated_insights: String,
    #[serde(default)]
    pub knowledge_sources: Vec<KnowledgeSource>,
}

impl PersistentAgentRecord {
    /// Panel form of this record, carrying its id and accumulated insights.
    pub fn to_agent(&self) -> Agent {
        let agent = Agent::new(&self.name, &self.role)
            .with_id(&self.id)
            .with_background(&self.background)
            .with_perspective(&self.perspective)
            .with_color(&self.color);
        if self.accumulated_insights.trim().is_empty() {
            agent
        } else {
            agent.with_accumulated_insights(&self.accumulated_insights)
        }
    }
}

/// Fields for a new record. Only `name` and `role` are required.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NewAgent {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub perspective: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

impl From<&Agent> for NewAgent {
    fn from(agent: &Agent) -> Self {
        Self {
            name: agent.name.clone(),
            role: agent.role.clone(),
            background: Some(agent.background.clone()),
            perspective: Some(agent.perspective.clone()),
            color: Some(agent.color.clone()),
        }
    }
}

/// Field-level update; `None` leaves the stored value untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub role: Option<String>,
    pub background: Option<String>,
    pub perspective: Option<String>,
    pub color: Option<String>,
    pub accumulated_insights: Option<String>,
    pub knowledge_sources: Option<Vec<KnowledgeSource>>,
}

/// Result of one knowledge merge, applied by [`AgentStore::update_knowledge`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeUpdate {
    pub topic: String,
    pub session_id: String,
    /// Replaces the stored insights wholesale when present and non-empty.
    pub new_insights: Option<String>,
    #[serde(default)]
    pub sources: Vec<Source>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(String),
    /// The backing storage could not be read or written.
    Unavailable(String),
    Invalid(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "agent not found: {}", id),
            StoreError::Unavailable(msg) => write!(f, "agent store unavailable: {}", msg),
            StoreError::Invalid(msg) => write!(f, "invalid agent data: {}", msg),
        }
    }
}

impl Error for StoreError {}

/// The record rules, independent of where the roster is kept.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentRoster {
    records: Vec<PersistentAgentRecord>,
}

impl AgentRoster {
    pub fn new(records: Vec<PersistentAgentRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[PersistentAgentRecord] {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&PersistentAgentRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut PersistentAgentRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    pub fn create(
        &mut self,
        new: NewAgent,
        now: DateTime<Utc>,
    ) -> Result<PersistentAgentRecord, StoreError> {
        if new.name.trim().is_empty() || new.role.trim().is_empty() {
            return Err(StoreError::Invalid("name and role are required".to_string()));
        }
        let record = PersistentAgentRecord {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            role: new.role,
            background: new.background.unwrap_or_default(),
            perspective: new.perspective.unwrap_or_default(),
            color: new
                .color
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_AGENT_COLOR.to_string()),
            created_at: now,
            updated_at: now,
            knowledge_base: KnowledgeBase::default(),
            accumulated_insights: String::new(),
            knowledge_sources: Vec::new(),
        };
        self.records.push(record.clone());
        Ok(record)
    }

    pub fn update(
        &mut self,
        id: &str,
        update: AgentUpdate,
        now: DateTime<Utc>,
    ) -> Option<PersistentAgentRecord> {
        let record = self.get_mut(id)?;
        if let Some(v) = update.name {
            record.name = v;
        }
        if let Some(v) = update.role {
            record.role = v;
        }
        if let Some(v) = update.background {
            record.background = v;
        }
        if let Some(v) = update.perspective {
            record.perspective = v;
        }
        if let Some(v) = update.color {
            record.color = v;
        }
        if let Some(v) = update.accumulated_insights {
            record.accumulated_insights = v;
        }
        if let Some(v) = update.knowledge_sources {
            record.knowledge_sources = v;
        }
        record.updated_at = now;
        Some(record.clone())
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.id != id);
        self.records.len() != before
    }

    /// Fold a merge result into a record.
    ///
    /// Sources are deduplicated by url within this batch only, appended with today's date,
    /// and the list is cut back to the newest `source_cap` entries.
    pub fn update_knowledge(
        &mut self,
        id: &str,
        update: KnowledgeUpdate,
        source_cap: usize,
        now: DateTime<Utc>,
    ) -> Option<PersistentAgentRecord> {
        let record = self.get_mut(id)?;

        if !update.topic.is_empty() && !update.session_id.is_empty() {
            record.knowledge_base.topics_discussed.push(TopicEntry {
                topic: update.topic.clone(),
                session_id: update.session_id.clone(),
                date: now,
            });
            record.knowledge_base.session_count += 1;
        }

        if let Some(insights) = update.new_insights.filter(|s| !s.trim().is_empty()) {
            record.accumulated_insights = insights;
        }

        let mut seen = HashSet::new();
        for source in update.sources {
            if source.url.is_empty() || !seen.insert(source.url.clone()) {
                continue;
            }
            record.knowledge_sources.push(KnowledgeSource {
                url: source.url,
                title: source.title,
                date: now,
                session_topic: update.topic.clone(),
            });
        }
        let len = record.knowledge_sources.len();
        if len > source_cap {
            record.knowledge_sources.drain(..len - source_cap);
        }

        record.updated_at = now;
        Some(record.clone())
    }

    /// Create one record per session agent that has no id yet.
    ///
    /// The result is parallel to `agents`: entries that already had an id, or lack a name or
    /// role, are `None`.
    pub fn save_from_session(
        &mut self,
        agents: &[Agent],
        now: DateTime<Utc>,
    ) -> Vec<Option<PersistentAgentRecord>> {
        agents
            .iter()
            .map(|agent| {
                if agent.id.is_some() {
                    return None;
                }
                self.create(NewAgent::from(agent), now).ok()
            })
            .collect()
    }
}

/// Keyed-record CRUD for persistent agents.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn list(&self) -> Result<Vec<PersistentAgentRecord>, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<PersistentAgentRecord>, StoreError>;

    async fn create(&self, new: NewAgent) -> Result<PersistentAgentRecord, StoreError>;

    async fn update(
        &self,
        id: &str,
        update: AgentUpdate,
    ) -> Result<PersistentAgentRecord, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    async fn update_knowledge(
        &self,
        id: &str,
        update: KnowledgeUpdate,
    ) -> Result<PersistentAgentRecord, StoreError>;

    /// See [`AgentRoster::save_from_session`].
    async fn save_from_session(
        &self,
        agents: &[Agent],
    ) -> Result<Vec<Option<PersistentAgentRecord>>, StoreError>;
}

/// Roster held in memory only.
pub struct InMemoryAgentStore {
    roster: Mutex<AgentRoster>,
    source_cap: usize,
}

impl Default for InMemoryAgentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAgentStore {
    pub fn new() -> Self {
        Self::with_records(Vec::new())
    }

    pub fn with_records(records: Vec<PersistentAgentRecord>) -> Self {
        Self {
            roster: Mutex::new(AgentRoster::new(records)),
            source_cap: KNOWLEDGE_SOURCE_CAP,
        }
    }

    pub fn with_source_cap(mut self, cap: usize) -> Self {
        self.source_cap = cap;
        self
    }
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn list(&self) -> Result<Vec<PersistentAgentRecord>, StoreError> {
        Ok(self.roster.lock().await.records().to_vec())
    }

    async fn get(&self, id: &str) -> Result<Option<PersistentAgentRecord>, StoreError> {
        Ok(self.roster.lock().await.get(id).cloned())
    }

    async fn create(&self, new: NewAgent) -> Result<PersistentAgentRecord, StoreError> {
        self.roster.lock().await.create(new, Utc::now())
    }

    async fn update(
        &self,
        id: &str,
        update: AgentUpdate,
    ) -> Result<PersistentAgentRecord, StoreError> {
        self.roster
            .lock()
            .await
            .update(id, update, Utc::now())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        if self.roster.lock().await.remove(id) {
            Ok(())
        } else {
            Err(StoreError::NotFound(id.to_string()))
        }
    }

    async fn update_knowledge(
        &self,
        id: &str,
        update: KnowledgeUpdate,
    ) -> Result<PersistentAgentRecord, StoreError> {
        self.roster
            .lock()
            .await
            .update_knowledge(id, update, self.source_cap, Utc::now())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn save_from_session(
        &self,
        agents: &[Agent],
    ) -> Result<Vec<Option<PersistentAgentRecord>>, StoreError> {
        Ok(self.roster.lock().await.save_from_session(agents, Utc::now()))
    }
}

/// Roster persisted as a pretty-printed JSON array in a single file.
pub struct JsonFileAgentStore {
    path: PathBuf,
    cache: Mutex<Option<AgentRoster>>,
    source_cap: usize,
}

impl JsonFileAgentStore {
    /// Store the roster at `<data_dir>/agents.json`.
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::new(data_dir.as_ref().join("agents.json"))
    }

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
            source_cap: KNOWLEDGE_SOURCE_CAP,
        }
    }

    pub fn with_source_cap(mut self, cap: usize) -> Self {
        self.source_cap = cap;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> AgentRoster {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => match serde_json::from_str::<AgentRoster>(&raw) {
                Ok(roster) => {
                    log::info!(
                        "focusgroup::agent_store: loaded {} persistent agents from {}",
                        roster.records().len(),
                        self.path.display()
                    );
                    roster
                }
                Err(err) => {
                    log::error!(
                        "focusgroup::agent_store: {} is unreadable, starting with an empty roster: {}",
                        self.path.display(),
                        err
                    );
                    AgentRoster::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => AgentRoster::default(),
            Err(err) => {
                log::error!(
                    "focusgroup::agent_store: cannot read {}, starting with an empty roster: {}",
                    self.path.display(),
                    err
                );
                AgentRoster::default()
            }
        }
    }

    async fn persist(&self, roster: &AgentRoster) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(roster)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let atomic = async {
            tokio::fs::write(&tmp, json.as_bytes()).await?;
            tokio::fs::rename(&tmp, &self.path).await
        };
        if let Err(err) = atomic.await {
            log::warn!(
                "focusgroup::agent_store: atomic save failed, writing directly: {}",
                err
            );
            tokio::fs::write(&self.path, json.as_bytes())
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        Ok(())
    }

    /// Run `op` against a copy of the latest roster and keep the copy only if it was saved.
    async fn mutate<T>(
        &self,
        op: impl FnOnce(&mut AgentRoster) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.cache.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await);
        }
        let mut working = guard.clone().unwrap_or_default();
        let result = op(&mut working)?;
        self.persist(&working).await?;
        *guard = Some(working);
        Ok(result)
    }

    async fn read<T>(&self, op: impl FnOnce(&AgentRoster) -> T) -> T {
        let mut guard = self.cache.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await);
        }
        match guard.as_ref() {
            Some(roster) => op(roster),
            None => op(&AgentRoster::default()),
        }
    }
}

#[async_trait]
impl AgentStore for JsonFileAgentStore {
    async fn list(&self) -> Result<Vec<PersistentAgentRecord>, StoreError> {
        Ok(self.read(|r| r.records().to_vec()).await)
    }

    async fn get(&self, id: &str) -> Result<Option<PersistentAgentRecord>, StoreError> {
        Ok(self.read(|r| r.get(id).cloned()).await)
    }

    async fn create(&self, new: NewAgent) -> Result<PersistentAgentRecord, StoreError> {
        self.mutate(|r| r.create(new, Utc::now())).await
    }

    async fn update(
        &self,
        id: &str,
        update: AgentUpdate,
    ) -> Result<PersistentAgentRecord, StoreError> {
        self.mutate(|r| {
            r.update(id, update, Utc::now())
                .ok_or_else(|| StoreError::NotFound(id.to_string()))
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|r| {
            if r.remove(id) {
                Ok(())
            } else {
                Err(StoreError::NotFound(id.to_string()))
            }
        })
        .await
    }

    async fn update_knowledge(
        &self,
        id: &str,
        update: KnowledgeUpdate,
    ) -> Result<PersistentAgentRecord, StoreError> {
        let cap = self.source_cap;
        self.mutate(|r| {
            r.update_knowledge(id, update, cap, Utc::now())
                .ok_or_else(|| StoreError::NotFound(id.to_string()))
        })
        .await
    }

    async fn save_from_session(
        &self,
        agents: &[Agent],
    ) -> Result<Vec<Option<PersistentAgentRecord>>, StoreError> {
        self.mutate(|r| Ok(r.save_from_session(agents, Utc::now())))
            .await
    }
}
