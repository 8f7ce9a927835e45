//! Server-held sessions.
//!
//! A [`SessionHandle`] pairs a session's data with its [`RunControl`]. The
//! [`SessionRegistry`] owns the handles, refreshes an idle timer on every access, and evicts
//! idle or excess sessions in [`sweep`](SessionRegistry::sweep). Removing a handle ends its
//! session, so a turn that resolves afterwards cannot append to it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use uuid::Uuid;

use crate::focusgroup::model::{DiscussionMessage, Session};
use crate::focusgroup::run_state::RunControl;

/// Shared state of one session.
pub struct SessionHandle {
    id: Uuid,
    session: Mutex<Session>,
    control: RunControl,
    last_touched: Mutex<DateTime<Utc>>,
}

impl SessionHandle {
    pub fn new(session: Session) -> Self {
        Self {
            id: session.id,
            session: Mutex::new(session),
            control: RunControl::new(),
            last_touched: Mutex::new(Utc::now()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    /// Lock the session data. Never hold the guard across an await point.
    pub fn lock(&self) -> MutexGuard<'_, Session> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> Session {
        self.lock().clone()
    }

    /// See [`Session::commit_turn`].
    pub fn commit_turn(&self, turn_id: Uuid, messages: Vec<DiscussionMessage>) -> bool {
        self.lock().commit_turn(turn_id, messages)
    }

    pub fn is_committed(&self, turn_id: &Uuid) -> bool {
        self.lock().is_committed(turn_id)
    }

    pub fn push(&self, message: DiscussionMessage) {
        self.lock().push(message);
    }

    /// Stop the run and refuse any further turn results.
    pub fn end(&self) {
        self.control.abort();
        self.lock().end();
    }

    pub fn has_ended(&self) -> bool {
        self.lock().has_ended()
    }

    pub fn touch(&self) {
        self.set_last_touched(Utc::now());
    }

    pub fn last_touched(&self) -> DateTime<Utc> {
        *self
            .last_touched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_last_touched(&self, at: DateTime<Utc>) {
        *self
            .last_touched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = at;
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.lock().created_at
    }
}

/// Eviction limits for the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistryLimits {
    pub idle_ttl: Duration,
    pub max_sessions: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(24 * 60 * 60),
            max_sessions: 100,
        }
    }
}

/// All live sessions, keyed by id.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<SessionHandle>>>,
    limits: RegistryLimits,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RegistryLimits::default())
    }
}

impl SessionRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            limits,
        }
    }

    pub fn insert(&self, session: Session) -> Arc<SessionHandle> {
        let handle = Arc::new(SessionHandle::new(session));
        self.write().insert(handle.id(), handle.clone());
        handle
    }

    /// Fetch a handle and refresh its idle timer.
    pub fn get(&self, id: &Uuid) -> Option<Arc<SessionHandle>> {
        let handle = self
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()?;
        handle.touch();
        Some(handle)
    }

    /// Remove and end a session.
    pub fn remove(&self, id: &Uuid) -> Option<Arc<SessionHandle>> {
        let handle = self.write().remove(id)?;
        handle.end();
        Some(handle)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict sessions idle longer than the TTL, then the oldest until the cap holds.
    ///
    /// Returns the evicted ids.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let ttl = ChronoDuration::from_std(self.limits.idle_ttl)
            .unwrap_or_else(|_| ChronoDuration::hours(24));
        let mut evicted = Vec::new();
        let mut map = self.write();

        let idle: Vec<Uuid> = map
            .iter()
            .filter(|(_, h)| now - h.last_touched() > ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in idle {
            if let Some(handle) = map.remove(&id) {
                handle.end();
                evicted.push(id);
            }
        }

        if map.len() > self.limits.max_sessions {
            let mut by_age: Vec<(DateTime<Utc>, Uuid)> =
                map.iter().map(|(id, h)| (h.created_at(), *id)).collect();
            by_age.sort();
            let excess = map.len() - self.limits.max_sessions;
            for (_, id) in by_age.into_iter().take(excess) {
                if let Some(handle) = map.remove(&id) {
                    handle.end();
                    evicted.push(id);
                }
            }
        }

        if !evicted.is_empty() {
            log::info!(
                "focusgroup::session_store: evicted {} session(s), {} remain",
                evicted.len(),
                map.len()
            );
        }
        evicted
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(registry) => {
                        registry.sweep(Utc::now());
                    }
                    None => break,
                }
            }
        })
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Arc<SessionHandle>>> {
        self.sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn backdate(&self, id: &Uuid, at: DateTime<Utc>) {
        if let Some(handle) = self.write().get(id) {
            handle.set_last_touched(at);
        }
    }
}
