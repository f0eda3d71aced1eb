use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use super::session::{SessionInfo, SessionMemory};
use super::stage::{Stage, TurnSignal};
use crate::config::{Config, MemoryConfig};
use crate::error::{AppResult, StoreError, StoreResult};
use crate::storage::{
    constraint_violation, validate_session_id, validate_user_id, SessionSummary, SqliteStore,
    SummaryStore,
};

/// Handle to one active session. Lock it to read or mutate.
pub type SharedSession = Arc<Mutex<SessionMemory>>;

/// What happened when a turn was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TurnOutcome {
    /// This turn moved the session into closure for the first time.
    pub closure_triggered: bool,
    /// The session was written to the store.
    pub saved: bool,
    /// Stage after the turn.
    pub stage: Stage,
}

/// A session dropped from process memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvictedSession {
    pub session_id: String,
    /// Turns recorded since the last save, now lost.
    pub unsaved_turns: u32,
}

/// Outcome of [`MemoryManager::shutdown`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Sessions written during shutdown.
    pub flushed: usize,
    /// Sessions whose final save failed.
    pub failures: Vec<(String, StoreError)>,
}

struct ActiveSession {
    memory: SharedSession,
    user_id: String,
    last_access: Instant,
}

impl ActiveSession {
    /// Only the registry holds a reference, so nobody is using or waiting on it.
    fn is_idle(&self) -> bool {
        Arc::strong_count(&self.memory) == 1
    }
}

/// Process-wide registry of active sessions.
///
/// The registry lock only guards the map and is never held across I/O.
/// Each session has its own mutex which serialises record, save and load
/// for that session; different sessions never wait on each other except
/// for pooled connections.
pub struct MemoryManager {
    store: Arc<dyn SummaryStore>,
    config: MemoryConfig,
    sessions: RwLock<HashMap<String, ActiveSession>>,
}

impl MemoryManager {
    /// Create a manager over an existing store.
    pub fn new(store: Arc<dyn SummaryStore>, config: MemoryConfig) -> Self {
        Self {
            store,
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Open the SQLite pool, create the schema and build a manager.
    pub async fn init(config: &Config) -> AppResult<Self> {
        let store = SqliteStore::new(&config.database).await?;
        info!(
            save_policy = ?config.memory.save_policy,
            max_active_sessions = config.memory.max_active_sessions,
            "Memory manager initialized"
        );
        Ok(Self::new(Arc::new(store), config.memory.clone()))
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Number of sessions currently held in memory.
    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Return the active session, creating and resuming it from the store if needed.
    pub async fn get_or_create(&self, session_id: &str, user_id: &str) -> StoreResult<SharedSession> {
        let guard = self.lock_session(session_id, user_id).await?;
        Ok(OwnedMutexGuard::mutex(&guard).clone())
    }

    /// Record one turn, saving when closure is first reached or the save
    /// policy asks for it.
    ///
    /// A failed save is returned as-is; the turn stays in memory and goes out
    /// with the next successful save.
    pub async fn record_turn(
        &self,
        session_id: &str,
        user_id: &str,
        signal: TurnSignal,
    ) -> StoreResult<TurnOutcome> {
        let mut memory = self.lock_session(session_id, user_id).await?;

        let closure_triggered = memory.record_turn(signal);
        let mut saved = false;
        if memory.should_save(closure_triggered) {
            memory.save().await?;
            saved = true;
        }

        if closure_triggered {
            info!(session_id = %session_id, user_id = %user_id, "Session reached closure");
        }

        Ok(TurnOutcome {
            closure_triggered,
            saved,
            stage: memory.current_stage(),
        })
    }

    /// Save one session now, regardless of policy.
    pub async fn save(&self, session_id: &str, user_id: &str) -> StoreResult<()> {
        let mut memory = self.lock_session(session_id, user_id).await?;
        memory.save().await
    }

    /// Stored sessions of a user, most recently updated first.
    pub async fn list_user_sessions(&self, user_id: &str) -> StoreResult<Vec<SessionSummary>> {
        self.store.list_sessions_for_user(user_id).await
    }

    /// Stored summary of one session, if its owner matches.
    pub async fn stored_summary(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> StoreResult<Option<SessionSummary>> {
        match self.store.get_summary(session_id).await? {
            Some(row) if row.user_id != user_id => Err(constraint_violation(format!(
                "session {} belongs to another user",
                session_id
            ))),
            other => Ok(other),
        }
    }

    /// Info view of an active session.
    pub async fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        let handle = self.handle(session_id).await?;
        let memory = handle.lock().await;
        Some(memory.info())
    }

    /// Recent turns of an active session formatted for prompt injection.
    pub async fn recent_context(&self, session_id: &str) -> Option<String> {
        let handle = self.handle(session_id).await?;
        let memory = handle.lock().await;
        Some(memory.tracker().recent_context(self.config.context_window_turns))
    }

    /// Transcript of an active session for an external summariser, and the
    /// turn number it covers through.
    pub async fn transcript(&self, session_id: &str) -> Option<(String, u64)> {
        let handle = self.handle(session_id).await?;
        let memory = handle.lock().await;
        Some(memory.tracker().transcript())
    }

    /// Apply an externally produced condensation to an active session.
    ///
    /// Returns false when the session is no longer active or the result is
    /// older than what the session already carries.
    pub async fn absorb_summary(&self, session_id: &str, text: String, through_turn: u64) -> bool {
        let Some(handle) = self.handle(session_id).await else {
            return false;
        };
        let mut memory = handle.lock().await;
        if memory.is_retired() {
            return false;
        }
        memory.absorb_summary(text, through_turn)
    }

    /// Save (if needed) and drop one session from memory.
    ///
    /// Returns false when the session was not active. On save failure the
    /// session stays active.
    pub async fn end_session(&self, session_id: &str) -> StoreResult<bool> {
        let Some(handle) = self.handle(session_id).await else {
            return Ok(false);
        };

        let mut memory = handle.lock().await;
        if memory.is_retired() {
            return Ok(false);
        }
        if memory.has_unsaved_changes() {
            memory.save().await?;
        }
        memory.retire();
        self.discard(session_id, &handle).await;
        info!(session_id = %session_id, "Session ended");
        Ok(true)
    }

    /// Evict sessions idle for longer than the configured timeout.
    ///
    /// Sessions currently in use are skipped. Unsaved turns of evicted
    /// sessions are lost.
    pub async fn evict_idle(&self) -> Vec<EvictedSession> {
        let timeout = self.config.idle_timeout();
        let mut sessions = self.sessions.write().await;

        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, entry)| entry.is_idle() && entry.last_access.elapsed() >= timeout)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| evict_entry(&mut sessions, &id))
            .collect()
    }

    /// Flush every session with unsaved changes, clear the registry and
    /// close the store.
    pub async fn shutdown(&self) -> ShutdownReport {
        let drained: Vec<(String, ActiveSession)> =
            self.sessions.write().await.drain().collect();

        let mut report = ShutdownReport::default();
        for (session_id, entry) in drained {
            let mut memory = entry.memory.lock().await;
            if memory.has_unsaved_changes() {
                match memory.save().await {
                    Ok(()) => report.flushed += 1,
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "Final save failed");
                        report.failures.push((session_id.clone(), e));
                    }
                }
            }
            memory.retire();
        }

        self.store.close().await;
        info!(
            flushed = report.flushed,
            failed = report.failures.len(),
            "Memory manager shut down"
        );
        report
    }

    /// Resolve the session and lock it, loading from the store on first use.
    async fn lock_session(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> StoreResult<OwnedMutexGuard<SessionMemory>> {
        validate_session_id(session_id)?;
        validate_user_id(user_id)?;

        loop {
            let handle = self.resolve(session_id, user_id).await?;
            let mut memory = handle.lock_owned().await;

            // Ended or shut down while we waited; resolve again.
            if memory.is_retired() {
                continue;
            }

            if !memory.is_loaded() {
                match memory.load().await {
                    Ok(resumed) => {
                        debug!(session_id = %session_id, resumed, "Session activated");
                    }
                    Err(e) => {
                        memory.retire();
                        let handle = OwnedMutexGuard::mutex(&memory).clone();
                        self.discard(session_id, &handle).await;
                        return Err(e);
                    }
                }
            }
            return Ok(memory);
        }
    }

    /// Drop a registry entry if it still points at `handle`.
    async fn discard(&self, session_id: &str, handle: &SharedSession) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get(session_id) {
            if Arc::ptr_eq(&entry.memory, handle) {
                sessions.remove(session_id);
            }
        }
    }

    async fn resolve(&self, session_id: &str, user_id: &str) -> StoreResult<SharedSession> {
        let mut sessions = self.sessions.write().await;

        if let Some(entry) = sessions.get_mut(session_id) {
            if entry.user_id != user_id {
                return Err(constraint_violation(format!(
                    "session {} belongs to another user",
                    session_id
                )));
            }
            entry.last_access = Instant::now();
            return Ok(entry.memory.clone());
        }

        let memory = Arc::new(Mutex::new(SessionMemory::new(
            session_id,
            user_id,
            self.store.clone(),
            &self.config,
        )));
        sessions.insert(
            session_id.to_string(),
            ActiveSession {
                memory: memory.clone(),
                user_id: user_id.to_string(),
                last_access: Instant::now(),
            },
        );

        // LRU eviction of idle sessions once over capacity
        while sessions.len() > self.config.max_active_sessions {
            let victim = sessions
                .iter()
                .filter(|(_, entry)| entry.is_idle())
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(id, _)| id.clone());

            match victim.and_then(|id| evict_entry(&mut sessions, &id)) {
                Some(_) => {}
                None => break,
            }
        }

        Ok(memory)
    }

    async fn handle(&self, session_id: &str) -> Option<SharedSession> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.memory.clone())
    }
}

/// Remove one idle entry. Must be called with the registry write lock held.
fn evict_entry(
    sessions: &mut HashMap<String, ActiveSession>,
    session_id: &str,
) -> Option<EvictedSession> {
    let entry = sessions.get(session_id)?;
    let unsaved_turns = {
        let mut memory = entry.memory.try_lock().ok()?;
        memory.retire();
        memory.unsaved_turns()
    };
    sessions.remove(session_id);

    if unsaved_turns > 0 {
        warn!(
            session_id = %session_id,
            unsaved_turns,
            "Evicted session with unsaved turns"
        );
    } else {
        debug!(session_id = %session_id, "Evicted idle session");
    }

    Some(EvictedSession {
        session_id: session_id.to_string(),
        unsaved_turns,
    })
}
