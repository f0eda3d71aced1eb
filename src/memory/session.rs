use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::stage::{BeliefShift, EmotionTally, Stage, TurnSignal};
use super::trend::TrendTracker;
use crate::config::{MemoryConfig, SavePolicy};
use crate::error::StoreResult;
use crate::storage::{constraint_violation, SessionSummary, SummaryStore};

/// Read-only view of an active session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub turn_count: u64,
    pub unsaved_turns: u32,
    pub current_stage: Stage,
    pub closed: bool,
    pub emotion_tally: EmotionTally,
    pub belief_shift: BeliefShift,
    pub summary: String,
}

/// In-process state of one active session.
///
/// Owns its [`TrendTracker`] and bridges it to the store. All methods are
/// called under the session's lock held by the `MemoryManager`.
pub struct SessionMemory {
    session_id: String,
    user_id: String,
    tracker: TrendTracker,
    store: Arc<dyn SummaryStore>,
    save_policy: SavePolicy,
    /// Sticky once the session first reaches closure.
    closed: bool,
    /// Closure was reached but no save has succeeded since.
    closure_unsaved: bool,
    unsaved_turns: u32,
    created_at: DateTime<Utc>,
    last_saved_at: Option<DateTime<Utc>>,
    loaded: bool,
    retired: bool,
}

impl SessionMemory {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        store: Arc<dyn SummaryStore>,
        config: &MemoryConfig,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            tracker: TrendTracker::new(config.summary_max_chars),
            store,
            save_policy: config.save_policy,
            closed: false,
            closure_unsaved: false,
            unsaved_turns: 0,
            created_at: Utc::now(),
            last_saved_at: None,
            loaded: false,
            retired: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn tracker(&self) -> &TrendTracker {
        &self.tracker
    }

    pub fn current_stage(&self) -> Stage {
        self.tracker.current_stage()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Turns recorded since the last successful save.
    pub fn unsaved_turns(&self) -> u32 {
        self.unsaved_turns
    }

    /// Whether anything would be lost if this session were dropped now.
    pub fn has_unsaved_changes(&self) -> bool {
        self.unsaved_turns > 0 || self.closure_unsaved
    }

    pub fn last_saved_at(&self) -> Option<DateTime<Utc>> {
        self.last_saved_at
    }

    /// Record a turn. Returns true only on the turn that first moves the
    /// session into closure.
    pub fn record_turn(&mut self, signal: TurnSignal) -> bool {
        let stage = signal.stage;
        self.tracker.append(signal);
        self.unsaved_turns = self.unsaved_turns.saturating_add(1);

        let triggered = !self.closed && self.tracker.is_closing();
        if triggered {
            self.closed = true;
            self.closure_unsaved = true;
        }

        debug!(
            session_id = %self.session_id,
            stage = %stage,
            turns = self.tracker.turn_count(),
            closure_triggered = triggered,
            "Turn recorded"
        );
        triggered
    }

    /// Save policy. Closure always saves, and keeps asking to until a save
    /// succeeds; the configured periodic policy is layered on top.
    pub fn should_save(&self, triggered_closure: bool) -> bool {
        if triggered_closure || self.closure_unsaved {
            return true;
        }
        match self.save_policy {
            SavePolicy::OnClosure => false,
            SavePolicy::EveryTurn => self.unsaved_turns > 0,
            SavePolicy::EveryNTurns(n) => self.unsaved_turns >= n.max(1),
        }
    }

    /// Write the current state to the store as a full-row upsert.
    ///
    /// On failure nothing is reset, so the next save carries the same turns.
    pub async fn save(&mut self) -> StoreResult<()> {
        let now = Utc::now();
        let updated_at = match self.last_saved_at {
            Some(last) if last > now => last,
            _ => now,
        };

        let summary = self.to_summary(updated_at);
        if let Err(e) = self.store.upsert_summary(&summary).await {
            warn!(
                session_id = %self.session_id,
                error = %e,
                retryable = e.is_retryable(),
                unsaved_turns = self.unsaved_turns,
                "Session save failed"
            );
            return Err(e);
        }

        self.last_saved_at = Some(updated_at);
        self.unsaved_turns = 0;
        self.closure_unsaved = false;

        info!(
            session_id = %self.session_id,
            user_id = %self.user_id,
            stage = %summary.current_stage,
            turns = summary.turn_count,
            closed = summary.closed,
            "Session saved"
        );
        Ok(())
    }

    /// Resume from the store. Returns true when a stored row was found.
    ///
    /// A stored row overwrites in-memory state; a missing row leaves it as is.
    pub async fn load(&mut self) -> StoreResult<bool> {
        let row = self.store.get_summary(&self.session_id).await?;
        self.loaded = true;

        let Some(row) = row else {
            debug!(session_id = %self.session_id, "No stored session, starting fresh");
            return Ok(false);
        };

        if row.user_id != self.user_id {
            self.loaded = false;
            return Err(constraint_violation(format!(
                "session {} belongs to another user",
                self.session_id
            )));
        }

        self.tracker.seed(&row);
        self.closed = row.closed;
        self.closure_unsaved = false;
        self.unsaved_turns = 0;
        self.created_at = row.created_at;
        self.last_saved_at = Some(row.updated_at);

        debug!(
            session_id = %self.session_id,
            stage = %row.current_stage,
            turns = row.turn_count,
            closed = row.closed,
            "Session resumed from store"
        );
        Ok(true)
    }

    /// Feed an externally produced condensation back into the tracker.
    pub fn absorb_summary(&mut self, text: impl Into<String>, through_turn: u64) -> bool {
        self.tracker.absorb_summary(text, through_turn)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            turn_count: self.tracker.turn_count(),
            unsaved_turns: self.unsaved_turns,
            current_stage: self.tracker.current_stage(),
            closed: self.closed,
            emotion_tally: self.tracker.emotion_tally(),
            belief_shift: self.tracker.belief_shift(),
            summary: self.tracker.rolling_summary(),
        }
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    /// Mark as removed from the manager; holders must re-resolve.
    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    fn to_summary(&self, updated_at: DateTime<Utc>) -> SessionSummary {
        let snapshot = self.tracker.snapshot();
        SessionSummary {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            summary_text: snapshot.summary_text,
            current_stage: snapshot.current_stage,
            emotion_trend: snapshot.emotion_trend,
            belief_trend: snapshot.belief_trend,
            emotion_digest: snapshot.emotion_digest,
            belief_shift: snapshot.belief_shift,
            turn_count: snapshot.turn_count,
            closed: self.closed,
            created_at: self.created_at,
            updated_at,
        }
    }
}

impl std::fmt::Debug for SessionMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMemory")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("stage", &self.tracker.current_stage())
            .field("closed", &self.closed)
            .field("unsaved_turns", &self.unsaved_turns)
            .finish()
    }
}
