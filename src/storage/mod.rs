//! Storage layer for session summary persistence.
//!
//! One row per counseling session, keyed by session id and written as a
//! full-row upsert. [`SqliteStore`] is the SQLite-backed implementation
//! behind a bounded connection pool.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{StoreError, StoreResult};
use crate::memory::{BeliefShift, Stage};

/// Longest accepted session id, in characters.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// A single timestamped observation in an emotion or belief trend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendPoint {
    /// The emotion or belief label.
    pub value: String,
    /// When the turn carrying it was recorded.
    pub at: DateTime<Utc>,
}

impl TrendPoint {
    pub fn new(value: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            at,
        }
    }
}

/// The persisted state of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Unique session identifier.
    pub session_id: String,
    /// Owner of the session.
    pub user_id: String,
    /// Rolling condensation of the conversation so far.
    pub summary_text: String,
    /// Most recently reported stage.
    pub current_stage: Stage,
    /// Emotions in the order they were observed.
    pub emotion_trend: Vec<TrendPoint>,
    /// Beliefs in the order they were observed.
    pub belief_trend: Vec<TrendPoint>,
    /// Polarity tally of the emotion trend, for browsing.
    pub emotion_digest: String,
    /// Direction of the belief trend, for browsing.
    pub belief_shift: BeliefShift,
    /// Total turns recorded across all loads of the session.
    pub turn_count: u64,
    /// Whether the session has reached closure. Never reverts.
    pub closed: bool,
    /// When the row was first inserted.
    pub created_at: DateTime<Utc>,
    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

impl SessionSummary {
    /// Create an empty summary for a new session.
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            summary_text: String::new(),
            current_stage: Stage::default(),
            emotion_trend: Vec::new(),
            belief_trend: Vec::new(),
            emotion_digest: String::new(),
            belief_shift: BeliefShift::default(),
            turn_count: 0,
            closed: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Emotion labels in observation order.
    pub fn emotions(&self) -> Vec<&str> {
        self.emotion_trend.iter().map(|p| p.value.as_str()).collect()
    }

    /// Belief labels in observation order.
    pub fn beliefs(&self) -> Vec<&str> {
        self.belief_trend.iter().map(|p| p.value.as_str()).collect()
    }
}

/// Build a `ConstraintViolation` raised before reaching the database,
/// logged as a defect the same way database-side violations are.
pub(crate) fn constraint_violation(message: impl Into<String>) -> StoreError {
    let message = message.into();
    error!(error = %message, "Session store constraint violated");
    StoreError::ConstraintViolation { message }
}

/// Reject session ids the schema would refuse, before touching the database.
pub fn validate_session_id(session_id: &str) -> StoreResult<()> {
    if session_id.trim().is_empty() {
        return Err(constraint_violation("session id must not be empty"));
    }
    if session_id.chars().count() > MAX_SESSION_ID_LEN {
        return Err(constraint_violation(format!(
            "session id longer than {} characters",
            MAX_SESSION_ID_LEN
        )));
    }
    if session_id.chars().any(char::is_control) {
        return Err(constraint_violation("session id contains control characters"));
    }
    Ok(())
}

/// Reject empty user ids.
pub fn validate_user_id(user_id: &str) -> StoreResult<()> {
    if user_id.trim().is_empty() {
        return Err(constraint_violation("user id must not be empty"));
    }
    Ok(())
}

/// Fixed-width UTC timestamp so stored values order lexicographically.
pub(crate) fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            message: format!("invalid timestamp '{}': {}", value, e),
        })
}

/// Durable CRUD over session summaries.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// Insert the row if absent, otherwise replace every mutable field.
    ///
    /// A write carrying an `updated_at` older than the stored row is ignored.
    async fn upsert_summary(&self, summary: &SessionSummary) -> StoreResult<()>;
    /// Get a session summary by ID. Absent rows are `Ok(None)`.
    async fn get_summary(&self, session_id: &str) -> StoreResult<Option<SessionSummary>>;
    /// All sessions of a user, most recently updated first.
    async fn list_sessions_for_user(&self, user_id: &str) -> StoreResult<Vec<SessionSummary>>;
    /// Release every pooled connection.
    async fn close(&self);
}
