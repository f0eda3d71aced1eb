use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{
    format_timestamp, parse_timestamp, validate_session_id, validate_user_id, SessionSummary,
    SummaryStore, TrendPoint,
};
use crate::config::DatabaseConfig;
use crate::error::{StoreError, StoreResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed session store with a bounded connection pool.
///
/// Every operation holds exactly one pooled connection for its duration;
/// the connection goes back to the pool when the guard drops, including on
/// error paths. Callers beyond `max_connections` wait up to the acquire
/// timeout and then fail with [`StoreError::PoolTimeout`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    acquire_timeout_ms: u64,
}

impl SqliteStore {
    /// Open (creating if missing) the database file and initialise the schema.
    pub async fn new(config: &DatabaseConfig) -> StoreResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::ConnectionLost {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StoreError::ConnectionLost {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionLost {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let store = Self {
            pool,
            acquire_timeout_ms: config.acquire_timeout_ms,
        };
        store.init_schema().await?;

        info!(
            path = %config.path.display(),
            max_connections = config.max_connections,
            "Session store initialized"
        );
        Ok(store)
    }

    /// In-memory store for tests, with the default five second acquire timeout.
    pub async fn new_in_memory() -> StoreResult<Self> {
        Self::new_in_memory_with_timeout(Duration::from_secs(5)).await
    }

    /// In-memory store backed by a single connection.
    ///
    /// Each SQLite in-memory connection is its own database, so the pool is
    /// pinned to one connection that is never recycled.
    pub async fn new_in_memory_with_timeout(acquire_timeout: Duration) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
            StoreError::ConnectionLost {
                message: format!("Invalid database URL: {}", e),
            }
        })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionLost {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let store = Self {
            pool,
            acquire_timeout_ms: acquire_timeout.as_millis() as u64,
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create the summary table if absent. Safe to call repeatedly.
    pub async fn init_schema(&self) -> StoreResult<()> {
        debug!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StoreError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        debug!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Scoped acquisition of one pooled connection.
    async fn acquire(&self) -> StoreResult<PoolConnection<Sqlite>> {
        self.pool.acquire().await.map_err(|e| self.classify(e))
    }

    fn classify(&self, err: sqlx::Error) -> StoreError {
        let err = StoreError::from_sqlx(err, self.acquire_timeout_ms);
        if let StoreError::ConstraintViolation { message } = &err {
            error!(error = %message, "Session store constraint violated");
        }
        err
    }
}

#[async_trait]
impl SummaryStore for SqliteStore {
    async fn upsert_summary(&self, summary: &SessionSummary) -> StoreResult<()> {
        validate_session_id(&summary.session_id)?;
        validate_user_id(&summary.user_id)?;

        let emotion_trend = encode_trend(&summary.emotion_trend)?;
        let belief_trend = encode_trend(&summary.belief_trend)?;
        let updated_at = format_timestamp(&summary.updated_at);

        let mut conn = self.acquire().await?;

        // Existing rows are only overwritten by a write that is not older and
        // comes from the same owner; `closed` is sticky.
        let result = sqlx::query(
            r#"
            INSERT INTO session_summaries (
                session_id, user_id, summary_text, current_stage,
                emotion_trend, belief_trend, emotion_digest, belief_shift,
                turn_count, closed, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                summary_text = excluded.summary_text,
                current_stage = excluded.current_stage,
                emotion_trend = excluded.emotion_trend,
                belief_trend = excluded.belief_trend,
                emotion_digest = excluded.emotion_digest,
                belief_shift = excluded.belief_shift,
                turn_count = excluded.turn_count,
                closed = MAX(session_summaries.closed, excluded.closed),
                updated_at = excluded.updated_at
            WHERE excluded.updated_at >= session_summaries.updated_at
              AND excluded.user_id = session_summaries.user_id
            "#,
        )
        .bind(&summary.session_id)
        .bind(&summary.user_id)
        .bind(&summary.summary_text)
        .bind(summary.current_stage.as_str())
        .bind(&emotion_trend)
        .bind(&belief_trend)
        .bind(&summary.emotion_digest)
        .bind(summary.belief_shift.as_str())
        .bind(summary.turn_count as i64)
        .bind(summary.closed)
        .bind(format_timestamp(&summary.created_at))
        .bind(&updated_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| self.classify(e))?;

        if result.rows_affected() > 0 {
            debug!(
                session_id = %summary.session_id,
                stage = %summary.current_stage,
                closed = summary.closed,
                "Session summary upserted"
            );
            return Ok(());
        }

        // Nothing written: either a foreign owner or a stale snapshot.
        let existing: Option<(String, String)> = sqlx::query_as(
            "SELECT user_id, updated_at FROM session_summaries WHERE session_id = ?",
        )
        .bind(&summary.session_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| self.classify(e))?;

        match existing {
            Some((owner, _)) if owner != summary.user_id => {
                error!(
                    session_id = %summary.session_id,
                    "Upsert rejected: session belongs to another user"
                );
                Err(StoreError::ConstraintViolation {
                    message: format!(
                        "session {} belongs to another user",
                        summary.session_id
                    ),
                })
            }
            Some((_, stored_at)) => {
                warn!(
                    session_id = %summary.session_id,
                    stored_at = %stored_at,
                    incoming_at = %updated_at,
                    "Ignoring stale session snapshot"
                );
                Ok(())
            }
            None => Err(StoreError::ConnectionLost {
                message: format!("upsert of session {} was not applied", summary.session_id),
            }),
        }
    }

    async fn get_summary(&self, session_id: &str) -> StoreResult<Option<SessionSummary>> {
        let mut conn = self.acquire().await?;

        let row: Option<SummaryRow> = sqlx::query_as(
            r#"
            SELECT session_id, user_id, summary_text, current_stage,
                   emotion_trend, belief_trend, emotion_digest, belief_shift,
                   turn_count, closed, created_at, updated_at
            FROM session_summaries
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| self.classify(e))?;

        row.map(SessionSummary::try_from).transpose()
    }

    async fn list_sessions_for_user(&self, user_id: &str) -> StoreResult<Vec<SessionSummary>> {
        let mut conn = self.acquire().await?;

        let rows: Vec<SummaryRow> = sqlx::query_as(
            r#"
            SELECT session_id, user_id, summary_text, current_stage,
                   emotion_trend, belief_trend, emotion_digest, belief_shift,
                   turn_count, closed, created_at, updated_at
            FROM session_summaries
            WHERE user_id = ?
            ORDER BY updated_at DESC, session_id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| self.classify(e))?;

        rows.into_iter().map(SessionSummary::try_from).collect()
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Session store connection pool closed");
    }
}

fn encode_trend(trend: &[TrendPoint]) -> StoreResult<String> {
    serde_json::to_string(trend).map_err(|e| StoreError::Corrupt {
        message: format!("Failed to serialize trend: {}", e),
    })
}

fn decode_trend(session_id: &str, raw: &str) -> StoreResult<Vec<TrendPoint>> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        message: format!("invalid trend for session {}: {}", session_id, e),
    })
}

// Internal row type for SQLx mapping
#[derive(sqlx::FromRow)]
struct SummaryRow {
    session_id: String,
    user_id: String,
    summary_text: String,
    current_stage: String,
    emotion_trend: String,
    belief_trend: String,
    emotion_digest: String,
    belief_shift: String,
    turn_count: i64,
    closed: bool,
    created_at: String,
    updated_at: String,
}

impl TryFrom<SummaryRow> for SessionSummary {
    type Error = StoreError;

    fn try_from(row: SummaryRow) -> Result<Self, Self::Error> {
        let corrupt = |message: String| StoreError::Corrupt { message };

        Ok(Self {
            current_stage: row.current_stage.parse().map_err(corrupt)?,
            belief_shift: row.belief_shift.parse().map_err(corrupt)?,
            emotion_trend: decode_trend(&row.session_id, &row.emotion_trend)?,
            belief_trend: decode_trend(&row.session_id, &row.belief_trend)?,
            turn_count: row.turn_count.max(0) as u64,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            session_id: row.session_id,
            user_id: row.user_id,
            summary_text: row.summary_text,
            emotion_digest: row.emotion_digest,
            closed: row.closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(current_stage: &str, emotion_trend: &str) -> SummaryRow {
        SummaryRow {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            summary_text: String::new(),
            current_stage: current_stage.to_string(),
            emotion_trend: emotion_trend.to_string(),
            belief_trend: "[]".to_string(),
            emotion_digest: String::new(),
            belief_shift: "unclassified".to_string(),
            turn_count: 0,
            closed: false,
            created_at: "2025-01-01T00:00:00.000000Z".to_string(),
            updated_at: "2025-01-01T00:00:00.000000Z".to_string(),
        }
    }

    #[test]
    fn test_decode_valid_row() {
        let summary = SessionSummary::try_from(row("evidence", "[]")).unwrap();
        assert_eq!(summary.current_stage.as_str(), "evidence");
        assert!(summary.emotion_trend.is_empty());
    }

    #[test]
    fn test_decode_unknown_stage_is_corrupt() {
        let err = SessionSummary::try_from(row("denial", "[]")).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_decode_bad_trend_is_corrupt() {
        let err = SessionSummary::try_from(row("closure", "not json")).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(!err.is_retryable());
    }
}
