//! Integration tests for the SQLite session store
//!
//! Most tests use an in-memory database; pool and restart behaviour use a
//! file-backed database in a temporary directory.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;

use socratic_memory::config::DatabaseConfig;
use socratic_memory::memory::{BeliefShift, Stage};
use socratic_memory::storage::{SessionSummary, SqliteStore, SummaryStore, TrendPoint};
use socratic_memory::StoreError;

/// Create an in-memory storage instance for testing
async fn create_test_store() -> SqliteStore {
    SqliteStore::new_in_memory()
        .await
        .expect("Failed to create in-memory store")
}

fn file_config(dir: &tempfile::TempDir, max_connections: u32) -> DatabaseConfig {
    DatabaseConfig {
        path: dir.path().join("memory.db"),
        max_connections,
        acquire_timeout_ms: 5000,
    }
}

fn sample_summary(session_id: &str, user_id: &str) -> SessionSummary {
    let now = Utc::now();
    let mut summary = SessionSummary::new(session_id, user_id);
    summary.summary_text = "#1 [evidence] doubt | but what if I fail".to_string();
    summary.current_stage = Stage::Evidence;
    summary.emotion_trend = vec![
        TrendPoint::new("joy", now - ChronoDuration::seconds(10)),
        TrendPoint::new("doubt", now),
    ];
    summary.belief_trend = vec![
        TrendPoint::new("I can handle this", now - ChronoDuration::seconds(10)),
        TrendPoint::new("but what if I fail", now),
    ];
    summary.emotion_digest = "positive:1 neutral:0 negative:1".to_string();
    summary.belief_shift = BeliefShift::PersistentIrrational;
    summary.turn_count = 2;
    summary
}

#[cfg(test)]
mod crud_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_get_nonexistent_summary() {
        let store = create_test_store().await;

        let result = store.get_summary("nonexistent-id").await.unwrap();

        assert!(result.is_none(), "Should return None for unknown session");
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = create_test_store().await;
        let summary = sample_summary("s1", "u1");

        store.upsert_summary(&summary).await.unwrap();

        let retrieved = store.get_summary("s1").await.unwrap().unwrap();
        assert_eq!(retrieved.session_id, "s1");
        assert_eq!(retrieved.user_id, "u1");
        assert_eq!(retrieved.current_stage, Stage::Evidence);
        assert_eq!(retrieved.emotion_trend, summary.emotion_trend);
        assert_eq!(retrieved.belief_trend, summary.belief_trend);
        assert_eq!(retrieved.belief_shift, BeliefShift::PersistentIrrational);
        assert_eq!(retrieved.turn_count, 2);
        assert!(!retrieved.closed);
    }

    #[tokio::test]
    async fn test_upsert_updates_in_place() {
        let store = create_test_store().await;
        let mut summary = sample_summary("s1", "u1");
        store.upsert_summary(&summary).await.unwrap();

        summary.current_stage = Stage::Reframe;
        summary.turn_count = 3;
        summary.summary_text.push_str("\n#3 [reframe] hope | maybe");
        summary.updated_at = summary.updated_at + ChronoDuration::seconds(1);
        store.upsert_summary(&summary).await.unwrap();

        let sessions = store.list_sessions_for_user("u1").await.unwrap();
        assert_eq!(sessions.len(), 1, "Upsert must not create a second row");
        assert_eq!(sessions[0].current_stage, Stage::Reframe);
        assert_eq!(sessions[0].turn_count, 3);
    }

    #[tokio::test]
    async fn test_created_at_survives_updates() {
        let store = create_test_store().await;
        let mut summary = sample_summary("s1", "u1");
        store.upsert_summary(&summary).await.unwrap();
        let created = store.get_summary("s1").await.unwrap().unwrap().created_at;

        summary.created_at = Utc::now() + ChronoDuration::days(1);
        summary.updated_at = summary.updated_at + ChronoDuration::seconds(1);
        store.upsert_summary(&summary).await.unwrap();

        let row = store.get_summary("s1").await.unwrap().unwrap();
        assert_eq!(row.created_at, created);
    }

    #[tokio::test]
    async fn test_stale_write_is_ignored() {
        let store = create_test_store().await;
        let newer = sample_summary("s1", "u1");
        store.upsert_summary(&newer).await.unwrap();

        let mut older = newer.clone();
        older.current_stage = Stage::Clarification;
        older.updated_at = newer.updated_at - ChronoDuration::seconds(30);
        store.upsert_summary(&older).await.unwrap();

        let row = store.get_summary("s1").await.unwrap().unwrap();
        assert_eq!(row.current_stage, Stage::Evidence);
    }

    #[tokio::test]
    async fn test_closed_never_reverts() {
        let store = create_test_store().await;
        let mut summary = sample_summary("s1", "u1");
        summary.current_stage = Stage::Closure;
        summary.closed = true;
        store.upsert_summary(&summary).await.unwrap();

        summary.current_stage = Stage::Evidence;
        summary.closed = false;
        summary.updated_at = summary.updated_at + ChronoDuration::seconds(1);
        store.upsert_summary(&summary).await.unwrap();

        let row = store.get_summary("s1").await.unwrap().unwrap();
        assert_eq!(row.current_stage, Stage::Evidence);
        assert!(row.closed, "closed is terminal");
    }

    #[tokio::test]
    async fn test_foreign_owner_is_rejected() {
        let store = create_test_store().await;
        store.upsert_summary(&sample_summary("s1", "u1")).await.unwrap();

        let mut hijack = sample_summary("s1", "u2");
        hijack.updated_at = hijack.updated_at + ChronoDuration::seconds(1);
        let err = store.upsert_summary(&hijack).await.unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation { .. }));

        let row = store.get_summary("s1").await.unwrap().unwrap();
        assert_eq!(row.user_id, "u1");
    }

    #[tokio::test]
    async fn test_malformed_session_id_is_constraint_violation() {
        let store = create_test_store().await;

        let err = store.upsert_summary(&sample_summary("", "u1")).await.unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation { .. }));
        assert!(!err.is_retryable());

        let long_id = "x".repeat(200);
        let err = store
            .upsert_summary(&sample_summary(&long_id, "u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation { .. }));
    }

    #[tokio::test]
    async fn test_list_sessions_ordered_newest_first() {
        let store = create_test_store().await;
        let base = Utc::now();

        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            let mut summary = sample_summary(id, "u1");
            summary.updated_at = base + ChronoDuration::seconds(i as i64);
            store.upsert_summary(&summary).await.unwrap();
        }
        store.upsert_summary(&sample_summary("other", "u2")).await.unwrap();

        let sessions = store.list_sessions_for_user("u1").await.unwrap();
        let ids: Vec<&str> = sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        assert!(store.list_sessions_for_user("nobody").await.unwrap().is_empty());
    }
}

#[cfg(test)]
mod schema_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_init_schema_is_idempotent() {
        let store = create_test_store().await;
        store.init_schema().await.unwrap();
        store.init_schema().await.unwrap();

        store.upsert_summary(&sample_summary("s1", "u1")).await.unwrap();
        store.init_schema().await.unwrap();
        assert!(store.get_summary("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reopen_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(&dir, 2);

        let store = SqliteStore::new(&config).await.unwrap();
        store.upsert_summary(&sample_summary("s1", "u1")).await.unwrap();
        store.close().await;

        let reopened = SqliteStore::new(&config).await.unwrap();
        let row = reopened.get_summary("s1").await.unwrap().unwrap();
        assert_eq!(row.turn_count, 2);
        reopened.close().await;
    }

    #[tokio::test]
    async fn test_operations_after_close_fail_as_connection_lost() {
        let store = create_test_store().await;
        store.close().await;

        let err = store.get_summary("s1").await.unwrap_err();
        assert!(matches!(err, StoreError::ConnectionLost { .. }));
        assert!(err.is_retryable());
    }
}

#[cfg(test)]
mod pool_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let store = SqliteStore::new_in_memory_with_timeout(Duration::from_millis(100))
            .await
            .unwrap();

        let held = store.pool().acquire().await.unwrap();
        let err = store.get_summary("s1").await.unwrap_err();
        assert!(matches!(err, StoreError::PoolTimeout { waited_ms: 100 }));
        assert!(err.is_retryable());

        drop(held);
        assert!(store.get_summary("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exhausted_pool_blocks_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(&file_config(&dir, 1)).await.unwrap());

        let held = store.pool().acquire().await.unwrap();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move { store.upsert_summary(&sample_summary("s1", "u1")).await })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!writer.is_finished(), "upsert should wait for the connection");

        drop(held);
        writer.await.unwrap().unwrap();
        assert!(store.get_summary("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_upserts_share_single_connection() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(&file_config(&dir, 1)).await.unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .upsert_summary(&sample_summary(&format!("s{}", i), "u1"))
                        .await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.list_sessions_for_user("u1").await.unwrap().len(), 8);
    }
}
