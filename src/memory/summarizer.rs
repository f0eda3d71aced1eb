//! Asynchronous summarisation of session transcripts.
//!
//! A [`Summarizer`] may call out to a language model, so it never runs under
//! a session lock. [`SummaryDispatcher`] takes a transcript, runs the
//! summariser on a spawned task bounded by a semaphore, and feeds the result
//! back through [`MemoryManager::absorb_summary`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::manager::MemoryManager;
use crate::error::AppResult;

/// Condenses a transcript into a short summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str) -> AppResult<String>;
}

/// Runs summariser calls with bounded concurrency.
#[derive(Clone)]
pub struct SummaryDispatcher {
    summarizer: Arc<dyn Summarizer>,
    permits: Arc<Semaphore>,
}

impl SummaryDispatcher {
    pub fn new(summarizer: Arc<dyn Summarizer>, max_concurrency: usize) -> Self {
        Self {
            summarizer,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Summariser calls that could start right now.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Summarise the session's current transcript in the background.
    ///
    /// Returns `None` when the session is not active. The task resolves to
    /// whether the summary was applied.
    pub async fn dispatch(
        &self,
        manager: Arc<MemoryManager>,
        session_id: &str,
    ) -> Option<JoinHandle<bool>> {
        let (transcript, through_turn) = manager.transcript(session_id).await?;
        if transcript.is_empty() {
            return None;
        }

        let summarizer = self.summarizer.clone();
        let permits = self.permits.clone();
        let session_id = session_id.to_string();

        Some(tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return false;
            };

            match summarizer.summarize(&transcript).await {
                Ok(text) => {
                    let applied = manager
                        .absorb_summary(&session_id, text, through_turn)
                        .await;
                    debug!(
                        session_id = %session_id,
                        through_turn,
                        applied,
                        "Summary absorbed"
                    );
                    applied
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Summarization failed");
                    false
                }
            }
        }))
    }
}
