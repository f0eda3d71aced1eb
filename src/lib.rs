//! # Socratic Memory
//!
//! Conversation memory and session persistence for a multi-turn counseling
//! assistant that walks a user through five fixed stages (clarification,
//! evidence, reframe, consequence, closure).
//!
//! Each model turn arrives as an already-extracted [`memory::TurnSignal`]
//! (emotion, belief, stage, text). The engine tracks stage progression and
//! the emotion and belief trends, keeps a bounded rolling summary, detects
//! the first move into closure, and writes one row per session to SQLite
//! through a bounded connection pool.
//!
//! ## Architecture
//!
//! ```text
//! Chat orchestrator → MemoryManager → SessionMemory → TrendTracker
//!                           ↓
//!                     SQLite (sqlx pool)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use socratic_memory::{Config, MemoryManager};
//! use socratic_memory::memory::{Stage, TurnSignal};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let manager = MemoryManager::init(&config).await?;
//!
//!     let signal = TurnSignal::new("hope", "maybe I'm overestimating risk", Stage::Closure);
//!     let outcome = manager.record_turn("s1", "u1", signal).await?;
//!     assert!(outcome.closure_triggered);
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

/// Command-line interface for the session store.
pub mod cli;
/// Configuration management.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Stage tracking, session memory and the session registry.
pub mod memory;
/// SQLite storage layer for session summaries.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult, StoreError, StoreResult};
pub use memory::MemoryManager;
