//! Conversation memory: per-session trend tracking, persistence and the
//! process-wide session registry.
//!
//! ```text
//! orchestrator → MemoryManager → SessionMemory → TrendTracker
//!                      │               │
//!                      └──── SummaryStore (SQLite pool)
//! ```

mod manager;
mod session;
mod stage;
mod summarizer;
mod trend;

pub use manager::{EvictedSession, MemoryManager, SharedSession, ShutdownReport, TurnOutcome};
pub use session::{SessionInfo, SessionMemory};
pub use stage::{BeliefShift, EmotionTally, Polarity, Stage, TurnSignal};
pub use summarizer::{Summarizer, SummaryDispatcher};
pub use trend::{TrendSnapshot, TrendTracker};
