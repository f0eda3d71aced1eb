//! Command-line interface for operating the session store.
//!
//! Provides schema setup, history browsing and a replay command that feeds
//! JSON-lines turn signals through the memory manager the way a chat
//! orchestrator would.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use uuid::Uuid;

use crate::config::Config;
use crate::memory::{MemoryManager, TurnSignal};
use crate::storage::{SessionSummary, SqliteStore, SummaryStore};

/// Socratic counseling session memory.
#[derive(Parser, Debug)]
#[command(name = "socratic-memory", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Create the session table if it does not exist
    Init,

    /// Show one stored session summary
    Show {
        /// Session identifier
        session_id: String,
    },

    /// List a user's sessions, newest first
    History {
        /// User identifier
        user_id: String,
    },

    /// Record JSON-lines turn signals into a session
    Replay {
        /// Session identifier; a new one is generated when omitted
        #[arg(long)]
        session: Option<String>,

        /// User identifier
        #[arg(long)]
        user: String,

        /// Read signals from this file instead of stdin
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

/// Result of CLI command execution.
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    /// Create a success result with the given message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    /// Create an error result with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

/// Execute a CLI command.
pub async fn execute_command(command: Commands, config: &Config) -> CliResult {
    match command {
        Commands::Init => execute_init(config).await,
        Commands::Show { session_id } => execute_show(config, &session_id).await,
        Commands::History { user_id } => execute_history(config, &user_id).await,
        Commands::Replay {
            session,
            user,
            file,
        } => {
            let session = session.unwrap_or_else(|| Uuid::new_v4().to_string());
            execute_replay(config, &session, &user, file).await
        }
    }
}

async fn execute_init(config: &Config) -> CliResult {
    match SqliteStore::new(&config.database).await {
        Ok(store) => {
            store.close().await;
            CliResult::success(format!(
                "Schema ready at {}",
                config.database.path.display()
            ))
        }
        Err(e) => CliResult::error(format!("Failed to initialize store: {}", e)),
    }
}

async fn execute_show(config: &Config, session_id: &str) -> CliResult {
    let store = match SqliteStore::new(&config.database).await {
        Ok(s) => s,
        Err(e) => return CliResult::error(format!("Failed to open store: {}", e)),
    };

    let result = match store.get_summary(session_id).await {
        Ok(Some(summary)) => CliResult::success(format_summary(&summary)),
        Ok(None) => CliResult::error(format!("No session '{}'", session_id)),
        Err(e) => CliResult::error(format!("Failed to read session: {}", e)),
    };
    store.close().await;
    result
}

async fn execute_history(config: &Config, user_id: &str) -> CliResult {
    let store = match SqliteStore::new(&config.database).await {
        Ok(s) => s,
        Err(e) => return CliResult::error(format!("Failed to open store: {}", e)),
    };

    let result = match store.list_sessions_for_user(user_id).await {
        Ok(sessions) if sessions.is_empty() => {
            CliResult::success(format!("No sessions for user '{}'", user_id))
        }
        Ok(sessions) => {
            let mut output = format!("Sessions for {} ({}):\n", user_id, sessions.len());
            for s in &sessions {
                output.push_str(&format!(
                    "  {}  {:<13} {:>3} turns  {}  {}\n",
                    s.updated_at.format("%Y-%m-%d %H:%M"),
                    s.current_stage,
                    s.turn_count,
                    if s.closed { "closed" } else { "open  " },
                    s.session_id
                ));
            }
            CliResult::success(output)
        }
        Err(e) => CliResult::error(format!("Failed to list sessions: {}", e)),
    };
    store.close().await;
    result
}

async fn execute_replay(
    config: &Config,
    session_id: &str,
    user_id: &str,
    file: Option<PathBuf>,
) -> CliResult {
    let source: Box<dyn AsyncRead + Unpin + Send> = match file {
        Some(path) => match tokio::fs::File::open(&path).await {
            Ok(f) => Box::new(f),
            Err(e) => {
                return CliResult::error(format!("Cannot open {}: {}", path.display(), e))
            }
        },
        None => Box::new(tokio::io::stdin()),
    };

    let manager = match MemoryManager::init(config).await {
        Ok(m) => m,
        Err(e) => return CliResult::error(format!("Failed to initialize memory: {}", e)),
    };

    let mut output = format!("session {}\n", session_id);
    let mut failed = replay_signals(
        &manager,
        session_id,
        user_id,
        BufReader::new(source),
        &mut output,
    )
    .await;

    let report = manager.shutdown().await;
    for (id, e) in &report.failures {
        output.push_str(&format!("final save of {} failed: {}\n", id, e));
        failed = true;
    }

    if failed {
        CliResult::error(output)
    } else {
        CliResult::success(output)
    }
}

/// Feed JSON-lines turn signals to the manager, one outcome line each.
///
/// Returns true when any line could not be read, parsed or recorded.
async fn replay_signals<R>(
    manager: &MemoryManager,
    session_id: &str,
    user_id: &str,
    reader: R,
    output: &mut String,
) -> bool
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0;
    let mut failed = false;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                output.push_str(&format!("read error: {}\n", e));
                failed = true;
                break;
            }
        };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let signal: TurnSignal = match serde_json::from_str(&line) {
            Ok(s) => s,
            Err(e) => {
                output.push_str(&format!("line {}: invalid signal: {}\n", line_no, e));
                failed = true;
                continue;
            }
        };

        match manager.record_turn(session_id, user_id, signal).await {
            Ok(outcome) => {
                output.push_str(&format!(
                    "line {}: stage={}{}{}\n",
                    line_no,
                    outcome.stage,
                    if outcome.saved { " saved" } else { "" },
                    if outcome.closure_triggered {
                        " closure reached"
                    } else {
                        ""
                    }
                ));
            }
            Err(e) => {
                output.push_str(&format!("line {}: {}\n", line_no, e));
                failed = true;
            }
        }
    }

    failed
}

fn format_summary(s: &SessionSummary) -> String {
    let emotions = s.emotions().join(" -> ");
    format!(
        "Session:  {}\nUser:     {}\nStage:    {}\nClosed:   {}\nTurns:    {}\nEmotions: {}\nDigest:   {}\nBeliefs:  {}\nUpdated:  {}\n\n{}\n",
        s.session_id,
        s.user_id,
        s.current_stage,
        s.closed,
        s.turn_count,
        emotions,
        s.emotion_digest,
        s.belief_shift,
        s.updated_at.to_rfc3339(),
        s.summary_text
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_replay() {
        let cli = Cli::try_parse_from([
            "socratic-memory",
            "replay",
            "--session",
            "s1",
            "--user",
            "u1",
        ])
        .unwrap();
        match cli.command {
            Commands::Replay {
                session,
                user,
                file,
            } => {
                assert_eq!(session.as_deref(), Some("s1"));
                assert_eq!(user, "u1");
                assert!(file.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_replay_without_session() {
        let cli = Cli::try_parse_from(["socratic-memory", "replay", "--user", "u1"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Replay { session: None, .. }
        ));
    }

    #[test]
    fn test_format_summary() {
        let mut summary = SessionSummary::new("s1", "u1");
        summary.summary_text = "talked about exams".to_string();
        let text = format_summary(&summary);
        assert!(text.contains("Session:  s1"));
        assert!(text.contains("Stage:    clarification"));
        assert!(text.ends_with("talked about exams\n"));
    }

    #[tokio::test]
    async fn test_replay_signals_from_reader() {
        use crate::config::MemoryConfig;
        use std::sync::Arc;

        let store = Arc::new(SqliteStore::new_in_memory().await.unwrap());
        let manager = MemoryManager::new(store.clone(), MemoryConfig::default());
        let input = concat!(
            r#"{"emotion":"joy","belief":"I can handle this","stage":"clarification"}"#,
            "\n",
            "\n",
            "not json\n",
            r#"{"emotion":"hope","belief":"maybe","stage":"closure"}"#,
            "\n",
        );

        let mut output = String::new();
        let failed = replay_signals(&manager, "s1", "u1", input.as_bytes(), &mut output).await;

        assert!(failed);
        assert!(output.contains("line 1: stage=clarification\n"));
        assert!(output.contains("line 3: invalid signal"));
        assert!(output.contains("line 4: stage=closure saved closure reached"));

        let row = store.get_summary("s1").await.unwrap().unwrap();
        assert_eq!(row.turn_count, 2);
        assert!(row.closed);
    }

    #[test]
    fn test_cli_result() {
        assert_eq!(CliResult::success("ok").exit_code, 0);
        assert_eq!(CliResult::error("no").exit_code, 1);
    }
}
