use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub memory: MemoryConfig,
}

/// Database and connection pool configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// Upper bound on concurrently open connections.
    pub max_connections: u32,
    /// How long a caller waits for a free connection before `PoolTimeout`.
    pub acquire_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// When a session is written to the store, beyond the mandatory save on closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavePolicy {
    /// Only the turn that first reaches closure saves.
    OnClosure,
    /// Every recorded turn saves.
    EveryTurn,
    /// Save once this many turns have accumulated since the last save.
    EveryNTurns(u32),
}

/// Session memory configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub save_policy: SavePolicy,
    /// Upper bound on the rolling summary length, in characters.
    pub summary_max_chars: usize,
    /// Number of recent turns returned as prompt context.
    pub context_window_turns: usize,
    /// Active sessions kept in process before LRU eviction kicks in.
    pub max_active_sessions: usize,
    pub idle_timeout_secs: u64,
    /// Maximum summariser calls in flight at once.
    pub summarizer_concurrency: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH")
                    .unwrap_or_else(|_| "./data/socratic_memory.db".to_string()),
            ),
            max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 5),
            acquire_timeout_ms: parse_var("DATABASE_ACQUIRE_TIMEOUT_MS", 5000),
        };

        if database.max_connections == 0 {
            return Err(AppError::Config {
                message: "DATABASE_MAX_CONNECTIONS must be at least 1".to_string(),
            });
        }

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let every_n: u32 = parse_var("SAVE_EVERY_N_TURNS", 5);
        let save_policy = match env::var("SAVE_POLICY")
            .unwrap_or_else(|_| "on_closure".to_string())
            .to_lowercase()
            .as_str()
        {
            "on_closure" | "closure" => SavePolicy::OnClosure,
            "every_turn" => SavePolicy::EveryTurn,
            "every_n_turns" => {
                if every_n == 0 {
                    return Err(AppError::Config {
                        message: "SAVE_EVERY_N_TURNS must be at least 1".to_string(),
                    });
                }
                SavePolicy::EveryNTurns(every_n)
            }
            other => {
                return Err(AppError::Config {
                    message: format!(
                        "Unknown SAVE_POLICY '{}' (expected on_closure, every_turn or every_n_turns)",
                        other
                    ),
                })
            }
        };

        let defaults = MemoryConfig::default();
        let memory = MemoryConfig {
            save_policy,
            summary_max_chars: parse_var("SUMMARY_MAX_CHARS", defaults.summary_max_chars),
            context_window_turns: parse_var("CONTEXT_WINDOW_TURNS", defaults.context_window_turns),
            max_active_sessions: parse_var("MAX_ACTIVE_SESSIONS", defaults.max_active_sessions),
            idle_timeout_secs: parse_var("SESSION_IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs),
            summarizer_concurrency: parse_var(
                "SUMMARIZER_MAX_CONCURRENCY",
                defaults.summarizer_concurrency,
            )
            .max(1),
        };

        Ok(Config {
            database,
            logging,
            memory,
        })
    }
}

/// Read and parse a variable, falling back to the default when missing or malformed.
fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl DatabaseConfig {
    /// Acquire timeout as a `Duration`.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl MemoryConfig {
    /// Idle timeout as a `Duration`.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/socratic_memory.db"),
            max_connections: 5,
            acquire_timeout_ms: 5000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            save_policy: SavePolicy::OnClosure,
            summary_max_chars: 2000,
            context_window_turns: 3,
            max_active_sessions: 1024,
            idle_timeout_secs: 1800,
            summarizer_concurrency: 2,
        }
    }
}
