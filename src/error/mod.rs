use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Session store errors.
///
/// `ConnectionLost` and `PoolTimeout` are transient and safe to retry with
/// backoff. Everything else points at a modeling defect.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("Timed out after {waited_ms}ms waiting for a pooled connection")]
    PoolTimeout { waited_ms: u64 },

    #[error("Constraint violation: {message}")]
    ConstraintViolation { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Corrupt session row: {message}")]
    Corrupt { message: String },
}

impl StoreError {
    /// Whether the caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionLost { .. } | StoreError::PoolTimeout { .. }
        )
    }

    /// Classify a raw sqlx error.
    ///
    /// `waited_ms` is the configured acquire timeout, reported when the pool
    /// gave up waiting for a free connection.
    pub fn from_sqlx(err: sqlx::Error, waited_ms: u64) -> Self {
        use sqlx::error::ErrorKind;

        match err {
            sqlx::Error::PoolTimedOut => StoreError::PoolTimeout { waited_ms },
            sqlx::Error::Database(db_err) => match db_err.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => StoreError::ConstraintViolation {
                    message: db_err.message().to_string(),
                },
                // SQLITE_BUSY and friends
                _ => StoreError::ConnectionLost {
                    message: db_err.message().to_string(),
                },
            },
            sqlx::Error::Io(e) => StoreError::ConnectionLost {
                message: e.to_string(),
            },
            sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => StoreError::ConnectionLost {
                message: err.to_string(),
            },
            sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => StoreError::ConnectionLost {
                message: err.to_string(),
            },
            other => StoreError::Corrupt {
                message: other.to_string(),
            },
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
