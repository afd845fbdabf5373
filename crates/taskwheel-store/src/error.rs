use thiserror::Error;

/// Errors surfaced by the task store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A write payload failed validation (missing field, malformed cron
    /// expression, bad prerequisite reference).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced row does not exist.
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: i64 },

    /// A uniqueness rule was violated (duplicate task name).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Underlying SQLite / rusqlite failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem failure while opening the backing store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Short machine-readable code, used by the HTTP layer for status mapping.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Validation(_) => "VALIDATION_FAILED",
            StoreError::NotFound { .. } => "NOT_FOUND",
            StoreError::Conflict(_) => "CONFLICT",
            StoreError::Database(_) | StoreError::Io(_) => "PERSISTENT",
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
