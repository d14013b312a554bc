//! Error types for the store.

use changeflow_protocol::ApiError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Unique or foreign key violation.
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// A conditional update matched no row because the row changed.
    #[error("Concurrent update: {0}")]
    Conflict(String),

    /// The row is not in the state the operation requires.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A persisted value failed to decode.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::Constraint(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn invalid_data(msg: impl Into<String>) -> Self {
        Self::InvalidData(msg.into())
    }

    /// Maps unique-constraint failures from SQLite to `Constraint`.
    pub(crate) fn from_insert(err: sqlx::Error, what: &str) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return Self::Constraint(format!("{} already exists", what));
            }
        }
        Self::Sqlx(err)
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => ApiError::not_found(msg),
            DbError::Constraint(msg) => ApiError::already_exists(msg),
            DbError::Conflict(msg) => ApiError::aborted(msg),
            DbError::InvalidState(msg) => ApiError::failed_precondition(msg),
            other => ApiError::internal(other.to_string()),
        }
    }
}
