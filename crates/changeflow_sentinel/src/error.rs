//! Error types for background scheduling.

use changeflow_db::DbError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Store error: {0}")]
    Store(#[from] DbError),

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("Plan check failed: {0}")]
    Check(String),

    #[error("Plan check canceled")]
    Canceled,

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchedulerError {
    pub fn check(msg: impl Into<String>) -> Self {
        Self::Check(msg.into())
    }
}
