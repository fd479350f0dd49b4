//! Error types for the batch engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Row '{0}' not found")]
    RowNotFound(String),

    #[error("Invalid qualifier pattern: {0}")]
    InvalidPattern(String),

    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Stable error code for summaries and exit reporting
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
            EngineError::ConnectionFailure(_) => "CONNECTION_FAILURE",
            EngineError::Store(_) => "STORE_ERROR",
            EngineError::TableNotFound(_) => "TABLE_NOT_FOUND",
            EngineError::RowNotFound(_) => "ROW_NOT_FOUND",
            EngineError::InvalidPattern(_) => "INVALID_PATTERN",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Fatal errors abort a run before (or instead of) any batch work.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidConfiguration(_) | EngineError::ConnectionFailure(_)
        )
    }

    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        EngineError::InvalidConfiguration(msg.into())
    }
}
