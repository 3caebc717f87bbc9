use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::events::ErrorCode;
use crate::queue::JobState;

/// Errors surfaced by the download engine adapter.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("external tool is missing: {tool} ({path})")]
    ToolMissing { tool: String, path: PathBuf },

    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{message}")]
    Failed { code: ErrorCode, message: String },

    #[error("invalid engine JSON: {0}")]
    InvalidJson(String),

    #[error("Canceled by user")]
    Canceled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stable code for the UI, derived from the error kind.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::ToolMissing { .. } | EngineError::Spawn { .. } => ErrorCode::ToolMissing,
            EngineError::Failed { code, .. } => code.clone(),
            EngineError::Canceled => ErrorCode::Canceled,
            EngineError::InvalidJson(_) | EngineError::Io(_) => ErrorCode::Unknown,
        }
    }
}

/// Queue state machine violations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("job {0} not found")]
    UnknownJob(Uuid),

    #[error("no job matches '{0}'")]
    NoMatch(String),

    #[error("'{0}' matches more than one job")]
    AmbiguousPrefix(String),

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition { id: Uuid, from: JobState, to: JobState },

    #[error("job {0} is downloading; cancel it first")]
    Busy(Uuid),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("download engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("database error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    /// Transient store contention that the user can simply retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Persistence(rusqlite::Error::SqliteFailure(e, _))
                if matches!(e.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
