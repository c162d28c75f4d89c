//! Error taxonomy for the aggregation engine.
//!
//! Storage and task failures are transient; the scheduler retries any
//! failed attempt while its budget lasts. Invariant violations are fatal
//! for one entity only; the run records them and carries on. A systemic
//! failure aborts the whole timezone/date run.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("invariant violated for {entity}: {detail}")]
    InvariantViolation { entity: String, detail: String },

    #[error("systemic failure: {failed} of {total} entities failed")]
    Systemic { failed: usize, total: usize },

    #[error("aggregation for {timezone} {date} is already running")]
    LockHeld { timezone: String, date: String },

    #[error("cleanup refused for {timezone} {date}: latest run is {status}")]
    CleanupRefused {
        timezone: String,
        date: String,
        status: String,
    },

    #[error("raw snapshots for {timezone} {date} were already cleaned up; refusing to recompute")]
    RawDataCleaned { timezone: String, date: String },

    #[error("invalid run transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("malformed stored value: {0}")]
    Malformed(String),
}

impl EngineError {
    /// Whether the error is transient. Logged with every failed attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Storage(_)
                | EngineError::Io(_)
                | EngineError::Task(_)
                | EngineError::Systemic { .. }
        )
    }

    pub(crate) fn invariant(entity: impl Into<String>, detail: impl Into<String>) -> Self {
        EngineError::InvariantViolation {
            entity: entity.into(),
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
