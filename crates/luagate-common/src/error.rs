use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("Invalid script name: {0}")]
    InvalidName(String),

    #[error("Script not found: {0}")]
    NotFound(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Script error: {0}")]
    ScriptFault(String),

    #[error("Script execution timed out after {0}ms")]
    Timeout(u64),

    #[error("Too many requests, retry after {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    #[error("Host call failed: {0}")]
    HostCallFailure(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already completed: {0}")]
    JobAlreadyCompleted(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GateError {
    /// Classifies the error for wire reporting.
    pub fn kind(&self) -> FailureKind {
        match self {
            GateError::InvalidName(_) => FailureKind::InvalidName,
            GateError::NotFound(_) => FailureKind::NotFound,
            GateError::InvalidPayload(_) => FailureKind::InvalidPayload,
            GateError::ScriptFault(_) => FailureKind::ScriptFault,
            GateError::Timeout(_) => FailureKind::Timeout,
            GateError::RateLimited { .. } => FailureKind::RateLimited,
            GateError::HostCallFailure(_) => FailureKind::HostCallFailure,
            GateError::JobNotFound(_) => FailureKind::JobNotFound,
            GateError::JobAlreadyCompleted(_)
            | GateError::Transport(_)
            | GateError::JsonSerialization(_)
            | GateError::Io(_) => FailureKind::Internal,
        }
    }

    /// Converts the error into the `{kind, message}` pair recorded on results.
    pub fn to_failure(&self) -> Failure {
        Failure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Wire-level classification of a failed execution or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidName,
    NotFound,
    InvalidPayload,
    ScriptFault,
    Timeout,
    RateLimited,
    HostCallFailure,
    JobNotFound,
    Internal,
}

/// A failure attached to an [`ExecutionResult`](crate::protocol::ExecutionResult).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, GateError>;
