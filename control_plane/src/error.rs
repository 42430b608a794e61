//! Error types for the control plane services.

use rule_engine::{RuleError, TargetId};
use thiserror::Error;

/// Failures acquiring or using a target's control connection.
///
/// `Clone` so that one failed in-flight open can be reported to every caller
/// waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Opening failed after every retry attempt.
    #[error("connection to {target} failed after {attempts} attempt(s): {reason}")]
    ConnectionFailed {
        target: TargetId,
        attempts: u32,
        reason: String,
    },

    /// The pool is full and every connection is in use.
    #[error("connection pool exhausted ({max_open} open, none idle) while connecting to {target}")]
    CapacityExhausted { target: TargetId, max_open: usize },

    /// The target was removed while work for it was pending.
    #[error("work for {0} was cancelled")]
    Cancelled(TargetId),

    /// The connection manager has been shut down.
    #[error("connection manager is closed")]
    Closed,
}

/// Failures of recording lifecycle operations.
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("recording \"{name}\" not found on {target}")]
    NotFound { target: TargetId, name: String },

    #[error("snapshot creation failed on {target}: {reason}")]
    SnapshotCreation { target: TargetId, reason: String },

    #[error("recording \"{name}\" already exists on {target}")]
    AlreadyExists { target: TargetId, name: String },

    #[error("template \"{template}\" not found on {target}")]
    UnknownTemplate { target: TargetId, template: String },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The target rejected an operation.
    #[error("target {target} rejected operation: {reason}")]
    Target { target: TargetId, reason: String },

    #[error("archive store error: {0}")]
    Archive(String),
}

impl RecordingError {
    /// True for the not-found variant, which callers usually treat as a value
    /// rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RecordingError::NotFound { .. })
    }
}

/// Failures of the rule automation engine.
#[derive(Debug, Error)]
pub enum AutomationError {
    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error("a rule named \"{0}\" already exists")]
    DuplicateRule(String),

    #[error("no rule named \"{0}\"")]
    RuleNotFound(String),

    #[error("rule repository error: {0}")]
    Repository(String),
}

impl From<rusqlite::Error> for AutomationError {
    fn from(e: rusqlite::Error) -> Self {
        AutomationError::Repository(e.to_string())
    }
}
