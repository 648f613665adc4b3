//! Error taxonomy for the beat
//!
//! Transient errors are retried where they happen. Fatal errors travel to the
//! supervisor and end the run with a non-zero exit.

use crate::state::AgentState;
use thiserror::Error;

/// Whether a failure is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Failure to read a sample from a source
#[derive(Debug, Clone, Error)]
#[error("{kind} collect error from `{source_name}`: {message}")]
pub struct CollectError {
    pub kind: ErrorKind,
    pub source_name: String,
    pub message: String,
}

impl CollectError {
    pub fn transient(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn fatal(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Fatal
    }

    /// Classify an I/O error: a missing source is unrecoverable, anything else may clear up
    pub fn from_io(source_name: impl Into<String>, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                Self::fatal(source_name, err.to_string())
            }
            _ => Self::transient(source_name, err.to_string()),
        }
    }
}

/// Sample rejected by the event builder
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid sample from `{source_name}` field `{field}`: {reason}")]
pub struct ValidationError {
    pub source_name: String,
    pub field: String,
    pub reason: String,
}

/// Failure to deliver a batch to a sink
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("transient send failure: {0}")]
    Transient(String),
    #[error("fatal send failure: {0}")]
    Fatal(String),
}

impl SendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SendError::Transient(_) => ErrorKind::Transient,
            SendError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

/// Pending batches were still queued when the drain deadline passed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("drain timed out, {dropped_events} events discarded")]
pub struct DrainTimeout {
    pub dropped_events: u64,
}

/// Lifecycle violation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("invalid agent state transition {from} -> {to}")]
    InvalidTransition { from: AgentState, to: AgentState },
}

/// Invalid settings, detected before anything starts
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Top-level error surfaced by the supervisor
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Collect(#[from] CollectError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    DrainTimeout(#[from] DrainTimeout),
    #[error(transparent)]
    State(#[from] StateError),
}
