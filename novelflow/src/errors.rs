//! Error types for the novelflow engine.
//!
//! Stage bodies report failures through [`StageError`]; storage backends
//! through [`PersistenceError`]. [`NovelflowError`] is what the engine itself
//! returns for programmer errors and infrastructure faults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for novelflow operations.
#[derive(Debug, Error)]
pub enum NovelflowError {
    /// No pipeline is registered under the requested type.
    #[error("Unknown pipeline type: {0}")]
    UnknownPipeline(String),

    /// A pipeline was registered twice under the same type.
    #[error("Pipeline type already registered: {0}")]
    DuplicatePipeline(String),

    /// The execution input does not name a target resource.
    #[error("Missing target: {0}")]
    MissingTarget(String),

    /// The health monitor has tripped the breaker for this pipeline type.
    #[error("Circuit open for pipeline type '{pipeline_type}': {failures} recent failures")]
    CircuitOpen {
        /// The refused pipeline type.
        pipeline_type: String,
        /// Failures counted inside the monitor window.
        failures: usize,
    },

    /// No execution record exists for the id.
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// The execution cannot be resumed from a checkpoint.
    #[error("Execution {execution_id} is not recoverable: {reason}")]
    NotRecoverable {
        /// The execution id.
        execution_id: String,
        /// Why recovery was refused.
        reason: String,
    },

    /// A status transition was rejected by the state machine.
    #[error("Invalid transition from '{from}' on '{event}'")]
    InvalidTransition {
        /// Status before the attempted transition.
        from: String,
        /// The rejected event.
        event: String,
    },

    /// A lock operation failed at the storage level.
    #[error("Lock error: {0}")]
    Lock(String),

    /// A persistence backend failed.
    #[error("{0}")]
    Persistence(#[from] PersistenceError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl NovelflowError {
    /// Returns true for errors caused by the caller rather than the runtime.
    #[must_use]
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownPipeline(_) | Self::MissingTarget(_) | Self::DuplicatePipeline(_)
        )
    }
}

/// Errors raised by storage backends.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    /// A record was not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint was violated.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The backend is unreachable or rejected the operation.
    #[error("Backend error: {0}")]
    Backend(String),

    /// A stored payload could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// A failure raised by a stage body.
///
/// Returning `Err(StageError)` from [`crate::stages::Stage::execute`] is the
/// equivalent of throwing: it routes through the stage's `on_error` hook
/// before retry classification.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[error("{message}")]
pub struct StageError {
    /// Human-readable error message, matched against retry patterns.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, serde_json::Value>,
}

impl StageError {
    /// Creates a new stage error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: HashMap::new(),
        }
    }

    /// Adds a single detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

impl From<&str> for StageError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for StageError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}
