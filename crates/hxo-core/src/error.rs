//! Unified error types for HXO

use std::time::Duration;
use thiserror::Error;

/// Unified error type for all HXO operations
#[derive(Error, Debug)]
pub enum HxoError {
    // Submission errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    // Stage errors
    #[error("Partition error: {0}")]
    Partition(#[from] PartitionError),

    // Shard errors
    #[error("Execution failure: {0}")]
    Execution(#[from] ExecutionFailure),

    // Persistence errors
    #[error("Checkpoint I/O error: {0}")]
    CheckpointIo(String),

    // Certification errors
    #[error("Certification error: {0}")]
    Certification(String),

    // Control-loop errors
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Orchestrator unavailable: {0}")]
    Unavailable(String),

    #[error("HXO is disabled")]
    Disabled,

    #[error("Config error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Errors raised while exploding a stage into shards
///
/// A partition error fails the owning stage only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("unknown partitioner kind: {0}")]
    UnknownKind(String),

    #[error("invalid input for {partitioner}: {reason}")]
    InvalidInput { partitioner: String, reason: String },

    #[error("stage would produce {produced} shards, budget is {budget}")]
    TooManyShards { produced: usize, budget: usize },
}

/// Why a single shard execution did not produce output
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionFailure {
    /// Worth retrying until the attempt budget runs out
    #[error("transient: {0}")]
    Transient(String),

    /// Explicit non-retryable signal
    #[error("permanent: {0}")]
    Permanent(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("no executor registered for kind: {0}")]
    UnknownExecutor(String),
}

impl ExecutionFailure {
    /// Whether the shard should go back to PENDING for another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Result type alias using HxoError
pub type Result<T> = std::result::Result<T, HxoError>;
