//! Error types for bench-forge operations.
//!
//! Defines the error taxonomy shared by every subsystem:
//! - Ledger storage (unreadable or unwritable ledgers are fatal)
//! - Worker invocations (recovered per item, never fatal to a run)
//! - Pipeline stages (missing preconditions abort the stage)
//! - Dataset publishing (schema violations block a merge)
//!
//! Identifier collisions during a merge are expected and are reported in the
//! merge outcome rather than raised as errors.

use thiserror::Error;

use crate::pipeline::ConfigError;

/// Errors raised by ledger storage.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("IO error on ledger '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode record for ledger '{path}': {source}")]
    Encode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl LedgerError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        LedgerError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Errors from a single external worker call.
///
/// A worker error only ever affects the item it was raised for: the item
/// stays in the deficit and is picked up again by the next run.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker failed: {0}")]
    Failed(String),

    #[error("Worker timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Failed to spawn worker process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Worker produced unusable output: {0}")]
    BadOutput(String),
}

/// Errors that stop a pipeline stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Precondition missing for stage '{stage}': {reason}")]
    PreconditionMissing { stage: String, reason: String },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Stage '{stage}' made no progress: {reason}")]
    NoProgress { stage: String, reason: String },

    #[error("Background task failed: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        PipelineError::Join(err.to_string())
    }
}

/// Errors raised while loading, checking or merging datasets.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Dataset '{dataset}' failed schema validation ({} violation(s))", .violations.len())]
    SchemaViolation {
        dataset: String,
        violations: Vec<String>,
    },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Dataset directory not found: {0}")]
    NotFound(String),
}
