use crate::batch::{BatchId, JobStatus, RowId};
use thiserror::Error;

/// Result type for conveyor operations.
pub type Result<T> = std::result::Result<T, ConveyorError>;

/// Errors that can occur in the batch engine.
///
/// Every rejected operation carries a distinct variant so callers can match
/// on the kind rather than parse a message.
#[derive(Debug, Error)]
pub enum ConveyorError {
    /// Batch does not exist
    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),

    /// Row does not exist
    #[error("row not found: {0}")]
    RowNotFound(RowId),

    /// Submit was called with an empty row sequence
    #[error("a batch must contain at least one row")]
    EmptyBatch,

    /// Append on a batch that is not held in `wait`
    #[error("batch {batch} is {status}, rows can only be appended while it is waiting")]
    NotHeld { batch: BatchId, status: JobStatus },

    /// Wait-off on a batch that is neither `wait` nor `queued`
    #[error("batch {batch} is {status} and cannot be released")]
    NotReleasable { batch: BatchId, status: JobStatus },

    /// Abort on a batch that already reached success or failure
    #[error("batch {batch} is already terminal ({status})")]
    AlreadyTerminal { batch: BatchId, status: JobStatus },

    /// An illegal status transition was requested
    #[error("illegal status transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// A processor is already registered under this (app, op) pair
    #[error("a processor is already registered for ({app}, {op})")]
    DuplicateProcessor { app: String, op: String },

    /// An initializer is already registered for this app
    #[error("an initializer is already registered for app {app}")]
    DuplicateInitializer { app: String },

    /// A file checker is already registered for this file type
    #[error("a file checker is already registered for file type {file_type}")]
    DuplicateChecker { file_type: String },

    /// No processor registered under this (app, op) pair
    #[error("no processor registered for ({app}, {op})")]
    UnknownProcessor { app: String, op: String },

    /// No initializer registered for this app
    #[error("no initializer registered for app {app}")]
    UnknownInitializer { app: String },

    /// No file checker registered for this file type
    #[error("no file checker registered for file type {file_type}")]
    UnknownFileType { file_type: String },

    /// The file checker rejected an intake file
    #[error("file {filename} rejected at intake: {reason}")]
    IntakeRejected { filename: String, reason: String },

    /// The batch has no aggregated output under this logical filename
    #[error("batch {batch} has no output file named {filename}")]
    OutputNotFound { batch: BatchId, filename: String },

    /// Database operation failed
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Object store operation failed
    #[error("object store error: {0}")]
    ObjectStore(anyhow::Error),

    /// Local file I/O failed (fragment spools, watched directories)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Status cache operation failed
    #[error("status cache error: {0}")]
    Cache(anyhow::Error),

    /// JSON serialization/deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
