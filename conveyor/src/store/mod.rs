//! Persistent store contract for batches, rows, and intake records.
//!
//! The engine depends only on this trait; the bundled implementations are
//! [`postgres::PostgresStore`] for production and [`memory::MemoryStore`]
//! for tests and single-process embedding. Multi-step mutations are each one
//! transaction; claim uses select-for-update with skip-locked semantics so
//! competing workers never overlap.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::batch::{
    Batch, BatchCounters, BatchFile, BatchId, BatchKind, BatchRow, JobStatus, MessageEntry,
    OutputFiles, RowId, WorkerId,
};
use crate::error::Result;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

/// Input for a new batch.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub app: String,
    /// Lowercased by the engine before it reaches the store
    pub op: String,
    pub kind: BatchKind,
    pub context: Value,
    /// Hold the batch in `wait` instead of queueing it immediately
    pub hold: bool,
}

/// Input for a new row.
#[derive(Debug, Clone)]
pub struct NewRow {
    pub line: i32,
    pub input: Value,
}

impl NewRow {
    pub fn new(line: i32, input: Value) -> Self {
        Self { line, input }
    }
}

/// A row handed to a worker by a claim pass, joined with the batch fields
/// the executor needs so no extra round-trip is required.
#[derive(Debug, Clone)]
pub struct ClaimedRow {
    pub row_id: RowId,
    pub batch_id: BatchId,
    pub app: String,
    pub op: String,
    pub kind: BatchKind,
    pub context: Value,
    pub line: i32,
    pub input: Value,
}

/// Counters and derived status computed by a summary plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryPlan {
    pub status: JobStatus,
    pub counters: BatchCounters,
}

/// Filter for listing batches. Empty filter lists everything.
#[derive(Debug, Clone, Default)]
pub struct BatchFilter {
    pub app: Option<String>,
    pub op: Option<String>,
    pub status: Option<JobStatus>,
}

/// Input for a new intake record.
#[derive(Debug, Clone)]
pub struct NewBatchFile {
    pub object_key: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub valid: bool,
    pub batch_id: Option<BatchId>,
}

/// Capability set the engine requires from its relational store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a batch and all of its rows in one transaction.
    ///
    /// Batch and rows start in `wait` (hold) or `queued` (no hold). Any
    /// failure leaves the store untouched.
    async fn insert_batch(&self, batch: NewBatch, rows: Vec<NewRow>) -> Result<BatchId>;

    /// Append rows to a batch that is held in `wait`, optionally releasing it.
    ///
    /// Concurrent appends are serialised by a row-level lock on the batch
    /// record. Returns the batch's total row count.
    ///
    /// # Errors
    /// - `NotHeld` if the batch is not in `wait`
    async fn append_rows(&self, batch: BatchId, rows: Vec<NewRow>, release: bool) -> Result<i64>;

    /// Promote a `wait` batch to `queued`. Idempotent when already `queued`.
    ///
    /// Returns the batch's row count.
    ///
    /// # Errors
    /// - `NotReleasable` if the batch is in progress or terminal
    async fn release_batch(&self, batch: BatchId) -> Result<i64>;

    /// Atomically claim up to `chunk` ready rows for a worker.
    ///
    /// Selects `queued` rows (and, as the crash-recovery widening, `inprog`
    /// rows whose claim stamp is older than `reclaim_after`), oldest first,
    /// skipping rows locked by a concurrent claim. Selected
    /// rows are stamped with the worker id and moved to `inprog`; each
    /// touched batch still in `queued` is flipped to `inprog`.
    async fn claim_rows(
        &self,
        chunk: usize,
        worker: WorkerId,
        reclaim_after: Duration,
    ) -> Result<Vec<ClaimedRow>>;

    /// Write a row's terminal outcome (status, result, messages, timestamp).
    ///
    /// # Errors
    /// - `RowNotFound` if the row doesn't exist
    /// - `InvalidTransition` if the row is already terminal or `status` isn't
    async fn complete_row(
        &self,
        row: RowId,
        status: JobStatus,
        result: Value,
        messages: Vec<MessageEntry>,
    ) -> Result<()>;

    /// Under a lock on the batch record, check whether every row is terminal.
    ///
    /// Returns `None` when the batch is already terminal or some row is still
    /// outstanding; otherwise the counters and derived terminal status. No
    /// state is written: aggregation happens between plan and
    /// [`commit_summary`](Store::commit_summary) so that object-store
    /// unavailability leaves the batch in progress and retryable.
    async fn plan_summary(&self, batch: BatchId) -> Result<Option<SummaryPlan>>;

    /// Write the batch's terminal status, counters, completion timestamp, and
    /// output-files map, re-checking eligibility under the lock.
    ///
    /// Returns `false` when another worker already finalised the batch (the
    /// loser of the last-row race) or a row turned out to be outstanding.
    async fn commit_summary(
        &self,
        batch: BatchId,
        status: JobStatus,
        counters: BatchCounters,
        output_files: OutputFiles,
    ) -> Result<bool>;

    /// Abort a batch: every non-terminal row becomes `aborted`, counters are
    /// recomputed, and the batch is closed as `aborted`.
    ///
    /// Aborting an already-aborted batch is a no-op returning the stored
    /// counters.
    ///
    /// # Errors
    /// - `AlreadyTerminal` if the batch finished as success or failed
    async fn abort_batch(&self, batch: BatchId) -> Result<BatchCounters>;

    /// Fetch a batch by identity.
    async fn get_batch(&self, batch: BatchId) -> Result<Batch>;

    /// List batches matching a filter, newest first.
    async fn list_batches(&self, filter: BatchFilter) -> Result<Vec<Batch>>;

    /// Fetch all rows of a batch, ordered by row identity.
    async fn get_rows(&self, batch: BatchId) -> Result<Vec<BatchRow>>;

    /// Fetch the rows of a batch that are not yet terminal.
    async fn get_pending_rows(&self, batch: BatchId) -> Result<Vec<BatchRow>>;

    /// Record an intake file.
    async fn insert_batch_file(&self, file: NewBatchFile) -> Result<Uuid>;

    /// Fetch an intake record by object key.
    async fn get_batch_file(&self, object_key: &str) -> Result<BatchFile>;
}
