//! Core types for batches, rows, and intake files.
//!
//! This module defines the identifiers, the shared status alphabet, and the
//! persistent record types the rest of the engine operates on.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl From<Uuid> for BatchId {
    fn from(uuid: Uuid) -> Self {
        BatchId(uuid)
    }
}

impl std::ops::Deref for BatchId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Monotonic identifier for a batch row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub i64);

impl From<i64> for RowId {
    fn from(id: i64) -> Self {
        RowId(id)
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn random() -> Self {
        WorkerId(Uuid::new_v4())
    }
}

impl From<Uuid> for WorkerId {
    fn from(uuid: Uuid) -> Self {
        WorkerId(uuid)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Status alphabet shared by batches and rows.
///
/// `Wait` and `Queued` are pre-dispatch; `InProgress` means a worker holds a
/// claim; the remaining three are terminal and freeze the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "wait")]
    Wait,
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "inprog")]
    InProgress,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "aborted")]
    Aborted,
}

impl JobStatus {
    /// Check if this status is terminal (success, failed, or aborted).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed | JobStatus::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Wait => "wait",
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "inprog",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "wait" => Ok(JobStatus::Wait),
            "queued" => Ok(JobStatus::Queued),
            "inprog" => Ok(JobStatus::InProgress),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            "aborted" => Ok(JobStatus::Aborted),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Discriminator separating row batches from single-row slow queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchKind {
    #[serde(rename = "rows")]
    Rows,
    #[serde(rename = "slow_query")]
    SlowQuery,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Rows => "rows",
            BatchKind::SlowQuery => "slow_query",
        }
    }
}

impl std::fmt::Display for BatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "rows" => Ok(BatchKind::Rows),
            "slow_query" => Ok(BatchKind::SlowQuery),
            other => Err(format!("unknown batch kind: {other}")),
        }
    }
}

/// Map from logical filename to the object-store key of the aggregated artifact.
pub type OutputFiles = BTreeMap<String, String>;

/// One structured diagnostic entry attached to a row.
///
/// The `messages` column is the authoritative carrier of per-row diagnostic
/// detail; processors append entries, the executor adds synthetic ones when a
/// processor errors out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntry {
    /// Stable machine-readable code (e.g. "processor_error")
    pub code: String,
    /// Input field the message refers to, when applicable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Human-readable detail
    pub detail: String,
}

impl MessageEntry {
    pub fn new(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            field: None,
            detail: detail.into(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

/// Terminal counters for a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounters {
    pub n_success: i64,
    pub n_failed: i64,
    pub n_aborted: i64,
}

impl BatchCounters {
    pub fn total(&self) -> i64 {
        self.n_success + self.n_failed + self.n_aborted
    }

    /// Derive the batch terminal status: aborted beats failed beats success.
    pub fn derive_status(&self) -> JobStatus {
        if self.n_aborted > 0 {
            JobStatus::Aborted
        } else if self.n_failed > 0 {
            JobStatus::Failed
        } else {
            JobStatus::Success
        }
    }
}

/// A batch: one submission of rows under a common (app, op) and context.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: BatchId,
    pub app: String,
    /// Lowercased at submit time
    pub op: String,
    pub kind: BatchKind,
    /// Opaque structured payload visible to every row invocation and the done hook
    pub context: Value,
    pub status: JobStatus,
    pub requested_at: DateTime<Utc>,
    /// Non-null iff the batch is terminal
    pub completed_at: Option<DateTime<Utc>>,
    /// Written on the terminal transition
    pub counters: Option<BatchCounters>,
    /// Logical filename -> object-store key, written on the terminal transition
    pub output_files: OutputFiles,
}

/// One unit of work belonging to a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRow {
    pub id: RowId,
    pub batch_id: BatchId,
    /// Caller-assigned line number; need not be dense or ordered
    pub line: i32,
    pub status: JobStatus,
    pub input: Value,
    /// Written only on the transition into a terminal status
    pub result: Option<Value>,
    /// Written only on the transition into a terminal status
    pub messages: Vec<MessageEntry>,
    pub worker_id: Option<WorkerId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Intake record linking a stored file to the batch made from it.
///
/// Created at file intake and never mutated. The batch reference is weak:
/// deleting the batch does not remove the record.
#[derive(Debug, Clone, Serialize)]
pub struct BatchFile {
    pub id: Uuid,
    pub object_key: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub received_at: DateTime<Utc>,
    /// Whether the file passed its file checker
    pub valid: bool,
    pub batch_id: Option<BatchId>,
}

/// Summary handed to the done hook after a batch reaches a terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct DoneSummary {
    pub batch_id: BatchId,
    pub status: JobStatus,
    pub counters: BatchCounters,
    pub output_files: OutputFiles,
}

/// Outcome of a single row execution, returned by a batch processor.
#[derive(Debug, Clone)]
pub struct RowOutcome {
    /// Must be terminal (success or failed)
    pub status: JobStatus,
    pub result: Value,
    pub messages: Vec<MessageEntry>,
    /// Per-row contributions to named output files, keyed by logical filename
    pub fragments: Vec<(String, Vec<u8>)>,
}

impl RowOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            status: JobStatus::Success,
            result,
            messages: Vec::new(),
            fragments: Vec::new(),
        }
    }

    pub fn failed(result: Value, messages: Vec<MessageEntry>) -> Self {
        Self {
            status: JobStatus::Failed,
            result,
            messages,
            fragments: Vec::new(),
        }
    }

    pub fn with_fragment(mut self, filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.fragments.push((filename.into(), bytes));
        self
    }
}

/// Outcome of a slow-query execution.
///
/// Slow queries upload their own artifacts; `output_files` carries the keys.
#[derive(Debug, Clone)]
pub struct SlowOutcome {
    /// Must be terminal (success or failed)
    pub status: JobStatus,
    pub result: Value,
    pub messages: Vec<MessageEntry>,
    pub output_files: OutputFiles,
}

impl SlowOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            status: JobStatus::Success,
            result,
            messages: Vec::new(),
            output_files: OutputFiles::new(),
        }
    }

    pub fn failed(result: Value, messages: Vec<MessageEntry>) -> Self {
        Self {
            status: JobStatus::Failed,
            result,
            messages,
            output_files: OutputFiles::new(),
        }
    }
}

/// Result of polling a batch.
///
/// Non-terminal batches expose only the status; the remaining fields are
/// filled once the batch is terminal.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub batch_id: BatchId,
    pub status: JobStatus,
    pub counters: Option<BatchCounters>,
    pub output_files: OutputFiles,
    pub rows: Vec<BatchRow>,
}

impl BatchResult {
    pub(crate) fn pending(batch_id: BatchId, status: JobStatus) -> Self {
        Self {
            batch_id,
            status,
            counters: None,
            output_files: OutputFiles::new(),
            rows: Vec::new(),
        }
    }

    /// Check if the batch has finished (reached a terminal status).
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Wait,
            JobStatus::Queued,
            JobStatus::InProgress,
            JobStatus::Success,
            JobStatus::Failed,
            JobStatus::Aborted,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn in_progress_serializes_as_inprog() {
        assert_eq!(JobStatus::InProgress.to_string(), "inprog");
        assert_eq!("inprog".parse::<JobStatus>().unwrap(), JobStatus::InProgress);
        assert_eq!(
            serde_json::to_string(&JobStatus::InProgress).unwrap(),
            r#""inprog""#
        );
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Aborted.is_terminal());
        assert!(!JobStatus::Wait.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
    }

    #[test]
    fn derived_status_prefers_aborted_then_failed() {
        let aborted = BatchCounters {
            n_success: 5,
            n_failed: 2,
            n_aborted: 1,
        };
        assert_eq!(aborted.derive_status(), JobStatus::Aborted);

        let failed = BatchCounters {
            n_success: 5,
            n_failed: 1,
            n_aborted: 0,
        };
        assert_eq!(failed.derive_status(), JobStatus::Failed);

        let success = BatchCounters {
            n_success: 5,
            n_failed: 0,
            n_aborted: 0,
        };
        assert_eq!(success.derive_status(), JobStatus::Success);
    }

    #[test]
    fn message_entry_serializes_without_empty_field() {
        let entry = MessageEntry::new("processor_error", "boom");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("field"));

        let with_field = MessageEntry::new("invalid_input", "missing address").with_field("to");
        let json = serde_json::to_string(&with_field).unwrap();
        assert!(json.contains(r#""field":"to""#));
    }
}
