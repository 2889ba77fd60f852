//! In-memory store implementation.
//!
//! Keeps batches and rows in maps behind a single lock. Suitable for tests
//! and single-process embedding; state is lost on restart. Semantics match
//! the Postgres implementation, including claim exclusivity, age-based
//! reclaim of abandoned rows, and refusal to rewrite terminal records.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::batch::{
    Batch, BatchCounters, BatchFile, BatchId, BatchRow, JobStatus, MessageEntry, OutputFiles,
    RowId, WorkerId,
};
use crate::error::{ConveyorError, Result};

use super::{BatchFilter, ClaimedRow, NewBatch, NewBatchFile, NewRow, Store, SummaryPlan};

#[derive(Default)]
struct Inner {
    batches: HashMap<BatchId, Batch>,
    /// BTreeMap so claim passes see rows oldest-first by identity
    rows: BTreeMap<RowId, BatchRow>,
    files: Vec<BatchFile>,
    next_row_id: i64,
}

impl Inner {
    fn next_row_id(&mut self) -> RowId {
        self.next_row_id += 1;
        RowId(self.next_row_id)
    }

    fn batch(&self, id: BatchId) -> Result<&Batch> {
        self.batches.get(&id).ok_or(ConveyorError::BatchNotFound(id))
    }

    fn batch_mut(&mut self, id: BatchId) -> Result<&mut Batch> {
        self.batches
            .get_mut(&id)
            .ok_or(ConveyorError::BatchNotFound(id))
    }

    fn insert_rows(&mut self, batch_id: BatchId, rows: Vec<NewRow>, status: JobStatus) {
        let now = Utc::now();
        for row in rows {
            let id = self.next_row_id();
            self.rows.insert(
                id,
                BatchRow {
                    id,
                    batch_id,
                    line: row.line,
                    status,
                    input: row.input,
                    result: None,
                    messages: Vec::new(),
                    worker_id: None,
                    claimed_at: None,
                    requested_at: now,
                    completed_at: None,
                },
            );
        }
    }

    fn rows_of(&self, batch_id: BatchId) -> impl Iterator<Item = &BatchRow> {
        self.rows.values().filter(move |r| r.batch_id == batch_id)
    }

    fn count_rows(&self, batch_id: BatchId) -> i64 {
        self.rows_of(batch_id).count() as i64
    }

    fn counters(&self, batch_id: BatchId) -> BatchCounters {
        let mut counters = BatchCounters::default();
        for row in self.rows_of(batch_id) {
            match row.status {
                JobStatus::Success => counters.n_success += 1,
                JobStatus::Failed => counters.n_failed += 1,
                JobStatus::Aborted => counters.n_aborted += 1,
                _ => {}
            }
        }
        counters
    }
}

/// In-memory implementation of the [`Store`] trait.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_batch(&self, batch: NewBatch, rows: Vec<NewRow>) -> Result<BatchId> {
        let id = BatchId(Uuid::new_v4());
        let status = if batch.hold {
            JobStatus::Wait
        } else {
            JobStatus::Queued
        };

        let mut inner = self.inner.write();
        inner.batches.insert(
            id,
            Batch {
                id,
                app: batch.app,
                op: batch.op,
                kind: batch.kind,
                context: batch.context,
                status,
                requested_at: Utc::now(),
                completed_at: None,
                counters: None,
                output_files: OutputFiles::new(),
            },
        );
        inner.insert_rows(id, rows, status);
        Ok(id)
    }

    async fn append_rows(&self, batch: BatchId, rows: Vec<NewRow>, release: bool) -> Result<i64> {
        let mut inner = self.inner.write();
        let status = inner.batch(batch)?.status;
        if status != JobStatus::Wait {
            return Err(ConveyorError::NotHeld { batch, status });
        }

        inner.insert_rows(batch, rows, JobStatus::Wait);
        if release {
            inner.batch_mut(batch)?.status = JobStatus::Queued;
            for row in inner.rows.values_mut() {
                if row.batch_id == batch && row.status == JobStatus::Wait {
                    row.status = JobStatus::Queued;
                }
            }
        }
        Ok(inner.count_rows(batch))
    }

    async fn release_batch(&self, batch: BatchId) -> Result<i64> {
        let mut inner = self.inner.write();
        let status = inner.batch(batch)?.status;
        match status {
            JobStatus::Queued => Ok(inner.count_rows(batch)),
            JobStatus::Wait => {
                inner.batch_mut(batch)?.status = JobStatus::Queued;
                for row in inner.rows.values_mut() {
                    if row.batch_id == batch && row.status == JobStatus::Wait {
                        row.status = JobStatus::Queued;
                    }
                }
                Ok(inner.count_rows(batch))
            }
            _ => Err(ConveyorError::NotReleasable { batch, status }),
        }
    }

    async fn claim_rows(
        &self,
        chunk: usize,
        worker: WorkerId,
        reclaim_after: Duration,
    ) -> Result<Vec<ClaimedRow>> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let stale_before = now
            - chrono::Duration::from_std(reclaim_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let picked: Vec<RowId> = inner
            .rows
            .values()
            .filter(|row| match row.status {
                JobStatus::Queued => true,
                JobStatus::InProgress => {
                    row.claimed_at.is_some_and(|claimed| claimed < stale_before)
                }
                _ => false,
            })
            .take(chunk)
            .map(|row| row.id)
            .collect();

        let mut claimed = Vec::with_capacity(picked.len());
        for id in picked {
            let (batch_id, line, input) = {
                let row = match inner.rows.get_mut(&id) {
                    Some(row) => row,
                    None => continue,
                };
                row.status = JobStatus::InProgress;
                row.worker_id = Some(worker);
                row.claimed_at = Some(now);
                (row.batch_id, row.line, row.input.clone())
            };

            let batch = inner.batch_mut(batch_id)?;
            if batch.status == JobStatus::Queued {
                batch.status = JobStatus::InProgress;
            }
            claimed.push(ClaimedRow {
                row_id: id,
                batch_id,
                app: batch.app.clone(),
                op: batch.op.clone(),
                kind: batch.kind,
                context: batch.context.clone(),
                line,
                input,
            });
        }
        Ok(claimed)
    }

    async fn complete_row(
        &self,
        row: RowId,
        status: JobStatus,
        result: Value,
        messages: Vec<MessageEntry>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(ConveyorError::InvalidTransition {
                from: JobStatus::InProgress,
                to: status,
            });
        }

        let mut inner = self.inner.write();
        let record = inner.rows.get_mut(&row).ok_or(ConveyorError::RowNotFound(row))?;
        if record.status.is_terminal() {
            return Err(ConveyorError::InvalidTransition {
                from: record.status,
                to: status,
            });
        }
        record.status = status;
        record.result = Some(result);
        record.messages = messages;
        record.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn plan_summary(&self, batch: BatchId) -> Result<Option<SummaryPlan>> {
        let inner = self.inner.read();
        let record = inner.batch(batch)?;
        if record.status.is_terminal() {
            return Ok(None);
        }
        if inner.rows_of(batch).any(|row| !row.status.is_terminal()) {
            return Ok(None);
        }
        let counters = inner.counters(batch);
        Ok(Some(SummaryPlan {
            status: counters.derive_status(),
            counters,
        }))
    }

    async fn commit_summary(
        &self,
        batch: BatchId,
        status: JobStatus,
        counters: BatchCounters,
        output_files: OutputFiles,
    ) -> Result<bool> {
        let mut inner = self.inner.write();
        if inner.batch(batch)?.status.is_terminal() {
            return Ok(false);
        }
        if inner.rows_of(batch).any(|row| !row.status.is_terminal()) {
            return Ok(false);
        }
        let record = inner.batch_mut(batch)?;
        record.status = status;
        record.counters = Some(counters);
        record.output_files = output_files;
        record.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn abort_batch(&self, batch: BatchId) -> Result<BatchCounters> {
        let mut inner = self.inner.write();
        let status = inner.batch(batch)?.status;
        match status {
            JobStatus::Aborted => {
                // Idempotent: repeat aborts return the recorded counters.
                return Ok(inner.batch(batch)?.counters.unwrap_or_default());
            }
            JobStatus::Success | JobStatus::Failed => {
                return Err(ConveyorError::AlreadyTerminal { batch, status });
            }
            _ => {}
        }

        let now = Utc::now();
        for row in inner.rows.values_mut() {
            if row.batch_id == batch && !row.status.is_terminal() {
                row.status = JobStatus::Aborted;
                row.completed_at = Some(now);
            }
        }
        let counters = inner.counters(batch);
        let record = inner.batch_mut(batch)?;
        record.status = JobStatus::Aborted;
        record.counters = Some(counters);
        record.completed_at = Some(now);
        Ok(counters)
    }

    async fn get_batch(&self, batch: BatchId) -> Result<Batch> {
        Ok(self.inner.read().batch(batch)?.clone())
    }

    async fn list_batches(&self, filter: BatchFilter) -> Result<Vec<Batch>> {
        let inner = self.inner.read();
        let mut batches: Vec<Batch> = inner
            .batches
            .values()
            .filter(|b| filter.app.as_deref().is_none_or(|app| b.app == app))
            .filter(|b| filter.op.as_deref().is_none_or(|op| b.op == op))
            .filter(|b| filter.status.is_none_or(|status| b.status == status))
            .cloned()
            .collect();
        batches.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        Ok(batches)
    }

    async fn get_rows(&self, batch: BatchId) -> Result<Vec<BatchRow>> {
        let inner = self.inner.read();
        inner.batch(batch)?;
        Ok(inner.rows_of(batch).cloned().collect())
    }

    async fn get_pending_rows(&self, batch: BatchId) -> Result<Vec<BatchRow>> {
        let inner = self.inner.read();
        inner.batch(batch)?;
        Ok(inner
            .rows_of(batch)
            .filter(|row| !row.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn insert_batch_file(&self, file: NewBatchFile) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.inner.write().files.push(BatchFile {
            id,
            object_key: file.object_key,
            size_bytes: file.size_bytes,
            checksum: file.checksum,
            received_at: Utc::now(),
            valid: file.valid,
            batch_id: file.batch_id,
        });
        Ok(id)
    }

    async fn get_batch_file(&self, object_key: &str) -> Result<BatchFile> {
        self.inner
            .read()
            .files
            .iter()
            .find(|f| f.object_key == object_key)
            .cloned()
            .ok_or_else(|| {
                ConveyorError::Other(anyhow::anyhow!("batch file not found: {object_key}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchKind;
    use serde_json::json;

    fn sample_batch(hold: bool) -> NewBatch {
        NewBatch {
            app: "emailapp".to_string(),
            op: "sendbulkemail".to_string(),
            kind: BatchKind::Rows,
            context: json!({}),
            hold,
        }
    }

    fn sample_rows(n: i32) -> Vec<NewRow> {
        (1..=n).map(|i| NewRow::new(i, json!({"line": i}))).collect()
    }

    #[tokio::test]
    async fn submit_then_claim() {
        let store = MemoryStore::new();
        let batch = store
            .insert_batch(sample_batch(false), sample_rows(3))
            .await
            .unwrap();

        let worker = WorkerId::random();
        let claimed = store
            .claim_rows(10, worker, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 3);
        assert!(claimed.iter().all(|c| c.batch_id == batch));
        assert_eq!(claimed[0].app, "emailapp");

        // The batch followed its first claimed row into inprog.
        let record = store.get_batch(batch).await.unwrap();
        assert_eq!(record.status, JobStatus::InProgress);
    }

    #[tokio::test]
    async fn claims_never_overlap() {
        let store = MemoryStore::new();
        store
            .insert_batch(sample_batch(false), sample_rows(4))
            .await
            .unwrap();

        let a = store
            .claim_rows(2, WorkerId::random(), Duration::from_secs(60))
            .await
            .unwrap();
        let b = store
            .claim_rows(10, WorkerId::random(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
        for row in &a {
            assert!(b.iter().all(|other| other.row_id != row.row_id));
        }

        // Nothing left once everything is claimed.
        let c = store
            .claim_rows(10, WorkerId::random(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn held_batches_are_invisible_until_released() {
        let store = MemoryStore::new();
        let batch = store
            .insert_batch(sample_batch(true), sample_rows(2))
            .await
            .unwrap();

        let claimed = store
            .claim_rows(10, WorkerId::random(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(claimed.is_empty());

        let count = store.release_batch(batch).await.unwrap();
        assert_eq!(count, 2);
        // Idempotent when already queued.
        assert_eq!(store.release_batch(batch).await.unwrap(), 2);

        let claimed = store
            .claim_rows(10, WorkerId::random(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);
    }

    #[tokio::test]
    async fn append_requires_wait() {
        let store = MemoryStore::new();
        let held = store
            .insert_batch(sample_batch(true), sample_rows(2))
            .await
            .unwrap();
        let count = store
            .append_rows(held, sample_rows(2), false)
            .await
            .unwrap();
        assert_eq!(count, 4);

        // Append with release flips the batch and its rows to queued.
        let count = store.append_rows(held, sample_rows(1), true).await.unwrap();
        assert_eq!(count, 5);
        let claimed = store
            .claim_rows(10, WorkerId::random(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 5);

        let err = store
            .append_rows(held, sample_rows(1), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::NotHeld { .. }));
    }

    #[tokio::test]
    async fn stale_claims_are_reclaimable() {
        let store = MemoryStore::new();
        store
            .insert_batch(sample_batch(false), sample_rows(1))
            .await
            .unwrap();

        let dead_worker = WorkerId::random();
        let claimed = store
            .claim_rows(1, dead_worker, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        // Not yet stale: invisible to other workers.
        let none = store
            .claim_rows(1, WorkerId::random(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(none.is_empty());

        // With a zero reclaim timeout the abandoned claim is taken over.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let survivor = WorkerId::random();
        let reclaimed = store
            .claim_rows(1, survivor, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].row_id, claimed[0].row_id);
    }

    #[tokio::test]
    async fn complete_row_is_monotone() {
        let store = MemoryStore::new();
        store
            .insert_batch(sample_batch(false), sample_rows(1))
            .await
            .unwrap();
        let claimed = store
            .claim_rows(1, WorkerId::random(), Duration::from_secs(60))
            .await
            .unwrap();
        let row = claimed[0].row_id;

        store
            .complete_row(row, JobStatus::Success, json!({"ok": true}), Vec::new())
            .await
            .unwrap();

        let err = store
            .complete_row(row, JobStatus::Failed, json!({}), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::InvalidTransition { .. }));

        // Non-terminal targets are refused outright.
        let err = store
            .complete_row(row, JobStatus::Queued, json!({}), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn summary_waits_for_all_rows() {
        let store = MemoryStore::new();
        let batch = store
            .insert_batch(sample_batch(false), sample_rows(2))
            .await
            .unwrap();
        let claimed = store
            .claim_rows(2, WorkerId::random(), Duration::from_secs(60))
            .await
            .unwrap();

        store
            .complete_row(claimed[0].row_id, JobStatus::Success, json!({}), Vec::new())
            .await
            .unwrap();
        assert!(store.plan_summary(batch).await.unwrap().is_none());

        store
            .complete_row(claimed[1].row_id, JobStatus::Failed, json!({}), Vec::new())
            .await
            .unwrap();
        let plan = store.plan_summary(batch).await.unwrap().unwrap();
        assert_eq!(plan.status, JobStatus::Failed);
        assert_eq!(plan.counters.n_success, 1);
        assert_eq!(plan.counters.n_failed, 1);

        let won = store
            .commit_summary(batch, plan.status, plan.counters, OutputFiles::new())
            .await
            .unwrap();
        assert!(won);
        // The loser of the race finds the batch terminal and skips.
        let won_again = store
            .commit_summary(batch, plan.status, plan.counters, OutputFiles::new())
            .await
            .unwrap();
        assert!(!won_again);
        assert!(store.plan_summary(batch).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn abort_preserves_finished_rows() {
        let store = MemoryStore::new();
        let batch = store
            .insert_batch(sample_batch(false), sample_rows(3))
            .await
            .unwrap();
        let claimed = store
            .claim_rows(1, WorkerId::random(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .complete_row(claimed[0].row_id, JobStatus::Success, json!({}), Vec::new())
            .await
            .unwrap();

        let counters = store.abort_batch(batch).await.unwrap();
        assert_eq!(counters.n_success, 1);
        assert_eq!(counters.n_aborted, 2);
        assert_eq!(counters.total(), 3);

        // Idempotent on an already-aborted batch.
        assert_eq!(store.abort_batch(batch).await.unwrap(), counters);

        let record = store.get_batch(batch).await.unwrap();
        assert_eq!(record.status, JobStatus::Aborted);
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn abort_rejects_success_and_failed() {
        let store = MemoryStore::new();
        let batch = store
            .insert_batch(sample_batch(false), sample_rows(1))
            .await
            .unwrap();
        let claimed = store
            .claim_rows(1, WorkerId::random(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .complete_row(claimed[0].row_id, JobStatus::Success, json!({}), Vec::new())
            .await
            .unwrap();
        let plan = store.plan_summary(batch).await.unwrap().unwrap();
        store
            .commit_summary(batch, plan.status, plan.counters, OutputFiles::new())
            .await
            .unwrap();

        let err = store.abort_batch(batch).await.unwrap_err();
        assert!(matches!(err, ConveyorError::AlreadyTerminal { .. }));

        // Distinguishable from a missing batch.
        let err = store
            .abort_batch(BatchId(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::BatchNotFound(_)));
    }

    #[tokio::test]
    async fn list_batches_applies_filters() {
        let store = MemoryStore::new();
        let first = store
            .insert_batch(sample_batch(false), sample_rows(1))
            .await
            .unwrap();
        let held = store
            .insert_batch(
                NewBatch {
                    app: "otherapp".to_string(),
                    op: "report".to_string(),
                    kind: BatchKind::Rows,
                    context: json!({}),
                    hold: true,
                },
                sample_rows(1),
            )
            .await
            .unwrap();

        let all = store.list_batches(BatchFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let emails = store
            .list_batches(BatchFilter {
                app: Some("emailapp".to_string()),
                ..BatchFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].id, first);

        let waiting = store
            .list_batches(BatchFilter {
                status: Some(JobStatus::Wait),
                ..BatchFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, held);

        let none = store
            .list_batches(BatchFilter {
                app: Some("emailapp".to_string()),
                op: Some("report".to_string()),
                ..BatchFilter::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn batch_files_round_trip() {
        let store = MemoryStore::new();
        let id = store
            .insert_batch_file(NewBatchFile {
                object_key: "orders_2026.csv".to_string(),
                size_bytes: 42,
                checksum: "abc".to_string(),
                valid: true,
                batch_id: None,
            })
            .await
            .unwrap();

        let file = store.get_batch_file("orders_2026.csv").await.unwrap();
        assert_eq!(file.id, id);
        assert_eq!(file.size_bytes, 42);
        assert!(file.valid);
    }
}
