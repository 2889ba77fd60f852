//! PostgreSQL implementation of the [`Store`] trait.
//!
//! Claim uses `SELECT ... FOR UPDATE SKIP LOCKED` so competing workers never
//! receive the same row, with the selection widened to stale `inprog` claims
//! as the crash-recovery path. All multi-step mutations run in a transaction;
//! serialization conflicts are retried up to a configured bound.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::batch::{
    Batch, BatchCounters, BatchFile, BatchId, BatchKind, BatchRow, JobStatus, MessageEntry,
    OutputFiles, RowId, WorkerId,
};
use crate::error::{ConveyorError, Result};

use super::{BatchFilter, ClaimedRow, NewBatch, NewBatchFile, NewRow, Store, SummaryPlan};

/// PostgreSQL-backed store.
pub struct PostgresStore {
    pool: PgPool,
    conflict_retries: u32,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            conflict_retries: 50,
        }
    }

    /// Set the bound on serialization-conflict retries.
    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ConveyorError::Other(anyhow::anyhow!("migration failed: {e}")))?;
        Ok(())
    }

    /// Run `op` with bounded retries on serialization conflicts.
    async fn with_retries<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Err(ConveyorError::Database(err))
                    if is_conflict(&err) && attempt < self.conflict_retries =>
                {
                    attempt += 1;
                    tracing::debug!(attempt, error = %err, "retrying store operation after conflict");
                }
                other => return other,
            }
        }
    }

    async fn do_insert_batch(&self, batch: &NewBatch, rows: &[NewRow]) -> Result<BatchId> {
        let status = if batch.hold {
            JobStatus::Wait
        } else {
            JobStatus::Queued
        };

        let mut tx = self.pool.begin().await?;

        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO batches (app, op, kind, context, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&batch.app)
        .bind(&batch.op)
        .bind(batch.kind.as_str())
        .bind(&batch.context)
        .bind(status.as_str())
        .fetch_one(&mut *tx)
        .await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO batch_rows (batch_id, line, status, input)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(id)
            .bind(row.line)
            .bind(status.as_str())
            .bind(&row.input)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(BatchId(id))
    }

    async fn do_append_rows(
        &self,
        batch: BatchId,
        rows: &[NewRow],
        release: bool,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let status = lock_batch_status(&mut tx, batch).await?;
        if status != JobStatus::Wait {
            return Err(ConveyorError::NotHeld { batch, status });
        }

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO batch_rows (batch_id, line, status, input)
                VALUES ($1, $2, 'wait', $3)
                "#,
            )
            .bind(*batch)
            .bind(row.line)
            .bind(&row.input)
            .execute(&mut *tx)
            .await?;
        }

        if release {
            queue_waiting(&mut tx, batch).await?;
        }

        let count = count_rows(&mut tx, batch).await?;
        tx.commit().await?;
        Ok(count)
    }

    async fn do_release_batch(&self, batch: BatchId) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let status = lock_batch_status(&mut tx, batch).await?;
        match status {
            JobStatus::Queued => {}
            JobStatus::Wait => queue_waiting(&mut tx, batch).await?,
            _ => return Err(ConveyorError::NotReleasable { batch, status }),
        }

        let count = count_rows(&mut tx, batch).await?;
        tx.commit().await?;
        Ok(count)
    }

    async fn do_claim_rows(
        &self,
        chunk: usize,
        worker: WorkerId,
        reclaim_after: Duration,
    ) -> Result<Vec<ClaimedRow>> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<PgRow> = sqlx::query(
            r#"
            WITH picked AS (
                SELECT id
                FROM batch_rows
                WHERE status = 'queued'
                   OR (status = 'inprog'
                       AND claimed_at < now() - ($3 || ' milliseconds')::interval)
                ORDER BY id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            ), claimed AS (
                UPDATE batch_rows r
                SET status = 'inprog', worker_id = $1, claimed_at = now()
                FROM picked p
                WHERE r.id = p.id
                RETURNING r.id, r.batch_id, r.line, r.input
            )
            SELECT c.id, c.batch_id, c.line, c.input, b.app, b.op, b.kind, b.context
            FROM claimed c
            JOIN batches b ON b.id = c.batch_id
            ORDER BY c.id ASC
            "#,
        )
        .bind(worker.0)
        .bind(chunk as i64)
        .bind((reclaim_after.as_millis() as i64).to_string())
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        let mut batch_ids = Vec::new();
        for row in rows {
            let batch_id: Uuid = row.try_get("batch_id")?;
            if !batch_ids.contains(&batch_id) {
                batch_ids.push(batch_id);
            }
            claimed.push(ClaimedRow {
                row_id: RowId(row.try_get::<i64, _>("id")?),
                batch_id: BatchId(batch_id),
                app: row.try_get("app")?,
                op: row.try_get("op")?,
                kind: parse_kind(row.try_get::<String, _>("kind")?)?,
                context: row.try_get("context")?,
                line: row.try_get("line")?,
                input: row.try_get("input")?,
            });
        }

        if !batch_ids.is_empty() {
            sqlx::query(
                r#"
                UPDATE batches SET status = 'inprog'
                WHERE id = ANY($1) AND status = 'queued'
                "#,
            )
            .bind(&batch_ids)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn do_complete_row(
        &self,
        row: RowId,
        status: JobStatus,
        result: &Value,
        messages: &Value,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> = sqlx::query_scalar(
            "SELECT status FROM batch_rows WHERE id = $1 FOR UPDATE",
        )
        .bind(row.0)
        .fetch_optional(&mut *tx)
        .await?;

        let current = parse_status(current.ok_or(ConveyorError::RowNotFound(row))?)?;
        if current.is_terminal() {
            return Err(ConveyorError::InvalidTransition {
                from: current,
                to: status,
            });
        }

        sqlx::query(
            r#"
            UPDATE batch_rows
            SET status = $2, result = $3, messages = $4, completed_at = now()
            WHERE id = $1
            "#,
        )
        .bind(row.0)
        .bind(status.as_str())
        .bind(result)
        .bind(messages)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn do_plan_summary(&self, batch: BatchId) -> Result<Option<SummaryPlan>> {
        let mut tx = self.pool.begin().await?;

        let status = lock_batch_status(&mut tx, batch).await?;
        if status.is_terminal() {
            return Ok(None);
        }

        let Some(counters) = terminal_counters(&mut tx, batch).await? else {
            return Ok(None);
        };

        // Nothing written: the lock is only held long enough to take a
        // consistent reading.
        tx.commit().await?;
        Ok(Some(SummaryPlan {
            status: counters.derive_status(),
            counters,
        }))
    }

    async fn do_commit_summary(
        &self,
        batch: BatchId,
        status: JobStatus,
        counters: BatchCounters,
        output_files: &Value,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let current = lock_batch_status(&mut tx, batch).await?;
        if current.is_terminal() {
            return Ok(false);
        }
        if terminal_counters(&mut tx, batch).await?.is_none() {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE batches
            SET status = $2, n_success = $3, n_failed = $4, n_aborted = $5,
                output_files = $6, completed_at = now()
            WHERE id = $1
            "#,
        )
        .bind(*batch)
        .bind(status.as_str())
        .bind(counters.n_success)
        .bind(counters.n_failed)
        .bind(counters.n_aborted)
        .bind(output_files)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn do_abort_batch(&self, batch: BatchId) -> Result<BatchCounters> {
        let mut tx = self.pool.begin().await?;

        let record = lock_batch(&mut tx, batch).await?;
        match record.status {
            JobStatus::Aborted => {
                return Ok(record.counters.unwrap_or_default());
            }
            JobStatus::Success | JobStatus::Failed => {
                return Err(ConveyorError::AlreadyTerminal {
                    batch,
                    status: record.status,
                });
            }
            _ => {}
        }

        sqlx::query(
            r#"
            UPDATE batch_rows
            SET status = 'aborted', completed_at = now()
            WHERE batch_id = $1 AND status IN ('wait', 'queued', 'inprog')
            "#,
        )
        .bind(*batch)
        .execute(&mut *tx)
        .await?;

        let counters = count_terminal(&mut tx, batch).await?;

        sqlx::query(
            r#"
            UPDATE batches
            SET status = 'aborted', n_success = $2, n_failed = $3, n_aborted = $4,
                completed_at = now()
            WHERE id = $1
            "#,
        )
        .bind(*batch)
        .bind(counters.n_success)
        .bind(counters.n_failed)
        .bind(counters.n_aborted)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(counters)
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn insert_batch(&self, batch: NewBatch, rows: Vec<NewRow>) -> Result<BatchId> {
        self.with_retries(|| self.do_insert_batch(&batch, &rows)).await
    }

    async fn append_rows(&self, batch: BatchId, rows: Vec<NewRow>, release: bool) -> Result<i64> {
        self.with_retries(|| self.do_append_rows(batch, &rows, release))
            .await
    }

    async fn release_batch(&self, batch: BatchId) -> Result<i64> {
        self.with_retries(|| self.do_release_batch(batch)).await
    }

    async fn claim_rows(
        &self,
        chunk: usize,
        worker: WorkerId,
        reclaim_after: Duration,
    ) -> Result<Vec<ClaimedRow>> {
        self.with_retries(|| self.do_claim_rows(chunk, worker, reclaim_after))
            .await
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
        let messages = serde_json::to_value(&messages)?;
        self.with_retries(|| self.do_complete_row(row, status, &result, &messages))
            .await
    }

    async fn plan_summary(&self, batch: BatchId) -> Result<Option<SummaryPlan>> {
        self.with_retries(|| self.do_plan_summary(batch)).await
    }

    async fn commit_summary(
        &self,
        batch: BatchId,
        status: JobStatus,
        counters: BatchCounters,
        output_files: OutputFiles,
    ) -> Result<bool> {
        let output_files = serde_json::to_value(&output_files)?;
        self.with_retries(|| self.do_commit_summary(batch, status, counters, &output_files))
            .await
    }

    async fn abort_batch(&self, batch: BatchId) -> Result<BatchCounters> {
        self.with_retries(|| self.do_abort_batch(batch)).await
    }

    async fn get_batch(&self, batch: BatchId) -> Result<Batch> {
        let row = sqlx::query(
            r#"
            SELECT id, app, op, kind, context, status, requested_at, completed_at,
                   n_success, n_failed, n_aborted, output_files
            FROM batches
            WHERE id = $1
            "#,
        )
        .bind(*batch)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ConveyorError::BatchNotFound(batch))?;

        batch_from_row(&row)
    }

    async fn list_batches(&self, filter: BatchFilter) -> Result<Vec<Batch>> {
        // Build the WHERE clause from whichever filters are present.
        let mut clauses = Vec::new();
        let mut params: Vec<String> = Vec::new();

        if let Some(app) = filter.app {
            params.push(app);
            clauses.push(format!("app = ${}", params.len()));
        }
        if let Some(op) = filter.op {
            params.push(op);
            clauses.push(format!("op = ${}", params.len()));
        }
        if let Some(status) = filter.status {
            params.push(status.as_str().to_string());
            clauses.push(format!("status = ${}", params.len()));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let query = format!(
            r#"
            SELECT id, app, op, kind, context, status, requested_at, completed_at,
                   n_success, n_failed, n_aborted, output_files
            FROM batches
            {where_clause}
            ORDER BY requested_at DESC
            "#,
        );

        let mut query_builder = sqlx::query(&query);
        for param in &params {
            query_builder = query_builder.bind(param);
        }

        let rows = query_builder.fetch_all(&self.pool).await?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn get_rows(&self, batch: BatchId) -> Result<Vec<BatchRow>> {
        // Existence check keeps not-found distinguishable from empty.
        self.get_batch(batch).await?;

        let rows = sqlx::query(
            r#"
            SELECT id, batch_id, line, status, input, result, messages,
                   worker_id, claimed_at, requested_at, completed_at
            FROM batch_rows
            WHERE batch_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(*batch)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_from_row).collect()
    }

    async fn get_pending_rows(&self, batch: BatchId) -> Result<Vec<BatchRow>> {
        self.get_batch(batch).await?;

        let rows = sqlx::query(
            r#"
            SELECT id, batch_id, line, status, input, result, messages,
                   worker_id, claimed_at, requested_at, completed_at
            FROM batch_rows
            WHERE batch_id = $1 AND status IN ('wait', 'queued', 'inprog')
            ORDER BY id ASC
            "#,
        )
        .bind(*batch)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_from_row).collect()
    }

    async fn insert_batch_file(&self, file: NewBatchFile) -> Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO batch_files (object_key, size_bytes, checksum, valid, batch_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&file.object_key)
        .bind(file.size_bytes)
        .bind(&file.checksum)
        .bind(file.valid)
        .bind(file.batch_id.map(|b| b.0))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_batch_file(&self, object_key: &str) -> Result<BatchFile> {
        let row = sqlx::query(
            r#"
            SELECT id, object_key, size_bytes, checksum, received_at, valid, batch_id
            FROM batch_files
            WHERE object_key = $1
            ORDER BY received_at DESC
            LIMIT 1
            "#,
        )
        .bind(object_key)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            ConveyorError::Other(anyhow::anyhow!("batch file not found: {object_key}"))
        })?;

        Ok(BatchFile {
            id: row.try_get("id")?,
            object_key: row.try_get("object_key")?,
            size_bytes: row.try_get("size_bytes")?,
            checksum: row.try_get("checksum")?,
            received_at: row.try_get("received_at")?,
            valid: row.try_get("valid")?,
            batch_id: row
                .try_get::<Option<Uuid>, _>("batch_id")?
                .map(BatchId),
        })
    }
}

type PgTx<'a> = sqlx::Transaction<'a, sqlx::Postgres>;

/// Lock a batch record and return its status.
async fn lock_batch_status(tx: &mut PgTx<'_>, batch: BatchId) -> Result<JobStatus> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM batches WHERE id = $1 FOR UPDATE")
            .bind(*batch)
            .fetch_optional(&mut **tx)
            .await?;
    parse_status(status.ok_or(ConveyorError::BatchNotFound(batch))?)
}

/// Lock a batch record and return the full row.
async fn lock_batch(tx: &mut PgTx<'_>, batch: BatchId) -> Result<Batch> {
    let row = sqlx::query(
        r#"
        SELECT id, app, op, kind, context, status, requested_at, completed_at,
               n_success, n_failed, n_aborted, output_files
        FROM batches
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(*batch)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(ConveyorError::BatchNotFound(batch))?;

    batch_from_row(&row)
}

/// Flip a waiting batch and its waiting rows to queued.
async fn queue_waiting(tx: &mut PgTx<'_>, batch: BatchId) -> Result<()> {
    sqlx::query("UPDATE batches SET status = 'queued' WHERE id = $1")
        .bind(*batch)
        .execute(&mut **tx)
        .await?;
    sqlx::query("UPDATE batch_rows SET status = 'queued' WHERE batch_id = $1 AND status = 'wait'")
        .bind(*batch)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn count_rows(tx: &mut PgTx<'_>, batch: BatchId) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM batch_rows WHERE batch_id = $1")
        .bind(*batch)
        .fetch_one(&mut **tx)
        .await?;
    Ok(count)
}

/// Count terminal rows per status; `None` when any row is still outstanding.
async fn terminal_counters(tx: &mut PgTx<'_>, batch: BatchId) -> Result<Option<BatchCounters>> {
    let pending: i64 = sqlx::query_scalar(
        r#"
        SELECT count(*) FROM batch_rows
        WHERE batch_id = $1 AND status IN ('wait', 'queued', 'inprog')
        "#,
    )
    .bind(*batch)
    .fetch_one(&mut **tx)
    .await?;

    if pending > 0 {
        return Ok(None);
    }
    Ok(Some(count_terminal(tx, batch).await?))
}

async fn count_terminal(tx: &mut PgTx<'_>, batch: BatchId) -> Result<BatchCounters> {
    let row = sqlx::query(
        r#"
        SELECT
            count(*) FILTER (WHERE status = 'success') AS n_success,
            count(*) FILTER (WHERE status = 'failed')  AS n_failed,
            count(*) FILTER (WHERE status = 'aborted') AS n_aborted
        FROM batch_rows
        WHERE batch_id = $1
        "#,
    )
    .bind(*batch)
    .fetch_one(&mut **tx)
    .await?;

    Ok(BatchCounters {
        n_success: row.try_get("n_success")?,
        n_failed: row.try_get("n_failed")?,
        n_aborted: row.try_get("n_aborted")?,
    })
}

fn batch_from_row(row: &PgRow) -> Result<Batch> {
    let status = parse_status(row.try_get::<String, _>("status")?)?;
    let n_success: Option<i64> = row.try_get("n_success")?;
    let counters = n_success.map(|n_success| {
        Ok::<_, ConveyorError>(BatchCounters {
            n_success,
            n_failed: row.try_get("n_failed")?,
            n_aborted: row.try_get("n_aborted")?,
        })
    });
    let counters = match counters {
        Some(result) => Some(result?),
        None => None,
    };

    let output_files: Option<Value> = row.try_get("output_files")?;
    let output_files: OutputFiles = match output_files {
        Some(value) => serde_json::from_value(value)?,
        None => BTreeMap::new(),
    };

    Ok(Batch {
        id: BatchId(row.try_get("id")?),
        app: row.try_get("app")?,
        op: row.try_get("op")?,
        kind: parse_kind(row.try_get::<String, _>("kind")?)?,
        context: row.try_get("context")?,
        status,
        requested_at: row.try_get("requested_at")?,
        completed_at: row.try_get("completed_at")?,
        counters,
        output_files,
    })
}

fn row_from_row(row: &PgRow) -> Result<BatchRow> {
    let messages: Option<Value> = row.try_get("messages")?;
    let messages: Vec<MessageEntry> = match messages {
        Some(value) => serde_json::from_value(value)?,
        None => Vec::new(),
    };

    Ok(BatchRow {
        id: RowId(row.try_get::<i64, _>("id")?),
        batch_id: BatchId(row.try_get("batch_id")?),
        line: row.try_get("line")?,
        status: parse_status(row.try_get::<String, _>("status")?)?,
        input: row.try_get("input")?,
        result: row.try_get("result")?,
        messages,
        worker_id: row
            .try_get::<Option<Uuid>, _>("worker_id")?
            .map(WorkerId),
        claimed_at: row.try_get::<Option<DateTime<Utc>>, _>("claimed_at")?,
        requested_at: row.try_get("requested_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn parse_status(raw: String) -> Result<JobStatus> {
    JobStatus::from_str(&raw).map_err(|e| ConveyorError::Other(anyhow::anyhow!(e)))
}

fn parse_kind(raw: String) -> Result<BatchKind> {
    BatchKind::from_str(&raw).map_err(|e| ConveyorError::Other(anyhow::anyhow!(e)))
}

/// Serialization failures and deadlocks are worth retrying.
fn is_conflict(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "40001" || code == "40P01")
}
