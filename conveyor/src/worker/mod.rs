//! Workers: the poll loop that claims and executes rows.
//!
//! Every worker is identical and competitive; there is no leader. A poll
//! pass claims up to a chunk of ready rows in one store transaction, then
//! processes the claimed rows sequentially. A pass that claims nothing
//! sleeps for the poll interval; a busy pass only naps briefly. Workers on
//! any number of hosts may run against the same store: claim exclusivity
//! comes from the store's skip-locked selection, and rows abandoned by a
//! crashed worker are swept back in once their claim stamp goes stale.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchKind, JobStatus, MessageEntry, WorkerId};
use crate::engine::Engine;
use crate::error::Result;
use crate::registry::{InitBlocks, RegisteredProcessor};
use crate::store::{ClaimedRow, Store};

/// Handle to a group of running workers.
pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Token that can be cloned into other tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop all workers and wait for them to release their resources.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "worker task panicked");
            }
        }
    }
}

impl<S: Store + 'static> Engine<S> {
    /// Start `count` workers (or the configured default when `None`).
    pub fn start_workers(self: &Arc<Self>, count: Option<usize>) -> WorkerPool {
        let count = count.unwrap_or(self.config.workers);
        let shutdown = CancellationToken::new();
        let rows_in_flight = Arc::new(AtomicUsize::new(0));

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        if let Some(interval) = self.config.status_log_interval {
            let counter = rows_in_flight.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            tracing::debug!(
                                rows_in_flight = counter.load(Ordering::Relaxed),
                                "worker pool status"
                            );
                        }
                    }
                }
            });
        }

        let handles = (0..count)
            .map(|_| {
                let worker = Worker {
                    engine: self.clone(),
                    id: WorkerId::random(),
                    blocks: InitBlocks::new(),
                    rows_in_flight: rows_in_flight.clone(),
                };
                tracing::info!(worker = %worker.id, host = %host, "starting worker");
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();

        WorkerPool { shutdown, handles }
    }
}

struct Worker<S: Store> {
    engine: Arc<Engine<S>>,
    id: WorkerId,
    blocks: InitBlocks,
    rows_in_flight: Arc<AtomicUsize>,
}

impl<S: Store + 'static> Worker<S> {
    #[tracing::instrument(skip(self, shutdown), fields(worker = %self.id))]
    async fn run(mut self, shutdown: CancellationToken) {
        let config = self.engine.config().clone();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let claimed = match self
                .engine
                .store
                .claim_rows(config.chunk_size, self.id, config.reclaim_timeout)
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::error!(error = %e, "claim pass failed");
                    Vec::new()
                }
            };

            if claimed.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => continue,
                }
            }

            tracing::debug!(claimed = claimed.len(), "claimed rows");

            // Rows within one chunk run sequentially on this worker.
            self.rows_in_flight.fetch_add(claimed.len(), Ordering::Relaxed);
            for row in claimed {
                if let Err(e) = self.execute_row(row).await {
                    tracing::error!(error = %e, "row execution failed");
                }
                self.rows_in_flight.fetch_sub(1, Ordering::Relaxed);
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(config.busy_poll_interval) => {}
            }
        }

        self.blocks.close_all().await;
        tracing::info!("worker stopped");
    }

    /// Execute one claimed row: invoke the processor, write the terminal
    /// outcome in its own transaction, and run the summarizer.
    async fn execute_row(&mut self, row: ClaimedRow) -> Result<()> {
        let batch_id = row.batch_id;
        let row_id = row.row_id;

        let (status, result, messages) = self.invoke_processor(&row).await;

        self.engine
            .store
            .complete_row(row_id, status, result, messages)
            .await?;

        tracing::debug!(row = %row_id, batch = %batch_id, status = %status, "row completed");

        if let Err(e) = self.engine.try_finalize(batch_id, &mut self.blocks).await {
            // The batch stays in progress; a later completion or poll retries.
            tracing::warn!(batch = %batch_id, error = %e, "batch finalisation failed");
        }

        Ok(())
    }

    /// Run the processor for a row, mapping every failure mode onto a failed
    /// outcome with a synthetic message entry. Never errors: the row always
    /// reaches a terminal status.
    async fn invoke_processor(
        &mut self,
        row: &ClaimedRow,
    ) -> (JobStatus, Value, Vec<MessageEntry>) {
        let processor = match self.engine.registry.resolve(&row.app, &row.op) {
            Ok(processor) => processor,
            Err(e) => {
                return failed_with("processor_missing", e.to_string());
            }
        };

        let init = match self
            .blocks
            .get_or_init(&self.engine.registry, &row.app)
            .await
        {
            Ok(init) => init,
            Err(e) => {
                return failed_with("initializer_failed", e.to_string());
            }
        };

        match (processor, row.kind) {
            (RegisteredProcessor::Rows(processor), BatchKind::Rows) => {
                match processor.process(init, &row.context, row.line, &row.input).await {
                    Ok(outcome) => {
                        if !outcome.status.is_terminal() {
                            return failed_with(
                                "invalid_status",
                                format!("processor returned non-terminal status {}", outcome.status),
                            );
                        }

                        // Only fragments of successful rows contribute to the
                        // aggregated outputs.
                        if outcome.status == JobStatus::Success {
                            for (filename, bytes) in &outcome.fragments {
                                if let Err(e) = self
                                    .engine
                                    .aggregator
                                    .append(row.batch_id, filename, bytes)
                                    .await
                                {
                                    return failed_with(
                                        "fragment_write_failed",
                                        format!("{filename}: {e}"),
                                    );
                                }
                            }
                        }

                        (outcome.status, outcome.result, outcome.messages)
                    }
                    Err(e) => failed_with("processor_error", e.to_string()),
                }
            }
            (RegisteredProcessor::SlowQuery(processor), BatchKind::SlowQuery) => {
                match processor.run(init, &row.context, &row.input).await {
                    Ok(outcome) => {
                        if !outcome.status.is_terminal() {
                            return failed_with(
                                "invalid_status",
                                format!("processor returned non-terminal status {}", outcome.status),
                            );
                        }

                        if outcome.status == JobStatus::Success {
                            for (filename, key) in &outcome.output_files {
                                self.engine
                                    .aggregator
                                    .note_uploaded(row.batch_id, filename, key);
                            }
                        }

                        (outcome.status, outcome.result, outcome.messages)
                    }
                    Err(e) => failed_with("processor_error", e.to_string()),
                }
            }
            (RegisteredProcessor::Rows(_), BatchKind::SlowQuery)
            | (RegisteredProcessor::SlowQuery(_), BatchKind::Rows) => failed_with(
                "processor_kind_mismatch",
                format!(
                    "batch kind {} does not match the registered processor",
                    row.kind
                ),
            ),
        }
    }
}

fn failed_with(code: &str, detail: String) -> (JobStatus, Value, Vec<MessageEntry>) {
    (
        JobStatus::Failed,
        json!(null),
        vec![MessageEntry::new(code, detail)],
    )
}
