//! The batch engine: public API and batch finalisation.
//!
//! An [`Engine`] ties the persistent store, status cache, object store,
//! registry, and output aggregator together. Workers (see [`crate::worker`])
//! share one engine and compete for rows through it; any number of engine
//! processes may run against the same store.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::aggregate::OutputAggregator;
use crate::batch::{
    Batch, BatchCounters, BatchId, BatchKind, BatchResult, DoneSummary, JobStatus,
};
use crate::blob::ObjectStore;
use crate::cache::{status_key, StatusCache};
use crate::config::EngineConfig;
use crate::error::{ConveyorError, Result};
use crate::registry::{
    BatchProcessor, FileChecker, InitBlocks, Initializer, RegisteredProcessor, Registry,
    SlowQueryProcessor,
};
use crate::store::{BatchFilter, NewBatch, NewRow, Store};

/// The batch job engine.
pub struct Engine<S: Store> {
    pub(crate) store: Arc<S>,
    pub(crate) cache: Arc<dyn StatusCache>,
    pub(crate) objects: Arc<dyn ObjectStore>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) aggregator: Arc<OutputAggregator>,
    pub(crate) config: EngineConfig,
    /// At-most-once guard for done-hook dispatch within this process.
    done_dispatched: DashMap<BatchId, ()>,
    /// Initializer blocks used when finalisation runs outside a worker
    /// (the poll-done retry path).
    hook_blocks: Mutex<InitBlocks>,
}

impl<S: Store + 'static> Engine<S> {
    pub fn new(
        store: Arc<S>,
        cache: Arc<dyn StatusCache>,
        objects: Arc<dyn ObjectStore>,
        config: EngineConfig,
    ) -> Self {
        let aggregator = Arc::new(OutputAggregator::new(
            config.resolve_spool_dir(),
            objects.clone(),
            config.buckets.output.clone(),
        ));
        Self {
            store,
            cache,
            objects,
            registry: Arc::new(Registry::new()),
            aggregator,
            config,
            done_dispatched: DashMap::new(),
            hook_blocks: Mutex::new(InitBlocks::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The underlying persistent store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The underlying object store.
    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    pub fn register_processor(
        &self,
        app: &str,
        op: &str,
        processor: Arc<dyn BatchProcessor>,
    ) -> Result<()> {
        self.registry.register_processor(app, op, processor)
    }

    pub fn register_slow_query(
        &self,
        app: &str,
        op: &str,
        processor: Arc<dyn SlowQueryProcessor>,
    ) -> Result<()> {
        self.registry.register_slow_query(app, op, processor)
    }

    pub fn register_initializer(
        &self,
        app: &str,
        initializer: Arc<dyn Initializer>,
    ) -> Result<()> {
        self.registry.register_initializer(app, initializer)
    }

    pub fn register_checker(&self, file_type: &str, checker: Arc<dyn FileChecker>) -> Result<()> {
        self.registry.register_checker(file_type, checker)
    }

    /// Submit a new batch.
    ///
    /// `op` is lowercased before persistence. With `hold` the batch starts in
    /// `wait` and is invisible to workers until [`wait_off`](Engine::wait_off).
    #[tracing::instrument(skip(self, context, rows), fields(row_count = rows.len()))]
    pub async fn submit(
        &self,
        app: &str,
        op: &str,
        context: Value,
        rows: Vec<NewRow>,
        hold: bool,
    ) -> Result<BatchId> {
        if rows.is_empty() {
            return Err(ConveyorError::EmptyBatch);
        }

        let batch = self
            .store
            .insert_batch(
                NewBatch {
                    app: app.to_string(),
                    op: op.to_lowercase(),
                    kind: BatchKind::Rows,
                    context,
                    hold,
                },
                rows,
            )
            .await?;

        tracing::info!(batch = %batch, hold, "batch submitted");
        Ok(batch)
    }

    /// Submit a slow query: a single-row batch sharing the batch machinery.
    #[tracing::instrument(skip(self, context, input))]
    pub async fn submit_slow_query(
        &self,
        app: &str,
        op: &str,
        context: Value,
        input: Value,
    ) -> Result<BatchId> {
        let batch = self
            .store
            .insert_batch(
                NewBatch {
                    app: app.to_string(),
                    op: op.to_lowercase(),
                    kind: BatchKind::SlowQuery,
                    context,
                    hold: false,
                },
                vec![NewRow::new(0, input)],
            )
            .await?;

        tracing::info!(batch = %batch, "slow query submitted");
        Ok(batch)
    }

    /// Append rows to a held batch; with `hold = false` the batch is released
    /// to the queue in the same transaction. Returns the total row count.
    #[tracing::instrument(skip(self, rows), fields(row_count = rows.len()))]
    pub async fn append(&self, batch: BatchId, rows: Vec<NewRow>, hold: bool) -> Result<i64> {
        self.store.append_rows(batch, rows, !hold).await
    }

    /// Release a held batch to the queue. Idempotent when already queued.
    /// Returns the row count.
    #[tracing::instrument(skip(self))]
    pub async fn wait_off(&self, batch: BatchId) -> Result<i64> {
        self.store.release_batch(batch).await
    }

    /// Abort a batch: every row not yet terminal becomes `aborted`, rows that
    /// already finished keep their outcome. Returns the final counters.
    #[tracing::instrument(skip(self))]
    pub async fn abort(&self, batch: BatchId) -> Result<BatchCounters> {
        let counters = self.store.abort_batch(batch).await?;
        self.aggregator.discard(batch).await;

        let key = status_key(batch);
        if let Err(e) = self
            .cache
            .set(&key, JobStatus::Aborted.as_str(), self.config.terminal_ttl())
            .await
        {
            tracing::warn!(batch = %batch, error = %e, "failed to cache aborted status");
        }

        tracing::info!(batch = %batch, n_aborted = counters.n_aborted, "batch aborted");
        Ok(counters)
    }

    /// Poll a batch's progress.
    ///
    /// Non-terminal batches report only their status (served from the status
    /// cache when fresh). Terminal batches report per-row outcomes, counters,
    /// and the output-files map.
    #[tracing::instrument(skip(self))]
    pub async fn poll_done(&self, batch: BatchId) -> Result<BatchResult> {
        let key = status_key(batch);

        // Cache errors degrade to a store read.
        if let Ok(Some(cached)) = self.cache.get(&key).await {
            if let Ok(status) = cached.parse::<JobStatus>() {
                if !status.is_terminal() {
                    return Ok(BatchResult::pending(batch, status));
                }
            }
        }

        let mut record = self.store.get_batch(batch).await?;

        if !record.status.is_terminal() {
            // All rows terminal but the batch is not: aggregation was delayed
            // (e.g. the object store was unavailable). Retry it now.
            let pending = self.store.get_pending_rows(batch).await?;
            if pending.is_empty() {
                let mut blocks = self.hook_blocks.lock().await;
                match self.try_finalize(batch, &mut blocks).await {
                    Ok(true) => record = self.store.get_batch(batch).await?,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(batch = %batch, error = %e, "deferred finalisation failed")
                    }
                }
            }
        }

        if record.status.is_terminal() {
            if let Err(e) = self
                .cache
                .set(&key, record.status.as_str(), self.config.terminal_ttl())
                .await
            {
                tracing::warn!(batch = %batch, error = %e, "failed to cache terminal status");
            }

            let rows = self.store.get_rows(batch).await?;
            return Ok(BatchResult {
                batch_id: batch,
                status: record.status,
                counters: record.counters,
                output_files: record.output_files,
                rows,
            });
        }

        // Refresh the cache only if nobody beat us to it, so a concurrent
        // terminal write is never clobbered with a stale status.
        let _ = self
            .cache
            .cas(&key, None, record.status.as_str(), self.config.status_ttl)
            .await;

        Ok(BatchResult::pending(batch, record.status))
    }

    /// List batches matching a filter, newest first.
    pub async fn list_batches(&self, filter: BatchFilter) -> Result<Vec<Batch>> {
        self.store.list_batches(filter).await
    }

    /// Fetch the bytes of one aggregated output artifact of a terminal batch.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_output(&self, batch: BatchId, filename: &str) -> Result<Vec<u8>> {
        let record = self.store.get_batch(batch).await?;
        let key = record.output_files.get(filename).ok_or_else(|| {
            ConveyorError::OutputNotFound {
                batch,
                filename: filename.to_string(),
            }
        })?;
        self.objects.get(&self.config.buckets.output, key).await
    }

    /// Attempt to finalise a batch whose rows may all be terminal.
    ///
    /// Runs the summarizer: plan under lock, aggregate outputs, commit under
    /// lock. Exactly one caller wins the commit; the winner refreshes the
    /// cache and dispatches the done hook. Returns whether this call won.
    pub(crate) async fn try_finalize(
        &self,
        batch: BatchId,
        blocks: &mut InitBlocks,
    ) -> Result<bool> {
        let Some(plan) = self.store.plan_summary(batch).await? else {
            return Ok(false);
        };

        // Object-store failure propagates here and leaves the batch
        // in-progress with all rows terminal; poll_done retries later.
        let output_files = self.aggregator.finalize(batch).await?;

        let won = self
            .store
            .commit_summary(batch, plan.status, plan.counters, output_files.clone())
            .await?;
        if !won {
            return Ok(false);
        }

        tracing::info!(
            batch = %batch,
            status = %plan.status,
            n_success = plan.counters.n_success,
            n_failed = plan.counters.n_failed,
            n_aborted = plan.counters.n_aborted,
            "batch finalised"
        );

        let key = status_key(batch);
        if let Err(e) = self
            .cache
            .set(&key, plan.status.as_str(), self.config.terminal_ttl())
            .await
        {
            tracing::warn!(batch = %batch, error = %e, "failed to cache terminal status");
        }

        let summary = DoneSummary {
            batch_id: batch,
            status: plan.status,
            counters: plan.counters,
            output_files,
        };
        self.dispatch_done(batch, summary, blocks).await;

        Ok(true)
    }

    /// Invoke the processor's terminal callback at most once per batch
    /// terminal transition within this process. Failures are logged and never
    /// revert the terminal state.
    async fn dispatch_done(&self, batch: BatchId, summary: DoneSummary, blocks: &mut InitBlocks) {
        if self.done_dispatched.insert(batch, ()).is_some() {
            return;
        }

        let record = match self.store.get_batch(batch).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(batch = %batch, error = %e, "failed to load batch for done hook");
                return;
            }
        };

        let processor = match self.registry.resolve(&record.app, &record.op) {
            Ok(processor) => processor,
            Err(_) => {
                // No processor in this process (e.g. a pure API node); the
                // hook fires wherever the processor is registered.
                tracing::debug!(batch = %batch, "no local processor, skipping done hook");
                return;
            }
        };

        let init = match blocks.get_or_init(&self.registry, &record.app).await {
            Ok(init) => init,
            Err(e) => {
                tracing::error!(batch = %batch, error = %e, "failed to build init block for done hook");
                return;
            }
        };

        let hook_result = match processor {
            RegisteredProcessor::Rows(p) => p.done(init, &record.context, &summary).await,
            RegisteredProcessor::SlowQuery(p) => p.done(init, &record.context, &summary).await,
        };

        if let Err(e) = hook_result {
            tracing::error!(batch = %batch, error = %e, "done hook failed");
        }
    }
}
