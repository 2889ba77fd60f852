//! Processor registry and per-worker initializer blocks.
//!
//! Processors are resolved by `(app, op)` string key, with `op` compared
//! case-insensitively. The maps are written at registration time; steady-state
//! reads take no locks. Each worker owns its initializer blocks exclusively:
//! blocks are created lazily on the first row for an app, probed for liveness
//! before reuse, and released on shutdown.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::batch::{DoneSummary, RowOutcome, SlowOutcome};
use crate::error::{ConveyorError, Result};
use crate::store::NewRow;

/// Per-worker, per-app resource bundle (e.g. a connection).
///
/// Processors downcast through [`as_any`](InitBlock::as_any) to reach their
/// concrete bundle type.
#[async_trait]
pub trait InitBlock: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Liveness probe; a dead block is closed and replaced on next use.
    async fn is_alive(&self) -> bool {
        true
    }

    /// Release the underlying resources.
    async fn close(&self) {}
}

/// Factory constructing an app's [`InitBlock`] for one worker.
#[async_trait]
pub trait Initializer: Send + Sync {
    async fn init(&self, app: &str) -> Result<Box<dyn InitBlock>>;
}

/// Init block for processors that need no per-worker resources.
pub struct NoopInitBlock;

#[async_trait]
impl InitBlock for NoopInitBlock {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Initializer producing [`NoopInitBlock`]s.
pub struct NoopInitializer;

#[async_trait]
impl Initializer for NoopInitializer {
    async fn init(&self, _app: &str) -> Result<Box<dyn InitBlock>> {
        Ok(Box::new(NoopInitBlock))
    }
}

/// User-supplied row processor.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    /// Process one row. The returned status must be terminal; returning `Err`
    /// fails the row with a synthetic message entry.
    async fn process(
        &self,
        init: &dyn InitBlock,
        context: &Value,
        line: i32,
        input: &Value,
    ) -> Result<RowOutcome>;

    /// Terminal callback, invoked at most once per batch terminal transition.
    async fn done(
        &self,
        _init: &dyn InitBlock,
        _context: &Value,
        _summary: &DoneSummary,
    ) -> Result<()> {
        Ok(())
    }
}

/// User-supplied slow-query processor.
///
/// Slow queries upload their own artifacts and return the object keys in the
/// outcome instead of emitting fragments.
#[async_trait]
pub trait SlowQueryProcessor: Send + Sync {
    async fn run(&self, init: &dyn InitBlock, context: &Value, input: &Value)
        -> Result<SlowOutcome>;

    /// Terminal callback, invoked at most once per batch terminal transition.
    async fn done(
        &self,
        _init: &dyn InitBlock,
        _context: &Value,
        _summary: &DoneSummary,
    ) -> Result<()> {
        Ok(())
    }
}

/// Decision returned by a file checker.
pub enum FileCheck {
    /// Admit the file: submit `rows` to `(app, op)` with the (possibly
    /// transformed) context.
    Accepted {
        context: Value,
        rows: Vec<NewRow>,
        app: String,
        op: String,
    },
    /// Reject the file with a diagnostic.
    Rejected { reason: String },
}

/// User-supplied validator turning an intake file into a batch submission.
#[async_trait]
pub trait FileChecker: Send + Sync {
    async fn check(&self, contents: &[u8], filename: &str, context: &Value) -> Result<FileCheck>;
}

/// A registered processor: row batch or slow query.
#[derive(Clone)]
pub enum RegisteredProcessor {
    Rows(Arc<dyn BatchProcessor>),
    SlowQuery(Arc<dyn SlowQueryProcessor>),
}

impl std::fmt::Debug for RegisteredProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisteredProcessor::Rows(_) => write!(f, "RegisteredProcessor::Rows"),
            RegisteredProcessor::SlowQuery(_) => write!(f, "RegisteredProcessor::SlowQuery"),
        }
    }
}

impl std::fmt::Debug for dyn InitBlock + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<InitBlock>")
    }
}

impl std::fmt::Debug for dyn FileChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<FileChecker>")
    }
}

/// Process-local maps from `(app, op)` to processors, `app` to initializers,
/// and file type to checkers.
#[derive(Default)]
pub struct Registry {
    processors: DashMap<(String, String), RegisteredProcessor>,
    initializers: DashMap<String, Arc<dyn Initializer>>,
    checkers: DashMap<String, Arc<dyn FileChecker>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_processor(
        &self,
        app: &str,
        op: &str,
        processor: Arc<dyn BatchProcessor>,
    ) -> Result<()> {
        self.insert_processor(app, op, RegisteredProcessor::Rows(processor))
    }

    pub fn register_slow_query(
        &self,
        app: &str,
        op: &str,
        processor: Arc<dyn SlowQueryProcessor>,
    ) -> Result<()> {
        self.insert_processor(app, op, RegisteredProcessor::SlowQuery(processor))
    }

    fn insert_processor(&self, app: &str, op: &str, processor: RegisteredProcessor) -> Result<()> {
        let key = (app.to_string(), op.to_lowercase());
        match self.processors.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ConveyorError::DuplicateProcessor {
                app: app.to_string(),
                op: op.to_lowercase(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(processor);
                Ok(())
            }
        }
    }

    pub fn register_initializer(&self, app: &str, initializer: Arc<dyn Initializer>) -> Result<()> {
        match self.initializers.entry(app.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ConveyorError::DuplicateInitializer {
                    app: app.to_string(),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(initializer);
                Ok(())
            }
        }
    }

    pub fn register_checker(&self, file_type: &str, checker: Arc<dyn FileChecker>) -> Result<()> {
        match self.checkers.entry(file_type.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ConveyorError::DuplicateChecker {
                file_type: file_type.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(checker);
                Ok(())
            }
        }
    }

    /// Resolve the processor for `(app, op)`; `op` is matched case-insensitively.
    pub fn resolve(&self, app: &str, op: &str) -> Result<RegisteredProcessor> {
        self.processors
            .get(&(app.to_string(), op.to_lowercase()))
            .map(|entry| entry.clone())
            .ok_or_else(|| ConveyorError::UnknownProcessor {
                app: app.to_string(),
                op: op.to_lowercase(),
            })
    }

    pub fn initializer(&self, app: &str) -> Result<Arc<dyn Initializer>> {
        self.initializers
            .get(app)
            .map(|entry| entry.clone())
            .ok_or_else(|| ConveyorError::UnknownInitializer {
                app: app.to_string(),
            })
    }

    pub fn checker(&self, file_type: &str) -> Result<Arc<dyn FileChecker>> {
        self.checkers
            .get(file_type)
            .map(|entry| entry.clone())
            .ok_or_else(|| ConveyorError::UnknownFileType {
                file_type: file_type.to_string(),
            })
    }
}

/// Initializer blocks owned by a single thread of control.
///
/// Blocks are created on first use for an app and reused for subsequent rows.
/// A block that fails its liveness probe is closed and rebuilt.
#[derive(Default)]
pub struct InitBlocks {
    blocks: HashMap<String, Box<dyn InitBlock>>,
}

impl InitBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_init(
        &mut self,
        registry: &Registry,
        app: &str,
    ) -> Result<&dyn InitBlock> {
        let usable = match self.blocks.get(app) {
            Some(block) => block.is_alive().await,
            None => false,
        };

        if !usable {
            if let Some(dead) = self.blocks.remove(app) {
                tracing::warn!(app, "initializer block failed liveness probe, rebuilding");
                dead.close().await;
            }
            let block = registry.initializer(app)?.init(app).await?;
            self.blocks.insert(app.to_string(), block);
        }

        Ok(self.blocks[app].as_ref())
    }

    /// Release every block. Called on worker shutdown.
    pub async fn close_all(&mut self) {
        for (app, block) in self.blocks.drain() {
            tracing::debug!(app, "closing initializer block");
            block.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Echo;

    #[async_trait]
    impl BatchProcessor for Echo {
        async fn process(
            &self,
            _init: &dyn InitBlock,
            _context: &Value,
            _line: i32,
            input: &Value,
        ) -> Result<RowOutcome> {
            Ok(RowOutcome::success(input.clone()))
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = Registry::new();
        registry
            .register_processor("emailapp", "SendBulkEmail", Arc::new(Echo))
            .unwrap();

        // Same op under different casing collides.
        let err = registry
            .register_processor("emailapp", "sendbulkemail", Arc::new(Echo))
            .unwrap_err();
        assert!(matches!(err, ConveyorError::DuplicateProcessor { .. }));

        let err = registry
            .register_initializer("emailapp", Arc::new(NoopInitializer))
            .and_then(|_| registry.register_initializer("emailapp", Arc::new(NoopInitializer)))
            .unwrap_err();
        assert!(matches!(err, ConveyorError::DuplicateInitializer { .. }));
    }

    #[test]
    fn ops_resolve_case_insensitively() {
        let registry = Registry::new();
        registry
            .register_processor("emailapp", "SendBulkEmail", Arc::new(Echo))
            .unwrap();

        assert!(registry.resolve("emailapp", "SENDBULKEMAIL").is_ok());
        assert!(registry.resolve("emailapp", "sendbulkemail").is_ok());
        let err = registry.resolve("emailapp", "other").unwrap_err();
        assert!(matches!(err, ConveyorError::UnknownProcessor { .. }));
    }

    struct ProbedBlock {
        alive: Arc<AtomicBool>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl InitBlock for ProbedBlock {
        fn as_any(&self) -> &dyn Any {
            self
        }

        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ProbedInitializer {
        alive: Arc<AtomicBool>,
        closed: Arc<AtomicUsize>,
        created: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Initializer for ProbedInitializer {
        async fn init(&self, _app: &str) -> Result<Box<dyn InitBlock>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ProbedBlock {
                alive: self.alive.clone(),
                closed: self.closed.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn blocks_are_reused_until_dead() {
        let alive = Arc::new(AtomicBool::new(true));
        let closed = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));

        let registry = Registry::new();
        registry
            .register_initializer(
                "emailapp",
                Arc::new(ProbedInitializer {
                    alive: alive.clone(),
                    closed: closed.clone(),
                    created: created.clone(),
                }),
            )
            .unwrap();

        let mut blocks = InitBlocks::new();
        blocks.get_or_init(&registry, "emailapp").await.unwrap();
        blocks.get_or_init(&registry, "emailapp").await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);

        // A failed probe replaces the block.
        alive.store(false, Ordering::SeqCst);
        blocks.get_or_init(&registry, "emailapp").await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        alive.store(true, Ordering::SeqCst);
        blocks.close_all().await;
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_initializer_is_a_distinct_error() {
        let registry = Registry::new();
        let mut blocks = InitBlocks::new();
        let err = blocks.get_or_init(&registry, "ghost").await.unwrap_err();
        assert!(matches!(err, ConveyorError::UnknownInitializer { .. }));
    }

    #[tokio::test]
    async fn checker_lookup() {
        struct AcceptAll;

        #[async_trait]
        impl FileChecker for AcceptAll {
            async fn check(
                &self,
                _contents: &[u8],
                _filename: &str,
                context: &Value,
            ) -> Result<FileCheck> {
                Ok(FileCheck::Accepted {
                    context: context.clone(),
                    rows: vec![NewRow::new(1, json!({}))],
                    app: "app".into(),
                    op: "op".into(),
                })
            }
        }

        let registry = Registry::new();
        registry
            .register_checker("csv", Arc::new(AcceptAll))
            .unwrap();
        assert!(registry.checker("csv").is_ok());
        assert!(matches!(
            registry.checker("xml").unwrap_err(),
            ConveyorError::UnknownFileType { .. }
        ));
        assert!(matches!(
            registry.register_checker("csv", Arc::new(AcceptAll)).unwrap_err(),
            ConveyorError::DuplicateChecker { .. }
        ));
    }
}
