//! Batch job engine with durable queues, competing workers, and aggregated
//! object-store artifacts.
//!
//! A conveyor [`Engine`] accepts large collections of input rows, queues them
//! durably in a relational store, and distributes the work across any number
//! of workers in any number of processes. Each row is processed exactly once
//! by a user-registered [`BatchProcessor`]; per-row outputs can contribute
//! fragments to named files that are aggregated into one object-store
//! artifact per batch. Callers observe progress through a polling lifecycle
//! (`submit` → queued → in progress → terminal) backed by a status cache.
//!
//! A single-row *slow query* mode shares the same scheduler and state
//! machine, and a file intake front-end turns uploaded files into batches
//! through user-registered file checkers.
//!
//! # Example
//! ```ignore
//! use conveyor::{
//!     Engine, EngineConfig, MemoryStore, MokaStatusCache, LocalObjectStore,
//!     BatchProcessor, InitBlock, NoopInitializer, NewRow, RowOutcome,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Arc::new(Engine::new(
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(MokaStatusCache::default()),
//!         Arc::new(LocalObjectStore::new("/var/lib/conveyor".into())),
//!         EngineConfig::default(),
//!     ));
//!
//!     engine.register_processor("emailapp", "sendbulkemail", Arc::new(SendEmails))?;
//!     engine.register_initializer("emailapp", Arc::new(NoopInitializer))?;
//!
//!     let pool = engine.start_workers(None);
//!
//!     let batch = engine
//!         .submit(
//!             "emailapp",
//!             "SendBulkEmail",
//!             serde_json::json!({"sender": "noreply@example.com"}),
//!             vec![NewRow::new(1, serde_json::json!({"to": "a@example.com"}))],
//!             false,
//!         )
//!         .await?;
//!
//!     let result = engine.poll_done(batch).await?;
//!     println!("status: {}", result.status);
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod batch;
pub mod blob;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod intake;
pub mod registry;
pub mod store;
pub mod worker;

pub use batch::{
    Batch, BatchCounters, BatchFile, BatchId, BatchKind, BatchResult, BatchRow, DoneSummary,
    JobStatus, MessageEntry, OutputFiles, RowId, RowOutcome, SlowOutcome, WorkerId,
};
pub use blob::local::LocalObjectStore;
#[cfg(feature = "s3")]
pub use blob::s3::{S3ObjectStore, S3Settings};
pub use blob::ObjectStore;
pub use cache::{MokaStatusCache, StatusCache};
pub use config::{BucketConfig, EngineConfig, WatcherConfig};
pub use engine::Engine;
pub use error::{ConveyorError, Result};
pub use intake::watcher::{DirectoryWatcher, WatchRule};
pub use intake::FileSource;
pub use registry::{
    BatchProcessor, FileCheck, FileChecker, InitBlock, Initializer, NoopInitBlock,
    NoopInitializer, Registry, SlowQueryProcessor,
};
pub use store::memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use store::postgres::PostgresStore;
pub use store::{BatchFilter, ClaimedRow, NewBatch, NewBatchFile, NewRow, Store, SummaryPlan};
pub use worker::WorkerPool;
