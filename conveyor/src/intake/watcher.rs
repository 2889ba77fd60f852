//! Directory watcher feeding the file intake front-end.
//!
//! Periodically scans configured directories for files matching a glob
//! pattern (recursive `**` supported), skips files modified too recently
//! (their writer may still be going), uploads each eligible file to the
//! incoming bucket, and runs it through the intake front-end. The source
//! file is deleted once the intake decision has been durably recorded;
//! rejected bytes survive in the failed bucket.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use glob::Pattern;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::engine::Engine;
use crate::error::{ConveyorError, Result};
use crate::intake::{sanitize_object_key, FileSource};
use crate::store::Store;

/// One watched directory.
#[derive(Debug, Clone)]
pub struct WatchRule {
    pub directory: PathBuf,
    /// Glob matched against paths relative to `directory`, e.g. `**/*.csv`
    pub pattern: String,
    /// File type tag resolving the registered file checker
    pub file_type: String,
    /// Context passed to the checker and, on acceptance, the batch
    pub context: Value,
}

/// Polling watcher over a set of [`WatchRule`]s.
pub struct DirectoryWatcher<S: Store> {
    engine: Arc<Engine<S>>,
    rules: Vec<WatchRule>,
    scan_interval: Duration,
    min_age: Duration,
}

impl<S: Store + 'static> DirectoryWatcher<S> {
    pub fn new(engine: Arc<Engine<S>>, rules: Vec<WatchRule>) -> Self {
        let config = engine.config().watcher.clone();
        Self {
            engine,
            rules,
            scan_interval: config.scan_interval,
            min_age: config.min_age,
        }
    }

    /// Run the scan loop until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(rules = self.rules.len(), "directory watcher starting");
        loop {
            match self.scan_once().await {
                Ok(0) => {}
                Ok(admitted) => tracing::info!(admitted, "watcher pass admitted files"),
                Err(e) => tracing::error!(error = %e, "watcher pass failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.scan_interval) => {}
            }
        }
        tracing::info!("directory watcher stopped");
    }

    /// Scan every rule once. Returns the number of files admitted.
    pub async fn scan_once(&self) -> Result<usize> {
        let mut admitted = 0;
        for rule in &self.rules {
            admitted += self.scan_rule(rule).await?;
        }
        Ok(admitted)
    }

    async fn scan_rule(&self, rule: &WatchRule) -> Result<usize> {
        let pattern = Pattern::new(&rule.pattern)
            .map_err(|e| ConveyorError::Other(anyhow::anyhow!("bad glob pattern: {e}")))?;

        let mut admitted = 0;

        for entry in WalkDir::new(&rule.directory)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&rule.directory) else {
                continue;
            };
            if !pattern.matches_path(relative) {
                continue;
            }

            // Skip files a writer may still be appending to.
            let fresh = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .and_then(|modified| modified.elapsed().ok())
                .is_none_or(|age| age < self.min_age);
            if fresh {
                continue;
            }

            if self.admit_file(rule, entry.path()).await? {
                admitted += 1;
            }
        }

        Ok(admitted)
    }

    /// Upload one file and run it through the intake front-end. Returns
    /// whether a batch was created.
    async fn admit_file(&self, rule: &WatchRule, path: &std::path::Path) -> Result<bool> {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());

        let bytes = tokio::fs::read(path).await?;
        let key = sanitize_object_key(
            &filename,
            self.engine.config().max_object_key_len,
        );

        let incoming = self.engine.config().buckets.incoming.clone();
        self.engine
            .objects
            .put(&incoming, &key, bytes, None)
            .await?;

        match self
            .engine
            .intake_file(
                FileSource::ObjectKey(key.clone()),
                &filename,
                &rule.file_type,
                rule.context.clone(),
            )
            .await
        {
            Ok(batch) => {
                tracing::info!(path = %path.display(), batch = %batch, "watched file admitted");
                remove_source(path).await;
                Ok(true)
            }
            Err(ConveyorError::IntakeRejected { reason, .. }) => {
                // The rejected object now lives in the failed bucket; the
                // source must go or the next pass would re-ingest it.
                tracing::warn!(path = %path.display(), reason, "watched file rejected");
                remove_source(path).await;
                Ok(false)
            }
            Err(e) => {
                // Transient failure: keep the source so a later pass retries.
                tracing::error!(path = %path.display(), error = %e, "watched file intake failed");
                self.engine.objects.delete(&incoming, &key).await.ok();
                Err(e)
            }
        }
    }
}

async fn remove_source(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::error!(path = %path.display(), error = %e, "failed to remove watched file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::RowOutcome;
    use crate::blob::local::LocalObjectStore;
    use crate::cache::MokaStatusCache;
    use crate::config::EngineConfig;
    use crate::registry::{
        BatchProcessor, FileCheck, FileChecker, InitBlock, NoopInitializer,
    };
    use crate::store::memory::MemoryStore;
    use crate::store::NewRow;
    use async_trait::async_trait;
    use serde_json::json;

    struct LineChecker;

    #[async_trait]
    impl FileChecker for LineChecker {
        async fn check(
            &self,
            contents: &[u8],
            _filename: &str,
            context: &Value,
        ) -> Result<FileCheck> {
            let text = String::from_utf8_lossy(contents);
            if text.trim().is_empty() {
                return Ok(FileCheck::Rejected {
                    reason: "empty file".to_string(),
                });
            }
            let rows = text
                .lines()
                .enumerate()
                .map(|(i, line)| NewRow::new(i as i32 + 1, json!({ "line": line })))
                .collect();
            Ok(FileCheck::Accepted {
                context: context.clone(),
                rows,
                app: "fileapp".to_string(),
                op: "ingest".to_string(),
            })
        }
    }

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

    fn test_engine(dir: &std::path::Path) -> Arc<Engine<MemoryStore>> {
        let config = EngineConfig {
            spool_dir: Some(dir.join("spool")),
            watcher: crate::config::WatcherConfig {
                scan_interval: Duration::from_millis(50),
                min_age: Duration::ZERO,
            },
            ..EngineConfig::default()
        };
        let engine = Arc::new(Engine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MokaStatusCache::default()),
            Arc::new(LocalObjectStore::new(dir.join("objects"))),
            config,
        ));
        engine
            .register_checker("lines", Arc::new(LineChecker))
            .unwrap();
        engine
            .register_processor("fileapp", "ingest", Arc::new(Echo))
            .unwrap();
        engine
            .register_initializer("fileapp", Arc::new(NoopInitializer))
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn scan_admits_matching_files_and_removes_sources() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());

        let watch_dir = dir.path().join("drop");
        tokio::fs::create_dir_all(watch_dir.join("nested"))
            .await
            .unwrap();
        tokio::fs::write(watch_dir.join("a.csv"), "one\ntwo")
            .await
            .unwrap();
        tokio::fs::write(watch_dir.join("nested/b.csv"), "three")
            .await
            .unwrap();
        tokio::fs::write(watch_dir.join("ignore.txt"), "nope")
            .await
            .unwrap();

        let watcher = DirectoryWatcher::new(
            engine.clone(),
            vec![WatchRule {
                directory: watch_dir.clone(),
                pattern: "**/*.csv".to_string(),
                file_type: "lines".to_string(),
                context: json!({}),
            }],
        );

        let admitted = watcher.scan_once().await.unwrap();
        assert_eq!(admitted, 2);

        // Matched sources are gone, the unmatched file stays.
        assert!(!watch_dir.join("a.csv").exists());
        assert!(!watch_dir.join("nested/b.csv").exists());
        assert!(watch_dir.join("ignore.txt").exists());

        // Both files were recorded against their batches.
        let file = engine.store.get_batch_file("a.csv").await.unwrap();
        assert!(file.valid);
        assert!(file.batch_id.is_some());

        // A second pass finds nothing new.
        assert_eq!(watcher.scan_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejected_files_move_to_failed_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());

        let watch_dir = dir.path().join("drop");
        tokio::fs::create_dir_all(&watch_dir).await.unwrap();
        tokio::fs::write(watch_dir.join("empty.csv"), "").await.unwrap();

        let watcher = DirectoryWatcher::new(
            engine.clone(),
            vec![WatchRule {
                directory: watch_dir.clone(),
                pattern: "*.csv".to_string(),
                file_type: "lines".to_string(),
                context: json!({}),
            }],
        );

        assert_eq!(watcher.scan_once().await.unwrap(), 0);
        assert!(!watch_dir.join("empty.csv").exists());

        let buckets = &engine.config().buckets;
        assert!(engine.objects.exists(&buckets.failed, "empty.csv").await.unwrap());
        assert!(!engine.objects.exists(&buckets.incoming, "empty.csv").await.unwrap());

        let record = engine.store.get_batch_file("empty.csv").await.unwrap();
        assert!(!record.valid);
        assert!(record.batch_id.is_none());
    }

    #[tokio::test]
    async fn young_files_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());

        let watch_dir = dir.path().join("drop");
        tokio::fs::create_dir_all(&watch_dir).await.unwrap();
        tokio::fs::write(watch_dir.join("fresh.csv"), "data").await.unwrap();

        let watcher = DirectoryWatcher {
            engine: engine.clone(),
            rules: vec![WatchRule {
                directory: watch_dir.clone(),
                pattern: "*.csv".to_string(),
                file_type: "lines".to_string(),
                context: json!({}),
            }],
            scan_interval: Duration::from_millis(50),
            min_age: Duration::from_secs(3600),
        };

        assert_eq!(watcher.scan_once().await.unwrap(), 0);
        assert!(watch_dir.join("fresh.csv").exists());
    }
}
