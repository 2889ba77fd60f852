//! Output aggregator: turns per-row fragments into per-batch artifacts.
//!
//! For each `(batch, logical filename)` pair the aggregator keeps an
//! append-only spool file on local disk; fragments stream straight to the
//! spool, so memory stays bounded by the number of open spools rather than
//! the aggregate output size. Fragment order is row-completion order; line
//! order is deliberately not promised. At batch finalisation each spool is
//! uploaded to the output bucket as one object keyed by the batch identity
//! and the logical filename.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::batch::{BatchId, OutputFiles};
use crate::blob::ObjectStore;
use crate::error::Result;

struct Spool {
    path: PathBuf,
    file: fs::File,
}

/// Aggregates row output fragments into one object per logical filename.
pub struct OutputAggregator {
    spool_dir: PathBuf,
    objects: Arc<dyn ObjectStore>,
    output_bucket: String,
    /// Per-key async mutex serialises concurrent appends for the same file.
    spools: DashMap<(BatchId, String), Arc<Mutex<Option<Spool>>>>,
    /// Output keys already uploaded by slow-query processors.
    uploaded: DashMap<(BatchId, String), String>,
}

impl OutputAggregator {
    pub fn new(spool_dir: PathBuf, objects: Arc<dyn ObjectStore>, output_bucket: String) -> Self {
        Self {
            spool_dir,
            objects,
            output_bucket,
            spools: DashMap::new(),
            uploaded: DashMap::new(),
        }
    }

    /// Object key an aggregated artifact is finalised under.
    pub fn output_key(batch: BatchId, filename: &str) -> String {
        format!("{}/{}", batch.0, filename)
    }

    /// Append one fragment to the spool for `(batch, filename)`.
    pub async fn append(&self, batch: BatchId, filename: &str, bytes: &[u8]) -> Result<()> {
        let cell = self
            .spools
            .entry((batch, filename.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();

        let mut slot = cell.lock().await;
        if slot.is_none() {
            let dir = self.spool_dir.join(batch.0.to_string());
            fs::create_dir_all(&dir).await?;
            let path = dir.join(filename.replace(['/', '\\'], "_"));
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            *slot = Some(Spool { path, file });
        }
        if let Some(spool) = slot.as_mut() {
            spool.file.write_all(bytes).await?;
        }
        Ok(())
    }

    /// Record an output that a slow-query processor already uploaded.
    pub fn note_uploaded(&self, batch: BatchId, filename: &str, key: &str) {
        self.uploaded
            .insert((batch, filename.to_string()), key.to_string());
    }

    fn batch_keys<V>(map: &DashMap<(BatchId, String), V>, batch: BatchId) -> Vec<String> {
        map.iter()
            .filter(|entry| entry.key().0 == batch)
            .map(|entry| entry.key().1.clone())
            .collect()
    }

    /// Close and upload every spool for `batch`, returning the filename→key map.
    ///
    /// On upload failure the spool is left intact so a later attempt can
    /// retry; nothing is recorded for the batch until every file made it.
    pub async fn finalize(&self, batch: BatchId) -> Result<OutputFiles> {
        let mut outputs = BTreeMap::new();

        for filename in Self::batch_keys(&self.spools, batch) {
            let map_key = (batch, filename.clone());
            let Some(cell) = self.spools.get(&map_key).map(|entry| Arc::clone(entry.value()))
            else {
                continue;
            };

            let mut slot = cell.lock().await;
            let Some(spool) = &mut *slot else { continue };

            spool.file.flush().await?;
            spool.file.sync_all().await?;

            let object_key = Self::output_key(batch, &filename);
            self.objects
                .put_file(&self.output_bucket, &object_key, &spool.path)
                .await?;

            let path = spool.path.clone();
            *slot = None;
            drop(slot);
            self.spools.remove(&map_key);
            if let Err(e) = fs::remove_file(&path).await {
                tracing::debug!(path = %path.display(), error = %e, "failed to remove spool file");
            }
            outputs.insert(filename, object_key);
        }

        for filename in Self::batch_keys(&self.uploaded, batch) {
            if let Some((_, key)) = self.uploaded.remove(&(batch, filename.clone())) {
                outputs.insert(filename, key);
            }
        }

        Ok(outputs)
    }

    /// Drop every spool for `batch` without uploading (abort path).
    pub async fn discard(&self, batch: BatchId) {
        for filename in Self::batch_keys(&self.spools, batch) {
            if let Some((_, cell)) = self.spools.remove(&(batch, filename)) {
                let mut slot = cell.lock().await;
                if let Some(spool) = slot.take() {
                    drop(spool.file);
                    if let Err(e) = fs::remove_file(&spool.path).await {
                        tracing::debug!(error = %e, "failed to remove discarded spool");
                    }
                }
            }
        }
        for filename in Self::batch_keys(&self.uploaded, batch) {
            self.uploaded.remove(&(batch, filename));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::local::LocalObjectStore;
    use uuid::Uuid;

    fn setup() -> (tempfile::TempDir, OutputAggregator) {
        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(LocalObjectStore::new(dir.path().join("objects")));
        let aggregator = OutputAggregator::new(
            dir.path().join("spool"),
            objects,
            "batch-output".to_string(),
        );
        (dir, aggregator)
    }

    #[tokio::test]
    async fn fragments_concatenate_in_append_order() {
        let (dir, aggregator) = setup();
        let batch = BatchId(Uuid::new_v4());

        aggregator.append(batch, "log.txt", b"ok:1\n").await.unwrap();
        aggregator.append(batch, "log.txt", b"ok:3\n").await.unwrap();
        aggregator.append(batch, "errs.txt", b"e:2\n").await.unwrap();

        let outputs = aggregator.finalize(batch).await.unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(
            outputs["log.txt"],
            OutputAggregator::output_key(batch, "log.txt")
        );

        let store = LocalObjectStore::new(dir.path().join("objects"));
        let bytes = store.get("batch-output", &outputs["log.txt"]).await.unwrap();
        assert_eq!(bytes, b"ok:1\nok:3\n");
        let bytes = store.get("batch-output", &outputs["errs.txt"]).await.unwrap();
        assert_eq!(bytes, b"e:2\n");
    }

    #[tokio::test]
    async fn finalize_with_no_fragments_is_empty() {
        let (_dir, aggregator) = setup();
        let outputs = aggregator.finalize(BatchId(Uuid::new_v4())).await.unwrap();
        assert!(outputs.is_empty());
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_file_all_land() {
        let (dir, aggregator) = setup();
        let aggregator = Arc::new(aggregator);
        let batch = BatchId(Uuid::new_v4());

        let mut handles = Vec::new();
        for i in 0..20 {
            let aggregator = aggregator.clone();
            handles.push(tokio::spawn(async move {
                let line = format!("row:{i}\n");
                aggregator.append(batch, "out.txt", line.as_bytes()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let outputs = aggregator.finalize(batch).await.unwrap();
        let store = LocalObjectStore::new(dir.path().join("objects"));
        let bytes = store.get("batch-output", &outputs["out.txt"]).await.unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.lines().count(), 20);
        for i in 0..20 {
            assert!(text.contains(&format!("row:{i}")));
        }
    }

    #[tokio::test]
    async fn batches_do_not_interfere() {
        let (_dir, aggregator) = setup();
        let a = BatchId(Uuid::new_v4());
        let b = BatchId(Uuid::new_v4());

        aggregator.append(a, "log.txt", b"a").await.unwrap();
        aggregator.append(b, "log.txt", b"b").await.unwrap();

        let outputs_a = aggregator.finalize(a).await.unwrap();
        assert_eq!(outputs_a.len(), 1);
        assert!(outputs_a["log.txt"].starts_with(&a.0.to_string()));

        // Batch b's spool is untouched by a's finalisation.
        let outputs_b = aggregator.finalize(b).await.unwrap();
        assert_eq!(outputs_b.len(), 1);
    }

    #[tokio::test]
    async fn noted_uploads_are_included() {
        let (_dir, aggregator) = setup();
        let batch = BatchId(Uuid::new_v4());

        aggregator.note_uploaded(batch, "report.json", "slow/report.json");
        let outputs = aggregator.finalize(batch).await.unwrap();
        assert_eq!(outputs["report.json"], "slow/report.json");
    }

    #[tokio::test]
    async fn discard_drops_spools() {
        let (_dir, aggregator) = setup();
        let batch = BatchId(Uuid::new_v4());

        aggregator.append(batch, "log.txt", b"data").await.unwrap();
        aggregator.discard(batch).await;

        let outputs = aggregator.finalize(batch).await.unwrap();
        assert!(outputs.is_empty());
    }
}
