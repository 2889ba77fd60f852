//! Local-filesystem object store backend.
//!
//! Stores objects as files under `{base}/{bucket}/{key}`. Useful for
//! development and testing; production deployments use the S3 backend.

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{ConveyorError, Result};

use super::ObjectStore;

pub struct LocalObjectStore {
    base_path: PathBuf,
}

impl LocalObjectStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.base_path.join(bucket).join(key)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(bucket, key);
        fs::read(&path).await.map_err(|e| {
            ConveyorError::ObjectStore(anyhow!("failed to read {bucket}/{key}: {e}"))
        })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        _content_type: Option<&str>,
    ) -> Result<()> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ConveyorError::ObjectStore(anyhow!("failed to create {bucket}: {e}"))
            })?;
        }

        let mut file = fs::File::create(&path).await.map_err(|e| {
            ConveyorError::ObjectStore(anyhow!("failed to create {bucket}/{key}: {e}"))
        })?;
        file.write_all(&bytes).await.map_err(|e| {
            ConveyorError::ObjectStore(anyhow!("failed to write {bucket}/{key}: {e}"))
        })?;
        file.sync_all().await.map_err(|e| {
            ConveyorError::ObjectStore(anyhow!("failed to sync {bucket}/{key}: {e}"))
        })?;
        Ok(())
    }

    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let dest = self.object_path(bucket, key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ConveyorError::ObjectStore(anyhow!("failed to create {bucket}: {e}"))
            })?;
        }
        fs::copy(path, &dest).await.map_err(|e| {
            ConveyorError::ObjectStore(anyhow!(
                "failed to store {} as {bucket}/{key}: {e}",
                path.display()
            ))
        })?;
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.object_path(bucket, key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConveyorError::ObjectStore(anyhow!(
                "failed to delete {bucket}/{key}: {e}"
            ))),
        }
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.object_path(bucket, key))
            .await
            .unwrap_or(false))
    }

    async fn copy(
        &self,
        bucket: &str,
        key: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> Result<()> {
        let source = self.object_path(bucket, key);
        self.put_file(dest_bucket, dest_key, &source).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn object_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path().to_path_buf());

        store
            .put("incoming", "orders.csv", b"a,b,c".to_vec(), None)
            .await
            .unwrap();
        assert!(store.exists("incoming", "orders.csv").await.unwrap());
        assert_eq!(
            store.get("incoming", "orders.csv").await.unwrap(),
            b"a,b,c"
        );

        store
            .copy("incoming", "orders.csv", "failed", "orders.csv")
            .await
            .unwrap();
        assert!(store.exists("failed", "orders.csv").await.unwrap());

        store.delete("incoming", "orders.csv").await.unwrap();
        assert!(!store.exists("incoming", "orders.csv").await.unwrap());
        // Deleting again is not an error.
        store.delete("incoming", "orders.csv").await.unwrap();
    }

    #[tokio::test]
    async fn get_missing_object_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path().to_path_buf());
        assert!(store.get("incoming", "nope").await.is_err());
    }

    #[tokio::test]
    async fn put_file_streams_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path().to_path_buf());

        let spool = dir.path().join("spool.dat");
        tokio::fs::write(&spool, b"fragment bytes").await.unwrap();

        store
            .put_file("batch-output", "b1/log.txt", &spool)
            .await
            .unwrap();
        assert_eq!(
            store.get("batch-output", "b1/log.txt").await.unwrap(),
            b"fragment bytes"
        );
    }
}
