//! Object store abstraction and backends.
//!
//! Three logical buckets back the engine: `incoming` for raw intake files,
//! `failed` for rejected intake files, and `batch-output` for aggregated
//! per-batch artifacts. The engine depends only on the [`ObjectStore`]
//! trait; backends are S3-compatible storage for production and a local
//! directory tree for development and tests.

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

/// Blob storage with bucket/key addressing.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object's bytes.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Store bytes under a key.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<()>;

    /// Stream a local file into an object without buffering it in memory.
    ///
    /// Used by the output aggregator to finalise spool files.
    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Check whether an object exists.
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Copy an object, possibly across buckets.
    async fn copy(
        &self,
        bucket: &str,
        key: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> Result<()>;
}

/// Hex-encoded SHA-256 of `data`, used for intake checksums.
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"Hello, World!"),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }
}
