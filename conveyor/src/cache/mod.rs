//! Status cache: bounds persistent-store read load for poll-heavy callers.
//!
//! Batch statuses are cached under `batch-status:{id}` with a short TTL for
//! in-flight statuses and a much longer TTL once terminal. The engine treats
//! any cache failure as a miss and falls back to the store.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};

use crate::batch::BatchId;
use crate::error::Result;

/// Cache key for a batch's status.
pub fn status_key(batch: BatchId) -> String {
    format!("batch-status:{}", batch.0)
}

/// Key/value cache with per-entry TTL and atomic compare-and-set.
#[async_trait]
pub trait StatusCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Set `key` to `new` only if its current value equals `expected`
    /// (`None` meaning absent). Returns whether the write was applied.
    async fn cas(&self, key: &str, expected: Option<&str>, new: &str, ttl: Duration)
        -> Result<bool>;
}

#[derive(Clone)]
struct CachedValue {
    value: String,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, CachedValue> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedValue,
        _updated_at: Instant,
        _remaining: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process [`StatusCache`] backed by moka.
///
/// The entry compute API makes `cas` atomic with respect to concurrent
/// writers on the same key.
pub struct MokaStatusCache {
    cache: Cache<String, CachedValue>,
}

impl MokaStatusCache {
    pub fn new(max_entries: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_entries)
                .expire_after(PerEntryTtl)
                .build(),
        }
    }
}

impl Default for MokaStatusCache {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl StatusCache for MokaStatusCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.get(key).await.map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.cache
            .insert(
                key.to_string(),
                CachedValue {
                    value: value.to_string(),
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn cas(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let replacement = CachedValue {
            value: new.to_string(),
            ttl,
        };
        let result = self
            .cache
            .entry_by_ref(key)
            .and_compute_with(|current| {
                let matches = match (&current, expected) {
                    (None, None) => true,
                    (Some(entry), Some(expected)) => entry.value().value == expected,
                    _ => false,
                };
                let op = if matches {
                    Op::Put(replacement.clone())
                } else {
                    Op::Nop
                };
                futures::future::ready(op)
            })
            .await;

        Ok(matches!(
            result,
            CompResult::Inserted(_) | CompResult::ReplacedWith(_)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn key_format() {
        let id = Uuid::new_v4();
        assert_eq!(
            status_key(BatchId(id)),
            format!("batch-status:{id}")
        );
    }

    #[tokio::test]
    async fn set_then_get() {
        let cache = MokaStatusCache::default();
        cache
            .set("batch-status:x", "queued", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            cache.get("batch-status:x").await.unwrap().as_deref(),
            Some("queued")
        );
        assert_eq!(cache.get("batch-status:y").await.unwrap(), None);
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = MokaStatusCache::default();
        cache
            .set("k", "inprog", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(cache.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cas_applies_only_on_match() {
        let cache = MokaStatusCache::default();
        let ttl = Duration::from_secs(60);

        // Absent + expected None applies.
        assert!(cache.cas("k", None, "queued", ttl).await.unwrap());
        // Absent expectation no longer holds.
        assert!(!cache.cas("k", None, "inprog", ttl).await.unwrap());
        // Wrong expected value.
        assert!(!cache.cas("k", Some("success"), "failed", ttl).await.unwrap());
        // Matching expected value.
        assert!(cache.cas("k", Some("queued"), "inprog", ttl).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("inprog"));
    }
}
