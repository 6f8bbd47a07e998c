//! File-backed cache collection, one JSON record per entry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge_storage::{RecordPath, RecordStorage};
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::{select_victims, CacheEntry, CacheStats, CacheStore, Clock, SystemClock};
use crate::hash::short_hash;
use crate::{Error, Result};

/// Cache collection persisted through a [`RecordStorage`] backend.
///
/// Each entry is an independent record, so a corrupt file only costs that
/// entry: it is reported as a miss and removed.
pub struct FileCache {
    storage: Arc<dyn RecordStorage>,
    collection: String,
    capacity: Option<usize>,
    clock: Arc<dyn Clock>,
    stats: Arc<CacheStats>,
    /// Serializes put-then-evict so concurrent writers never evict each other's
    /// fresh entries twice.
    write_lock: Mutex<()>,
}

impl FileCache {
    pub fn new(
        storage: Arc<dyn RecordStorage>,
        collection: impl Into<String>,
        capacity: Option<usize>,
    ) -> Self {
        Self {
            storage,
            collection: collection.into(),
            capacity,
            clock: Arc::new(SystemClock::new()),
            stats: Arc::new(CacheStats::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Replace the timestamp source (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn path(&self, key: &str) -> Result<RecordPath> {
        RecordPath::new(self.collection.as_str(), key)
            .map_err(|e| Error::Validation(format!("invalid cache key: {}", e)))
    }

    /// Read every record with its timestamp. Unreadable or corrupt records get
    /// `i64::MIN` so they sort first.
    async fn scan(&self) -> Result<Vec<(String, i64)>> {
        let records = self.storage.list(&self.collection).await?;
        let mut entries = Vec::with_capacity(records.len());
        for meta in records {
            let created_at = match self.storage.read(&meta.path).await {
                Ok(bytes) => serde_json::from_slice::<CacheEntry>(&bytes)
                    .map(|e| e.created_at)
                    .unwrap_or(i64::MIN),
                Err(e) if e.is_not_found() => continue,
                Err(_) => i64::MIN,
            };
            entries.push((meta.path.key, created_at));
        }
        Ok(entries)
    }

    async fn evict_locked(&self) -> usize {
        let Some(capacity) = self.capacity else {
            return 0;
        };

        let entries = match self.scan().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(collection = %self.collection, error = %e, "Cache eviction scan failed");
                return 0;
            }
        };

        let mut evicted = 0;
        for key in select_victims(entries, capacity) {
            let path = match self.path(&key) {
                Ok(path) => path,
                Err(_) => continue,
            };
            match self.storage.delete(&path).await {
                Ok(()) => {
                    evicted += 1;
                    debug!(collection = %self.collection, key = short_hash(&key), "Evicted cache entry");
                }
                Err(e) => {
                    warn!(collection = %self.collection, key = short_hash(&key), error = %e, "Failed to evict cache entry");
                }
            }
        }

        if evicted > 0 {
            self.stats.evict(evicted as u64);
            metrics::counter!("bridge_cache_evictions_total", "collection" => self.collection.clone())
                .increment(evicted as u64);
        }
        evicted
    }

    fn record_miss(&self) {
        self.stats.miss();
        metrics::counter!("bridge_cache_misses_total", "collection" => self.collection.clone())
            .increment(1);
    }
}

#[async_trait]
impl CacheStore for FileCache {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    #[instrument(skip(self), fields(collection = %self.collection, key = short_hash(key)))]
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        let path = match self.path(key) {
            Ok(path) => path,
            Err(_) => {
                self.record_miss();
                return None;
            }
        };

        let bytes = match self.storage.read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                self.record_miss();
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Cache read failed, treating as miss");
                self.record_miss();
                return None;
            }
        };

        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => {
                self.stats.hit();
                metrics::counter!("bridge_cache_hits_total", "collection" => self.collection.clone())
                    .increment(1);
                Some(entry)
            }
            Err(e) => {
                warn!(error = %e, "Corrupt cache entry, removing");
                if let Err(e) = self.storage.delete(&path).await {
                    warn!(error = %e, "Failed to remove corrupt cache entry");
                }
                self.record_miss();
                None
            }
        }
    }

    #[instrument(skip(self, payload), fields(collection = %self.collection, key = short_hash(key)))]
    async fn put(&self, key: &str, payload: Value) -> Result<CacheEntry> {
        let path = self.path(key)?;
        let _guard = self.write_lock.lock().await;

        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            created_at: self.clock.now_ms(),
        };
        let bytes = serde_json::to_vec_pretty(&entry)?;
        self.storage.write(&path, Bytes::from(bytes)).await?;
        debug!("Cached entry");

        self.evict_locked().await;
        Ok(entry)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let records = self.storage.list(&self.collection).await?;
        Ok(records.into_iter().map(|m| m.path.key).collect())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path(key)?;
        let existed = self.storage.exists(&path).await?;
        self.storage.delete(&path).await?;
        Ok(existed)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.storage.list(&self.collection).await?.len())
    }

    async fn evict_if_over_capacity(&self) -> usize {
        let _guard = self.write_lock.lock().await;
        self.evict_locked().await
    }

    #[instrument(skip(self), fields(collection = %self.collection))]
    async fn cleanup(&self, max_age: Duration) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let cutoff = self.clock.now_ms() - max_age.as_millis() as i64;

        let mut removed = 0;
        for (key, created_at) in self.scan().await? {
            if created_at >= cutoff {
                continue;
            }
            let path = self.path(&key)?;
            match self.storage.delete(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(key = short_hash(&key), error = %e, "Cleanup failed to delete entry"),
            }
        }

        if removed > 0 {
            debug!(removed, "Removed expired cache entries");
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        Ok(self.storage.delete_collection(&self.collection).await?)
    }

    fn stats(&self) -> Arc<CacheStats> {
        self.stats.clone()
    }
}
