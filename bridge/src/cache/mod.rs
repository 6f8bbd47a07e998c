//! Cache module
//!
//! Bounded, content-addressed stores for expensive artifacts (document
//! analyses, annotations, synthesized audio). Each store owns one named
//! collection with its own capacity; once a `put` pushes the collection over
//! capacity the oldest entries (by `createdAt`) are evicted.
//!
//! Two backends implement [`CacheStore`]:
//! - [`FileCache`]: one JSON file per entry (server)
//! - [`SqliteCache`]: embedded key-value table (client)

mod clock;
mod file;
mod sqlite;
mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use file::FileCache;
pub use sqlite::{SqliteCache, SqliteDatabase};
pub use stats::{CacheStats, CacheStatsSnapshot};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::Result;

/// Well-known collection names.
pub mod collections {
    pub const ANALYSIS: &str = "analysis";
    pub const THOUGHT_GROUPS: &str = "thought_groups";
    pub const WORD_AUDIO: &str = "word_audio";
    pub const SYLLABLE_AUDIO: &str = "syllable_audio";
    pub const CHUNK_KEYWORDS: &str = "chunk_keywords";
    pub const SENTENCE_TRANSLATIONS: &str = "sentence_translations";
}

/// Default capacity for a well-known collection.
pub fn default_capacity(collection: &str) -> Option<usize> {
    match collection {
        collections::ANALYSIS => Some(20),
        collections::THOUGHT_GROUPS => Some(400),
        collections::WORD_AUDIO => Some(500),
        collections::SYLLABLE_AUDIO => Some(500),
        collections::CHUNK_KEYWORDS => Some(400),
        collections::SENTENCE_TRANSLATIONS => Some(400),
        _ => None,
    }
}

/// A stored `(key, payload, createdAt)` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub payload: Value,
    /// Milliseconds since the Unix epoch
    pub created_at: i64,
}

impl CacheEntry {
    /// Render the entry the way the HTTP API returns it: payload fields at the
    /// top level with `hash` and `createdAt` injected.
    pub fn to_flat_json(&self) -> Value {
        let mut object = match &self.payload {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("payload".to_string(), other.clone());
                map
            }
        };
        object.insert("hash".to_string(), Value::String(self.key.clone()));
        object.insert("createdAt".to_string(), Value::from(self.created_at));
        Value::Object(object)
    }
}

/// Capacity configuration for one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub name: String,
    /// Maximum number of entries; `None` means unbounded
    pub capacity: Option<usize>,
}

impl CollectionConfig {
    pub fn new(name: &str, capacity: Option<usize>) -> Self {
        Self {
            name: name.to_string(),
            capacity,
        }
    }

    /// Collection with its well-known default capacity.
    pub fn named(name: &str) -> Self {
        Self::new(name, default_capacity(name))
    }
}

/// Trait for bounded cache collections.
///
/// Failure semantics: read-side storage errors degrade to a miss and are
/// logged; write-side errors propagate so the caller can decide whether a
/// lost cache write matters.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Collection this store owns.
    fn collection(&self) -> &str;

    /// Maximum entry count, if bounded.
    fn capacity(&self) -> Option<usize>;

    /// Look up an entry. Never fails: missing, unreadable or corrupt entries are misses.
    async fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Store `payload` under `key`, stamping `createdAt`, then evict down to capacity.
    async fn put(&self, key: &str, payload: Value) -> Result<CacheEntry>;

    /// Keys currently stored (maintenance/enumeration only).
    async fn list(&self) -> Result<Vec<String>>;

    /// Remove one entry. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Number of stored entries.
    async fn len(&self) -> Result<usize>;

    /// Delete the oldest entries until the collection is within capacity.
    ///
    /// Partial failures are logged and skipped; returns the number evicted.
    async fn evict_if_over_capacity(&self) -> usize;

    /// Remove entries older than `max_age`, regardless of capacity.
    async fn cleanup(&self, max_age: Duration) -> Result<usize>;

    /// Remove every entry.
    async fn clear(&self) -> Result<usize>;

    /// Hit/miss/eviction counters for this store.
    fn stats(&self) -> Arc<CacheStats>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Pick the keys to evict so that at most `capacity` of `entries` remain.
///
/// Oldest `createdAt` first; ties broken by key so the choice is deterministic.
pub(crate) fn select_victims(mut entries: Vec<(String, i64)>, capacity: usize) -> Vec<String> {
    if entries.len() <= capacity {
        return Vec::new();
    }
    let excess = entries.len() - capacity;
    entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    entries.into_iter().take(excess).map(|(k, _)| k).collect()
}

/// Registry of named stores, owned by the composition root.
#[derive(Default, Clone)]
pub struct CacheRegistry {
    stores: HashMap<String, Arc<dyn CacheStore>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, store: Arc<dyn CacheStore>) {
        self.stores.insert(store.collection().to_string(), store);
    }

    pub fn get(&self, collection: &str) -> Option<Arc<dyn CacheStore>> {
        self.stores.get(collection).cloned()
    }

    pub fn stores(&self) -> impl Iterator<Item = &Arc<dyn CacheStore>> {
        self.stores.values()
    }

    /// Stats for every registered collection, keyed by name.
    pub fn snapshot(&self) -> HashMap<String, CacheStatsSnapshot> {
        self.stores
            .iter()
            .map(|(name, store)| (name.clone(), store.stats().snapshot()))
            .collect()
    }
}
