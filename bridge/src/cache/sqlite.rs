//! SQLite-backed cache collections

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{CacheEntry, CacheStats, CacheStore, Clock, SystemClock};
use crate::Result;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS cache_entries (
        collection  TEXT NOT NULL,
        key         TEXT NOT NULL,
        payload     TEXT NOT NULL,
        created_at  INTEGER NOT NULL,
        PRIMARY KEY (collection, key)
    );
    CREATE INDEX IF NOT EXISTS idx_collection_created
        ON cache_entries(collection, created_at);
"#;

/// One SQLite database shared by every client-side collection.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl SqliteDatabase {
    /// Open (or create) the database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;

        // WAL mode + performance pragmas
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA temp_store=MEMORY;",
        )?;

        Ok(Self::from_connection(conn))
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Handle onto one named collection.
    pub fn collection(&self, name: impl Into<String>, capacity: Option<usize>) -> SqliteCache {
        SqliteCache {
            conn: self.conn.clone(),
            clock: self.clock.clone(),
            collection: name.into(),
            capacity,
            stats: Arc::new(CacheStats::new()),
        }
    }
}

/// A single collection inside a [`SqliteDatabase`].
///
/// Put and eviction run under the connection lock, so a collection is never
/// observed above capacity.
pub struct SqliteCache {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    collection: String,
    capacity: Option<usize>,
    stats: Arc<CacheStats>,
}

impl SqliteCache {
    fn evict_with(&self, conn: &Connection) -> rusqlite::Result<usize> {
        let Some(capacity) = self.capacity else {
            return Ok(0);
        };

        let current: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cache_entries WHERE collection = ?",
            params![&self.collection],
            |row| row.get(0),
        )?;
        let current = current as usize;
        if current <= capacity {
            return Ok(0);
        }

        let to_delete = current - capacity;
        let deleted = conn.execute(
            r#"
            DELETE FROM cache_entries WHERE collection = ?1 AND key IN (
                SELECT key FROM cache_entries
                WHERE collection = ?1
                ORDER BY created_at ASC, key ASC
                LIMIT ?2
            )
            "#,
            params![&self.collection, to_delete as i64],
        )?;

        if deleted > 0 {
            self.stats.evict(deleted as u64);
            metrics::counter!("bridge_cache_evictions_total", "collection" => self.collection.clone())
                .increment(deleted as u64);
            debug!(collection = %self.collection, deleted, "Evicted cache entries");
        }
        Ok(deleted)
    }
}

#[async_trait]
impl CacheStore for SqliteCache {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    async fn get(&self, key: &str) -> Option<CacheEntry> {
        let conn = self.conn.lock().await;
        let row: rusqlite::Result<Option<(String, i64)>> = conn
            .query_row(
                "SELECT payload, created_at FROM cache_entries WHERE collection = ? AND key = ?",
                params![&self.collection, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional();

        let found = match row {
            Ok(found) => found,
            Err(e) => {
                warn!(collection = %self.collection, error = %e, "Cache read failed, treating as miss");
                None
            }
        };

        let entry = found.and_then(|(payload, created_at)| {
            match serde_json::from_str::<Value>(&payload) {
                Ok(payload) => Some(CacheEntry {
                    key: key.to_string(),
                    payload,
                    created_at,
                }),
                Err(e) => {
                    warn!(collection = %self.collection, error = %e, "Corrupt cache entry, removing");
                    let _ = conn.execute(
                        "DELETE FROM cache_entries WHERE collection = ? AND key = ?",
                        params![&self.collection, key],
                    );
                    None
                }
            }
        });

        match entry {
            Some(entry) => {
                self.stats.hit();
                metrics::counter!("bridge_cache_hits_total", "collection" => self.collection.clone())
                    .increment(1);
                Some(entry)
            }
            None => {
                self.stats.miss();
                metrics::counter!("bridge_cache_misses_total", "collection" => self.collection.clone())
                    .increment(1);
                None
            }
        }
    }

    async fn put(&self, key: &str, payload: Value) -> Result<CacheEntry> {
        let conn = self.conn.lock().await;
        let created_at = self.clock.now_ms();
        let text = serde_json::to_string(&payload)?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO cache_entries (collection, key, payload, created_at)
            VALUES (?, ?, ?, ?)
            "#,
            params![&self.collection, key, &text, created_at],
        )?;

        if let Err(e) = self.evict_with(&conn) {
            warn!(collection = %self.collection, error = %e, "Cache eviction failed");
        }

        Ok(CacheEntry {
            key: key.to_string(),
            payload,
            created_at,
        })
    }

    async fn list(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT key FROM cache_entries WHERE collection = ? ORDER BY key")?;
        let keys = stmt
            .query_map(params![&self.collection], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM cache_entries WHERE collection = ? AND key = ?",
            params![&self.collection, key],
        )?;
        Ok(deleted > 0)
    }

    async fn len(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cache_entries WHERE collection = ?",
            params![&self.collection],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn evict_if_over_capacity(&self) -> usize {
        let conn = self.conn.lock().await;
        match self.evict_with(&conn) {
            Ok(n) => n,
            Err(e) => {
                warn!(collection = %self.collection, error = %e, "Cache eviction failed");
                0
            }
        }
    }

    async fn cleanup(&self, max_age: Duration) -> Result<usize> {
        let conn = self.conn.lock().await;
        let cutoff = self.clock.now_ms() - max_age.as_millis() as i64;
        let deleted = conn.execute(
            "DELETE FROM cache_entries WHERE collection = ? AND created_at < ?",
            params![&self.collection, cutoff],
        )?;
        Ok(deleted)
    }

    async fn clear(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM cache_entries WHERE collection = ?",
            params![&self.collection],
        )?;
        Ok(deleted)
    }

    fn stats(&self) -> Arc<CacheStats> {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use serde_json::json;

    fn db(clock: Arc<ManualClock>) -> SqliteDatabase {
        SqliteDatabase::in_memory().unwrap().with_clock(clock)
    }

    #[tokio::test]
    async fn test_cache_roundtrip() {
        let db = db(Arc::new(ManualClock::new(5)));
        let cache = db.collection("chunk_keywords", None);

        assert!(cache.get("chunk-1").await.is_none());
        cache
            .put("chunk-1", json!(["alpha", "beta"]))
            .await
            .unwrap();

        let entry = cache.get("chunk-1").await.unwrap();
        assert_eq!(entry.payload, json!(["alpha", "beta"]));
        assert_eq!(entry.created_at, 5);
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let db = db(Arc::new(ManualClock::new(0)));
        let words = db.collection("word_audio", Some(1));
        let syllables = db.collection("syllable_audio", Some(1));

        words.put("hello", json!("w")).await.unwrap();
        syllables.put("hello", json!("s")).await.unwrap();

        assert_eq!(words.get("hello").await.unwrap().payload, json!("w"));
        assert_eq!(syllables.get("hello").await.unwrap().payload, json!("s"));
        assert_eq!(words.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_capacity_eviction() {
        let clock = Arc::new(ManualClock::new(0));
        let db = db(clock.clone());
        let cache = db.collection("analysis", Some(3));

        for i in 0..5 {
            clock.advance(1);
            cache.put(&format!("k{}", i), json!(i)).await.unwrap();
        }

        assert_eq!(cache.len().await.unwrap(), 3);
        assert_eq!(cache.list().await.unwrap(), vec!["k2", "k3", "k4"]);
        assert_eq!(cache.stats().evictions(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_and_clear() {
        let clock = Arc::new(ManualClock::new(0));
        let db = db(clock.clone());
        let cache = db.collection("analysis", None);

        cache.put("old", json!(1)).await.unwrap();
        clock.set(10_000);
        cache.put("new", json!(2)).await.unwrap();

        assert_eq!(cache.cleanup(Duration::from_secs(5)).await.unwrap(), 1);
        assert_eq!(cache.list().await.unwrap(), vec!["new"]);

        assert!(cache.delete("new").await.unwrap());
        assert!(!cache.delete("new").await.unwrap());
        cache.put("x", json!(3)).await.unwrap();
        assert_eq!(cache.clear().await.unwrap(), 1);
        assert!(cache.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("client.db");
        {
            let db = SqliteDatabase::open(&path).unwrap();
            db.collection("analysis", None)
                .put("a", json!({"coreThesis": "t"}))
                .await
                .unwrap();
        }
        let db = SqliteDatabase::open(&path).unwrap();
        let entry = db.collection("analysis", None).get("a").await.unwrap();
        assert_eq!(entry.payload["coreThesis"], "t");
    }
}
