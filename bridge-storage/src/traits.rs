//! Core storage trait definitions.
//!
//! The `RecordStorage` trait is the persistence seam under the file-backed
//! cache: every record is an independent blob so corruption or a partial
//! write only ever affects a single entry.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::path::RecordPath;

/// Metadata about a stored record.
#[derive(Debug, Clone)]
pub struct RecordMeta {
    /// Full path to the record
    pub path: RecordPath,
    /// Size in bytes
    pub size: u64,
    /// Last modified timestamp (Unix epoch milliseconds)
    pub last_modified_ms: Option<i64>,
}

/// Storage for independent records grouped by collection.
///
/// # Thread Safety
///
/// All implementations must be `Send + Sync` to allow concurrent access
/// from multiple async tasks.
#[async_trait]
pub trait RecordStorage: Send + Sync {
    /// Write a record, replacing any previous content.
    ///
    /// Implementations must never leave a half-written record visible
    /// under `path`.
    async fn write(&self, path: &RecordPath, data: Bytes) -> Result<()>;

    /// Read a record.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the record does not exist.
    async fn read(&self, path: &RecordPath) -> Result<Bytes>;

    /// Check if a record exists.
    async fn exists(&self, path: &RecordPath) -> Result<bool>;

    /// Delete a record.
    ///
    /// No-op if the record does not exist (idempotent).
    async fn delete(&self, path: &RecordPath) -> Result<()>;

    /// List all records in a collection.
    ///
    /// A collection that was never written to is empty, not an error.
    async fn list(&self, collection: &str) -> Result<Vec<RecordMeta>>;

    /// Delete every record in a collection, returning the number deleted.
    async fn delete_collection(&self, collection: &str) -> Result<usize> {
        let records = self.list(collection).await?;
        let count = records.len();
        for meta in records {
            self.delete(&meta.path).await?;
        }
        Ok(count)
    }

    /// Name of this backend for logging.
    fn backend_name(&self) -> &'static str;
}
