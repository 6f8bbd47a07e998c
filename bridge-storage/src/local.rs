//! Local filesystem storage implementation.
//!
//! This is the storage backend behind the server's file cache.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::{debug, instrument};

use crate::error::{Result, StorageError};
use crate::path::RecordPath;
use crate::traits::{RecordMeta, RecordStorage};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Local filesystem storage backend.
///
/// Stores one file per record: `base_path/collection/key.json`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a new local storage backend.
    ///
    /// Collection directories are created lazily on first write.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Get the base path for this storage.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn to_fs_path(&self, path: &RecordPath) -> PathBuf {
        path.to_path_buf(&self.base_path)
    }

    fn temp_path(&self, path: &RecordPath) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.base_path.join(&path.collection).join(format!(
            ".{}.{}.{}.tmp",
            path.file_name(),
            std::process::id(),
            n
        ))
    }
}

fn modified_ms(metadata: &std::fs::Metadata) -> Option<i64> {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
}

#[async_trait]
impl RecordStorage for LocalStorage {
    #[instrument(skip(self, data), fields(path = %path, size = data.len()))]
    async fn write(&self, path: &RecordPath, data: Bytes) -> Result<()> {
        let fs_path = self.to_fs_path(path);
        if let Some(parent) = fs_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write-then-rename keeps readers from ever seeing a torn record.
        let tmp = self.temp_path(path);
        debug!("Writing {} bytes to {:?}", data.len(), fs_path);
        if let Err(e) = fs::write(&tmp, &data).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, &fs_path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn read(&self, path: &RecordPath) -> Result<Bytes> {
        let fs_path = self.to_fs_path(path);
        match fs::read(&fs_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &RecordPath) -> Result<bool> {
        match fs::metadata(self.to_fs_path(path)).await {
            Ok(m) => Ok(m.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn delete(&self, path: &RecordPath) -> Result<()> {
        let fs_path = self.to_fs_path(path);
        debug!("Deleting {:?}", fs_path);

        match fs::remove_file(&fs_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    async fn list(&self, collection: &str) -> Result<Vec<RecordMeta>> {
        let dir = self.base_path.join(collection);
        let mut results = Vec::new();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(results),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            if let Some(path) = RecordPath::from_file_name(collection, &file_name) {
                results.push(RecordMeta {
                    path,
                    size: metadata.len(),
                    last_modified_ms: modified_ms(&metadata),
                });
            }
        }

        results.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(results)
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}
