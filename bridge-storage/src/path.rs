//! Record paths for cache storage.
//!
//! Records follow the pattern: `collection/key`, stored on disk as
//! `collection/key.json`.
//!
//! # Examples
//!
//! ```
//! use bridge_storage::RecordPath;
//!
//! let path = RecordPath::new("analysis", "9f86d081884c7d65").unwrap();
//! assert_eq!(path.to_string(), "analysis/9f86d081884c7d65");
//! assert_eq!(path.file_name(), "9f86d081884c7d65.json");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, StorageError};

/// File extension used for every record.
pub const RECORD_EXTENSION: &str = "json";

/// Path of a single record inside a named collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordPath {
    /// Collection name
    pub collection: String,
    /// Record key (content hash, word, chunk id...)
    pub key: String,
}

impl RecordPath {
    /// Create a record path, rejecting segments that would escape the collection directory.
    pub fn new(collection: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let collection = collection.into();
        let key = key.into();
        validate_segment(&collection)?;
        validate_segment(&key)?;
        Ok(Self { collection, key })
    }

    /// File name of the record within its collection directory.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.key, RECORD_EXTENSION)
    }

    /// Convert to a filesystem path under the given base directory.
    pub fn to_path_buf(&self, base: &Path) -> PathBuf {
        base.join(&self.collection).join(self.file_name())
    }

    /// Parse a record file name (`key.json`) back into a path for `collection`.
    ///
    /// Returns `None` for files that are not records (temp files, other extensions).
    pub fn from_file_name(collection: &str, file_name: &str) -> Option<Self> {
        let key = file_name.strip_suffix(&format!(".{}", RECORD_EXTENSION))?;
        Self::new(collection, key).ok()
    }
}

impl fmt::Display for RecordPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}

fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty()
        || segment.starts_with('.')
        || segment.contains(['/', '\\', '\0'])
    {
        return Err(StorageError::InvalidPath(segment.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_file_name() {
        let path = RecordPath::new("word_audio", "hello").unwrap();
        assert_eq!(path.to_string(), "word_audio/hello");
        assert_eq!(path.file_name(), "hello.json");
        assert_eq!(
            path.to_path_buf(Path::new("/data")),
            PathBuf::from("/data/word_audio/hello.json")
        );
    }

    #[test]
    fn test_rejects_traversal() {
        assert!(RecordPath::new("analysis", "../etc/passwd").is_err());
        assert!(RecordPath::new("analysis", "..").is_err());
        assert!(RecordPath::new("analysis", "").is_err());
        assert!(RecordPath::new("a/b", "key").is_err());
        assert!(RecordPath::new(".hidden", "key").is_err());
    }

    #[test]
    fn test_allows_word_keys() {
        assert!(RecordPath::new("word_audio", "don't").is_ok());
        assert!(RecordPath::new("word_audio", "café").is_ok());
    }

    #[test]
    fn test_from_file_name() {
        let path = RecordPath::from_file_name("analysis", "abc123.json").unwrap();
        assert_eq!(path.key, "abc123");
        assert!(RecordPath::from_file_name("analysis", "abc123.json.tmp").is_none());
        assert!(RecordPath::from_file_name("analysis", ".abc.json").is_none());
    }
}
