//! Storage error types.

use std::io;
use thiserror::Error;

/// Record storage operation errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error during storage operation
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Collection name or record key that cannot be mapped to a file
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    /// Check if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
            || matches!(self, StorageError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }

    /// Check if this is a permission error.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, StorageError::PermissionDenied(_))
            || matches!(self, StorageError::Io(e) if e.kind() == io::ErrorKind::PermissionDenied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_not_found() {
        let err = StorageError::NotFound("analysis/abc".to_string());
        assert!(err.is_not_found());

        let io_err = StorageError::Io(io::Error::new(io::ErrorKind::NotFound, "not found"));
        assert!(io_err.is_not_found());

        let other = StorageError::InvalidPath("../x".to_string());
        assert!(!other.is_not_found());
    }

    #[test]
    fn test_error_display() {
        let err = StorageError::NotFound("analysis/abc".to_string());
        assert_eq!(err.to_string(), "Record not found: analysis/abc");
    }
}
