//! Storage layer error types.

use thiserror::Error;

use crate::storage::page::{FileId, PageId};

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Page not found: page {page_id} of file {file_id}")]
    PageNotFound { file_id: FileId, page_id: PageId },

    #[error("Buffer pool is full: cannot allocate new frame")]
    BufferPoolFull,

    #[error("File already exists: {0}")]
    FileExists(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Unknown file id: {0}")]
    UnknownFile(FileId),

    #[error("Malformed page: {0}")]
    MalformedPage(String),

    #[error("Malformed WAL: {0}")]
    MalformedWal(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "Reached max depth {depth} of the tree but still found nothing, the tree is in a corrupted state. You should rebuild the index related to this tree"
    )]
    Corrupted { depth: usize },

    #[error("Error during {operation} of tree '{name}'")]
    Tree {
        operation: &'static str,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl StorageError {
    /// Wrap an internal failure of a tree operation.
    pub fn tree(operation: &'static str, name: impl Into<String>, source: anyhow::Error) -> Self {
        StorageError::Tree {
            operation,
            name: name.into(),
            source,
        }
    }

    /// Whether this error, or any error it wraps, reports a corrupted tree.
    ///
    /// Corruption is never retryable: the tree has to be rebuilt.
    pub fn is_corruption(&self) -> bool {
        match self {
            StorageError::Corrupted { .. } => true,
            StorageError::Tree { source, .. } => source.chain().any(|cause| {
                matches!(
                    cause.downcast_ref::<StorageError>(),
                    Some(StorageError::Corrupted { .. })
                )
            }),
            _ => false,
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_is_detected_through_wrapping() {
        let inner = anyhow::Error::new(StorageError::Corrupted { depth: 64 });
        let wrapped = StorageError::tree("put", "edges", inner.context("descending"));
        assert!(wrapped.is_corruption());
        assert!(wrapped.to_string().contains("put"));
        assert!(wrapped.to_string().contains("edges"));
    }

    #[test]
    fn test_io_is_not_corruption() {
        let wrapped = StorageError::tree(
            "get",
            "edges",
            anyhow::Error::new(std::io::Error::other("disk gone")),
        );
        assert!(!wrapped.is_corruption());
        assert!(std::error::Error::source(&wrapped).is_some());
    }
}
