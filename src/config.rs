//! Storage configuration.

use crate::storage::error::{StorageError, StorageResult};

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// Smallest page size a bucket can work with.
pub const MIN_PAGE_SIZE: usize = 256;

/// Default maximum depth of a tree descent before the tree is considered corrupted.
pub const DEFAULT_MAX_TREE_DEPTH: usize = 64;

/// Size of the WAL buffer in bytes (1MB).
pub const DEFAULT_WAL_BUFFER_SIZE: usize = 1024 * 1024;

/// WAL configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Whether to sync WAL to disk on every commit.
    pub sync_on_commit: bool,
    /// Buffered bytes after which the WAL is written out without waiting for a commit.
    pub buffer_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            sync_on_commit: true,
            buffer_size: DEFAULT_WAL_BUFFER_SIZE,
        }
    }
}

/// Configuration shared by every storage component.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Size of one page (and of one bucket) in bytes.
    pub page_size: usize,
    /// Number of frames held by the buffer pool.
    pub buffer_pool_frames: usize,
    /// Maximum number of levels a tree descent may visit.
    pub max_tree_depth: usize,
    /// Write-ahead log settings.
    pub wal: WalConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            buffer_pool_frames: 1024,
            max_tree_depth: DEFAULT_MAX_TREE_DEPTH,
            wal: WalConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Check that the configuration can be used to build a storage.
    pub fn validate(&self) -> StorageResult<()> {
        if self.page_size < MIN_PAGE_SIZE {
            return Err(StorageError::InvalidConfig(format!(
                "page size {} is smaller than the minimum of {}",
                self.page_size, MIN_PAGE_SIZE
            )));
        }
        if self.page_size % 8 != 0 {
            return Err(StorageError::InvalidConfig(format!(
                "page size {} is not a multiple of 8",
                self.page_size
            )));
        }
        if u32::try_from(self.page_size).is_err() {
            return Err(StorageError::InvalidConfig(format!(
                "page size {} does not fit in 32 bits",
                self.page_size
            )));
        }
        if self.buffer_pool_frames == 0 {
            return Err(StorageError::InvalidConfig(
                "buffer pool needs at least one frame".to_string(),
            ));
        }
        if self.max_tree_depth == 0 {
            return Err(StorageError::InvalidConfig(
                "max tree depth must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = StorageConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert!(config.wal.sync_on_commit);
    }

    #[test]
    fn test_rejects_tiny_pages() {
        let config = StorageConfig {
            page_size: 64,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StorageError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_unaligned_pages() {
        let config = StorageConfig {
            page_size: 1001,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_frames_and_depth() {
        let config = StorageConfig {
            buffer_pool_frames: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = StorageConfig {
            max_tree_depth: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
