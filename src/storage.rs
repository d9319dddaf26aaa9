//! Storage layer.
//!
//! Everything below the trees lives here:
//!
//! - **FileManager**: maps named files to [`FileId`]s and does paged I/O on them
//! - **BufferPool**: in-memory cache of pages keyed by `(FileId, PageId)` with LRU eviction
//! - **Bucket / EntryPoint**: the two page formats of a bonsai tree
//! - **WAL**: the write-ahead log and the page operation records stored in it
//!
//! Page bytes are only ever changed through [`wal::PageOperation`]s, so every
//! change can be logged, redone and undone.

pub mod buffer;
pub mod disk;
pub mod error;
pub mod page;
pub mod wal;

pub use buffer::{BufferPoolManager, PageReadGuard, PageWriteGuard};
pub use disk::{FileManager, PageManager};
pub use error::{StorageError, StorageResult};
pub use page::{Bucket, EntryPoint, FileId, PageId, PageKey};
