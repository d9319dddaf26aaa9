pub mod bucket;
pub mod entry_point;
pub mod utils;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::error::StorageResult;
use crate::storage::wal::{PageOperation, LSN};

/// Index of a page inside one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle of a file registered with the file manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u32);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A page address in the page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub file_id: FileId,
    pub page_id: PageId,
}

impl PageKey {
    pub fn new(file_id: FileId, page_id: PageId) -> Self {
        Self { file_id, page_id }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_id)
    }
}

/// Every page starts with the LSN of the last WAL record applied to it.
pub const PAGE_LSN_OFFSET: usize = 0;

/// Size of the header shared by every page kind.
pub const COMMON_HEADER_SIZE: usize = 8;

pub fn page_lsn(data: &[u8]) -> LSN {
    LSN(LittleEndian::read_u64(&data[PAGE_LSN_OFFSET..]))
}

pub fn set_page_lsn(data: &mut [u8], lsn: LSN) {
    LittleEndian::write_u64(&mut data[PAGE_LSN_OFFSET..], lsn.0);
}

/// Read access to the bytes of a page.
pub trait PageView {
    fn data(&self) -> &[u8];
}

/// A page whose mutations are expressed as logged page operations.
pub trait PageMut: PageView {
    /// Apply `operation` to the page and record it.
    fn apply(&mut self, operation: PageOperation) -> StorageResult<()>;
}

impl PageView for [u8] {
    fn data(&self) -> &[u8] {
        self
    }
}

impl PageView for Vec<u8> {
    fn data(&self) -> &[u8] {
        self
    }
}

impl<T: PageView + ?Sized> PageView for &T {
    fn data(&self) -> &[u8] {
        (**self).data()
    }
}

impl<T: PageView + ?Sized> PageView for &mut T {
    fn data(&self) -> &[u8] {
        (**self).data()
    }
}

impl<T: PageMut + ?Sized> PageMut for &mut T {
    fn apply(&mut self, operation: PageOperation) -> StorageResult<()> {
        (**self).apply(operation)
    }
}

/// A page buffer living outside the buffer pool.
///
/// Operations applied to it are kept in memory, which makes it the
/// scratch page used when inspecting what a bucket mutation logs.
#[derive(Debug, Clone)]
pub struct DetachedPage {
    data: Vec<u8>,
    operations: Vec<PageOperation>,
}

impl DetachedPage {
    pub fn new(page_size: usize) -> Self {
        Self {
            data: vec![0; page_size],
            operations: Vec::new(),
        }
    }

    pub fn from_data(data: Vec<u8>) -> Self {
        Self {
            data,
            operations: Vec::new(),
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn operations(&self) -> &[PageOperation] {
        &self.operations
    }

    pub fn clear_operations(&mut self) {
        self.operations.clear();
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl PageView for DetachedPage {
    fn data(&self) -> &[u8] {
        &self.data
    }
}

impl PageMut for DetachedPage {
    fn apply(&mut self, operation: PageOperation) -> StorageResult<()> {
        operation.redo(&mut self.data)?;
        self.operations.push(operation);
        Ok(())
    }
}

pub use bucket::Bucket;
pub use entry_point::EntryPoint;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_lsn_roundtrip() {
        let mut data = vec![0u8; 64];
        assert_eq!(page_lsn(&data), LSN(0));
        set_page_lsn(&mut data, LSN(77));
        assert_eq!(page_lsn(&data), LSN(77));
    }

    #[test]
    fn test_page_key_display() {
        let key = PageKey::new(FileId(3), PageId(9));
        assert_eq!(key.to_string(), "#3:9");
    }

    #[test]
    fn test_detached_page_records_operations() -> StorageResult<()> {
        let mut page = DetachedPage::new(256);
        page.apply(PageOperation::EntryPointSetTreeSize { prev: 0, new: 5 })?;
        assert_eq!(page.operations().len(), 1);
        page.clear_operations();
        assert!(page.operations().is_empty());
        Ok(())
    }
}
