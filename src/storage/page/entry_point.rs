//! Entry point page: page 0 of every tree file.
//!
//! ```text
//! [8..16)  tree size (i64), number of leaf entries
//! [16..20) pages size (u32), highest page index handed out to the tree
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageMut, PageView};
use crate::storage::wal::PageOperation;

const TREE_SIZE_OFFSET: usize = 8;
const PAGES_SIZE_OFFSET: usize = 16;

/// Bytes covered by the entry point header (excluding the page LSN).
pub const ENTRY_POINT_HEADER_RANGE: std::ops::Range<usize> = TREE_SIZE_OFFSET..PAGES_SIZE_OFFSET + 4;

pub(crate) fn init_header(data: &mut [u8]) {
    set_tree_size_raw(data, 0);
    set_pages_size_raw(data, 1);
}

pub(crate) fn restore_header(data: &mut [u8], header: &[u8]) -> StorageResult<()> {
    if header.len() != ENTRY_POINT_HEADER_RANGE.len() {
        return Err(StorageError::MalformedPage(format!(
            "entry point header must be {} bytes, got {}",
            ENTRY_POINT_HEADER_RANGE.len(),
            header.len()
        )));
    }
    data[ENTRY_POINT_HEADER_RANGE].copy_from_slice(header);
    Ok(())
}

pub(crate) fn set_tree_size_raw(data: &mut [u8], size: i64) {
    LittleEndian::write_i64(&mut data[TREE_SIZE_OFFSET..], size);
}

pub(crate) fn set_pages_size_raw(data: &mut [u8], pages: u32) {
    LittleEndian::write_u32(&mut data[PAGES_SIZE_OFFSET..], pages);
}

/// Typed view over the entry point page.
pub struct EntryPoint<P> {
    page: P,
}

impl<P: PageView> EntryPoint<P> {
    pub fn new(page: P) -> Self {
        Self { page }
    }

    pub fn tree_size(&self) -> i64 {
        LittleEndian::read_i64(&self.page.data()[TREE_SIZE_OFFSET..])
    }

    pub fn pages_size(&self) -> u32 {
        LittleEndian::read_u32(&self.page.data()[PAGES_SIZE_OFFSET..])
    }
}

impl<P: PageMut> EntryPoint<P> {
    /// Tree size 0, one page in use (the root).
    pub fn init(&mut self) -> StorageResult<()> {
        let prev_header = self.page.data()[ENTRY_POINT_HEADER_RANGE].to_vec();
        self.page.apply(PageOperation::EntryPointInit { prev_header })
    }

    pub fn set_tree_size(&mut self, size: i64) -> StorageResult<()> {
        let prev = self.tree_size();
        self.page
            .apply(PageOperation::EntryPointSetTreeSize { prev, new: size })
    }

    pub fn set_pages_size(&mut self, pages: u32) -> StorageResult<()> {
        let prev = self.pages_size();
        self.page
            .apply(PageOperation::EntryPointSetPagesSize { prev, new: pages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::DetachedPage;

    #[test]
    fn test_init_counters() -> StorageResult<()> {
        let mut page = DetachedPage::new(256);
        let mut entry_point = EntryPoint::new(&mut page);
        entry_point.init()?;
        assert_eq!(entry_point.tree_size(), 0);
        assert_eq!(entry_point.pages_size(), 1);
        Ok(())
    }

    #[test]
    fn test_counters_are_logged() -> StorageResult<()> {
        let mut page = DetachedPage::new(256);
        let mut entry_point = EntryPoint::new(&mut page);
        entry_point.init()?;
        entry_point.set_tree_size(3)?;
        entry_point.set_pages_size(9)?;
        assert_eq!(entry_point.tree_size(), 3);
        assert_eq!(entry_point.pages_size(), 9);

        assert_eq!(
            page.operations()[1..],
            [
                PageOperation::EntryPointSetTreeSize { prev: 0, new: 3 },
                PageOperation::EntryPointSetPagesSize { prev: 1, new: 9 },
            ]
        );
        Ok(())
    }

    #[test]
    fn test_init_undo_restores_previous_counters() -> StorageResult<()> {
        let mut page = DetachedPage::new(256);
        set_tree_size_raw(page.data_mut(), 12);
        set_pages_size_raw(page.data_mut(), 30);
        let before = page.data().to_vec();

        EntryPoint::new(&mut page).init()?;
        let mut undone = page.data().to_vec();
        page.operations()[0].undo(&mut undone)?;
        assert_eq!(undone, before);
        Ok(())
    }
}
