use crate::storage::page::PageId;
use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Page-granular access to one file.
pub struct PageManager {
    file: File,
    page_size: usize,
}

impl PageManager {
    pub fn create(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create file: {:?}", path))?;

        Ok(Self { file, page_size })
    }

    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open file: {:?}", path))?;

        Ok(Self { file, page_size })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.page_size {
            bail!(
                "Buffer size must be the page size ({}), got {}",
                self.page_size,
                buf.len()
            );
        }

        let offset = self.page_offset(page_id);
        let file_size = self.file.metadata()?.len();

        if offset >= file_size {
            bail!("Page {} does not exist", page_id.0);
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .context("Failed to seek")?;
        self.file.read_exact(buf).context("Failed to read page")?;

        Ok(())
    }

    /// Write a page, extending the file when it lies past the end.
    /// The data reaches the disk on the next `sync`.
    pub fn write_page(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            bail!(
                "Data size must be the page size ({}), got {}",
                self.page_size,
                data.len()
            );
        }

        let offset = self.page_offset(page_id);
        let file_size = self.file.metadata()?.len();

        if offset >= file_size {
            let new_size = offset + self.page_size as u64;
            self.file
                .set_len(new_size)
                .context("Failed to extend file")?;
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .context("Failed to seek")?;
        self.file.write_all(data).context("Failed to write page")?;

        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().context("Failed to sync")
    }

    pub fn num_pages(&self) -> Result<u32> {
        let file_size = self.file.metadata()?.len();
        Ok((file_size / self.page_size as u64) as u32)
    }

    /// Extend the file by one zeroed page.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        let current_pages = self.num_pages()?;
        let new_page_id = PageId(current_pages);

        let new_size = (current_pages as u64 + 1) * self.page_size as u64;
        self.file
            .set_len(new_size)
            .context("Failed to extend file")?;

        Ok(new_page_id)
    }

    fn page_offset(&self, page_id: PageId) -> u64 {
        page_id.0 as u64 * self.page_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE_SIZE: usize = 512;

    #[test]
    fn test_create_and_open() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.grb");

        {
            let pm = PageManager::create(&file_path, PAGE_SIZE)?;
            assert_eq!(pm.num_pages()?, 0);
        }

        {
            let pm = PageManager::open(&file_path, PAGE_SIZE)?;
            assert_eq!(pm.num_pages()?, 0);
        }

        assert!(PageManager::open(&dir.path().join("missing.grb"), PAGE_SIZE).is_err());
        Ok(())
    }

    #[test]
    fn test_write_and_read_page() -> Result<()> {
        let dir = tempdir()?;
        let mut pm = PageManager::create(&dir.path().join("test.grb"), PAGE_SIZE)?;

        let mut write_buf = vec![0u8; PAGE_SIZE];
        write_buf[0] = 42;
        write_buf[PAGE_SIZE - 1] = 24;
        pm.write_page(PageId(2), &write_buf)?;
        pm.sync()?;
        assert_eq!(pm.num_pages()?, 3);

        let mut read_buf = vec![0u8; PAGE_SIZE];
        pm.read_page(PageId(2), &mut read_buf)?;
        assert_eq!(read_buf, write_buf);

        pm.read_page(PageId(0), &mut read_buf)?;
        assert!(read_buf.iter().all(|b| *b == 0));
        Ok(())
    }

    #[test]
    fn test_allocate_and_bounds() -> Result<()> {
        let dir = tempdir()?;
        let mut pm = PageManager::create(&dir.path().join("test.grb"), PAGE_SIZE)?;

        assert_eq!(pm.allocate_page()?, PageId(0));
        assert_eq!(pm.allocate_page()?, PageId(1));
        assert_eq!(pm.num_pages()?, 2);

        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(pm.read_page(PageId(2), &mut buf).is_err());
        let mut short = vec![0u8; PAGE_SIZE - 1];
        assert!(pm.read_page(PageId(0), &mut short).is_err());
        assert!(pm.write_page(PageId(0), &short).is_err());
        Ok(())
    }
}
