//! File allocation layer.
//!
//! Maps file names to stable [`FileId`]s and forwards page I/O to one
//! [`PageManager`] per open file. The name registry is persisted next to
//! the data files so ids survive a restart, which the WAL relies on.

use anyhow::{Context, Result};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::page_manager::PageManager;
use crate::storage::error::StorageError;
use crate::storage::page::{FileId, PageId};

const REGISTRY_FILE_NAME: &str = "files.registry";

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileRegistry {
    next_id: u32,
    files: BTreeMap<String, FileId>,
}

pub struct FileManager {
    dir: PathBuf,
    page_size: usize,
    registry: Mutex<FileRegistry>,
    open_files: RwLock<HashMap<FileId, Arc<Mutex<PageManager>>>>,
}

impl FileManager {
    /// Open the file layer rooted at `dir`, loading the registry if present.
    pub fn open(dir: &Path, page_size: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {:?}", dir))?;
        let registry_path = dir.join(REGISTRY_FILE_NAME);
        let registry = if registry_path.exists() {
            let bytes = std::fs::read(&registry_path)
                .with_context(|| format!("Failed to read registry: {:?}", registry_path))?;
            bincode::deserialize(&bytes).map_err(StorageError::from)?
        } else {
            FileRegistry::default()
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            page_size,
            registry: Mutex::new(registry),
            open_files: RwLock::new(HashMap::new()),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn save_registry(&self, registry: &FileRegistry) -> Result<()> {
        let bytes = bincode::serialize(registry).map_err(StorageError::from)?;
        let tmp = self.dir.join(format!("{}.tmp", REGISTRY_FILE_NAME));
        std::fs::write(&tmp, bytes)
            .with_context(|| format!("Failed to write registry: {:?}", tmp))?;
        std::fs::rename(&tmp, self.dir.join(REGISTRY_FILE_NAME))
            .context("Failed to replace registry")?;
        Ok(())
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Create a new empty file.
    pub fn add_file(&self, name: &str) -> Result<FileId> {
        let mut registry = self.registry.lock();
        if registry.files.contains_key(name) {
            return Err(StorageError::FileExists(name.to_string()).into());
        }
        let manager = PageManager::create(&self.path_of(name), self.page_size)?;
        let file_id = FileId(registry.next_id);
        registry.next_id += 1;
        registry.files.insert(name.to_string(), file_id);
        self.save_registry(&registry)?;
        self.open_files
            .write()
            .insert(file_id, Arc::new(Mutex::new(manager)));
        info!("Added file {} as {}", name, file_id);
        Ok(file_id)
    }

    /// Open an existing file by name.
    pub fn open_file(&self, name: &str) -> Result<FileId> {
        let file_id = self
            .registry
            .lock()
            .files
            .get(name)
            .copied()
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        self.page_manager(file_id)?;
        Ok(file_id)
    }

    /// Remove a file and its registry entry.
    pub fn delete_file(&self, file_id: FileId) -> Result<()> {
        let mut registry = self.registry.lock();
        let name = registry
            .files
            .iter()
            .find(|(_, id)| **id == file_id)
            .map(|(name, _)| name.clone())
            .ok_or(StorageError::UnknownFile(file_id))?;
        self.open_files.write().remove(&file_id);
        let path = self.path_of(&name);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove file: {:?}", path))?;
        }
        registry.files.remove(&name);
        self.save_registry(&registry)?;
        info!("Deleted file {} ({})", name, file_id);
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.registry.lock().files.contains_key(name)
    }

    pub fn exists_id(&self, file_id: FileId) -> bool {
        self.registry.lock().files.values().any(|id| *id == file_id)
    }

    pub fn file_name(&self, file_id: FileId) -> Option<String> {
        self.registry
            .lock()
            .files
            .iter()
            .find(|(_, id)| **id == file_id)
            .map(|(name, _)| name.clone())
    }

    fn page_manager(&self, file_id: FileId) -> Result<Arc<Mutex<PageManager>>> {
        if let Some(manager) = self.open_files.read().get(&file_id) {
            return Ok(manager.clone());
        }

        let name = self
            .file_name(file_id)
            .ok_or(StorageError::UnknownFile(file_id))?;
        let mut open_files = self.open_files.write();
        if let Some(manager) = open_files.get(&file_id) {
            return Ok(manager.clone());
        }
        debug!("Opening file {} ({})", name, file_id);
        let manager = Arc::new(Mutex::new(PageManager::open(
            &self.path_of(&name),
            self.page_size,
        )?));
        open_files.insert(file_id, manager.clone());
        Ok(manager)
    }

    pub fn read_page(&self, file_id: FileId, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        let manager = self.page_manager(file_id)?;
        let mut manager = manager.lock();
        manager
            .read_page(page_id, buf)
            .with_context(|| format!("Failed to read page {} of file {}", page_id, file_id))
    }

    pub fn write_page(&self, file_id: FileId, page_id: PageId, data: &[u8]) -> Result<()> {
        let manager = self.page_manager(file_id)?;
        let mut manager = manager.lock();
        manager
            .write_page(page_id, data)
            .with_context(|| format!("Failed to write page {} of file {}", page_id, file_id))
    }

    pub fn allocate_page(&self, file_id: FileId) -> Result<PageId> {
        let manager = self.page_manager(file_id)?;
        let mut manager = manager.lock();
        manager.allocate_page()
    }

    pub fn num_pages(&self, file_id: FileId) -> Result<u32> {
        let manager = self.page_manager(file_id)?;
        let manager = manager.lock();
        manager.num_pages()
    }

    /// Sync every open file.
    pub fn sync_all(&self) -> Result<()> {
        let managers: Vec<_> = self.open_files.read().values().cloned().collect();
        for manager in managers {
            manager.lock().sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE_SIZE: usize = 256;

    #[test]
    fn test_add_and_open() -> Result<()> {
        let dir = tempdir()?;
        let files = FileManager::open(dir.path(), PAGE_SIZE)?;
        let a = files.add_file("a.grb")?;
        let b = files.add_file("b.grb")?;
        assert_ne!(a, b);
        assert_eq!(files.open_file("a.grb")?, a);
        assert_eq!(files.file_name(b).as_deref(), Some("b.grb"));
        assert!(files.exists("a.grb"));
        assert!(files.exists_id(b));
        Ok(())
    }

    #[test]
    fn test_duplicate_and_missing_names() -> Result<()> {
        let dir = tempdir()?;
        let files = FileManager::open(dir.path(), PAGE_SIZE)?;
        files.add_file("a.grb")?;

        let err = files.add_file("a.grb").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::FileExists(_))
        ));
        let err = files.open_file("nope.grb").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::FileNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_ids_survive_restart() -> Result<()> {
        let dir = tempdir()?;
        let (a, b) = {
            let files = FileManager::open(dir.path(), PAGE_SIZE)?;
            let a = files.add_file("a.grb")?;
            let b = files.add_file("b.grb")?;
            files.write_page(b, PageId(0), &[7u8; PAGE_SIZE])?;
            files.sync_all()?;
            (a, b)
        };

        let files = FileManager::open(dir.path(), PAGE_SIZE)?;
        assert_eq!(files.open_file("a.grb")?, a);
        assert_eq!(files.open_file("b.grb")?, b);
        let mut buf = vec![0u8; PAGE_SIZE];
        files.read_page(b, PageId(0), &mut buf)?;
        assert_eq!(buf, vec![7u8; PAGE_SIZE]);

        let c = files.add_file("c.grb")?;
        assert!(c.0 > b.0);
        Ok(())
    }

    #[test]
    fn test_delete_file() -> Result<()> {
        let dir = tempdir()?;
        let files = FileManager::open(dir.path(), PAGE_SIZE)?;
        let a = files.add_file("a.grb")?;
        files.allocate_page(a)?;
        assert_eq!(files.num_pages(a)?, 1);

        files.delete_file(a)?;
        assert!(!files.exists("a.grb"));
        assert!(!dir.path().join("a.grb").exists());
        assert!(files.num_pages(a).is_err());

        let again = files.add_file("a.grb")?;
        assert_ne!(again, a);
        Ok(())
    }
}
