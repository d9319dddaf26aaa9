use crate::access::bonsai::BTreeBonsai;
use crate::config::StorageConfig;
use crate::recovery::{AriesRecovery, RecoveryStats};
use crate::storage::buffer::lru::LruReplacer;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::disk::FileManager;
use crate::storage::error::StorageError;
use crate::storage::wal::{WalManager, LSN};
use crate::transaction::AtomicOperationsManager;
use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const META_FILE_NAME: &str = "bonsai.meta";

/// Settings fixed when a database is created.
#[derive(Debug, Serialize, Deserialize)]
struct DatabaseMeta {
    page_size: u32,
}

/// A directory of bonsai trees sharing one page cache and one WAL.
pub struct Database {
    dir: PathBuf,
    config: StorageConfig,
    manager: Arc<AtomicOperationsManager>,
    trees: DashMap<String, Arc<BTreeBonsai>>,
    recovery_stats: RecoveryStats,
}

impl Database {
    /// Create a new database in `dir`, which must not hold one yet.
    pub fn create(dir: &Path, config: StorageConfig) -> Result<Self> {
        if dir.join(META_FILE_NAME).exists() {
            bail!("Database already exists at {:?}", dir);
        }
        config.validate()?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create data directory {:?}", dir))?;
        let meta = DatabaseMeta {
            page_size: config.page_size as u32,
        };
        std::fs::write(
            dir.join(META_FILE_NAME),
            bincode::serialize(&meta).map_err(StorageError::from)?,
        )
        .context("Failed to write database meta file")?;
        info!("Created database at {:?}", dir);
        Self::start(dir, config)
    }

    /// Open an existing database, replaying its WAL first.
    pub fn open(dir: &Path, mut config: StorageConfig) -> Result<Self> {
        let meta_path = dir.join(META_FILE_NAME);
        if !meta_path.exists() {
            bail!("Database does not exist at {:?}", dir);
        }
        let bytes = std::fs::read(&meta_path).context("Failed to read database meta file")?;
        let meta: DatabaseMeta = bincode::deserialize(&bytes).map_err(StorageError::from)?;
        if meta.page_size as usize != config.page_size {
            warn!(
                "Database at {:?} uses {} byte pages, ignoring configured {}",
                dir, meta.page_size, config.page_size
            );
            config.page_size = meta.page_size as usize;
        }
        Self::start(dir, config)
    }

    pub fn open_or_create(dir: &Path, config: StorageConfig) -> Result<Self> {
        if dir.join(META_FILE_NAME).exists() {
            Self::open(dir, config)
        } else {
            Self::create(dir, config)
        }
    }

    fn start(dir: &Path, config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let files = Arc::new(FileManager::open(dir, config.page_size)?);
        let wal = Arc::new(WalManager::open(dir, config.wal.clone())?);
        let replacer = Box::new(LruReplacer::new(config.buffer_pool_frames));
        let buffer_pool = BufferPoolManager::new(files, wal, replacer, config.buffer_pool_frames);
        let manager = Arc::new(AtomicOperationsManager::new(buffer_pool));

        let recovery_stats = AriesRecovery::new(&manager)
            .recover()
            .with_context(|| format!("Recovery of {:?} failed", dir))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            manager,
            trees: DashMap::new(),
            recovery_stats,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery_stats
    }

    pub fn atomic_operations(&self) -> &Arc<AtomicOperationsManager> {
        &self.manager
    }

    pub fn buffer_pool(&self) -> &BufferPoolManager {
        self.manager.buffer_pool()
    }

    fn new_tree(&self, name: &str) -> BTreeBonsai {
        BTreeBonsai::new(name, self.manager.clone(), self.config.max_tree_depth)
    }

    /// Whether a tree called `name` exists on disk.
    pub fn has_bonsai(&self, name: &str) -> bool {
        self.manager.files().exists(self.new_tree(name).full_name())
    }

    /// Create a tree in its own atomic operation.
    pub fn create_bonsai(&self, name: &str) -> Result<Arc<BTreeBonsai>> {
        let tree = Arc::new(self.new_tree(name));
        self.manager.with_operation(|op| Ok(tree.create(op)?))?;
        self.trees.insert(name.to_string(), tree.clone());
        Ok(tree)
    }

    /// An existing tree, loaded on first use.
    pub fn bonsai(&self, name: &str) -> Result<Arc<BTreeBonsai>> {
        if let Some(tree) = self.trees.get(name) {
            return Ok(tree.clone());
        }
        let tree = Arc::new(self.new_tree(name));
        tree.load()?;
        let tree = self
            .trees
            .entry(name.to_string())
            .or_insert(tree)
            .clone();
        Ok(tree)
    }

    /// Delete a tree and its file in its own atomic operation.
    pub fn delete_bonsai(&self, name: &str) -> Result<()> {
        let tree = self.bonsai(name)?;
        self.manager.with_operation(|op| Ok(tree.delete(op)?))?;
        self.trees.remove(name);
        Ok(())
    }

    pub fn checkpoint(&self) -> Result<LSN> {
        self.manager.checkpoint()
    }

    /// Checkpoint and close. Dropping a database without closing it leaves
    /// the work to recovery on the next open.
    pub fn close(self) -> Result<()> {
        self.checkpoint()?;
        info!("Closed database at {:?}", self.dir);
        Ok(())
    }
}
