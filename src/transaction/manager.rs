//! Atomic operations manager: starts and ends atomic operations, hands out
//! component coordination locks and runs checkpoints.

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use log::{info, warn};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::sync::Arc;

use super::id::{OperationUnitId, OperationUnitIdGenerator};
use super::operation::{AtomicOperation, OperationContext};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::disk::FileManager;
use crate::storage::wal::{WalManager, LSN};

/// Scoped read side of a component coordination lock.
pub type ComponentReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;
/// Scoped exclusive side of a component coordination lock.
pub type ComponentFreezeGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

pub struct AtomicOperationsManager {
    context: Arc<OperationContext>,
    id_generator: OperationUnitIdGenerator,
    /// Held shared by every running operation, exclusively by a checkpoint.
    checkpoint_gate: Arc<RwLock<()>>,
    component_locks: DashMap<String, Arc<RwLock<()>>>,
}

impl AtomicOperationsManager {
    pub fn new(buffer_pool: BufferPoolManager) -> Self {
        let wal = buffer_pool.wal().clone();
        let files = buffer_pool.files().clone();
        Self {
            context: Arc::new(OperationContext {
                buffer_pool,
                wal,
                files,
                active: DashMap::new(),
            }),
            id_generator: OperationUnitIdGenerator::new(),
            checkpoint_gate: Arc::new(RwLock::new(())),
            component_locks: DashMap::new(),
        }
    }

    pub fn buffer_pool(&self) -> &BufferPoolManager {
        &self.context.buffer_pool
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.context.wal
    }

    pub fn files(&self) -> &Arc<FileManager> {
        &self.context.files
    }

    pub fn id_generator(&self) -> &OperationUnitIdGenerator {
        &self.id_generator
    }

    /// Start an atomic operation bound to the calling thread.
    ///
    /// Operations do not nest: a thread that already runs one gets an error.
    pub fn start_atomic_operation(&self) -> Result<AtomicOperation> {
        if let Some(unit) = self.current_operation_id() {
            return Err(anyhow!(
                "atomic operation {} is already running on this thread",
                unit
            ));
        }
        let gate = self.checkpoint_gate.read_arc();
        let unit_id = self.id_generator.next();
        Ok(AtomicOperation::new(unit_id, self.context.clone(), gate))
    }

    /// Commit the operation, or roll it back when `rollback` is set.
    pub fn end_atomic_operation(&self, operation: AtomicOperation, rollback: bool) -> Result<()> {
        operation.finish(rollback)
    }

    /// Run `body` inside a fresh atomic operation: committed when the body
    /// succeeds, rolled back when it fails.
    pub fn with_operation<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&AtomicOperation) -> Result<T>,
    {
        let operation = self.start_atomic_operation()?;
        match body(&operation) {
            Ok(value) => {
                self.end_atomic_operation(operation, false)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.end_atomic_operation(operation, true) {
                    warn!("Rollback after failure failed: {:#}", rollback);
                }
                Err(e)
            }
        }
    }

    /// Run a component's mutation inside `operation`. A failing body leaves
    /// the operation rollback-only.
    pub fn execute_inside_component_operation<T, F>(
        &self,
        operation: &AtomicOperation,
        component: &str,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(&AtomicOperation) -> Result<T>,
    {
        body(operation).map_err(|e| {
            warn!(
                "{} failed inside {}, marking it rollback-only: {:#}",
                component,
                operation.unit_id(),
                e
            );
            operation.mark_rollback_only();
            e
        })
    }

    fn component_lock(&self, component: &str) -> Arc<RwLock<()>> {
        self.component_locks
            .entry(component.to_string())
            .or_default()
            .clone()
    }

    /// Coordination token taken by readers of a component. Released on drop.
    pub fn acquire_read_lock(&self, component: &str) -> ComponentReadGuard {
        self.component_lock(component).read_arc()
    }

    /// Exclude readers of a component until the guard is dropped.
    pub fn freeze_component(&self, component: &str) -> ComponentFreezeGuard {
        self.component_lock(component).write_arc()
    }

    /// Operation running on the calling thread, if any.
    pub fn current_operation_id(&self) -> Option<OperationUnitId> {
        self.context
            .active
            .get(&std::thread::current().id())
            .map(|entry| *entry.value())
    }

    pub fn has_active_operations(&self) -> bool {
        !self.context.active.is_empty()
    }

    /// Flush every page, sync every file and restart the WAL.
    ///
    /// Waits for running operations to end and blocks new ones meanwhile.
    pub fn checkpoint(&self) -> Result<LSN> {
        if let Some(unit) = self.current_operation_id() {
            return Err(anyhow!(
                "cannot checkpoint while {} runs on this thread",
                unit
            ));
        }
        let _gate = self.checkpoint_gate.write();
        self.context.buffer_pool.flush_all()?;
        self.context.files.sync_all()?;
        let lsn = self.context.wal.truncate()?;
        info!("Checkpoint at {}", lsn);
        Ok(lsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalConfig;
    use crate::storage::buffer::lru::LruReplacer;
    use crate::storage::page::{Bucket, PageId, PageKey, PageView};
    use crate::storage::wal::WalFramePayload;
    use crate::transaction::AtomicOperationState;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::{tempdir, TempDir};

    const PAGE_SIZE: usize = 256;

    fn create_manager() -> Result<(AtomicOperationsManager, TempDir)> {
        let dir = tempdir()?;
        let files = Arc::new(FileManager::open(dir.path(), PAGE_SIZE)?);
        let wal = Arc::new(WalManager::open(
            dir.path(),
            WalConfig {
                sync_on_commit: false,
                ..Default::default()
            },
        )?);
        let buffer_pool = BufferPoolManager::new(files, wal, Box::new(LruReplacer::new(16)), 16);
        Ok((AtomicOperationsManager::new(buffer_pool), dir))
    }

    fn leaf_size(manager: &AtomicOperationsManager, key: PageKey) -> Result<usize> {
        let guard = manager.buffer_pool().fetch_page(key)?;
        Ok(Bucket::new(&guard).size())
    }

    #[test]
    fn test_commit_keeps_changes_and_logs_them() -> Result<()> {
        let (manager, _dir) = create_manager()?;
        let key = manager.with_operation(|op| {
            let file_id = op.add_file("commit.grb")?;
            let mut page = op.add_page(file_id)?;
            let page_id = page.page_id();
            let mut bucket = Bucket::new(&mut page);
            bucket.init(true)?;
            bucket.add_leaf_entry(0, &[0u8; 12], &[2])?;
            assert_eq!(op.applied_operations(), 2);
            Ok(PageKey::new(file_id, page_id))
        })?;

        assert_eq!(leaf_size(&manager, key)?, 1);
        let frames = manager.wal().read_all()?;
        assert!(frames
            .iter()
            .any(|f| matches!(f.payload, WalFramePayload::Commit { .. })));
        assert_eq!(
            frames.iter().filter(|f| f.page_operation().ok().flatten().is_some()).count(),
            2
        );
        assert!(manager.current_operation_id().is_none());
        Ok(())
    }

    #[test]
    fn test_rollback_restores_page_bytes() -> Result<()> {
        let (manager, _dir) = create_manager()?;
        let key = manager.with_operation(|op| {
            let file_id = op.add_file("rollback.grb")?;
            let mut page = op.add_page(file_id)?;
            let page_id = page.page_id();
            Bucket::new(&mut page).init(true)?;
            Ok(PageKey::new(file_id, page_id))
        })?;
        let before = manager.buffer_pool().fetch_page(key)?.to_vec();

        let op = manager.start_atomic_operation()?;
        {
            let mut page = op.load_page_for_write(key.file_id, key.page_id)?;
            let mut bucket = Bucket::new(&mut page);
            bucket.add_leaf_entry(0, &[1u8; 12], &[4])?;
            bucket.set_right_sibling(Some(PageId(9)))?;
        }
        manager.end_atomic_operation(op, true)?;

        let after = manager.buffer_pool().fetch_page(key)?;
        assert_eq!(&after[8..], &before[8..]);
        let frames = manager.wal().read_all()?;
        let compensations = frames
            .iter()
            .filter(|f| matches!(f.payload, WalFramePayload::Compensation { .. }))
            .count();
        assert_eq!(compensations, 2);
        Ok(())
    }

    #[test]
    fn test_dropped_operation_rolls_back() -> Result<()> {
        let (manager, _dir) = create_manager()?;
        let key = manager.with_operation(|op| {
            let file_id = op.add_file("dropped.grb")?;
            let mut page = op.add_page(file_id)?;
            let page_id = page.page_id();
            Bucket::new(&mut page).init(true)?;
            Ok(PageKey::new(file_id, page_id))
        })?;

        {
            let op = manager.start_atomic_operation()?;
            let mut page = op.load_page_for_write(key.file_id, key.page_id)?;
            Bucket::new(&mut page).add_leaf_entry(0, &[1u8; 12], &[4])?;
        }
        assert_eq!(leaf_size(&manager, key)?, 0);
        assert!(manager.current_operation_id().is_none());
        Ok(())
    }

    #[test]
    fn test_failed_body_rolls_back_created_file() -> Result<()> {
        let (manager, _dir) = create_manager()?;
        let result: Result<()> = manager.with_operation(|op| {
            let file_id = op.add_file("doomed.grb")?;
            let mut page = op.add_page(file_id)?;
            Bucket::new(&mut page).init(true)?;
            Err(anyhow!("boom"))
        });
        assert!(result.is_err());
        assert!(!manager.files().exists("doomed.grb"));
        Ok(())
    }

    #[test]
    fn test_failed_undo_leaves_unit_unfinished() -> Result<()> {
        let (manager, _dir) = create_manager()?;
        let key = manager.with_operation(|op| {
            let file_id = op.add_file("stuck.grb")?;
            let mut page = op.add_page(file_id)?;
            let page_id = page.page_id();
            Bucket::new(&mut page).init(true)?;
            Ok(PageKey::new(file_id, page_id))
        })?;

        let op = manager.start_atomic_operation()?;
        let unit = op.unit_id().0;
        {
            let mut page = op.load_page_for_write(key.file_id, key.page_id)?;
            let mut bucket = Bucket::new(&mut page);
            bucket.add_leaf_entry(0, &[1u8; 12], &[4])?;
            bucket.set_right_sibling(Some(PageId(9)))?;
        }
        {
            // Empty the bucket behind the operation's back so undoing the
            // insert has nothing to remove.
            let mut guard = manager.buffer_pool().fetch_page_write(key)?;
            guard[12..16].copy_from_slice(&0u32.to_le_bytes());
        }

        assert!(op.finish(true).is_err());
        assert_eq!(op.state(), AtomicOperationState::RollbackFailed);
        assert_eq!(op.applied_operations(), 1);
        assert!(op.finish(true).is_err());
        drop(op);

        let frames = manager.wal().read_all()?;
        assert!(!frames
            .iter()
            .any(|f| matches!(f.payload, WalFramePayload::Rollback { unit: u } if u == unit)));
        let compensations = frames
            .iter()
            .filter(|f| matches!(f.payload, WalFramePayload::Compensation { .. }))
            .count();
        assert_eq!(compensations, 1);
        assert!(manager.current_operation_id().is_none());
        Ok(())
    }

    #[test]
    fn test_operations_do_not_nest() -> Result<()> {
        let (manager, _dir) = create_manager()?;
        let op = manager.start_atomic_operation()?;
        assert_eq!(manager.current_operation_id(), Some(op.unit_id()));
        assert!(manager.start_atomic_operation().is_err());
        assert!(manager.checkpoint().is_err());
        manager.end_atomic_operation(op, false)?;

        let next = manager.start_atomic_operation()?;
        manager.end_atomic_operation(next, false)?;
        Ok(())
    }

    #[test]
    fn test_rollback_only_operation_cannot_commit() -> Result<()> {
        let (manager, _dir) = create_manager()?;
        let op = manager.start_atomic_operation()?;
        let result: Result<()> =
            manager.execute_inside_component_operation(&op, "tree", |_| Err(anyhow!("failed")));
        assert!(result.is_err());
        assert_eq!(op.state(), AtomicOperationState::RollbackOnly);
        assert!(manager.end_atomic_operation(op, false).is_err());
        Ok(())
    }

    #[test]
    fn test_file_deletion_waits_for_commit() -> Result<()> {
        let (manager, _dir) = create_manager()?;
        manager.with_operation(|op| op.add_file("victim.grb").map(|_| ()))?;

        let op = manager.start_atomic_operation()?;
        let file_id = op.open_file("victim.grb")?;
        op.delete_file(file_id)?;
        assert!(manager.files().exists("victim.grb"));
        manager.end_atomic_operation(op, false)?;
        assert!(!manager.files().exists("victim.grb"));
        Ok(())
    }

    #[test]
    fn test_freeze_waits_for_readers() -> Result<()> {
        let (manager, _dir) = create_manager()?;
        let manager = Arc::new(manager);
        let frozen = Arc::new(AtomicBool::new(false));

        let reader = manager.acquire_read_lock("tree");
        let handle = {
            let manager = manager.clone();
            let frozen = frozen.clone();
            std::thread::spawn(move || {
                let _freeze = manager.freeze_component("tree");
                frozen.store(true, Ordering::SeqCst);
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!frozen.load(Ordering::SeqCst));
        drop(reader);
        handle.join().map_err(|_| anyhow!("freezer panicked"))?;
        assert!(frozen.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn test_checkpoint_restarts_wal() -> Result<()> {
        let (manager, _dir) = create_manager()?;
        let key = manager.with_operation(|op| {
            let file_id = op.add_file("cp.grb")?;
            let mut page = op.add_page(file_id)?;
            let page_id = page.page_id();
            Bucket::new(&mut page).init(true)?;
            Ok(PageKey::new(file_id, page_id))
        })?;
        let last = manager.wal().current_lsn();

        let lsn = manager.checkpoint()?;
        assert!(lsn > last);
        let frames = manager.wal().read_all()?;
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0].payload, WalFramePayload::Checkpoint { .. }));

        let mut buf = vec![0u8; PAGE_SIZE];
        manager
            .files()
            .read_page(key.file_id, key.page_id, &mut buf)?;
        assert!(Bucket::new(&buf).is_leaf());
        assert!(Bucket::new(buf.data()).is_empty());
        Ok(())
    }
}
