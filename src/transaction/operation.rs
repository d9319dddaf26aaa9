//! Atomic operations and the page handles they hand out.

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{Mutex, RawRwLock};
use std::sync::Arc;
use std::thread::ThreadId;

use super::id::OperationUnitId;
use super::state::AtomicOperationState;
use crate::storage::buffer::{BufferPoolManager, PageReadGuard, PageWriteGuard};
use crate::storage::disk::FileManager;
use crate::storage::error::StorageResult;
use crate::storage::page::{set_page_lsn, FileId, PageId, PageKey, PageMut, PageView};
use crate::storage::wal::{PageOperation, PageOperationRecord, WalFramePayload, WalManager, LSN};

/// Collaborators shared by the manager and every operation it starts.
pub(crate) struct OperationContext {
    pub buffer_pool: BufferPoolManager,
    pub wal: Arc<WalManager>,
    pub files: Arc<FileManager>,
    /// Operation running on each thread.
    pub active: DashMap<ThreadId, OperationUnitId>,
}

struct OperationLog {
    state: AtomicOperationState,
    records: Vec<(LSN, PageOperationRecord)>,
    created_files: Vec<FileId>,
    deleted_files: Vec<FileId>,
}

/// A group of page mutations that become durable together or not at all.
///
/// Every page mutation goes through a [`CacheEntry`] obtained from the
/// operation, which logs it before it can reach the disk. An operation
/// dropped without being ended is rolled back.
pub struct AtomicOperation {
    unit_id: OperationUnitId,
    thread: ThreadId,
    context: Arc<OperationContext>,
    log: Mutex<OperationLog>,
    _checkpoint_gate: ArcRwLockReadGuard<RawRwLock, ()>,
}

impl AtomicOperation {
    pub(crate) fn new(
        unit_id: OperationUnitId,
        context: Arc<OperationContext>,
        checkpoint_gate: ArcRwLockReadGuard<RawRwLock, ()>,
    ) -> Self {
        let thread = std::thread::current().id();
        context.active.insert(thread, unit_id);
        Self {
            unit_id,
            thread,
            context,
            log: Mutex::new(OperationLog {
                state: AtomicOperationState::Active,
                records: Vec::new(),
                created_files: Vec::new(),
                deleted_files: Vec::new(),
            }),
            _checkpoint_gate: checkpoint_gate,
        }
    }

    pub fn unit_id(&self) -> OperationUnitId {
        self.unit_id
    }

    pub fn state(&self) -> AtomicOperationState {
        self.log.lock().state
    }

    /// Number of page operations applied so far.
    pub fn applied_operations(&self) -> usize {
        self.log.lock().records.len()
    }

    pub fn mark_rollback_only(&self) {
        let mut log = self.log.lock();
        if log.state == AtomicOperationState::Active {
            log.state = AtomicOperationState::RollbackOnly;
        }
    }

    pub fn load_page_for_read(&self, file_id: FileId, page_id: PageId) -> Result<PageReadGuard> {
        self.context
            .buffer_pool
            .fetch_page(PageKey::new(file_id, page_id))
    }

    pub fn load_page_for_write(&self, file_id: FileId, page_id: PageId) -> Result<CacheEntry<'_>> {
        let guard = self
            .context
            .buffer_pool
            .fetch_page_write(PageKey::new(file_id, page_id))?;
        Ok(CacheEntry {
            operation: self,
            guard,
        })
    }

    /// Append a page to the file and hand it out for write.
    pub fn add_page(&self, file_id: FileId) -> Result<CacheEntry<'_>> {
        let (_, guard) = self.context.buffer_pool.new_page(file_id)?;
        Ok(CacheEntry {
            operation: self,
            guard,
        })
    }

    pub fn filled_up_to(&self, file_id: FileId) -> Result<u32> {
        self.context.buffer_pool.filled_up_to(file_id)
    }

    /// Create a file owned by this operation: rolling back removes it.
    pub fn add_file(&self, name: &str) -> Result<FileId> {
        let file_id = self.context.files.add_file(name)?;
        self.context.wal.append(WalFramePayload::FileCreated {
            unit: self.unit_id.0,
            file_id,
        })?;
        self.log.lock().created_files.push(file_id);
        Ok(file_id)
    }

    pub fn open_file(&self, name: &str) -> Result<FileId> {
        self.context.files.open_file(name)
    }

    pub fn file_exists(&self, name: &str) -> bool {
        self.context.files.exists(name)
    }

    /// Delete a file once the operation commits.
    pub fn delete_file(&self, file_id: FileId) -> Result<()> {
        if !self.context.files.exists_id(file_id) {
            return Err(anyhow!(crate::storage::error::StorageError::UnknownFile(
                file_id
            )));
        }
        self.log.lock().deleted_files.push(file_id);
        Ok(())
    }

    fn log_page_operation(&self, record: PageOperationRecord) -> StorageResult<LSN> {
        let lsn = self.context.wal.append(WalFramePayload::PageOperation {
            record: record.to_bytes(),
        })?;
        self.log.lock().records.push((lsn, record));
        Ok(lsn)
    }

    /// Commit or roll back. Returns an error when a commit was requested
    /// for an operation marked rollback-only; it is rolled back instead.
    pub(crate) fn finish(&self, rollback: bool) -> Result<()> {
        let state = self.state();
        if state.is_finished() {
            return Err(anyhow!(
                "atomic operation {} is already {}",
                self.unit_id,
                state
            ));
        }
        if rollback {
            return self.rollback();
        }
        if state == AtomicOperationState::RollbackOnly {
            self.rollback()?;
            return Err(anyhow!(
                "atomic operation {} was marked rollback-only and has been rolled back",
                self.unit_id
            ));
        }
        self.commit()
    }

    fn commit(&self) -> Result<()> {
        let context = &self.context;
        context.wal.append(WalFramePayload::Commit {
            unit: self.unit_id.0,
        })?;
        context.wal.flush()?;

        let deleted = {
            let mut log = self.log.lock();
            log.state = AtomicOperationState::Committed;
            std::mem::take(&mut log.deleted_files)
        };
        for file_id in deleted {
            context.buffer_pool.discard_file(file_id);
            context.files.delete_file(file_id)?;
        }
        debug!("Committed {}", self.unit_id);
        Ok(())
    }

    /// Undo every logged page operation, newest first, then log the
    /// rollback. A record leaves the log only once it has been undone and
    /// compensated. If anything fails the operation becomes
    /// `RollbackFailed`: no rollback frame is written, so recovery still
    /// treats the unit as unfinished and completes the undo.
    fn rollback(&self) -> Result<()> {
        warn!(
            "Rolling back {} ({} page operations)",
            self.unit_id,
            self.applied_operations()
        );
        if let Err(e) = self.undo_all() {
            self.log.lock().state = AtomicOperationState::RollbackFailed;
            if let Err(flush) = self.context.wal.flush() {
                warn!("Could not flush WAL after failed rollback: {}", flush);
            }
            return Err(e.context(format!("Rollback of {} failed", self.unit_id)));
        }
        self.log.lock().state = AtomicOperationState::RolledBack;
        Ok(())
    }

    fn undo_all(&self) -> Result<()> {
        let context = &self.context;
        let created = self.log.lock().created_files.clone();

        loop {
            let next = self.log.lock().records.pop();
            let (lsn, record) = match next {
                Some(entry) => entry,
                None => break,
            };
            if created.contains(&record.file_id) {
                continue;
            }
            if let Err(e) = self.undo_record(lsn, &record) {
                self.log.lock().records.push((lsn, record));
                return Err(e);
            }
        }

        for file_id in created {
            context.buffer_pool.discard_file(file_id);
            context.files.delete_file(file_id)?;
            self.log.lock().created_files.retain(|id| *id != file_id);
        }

        context.wal.append(WalFramePayload::Rollback {
            unit: self.unit_id.0,
        })?;
        context.wal.flush()?;
        Ok(())
    }

    fn undo_record(&self, lsn: LSN, record: &PageOperationRecord) -> Result<()> {
        let key = PageKey::new(record.file_id, record.page_index);
        let mut guard = self
            .context
            .buffer_pool
            .fetch_page_write(key)
            .with_context(|| format!("Failed to load page {} for undo", key))?;
        record
            .undo(&mut guard)
            .with_context(|| format!("Failed to undo {} on page {}", lsn, key))?;
        let clr = self.context.wal.append(WalFramePayload::Compensation {
            undo_of: lsn,
            record: record.to_bytes(),
        })?;
        set_page_lsn(&mut guard, clr);
        Ok(())
    }
}

impl Drop for AtomicOperation {
    fn drop(&mut self) {
        if !self.state().is_finished() {
            if let Err(e) = self.rollback() {
                warn!("Rollback of abandoned {} failed: {:#}", self.unit_id, e);
            }
        }
        self.context
            .active
            .remove_if(&self.thread, |_, unit| *unit == self.unit_id);
    }
}

/// A page pinned for write inside an atomic operation.
///
/// Applying a page operation redoes it on the page, appends it to the WAL,
/// stamps the page with the assigned LSN and remembers it for rollback.
pub struct CacheEntry<'a> {
    operation: &'a AtomicOperation,
    guard: PageWriteGuard,
}

impl CacheEntry<'_> {
    pub fn file_id(&self) -> FileId {
        self.guard.key().file_id
    }

    pub fn page_id(&self) -> PageId {
        self.guard.key().page_id
    }
}

impl PageView for CacheEntry<'_> {
    fn data(&self) -> &[u8] {
        &self.guard
    }
}

impl PageMut for CacheEntry<'_> {
    fn apply(&mut self, operation: PageOperation) -> StorageResult<()> {
        operation.redo(&mut self.guard)?;
        let key = self.guard.key();
        let record = PageOperationRecord::new(
            key.file_id,
            key.page_id,
            self.operation.unit_id.0,
            operation,
        );
        match self.operation.log_page_operation(record.clone()) {
            Ok(lsn) => {
                set_page_lsn(&mut self.guard, lsn);
                Ok(())
            }
            Err(e) => {
                if let Err(undo) = record.undo(&mut self.guard) {
                    warn!("Could not revert unlogged change on {}: {}", key, undo);
                }
                Err(e)
            }
        }
    }
}
