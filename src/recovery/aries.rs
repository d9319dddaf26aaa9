//! Crash recovery in three passes over the WAL:
//! 1. Analysis: find the units that never finished
//! 2. Redo: repeat history for every page the log touches
//! 3. Undo: roll back the unfinished units, logging compensations

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashSet};

use crate::storage::page::{page_lsn, set_page_lsn, FileId, PageKey};
use crate::storage::wal::{PageOperationRecord, WalFrame, WalFramePayload, LSN};
use crate::transaction::AtomicOperationsManager;

/// How a unit ended, as far as the log tells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Active,
    Committed,
    RolledBack,
}

/// What the log holds about one operation unit.
#[derive(Debug)]
pub struct UnitTableEntry {
    pub status: UnitStatus,
    pub records: Vec<(LSN, PageOperationRecord)>,
    pub created_files: Vec<FileId>,
}

impl UnitTableEntry {
    fn new() -> Self {
        Self {
            status: UnitStatus::Active,
            records: Vec::new(),
            created_files: Vec::new(),
        }
    }
}

/// Output of the analysis pass.
#[derive(Debug, Default)]
pub struct Analysis {
    pub units: BTreeMap<u64, UnitTableEntry>,
    /// LSNs of page operations already undone by a compensation frame.
    pub compensated: HashSet<LSN>,
    pub max_unit: u64,
}

impl Analysis {
    pub fn losers(&self) -> impl Iterator<Item = (&u64, &UnitTableEntry)> {
        self.units
            .iter()
            .filter(|(_, entry)| entry.status == UnitStatus::Active)
    }
}

/// Recovery statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Number of frames read from the log.
    pub records_analyzed: usize,
    /// Number of page operations and compensations reapplied.
    pub records_redone: usize,
    /// Number of page operations undone for unfinished units.
    pub records_undone: usize,
    /// Number of units that were rolled back.
    pub losers: usize,
    pub recovery_start_lsn: LSN,
    pub recovery_end_lsn: LSN,
}

pub struct AriesRecovery<'a> {
    manager: &'a AtomicOperationsManager,
}

impl<'a> AriesRecovery<'a> {
    pub fn new(manager: &'a AtomicOperationsManager) -> Self {
        Self { manager }
    }

    /// Bring every file back to the state of the last finished operations,
    /// then checkpoint.
    pub fn recover(&self) -> Result<RecoveryStats> {
        let frames = self
            .manager
            .wal()
            .read_all()
            .context("Failed to read the WAL for recovery")?;

        let mut stats = RecoveryStats {
            records_analyzed: frames.len(),
            recovery_start_lsn: frames.first().map(|f| f.lsn).unwrap_or_default(),
            ..Default::default()
        };

        let analysis = Self::analysis_phase(&frames)?;
        self.redo_phase(&frames, &analysis, &mut stats)?;
        self.undo_phase(&analysis, &mut stats)?;

        self.manager.id_generator().advance_past(analysis.max_unit);
        stats.recovery_end_lsn = self.manager.checkpoint()?;

        info!(
            "Recovery done: {} frames analyzed, {} redone, {} undone, {} units rolled back",
            stats.records_analyzed, stats.records_redone, stats.records_undone, stats.losers
        );
        Ok(stats)
    }

    pub fn analysis_phase(frames: &[WalFrame]) -> Result<Analysis> {
        let mut analysis = Analysis::default();

        for frame in frames {
            if let Some(unit) = frame.unit()? {
                analysis.max_unit = analysis.max_unit.max(unit);
            }
            match &frame.payload {
                WalFramePayload::PageOperation { .. } => {
                    if let Some(record) = frame.page_operation()? {
                        analysis
                            .units
                            .entry(record.operation_unit_id)
                            .or_insert_with(UnitTableEntry::new)
                            .records
                            .push((frame.lsn, record));
                    }
                }
                WalFramePayload::Compensation { undo_of, .. } => {
                    analysis.compensated.insert(*undo_of);
                }
                WalFramePayload::FileCreated { unit, file_id } => {
                    analysis
                        .units
                        .entry(*unit)
                        .or_insert_with(UnitTableEntry::new)
                        .created_files
                        .push(*file_id);
                }
                WalFramePayload::Commit { unit } => {
                    analysis
                        .units
                        .entry(*unit)
                        .or_insert_with(UnitTableEntry::new)
                        .status = UnitStatus::Committed;
                }
                WalFramePayload::Rollback { unit } => {
                    analysis
                        .units
                        .entry(*unit)
                        .or_insert_with(UnitTableEntry::new)
                        .status = UnitStatus::RolledBack;
                }
                WalFramePayload::Checkpoint { .. } => {}
            }
        }
        Ok(analysis)
    }

    /// Repeat history: every logged change, compensations included, is
    /// reapplied to pages older than it.
    fn redo_phase(
        &self,
        frames: &[WalFrame],
        analysis: &Analysis,
        stats: &mut RecoveryStats,
    ) -> Result<()> {
        let files = self.manager.files();
        let buffer_pool = self.manager.buffer_pool();

        for frame in frames {
            let Some(record) = frame.page_operation()? else {
                continue;
            };
            if !files.exists_id(record.file_id) {
                debug!("Skipping {} of removed file {}", frame.lsn, record.file_id);
                continue;
            }

            let key = PageKey::new(record.file_id, record.page_index);
            let mut guard = buffer_pool.fetch_page_write_or_allocate(key)?;
            if page_lsn(&guard) >= frame.lsn {
                continue;
            }
            match frame.payload {
                WalFramePayload::Compensation { .. } => record.undo(&mut guard),
                _ => record.redo(&mut guard),
            }
            .with_context(|| format!("Failed to redo {} on page {}", frame.lsn, key))?;
            set_page_lsn(&mut guard, frame.lsn);
            stats.records_redone += 1;
        }
        debug!(
            "Redo pass reapplied {} records, {} units to roll back",
            stats.records_redone,
            analysis.losers().count()
        );
        Ok(())
    }

    fn undo_phase(&self, analysis: &Analysis, stats: &mut RecoveryStats) -> Result<()> {
        let files = self.manager.files();
        let buffer_pool = self.manager.buffer_pool();
        let wal = self.manager.wal();

        for (unit, entry) in analysis.losers() {
            warn!(
                "Rolling back unfinished Unit{} ({} page operations)",
                unit,
                entry.records.len()
            );
            for (lsn, record) in entry.records.iter().rev() {
                if analysis.compensated.contains(lsn)
                    || entry.created_files.contains(&record.file_id)
                    || !files.exists_id(record.file_id)
                {
                    continue;
                }
                let key = PageKey::new(record.file_id, record.page_index);
                let mut guard = buffer_pool.fetch_page_write_or_allocate(key)?;
                record
                    .undo(&mut guard)
                    .with_context(|| format!("Failed to undo {} on page {}", lsn, key))?;
                let clr = wal.append(WalFramePayload::Compensation {
                    undo_of: *lsn,
                    record: record.to_bytes(),
                })?;
                set_page_lsn(&mut guard, clr);
                stats.records_undone += 1;
            }

            for file_id in &entry.created_files {
                if files.exists_id(*file_id) {
                    buffer_pool.discard_file(*file_id);
                    files.delete_file(*file_id)?;
                }
            }
            wal.append(WalFramePayload::Rollback { unit: *unit })?;
            stats.losers += 1;
        }
        wal.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalConfig;
    use crate::storage::buffer::{lru::LruReplacer, BufferPoolManager};
    use crate::storage::disk::FileManager;
    use crate::storage::page::{Bucket, PageId};
    use crate::storage::wal::WalManager;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    const PAGE_SIZE: usize = 256;

    fn open_manager(dir: &Path) -> Result<AtomicOperationsManager> {
        let files = Arc::new(FileManager::open(dir, PAGE_SIZE)?);
        let wal = Arc::new(WalManager::open(
            dir,
            WalConfig {
                sync_on_commit: false,
                ..Default::default()
            },
        )?);
        let buffer_pool = BufferPoolManager::new(files, wal, Box::new(LruReplacer::new(16)), 16);
        Ok(AtomicOperationsManager::new(buffer_pool))
    }

    fn create_leaf(manager: &AtomicOperationsManager, name: &str) -> Result<PageKey> {
        manager.with_operation(|op| {
            let file_id = op.add_file(name)?;
            let mut page = op.add_page(file_id)?;
            let page_id = page.page_id();
            Bucket::new(&mut page).init(true)?;
            Ok(PageKey::new(file_id, page_id))
        })
    }

    fn leaf_keys(manager: &AtomicOperationsManager, key: PageKey) -> Result<usize> {
        let guard = manager.buffer_pool().fetch_page(key)?;
        Ok(Bucket::new(&guard).size())
    }

    #[test]
    fn test_empty_recovery() -> Result<()> {
        let dir = tempdir()?;
        let manager = open_manager(dir.path())?;
        let stats = AriesRecovery::new(&manager).recover()?;
        assert_eq!(stats.records_redone, 0);
        assert_eq!(stats.records_undone, 0);
        assert_eq!(stats.losers, 0);
        Ok(())
    }

    #[test]
    fn test_committed_changes_are_redone() -> Result<()> {
        let dir = tempdir()?;
        let key = {
            let manager = open_manager(dir.path())?;
            let key = create_leaf(&manager, "redo.grb")?;
            manager.with_operation(|op| {
                let mut page = op.load_page_for_write(key.file_id, key.page_id)?;
                Bucket::new(&mut page).add_leaf_entry(0, &[0u8; 12], &[6])?;
                Ok(())
            })?;
            key
        };

        let manager = open_manager(dir.path())?;
        let stats = AriesRecovery::new(&manager).recover()?;
        assert_eq!(stats.records_redone, 2);
        assert_eq!(stats.losers, 0);
        assert_eq!(leaf_keys(&manager, key)?, 1);
        Ok(())
    }

    #[test]
    fn test_unfinished_unit_is_undone() -> Result<()> {
        let dir = tempdir()?;
        let key = {
            let manager = open_manager(dir.path())?;
            let key = create_leaf(&manager, "undo.grb")?;
            let op = manager.start_atomic_operation()?;
            {
                let mut page = op.load_page_for_write(key.file_id, key.page_id)?;
                let mut bucket = Bucket::new(&mut page);
                bucket.add_leaf_entry(0, &[0u8; 12], &[6])?;
                bucket.set_right_sibling(Some(PageId(3)))?;
            }
            manager.buffer_pool().flush_all()?;
            std::mem::forget(op);
            key
        };

        let manager = open_manager(dir.path())?;
        let stats = AriesRecovery::new(&manager).recover()?;
        assert_eq!(stats.losers, 1);
        assert_eq!(stats.records_undone, 2);

        let guard = manager.buffer_pool().fetch_page(key)?;
        let bucket = Bucket::new(&guard);
        assert!(bucket.is_empty());
        assert_eq!(bucket.right_sibling(), None);
        Ok(())
    }

    #[test]
    fn test_files_of_unfinished_unit_are_removed() -> Result<()> {
        let dir = tempdir()?;
        {
            let manager = open_manager(dir.path())?;
            let op = manager.start_atomic_operation()?;
            let file_id = op.add_file("orphan.grb")?;
            {
                let mut page = op.add_page(file_id)?;
                Bucket::new(&mut page).init(true)?;
            }
            manager.wal().flush()?;
            std::mem::forget(op);
        }

        let manager = open_manager(dir.path())?;
        let stats = AriesRecovery::new(&manager).recover()?;
        assert_eq!(stats.losers, 1);
        assert!(!manager.files().exists("orphan.grb"));
        Ok(())
    }

    #[test]
    fn test_compensations_are_redone() -> Result<()> {
        let dir = tempdir()?;
        let key = {
            let manager = open_manager(dir.path())?;
            let key = create_leaf(&manager, "clr.grb")?;
            let op = manager.start_atomic_operation()?;
            {
                let mut page = op.load_page_for_write(key.file_id, key.page_id)?;
                Bucket::new(&mut page).add_leaf_entry(0, &[0u8; 12], &[6])?;
            }
            manager.end_atomic_operation(op, true)?;
            key
        };

        let manager = open_manager(dir.path())?;
        let stats = AriesRecovery::new(&manager).recover()?;
        assert_eq!(stats.losers, 0);
        assert_eq!(stats.records_undone, 0);
        assert_eq!(leaf_keys(&manager, key)?, 0);
        Ok(())
    }

    #[test]
    fn test_unit_ids_resume_after_log() -> Result<()> {
        let dir = tempdir()?;
        let last = {
            let manager = open_manager(dir.path())?;
            create_leaf(&manager, "ids.grb")?;
            create_leaf(&manager, "ids2.grb")?;
            manager.id_generator().current()
        };

        let manager = open_manager(dir.path())?;
        AriesRecovery::new(&manager).recover()?;
        let op = manager.start_atomic_operation()?;
        assert!(op.unit_id() > last);
        manager.end_atomic_operation(op, false)?;
        Ok(())
    }

    #[test]
    fn test_analysis_finds_losers() -> Result<()> {
        let frames = vec![
            WalFrame {
                lsn: LSN(1),
                payload: WalFramePayload::FileCreated {
                    unit: 1,
                    file_id: FileId(0),
                },
            },
            WalFrame {
                lsn: LSN(2),
                payload: WalFramePayload::Commit { unit: 1 },
            },
            WalFrame {
                lsn: LSN(3),
                payload: WalFramePayload::FileCreated {
                    unit: 2,
                    file_id: FileId(1),
                },
            },
        ];
        let analysis = AriesRecovery::analysis_phase(&frames)?;
        assert_eq!(analysis.max_unit, 2);
        let losers: Vec<u64> = analysis.losers().map(|(unit, _)| *unit).collect();
        assert_eq!(losers, vec![2]);
        Ok(())
    }
}
