//! Page cache.
//!
//! Pages are addressed by `(FileId, PageId)` and handed out through guards
//! that keep the frame pinned and hold the page latch. Dropping a guard
//! releases both, so every fetch is released exactly once on every path.

pub mod lru;
pub mod replacer;

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use log::{debug, trace};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use replacer::{FrameId, Replacer};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::storage::disk::FileManager;
use crate::storage::error::StorageError;
use crate::storage::page::{FileId, PageId, PageKey, PageView};
use crate::storage::wal::WalManager;

type PageData = Arc<RwLock<Box<[u8]>>>;

struct Frame {
    data: PageData,
    page: Option<PageKey>,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
}

impl Frame {
    fn new(page_size: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            page: None,
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }
}

#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    page_table: DashMap<PageKey, FrameId>,
    frames: RwLock<HashMap<FrameId, Frame>>,
    replacer: Mutex<Box<dyn Replacer>>,
    files: Arc<FileManager>,
    wal: Arc<WalManager>,
    /// Serializes cache misses, evictions and allocations.
    load_latch: Mutex<()>,
    next_frame_id: AtomicU32,
    max_frames: usize,
    page_size: usize,
}

impl BufferPoolInner {
    fn release(&self, frame_id: FrameId) {
        let should_unpin = {
            let frames = self.frames.read();
            match frames.get(&frame_id) {
                Some(frame) => frame.pin_count.fetch_sub(1, Ordering::SeqCst) == 1,
                None => false,
            }
        };
        if should_unpin {
            self.replacer.lock().unpin(frame_id);
        }
    }

    fn mark_dirty(&self, frame_id: FrameId) {
        if let Some(frame) = self.frames.read().get(&frame_id) {
            frame.is_dirty.store(true, Ordering::SeqCst);
        }
    }
}

impl BufferPoolManager {
    pub fn new(
        files: Arc<FileManager>,
        wal: Arc<WalManager>,
        replacer: Box<dyn Replacer>,
        max_frames: usize,
    ) -> Self {
        let page_size = files.page_size();
        Self {
            inner: Arc::new(BufferPoolInner {
                page_table: DashMap::new(),
                frames: RwLock::new(HashMap::with_capacity(max_frames)),
                replacer: Mutex::new(replacer),
                files,
                wal,
                load_latch: Mutex::new(()),
                next_frame_id: AtomicU32::new(0),
                max_frames,
                page_size,
            }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    pub fn files(&self) -> &Arc<FileManager> {
        &self.inner.files
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.inner.wal
    }

    /// Pin a cached page. The frame lock is released before the page latch
    /// is taken, so a thread waiting for a page never blocks the cache.
    fn pin_cached(&self, key: PageKey) -> Option<(FrameId, PageData)> {
        let frames = self.inner.frames.read();
        let frame_id = self.inner.page_table.get(&key).map(|e| *e.value())?;
        let frame = frames.get(&frame_id)?;
        if frame.page != Some(key) {
            return None;
        }
        frame.pin_count.fetch_add(1, Ordering::SeqCst);
        self.inner.replacer.lock().pin(frame_id);
        Some((frame_id, frame.data.clone()))
    }

    /// Pin a page, reading it from disk on a miss.
    fn pin_page(&self, key: PageKey) -> Result<(FrameId, PageData)> {
        if let Some(pinned) = self.pin_cached(key) {
            return Ok(pinned);
        }

        let _latch = self.inner.load_latch.lock();
        if let Some(pinned) = self.pin_cached(key) {
            return Ok(pinned);
        }

        let (frame_id, data) = self.get_frame()?;
        {
            let mut buf = data.write();
            if let Err(e) = self
                .inner
                .files
                .read_page(key.file_id, key.page_id, &mut buf)
            {
                drop(buf);
                self.inner.replacer.lock().unpin(frame_id);
                return Err(e.context(StorageError::PageNotFound {
                    file_id: key.file_id,
                    page_id: key.page_id,
                }));
            }
        }
        self.install(frame_id, key);
        trace!("Loaded page {} into frame {}", key, frame_id);
        Ok((frame_id, data))
    }

    fn install(&self, frame_id: FrameId, key: PageKey) {
        let mut frames = self.inner.frames.write();
        if let Some(frame) = frames.get_mut(&frame_id) {
            frame.page = Some(key);
            frame.pin_count.store(1, Ordering::SeqCst);
            frame.is_dirty.store(false, Ordering::SeqCst);
        }
        self.inner.page_table.insert(key, frame_id);
        self.inner.replacer.lock().pin(frame_id);
    }

    /// loadForRead: shared access to a page.
    pub fn fetch_page(&self, key: PageKey) -> Result<PageReadGuard> {
        let (frame_id, data) = self.pin_page(key)?;
        Ok(PageReadGuard {
            inner: self.inner.clone(),
            frame_id,
            key,
            data: data.read_arc(),
        })
    }

    /// loadForWrite: exclusive access to a page.
    pub fn fetch_page_write(&self, key: PageKey) -> Result<PageWriteGuard> {
        let (frame_id, data) = self.pin_page(key)?;
        Ok(PageWriteGuard {
            inner: self.inner.clone(),
            frame_id,
            key,
            data: data.write_arc(),
        })
    }

    /// loadForWrite with create-if-missing: the file is extended with zeroed
    /// pages up to `key` when needed.
    pub fn fetch_page_write_or_allocate(&self, key: PageKey) -> Result<PageWriteGuard> {
        {
            let _latch = self.inner.load_latch.lock();
            while self.inner.files.num_pages(key.file_id)? <= key.page_id.0 {
                let page_id = self.inner.files.allocate_page(key.file_id)?;
                debug!("Extended file {} to page {}", key.file_id, page_id);
            }
        }
        self.fetch_page_write(key)
    }

    /// addPage: append a zeroed page to the file and pin it for write.
    pub fn new_page(&self, file_id: FileId) -> Result<(PageId, PageWriteGuard)> {
        let _latch = self.inner.load_latch.lock();
        let (frame_id, data) = self.get_frame()?;

        let page_id = match self.inner.files.allocate_page(file_id) {
            Ok(page_id) => page_id,
            Err(e) => {
                self.inner.replacer.lock().unpin(frame_id);
                return Err(e);
            }
        };
        let key = PageKey::new(file_id, page_id);
        let mut guard = data.write_arc();
        guard.fill(0);
        self.install(frame_id, key);
        self.inner.mark_dirty(frame_id);
        debug!("Allocated page {}", key);

        Ok((
            page_id,
            PageWriteGuard {
                inner: self.inner.clone(),
                frame_id,
                key,
                data: guard,
            },
        ))
    }

    /// filledUpTo: number of pages the file holds.
    pub fn filled_up_to(&self, file_id: FileId) -> Result<u32> {
        self.inner.files.num_pages(file_id)
    }

    fn write_back(&self, key: PageKey, data: &PageData) -> Result<()> {
        // A page may only reach the disk after the log records describing it.
        self.inner.wal.flush()?;
        let buf = data.read();
        self.inner.files.write_page(key.file_id, key.page_id, &buf)
    }

    pub fn flush_page(&self, key: PageKey) -> Result<()> {
        let dirty = {
            let frames = self.inner.frames.read();
            self.inner
                .page_table
                .get(&key)
                .and_then(|e| frames.get(e.value()))
                .filter(|frame| frame.is_dirty.swap(false, Ordering::SeqCst))
                .map(|frame| frame.data.clone())
        };
        if let Some(data) = dirty {
            self.write_back(key, &data)?;
        }
        Ok(())
    }

    pub fn flush_all(&self) -> Result<()> {
        let dirty: Vec<(PageKey, PageData)> = {
            let frames = self.inner.frames.read();
            frames
                .values()
                .filter_map(|frame| {
                    let key = frame.page?;
                    frame
                        .is_dirty
                        .swap(false, Ordering::SeqCst)
                        .then(|| (key, frame.data.clone()))
                })
                .collect()
        };
        if dirty.is_empty() {
            return Ok(());
        }
        self.inner.wal.flush()?;
        for (key, data) in &dirty {
            let buf = data.read();
            self.inner
                .files
                .write_page(key.file_id, key.page_id, &buf)
                .with_context(|| format!("Failed to flush page {}", key))?;
        }
        debug!("Flushed {} pages", dirty.len());
        Ok(())
    }

    /// Drop every cached page of a file without writing it back.
    pub fn discard_file(&self, file_id: FileId) {
        let _latch = self.inner.load_latch.lock();
        let mut frames = self.inner.frames.write();
        let mut replacer = self.inner.replacer.lock();
        for (frame_id, frame) in frames.iter_mut() {
            if let Some(key) = frame.page.filter(|key| key.file_id == file_id) {
                self.inner.page_table.remove(&key);
                frame.page = None;
                frame.is_dirty.store(false, Ordering::SeqCst);
                if frame.pin_count.load(Ordering::SeqCst) == 0 {
                    replacer.release(*frame_id);
                }
            }
        }
    }

    /// Find a frame for a new page: a fresh one while under the limit,
    /// otherwise an evicted one. Caller holds `load_latch`.
    fn get_frame(&self) -> Result<(FrameId, PageData)> {
        {
            let mut frames = self.inner.frames.write();
            if frames.len() < self.inner.max_frames {
                let frame_id = self.inner.next_frame_id.fetch_add(1, Ordering::SeqCst);
                let frame = Frame::new(self.inner.page_size);
                let data = frame.data.clone();
                frames.insert(frame_id, frame);
                return Ok((frame_id, data));
            }
        }

        loop {
            let frame_id = self
                .inner
                .replacer
                .lock()
                .evict()
                .ok_or_else(|| anyhow!(StorageError::BufferPoolFull))?;

            let victim = {
                let mut frames = self.inner.frames.write();
                let Some(frame) = frames.get_mut(&frame_id) else {
                    continue;
                };
                if frame.pin_count.load(Ordering::SeqCst) > 0 {
                    continue;
                }
                let old = frame.page.take();
                if let Some(key) = old {
                    self.inner.page_table.remove(&key);
                }
                let dirty = frame.is_dirty.swap(false, Ordering::SeqCst);
                (old, dirty, frame.data.clone())
            };

            if let (Some(key), true, data) = &victim {
                trace!("Evicting dirty page {} from frame {}", key, frame_id);
                self.write_back(*key, data)?;
            }
            return Ok((frame_id, victim.2));
        }
    }
}

pub struct PageReadGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    key: PageKey,
    data: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
}

impl PageReadGuard {
    pub fn key(&self) -> PageKey {
        self.key
    }
}

impl Deref for PageReadGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl PageView for PageReadGuard {
    fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        self.inner.release(self.frame_id);
    }
}

pub struct PageWriteGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    key: PageKey,
    data: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
}

impl PageWriteGuard {
    pub fn key(&self) -> PageKey {
        self.key
    }
}

impl Deref for PageWriteGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl PageView for PageWriteGuard {
    fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        // Marked while the latch is still held, so a concurrent flush either
        // sees the change or the flag.
        self.inner.mark_dirty(self.frame_id);
        self.inner.release(self.frame_id);
    }
}
