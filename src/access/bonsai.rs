//! Bonsai B+tree mapping edge keys to integer values.
//!
//! One tree lives in one file: page 0 is the entry point, page 1 is the
//! root for the whole life of the tree. Leaves are chained both ways in key
//! order. Every mutation runs inside an atomic operation.

pub mod key;

pub use key::{EdgeKey, KeyBound};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info};
use parking_lot::RwLock;
use std::sync::Arc;

use crate::storage::buffer::PageReadGuard;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::utils::serialize_value;
use crate::storage::page::{Bucket, EntryPoint, FileId, PageId, PageKey, PageView};
use crate::transaction::{AtomicOperation, AtomicOperationsManager, CacheEntry};

/// Extension of the file backing a tree.
pub const FILE_EXTENSION: &str = ".grb";

pub const ENTRY_POINT_INDEX: PageId = PageId(0);
pub const ROOT_INDEX: PageId = PageId(1);

type WriteBucket<'a> = Bucket<CacheEntry<'a>>;

/// Root-to-leaf path recorded while descending for an update.
#[derive(Debug, Clone)]
struct UpdatePath {
    /// Page indexes from the root down to the target bucket.
    pages: Vec<PageId>,
    /// For every level, where an entry for the next level down belongs.
    /// The last one is the index inside the target bucket.
    indexes: Vec<usize>,
}

impl UpdatePath {
    fn last_page(&self) -> Result<PageId> {
        self.pages
            .last()
            .copied()
            .ok_or_else(|| anyhow!("update path holds no pages"))
    }

    fn item_index(&self) -> Result<usize> {
        self.indexes
            .last()
            .copied()
            .ok_or_else(|| anyhow!("update path holds no indexes"))
    }
}

/// Result of [`BTreeBonsai::check_consistency`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub leaves: usize,
    pub entries: usize,
    pub depth: usize,
}

pub struct BTreeBonsai {
    name: String,
    full_name: String,
    /// Backing file, `None` until created or loaded. Its lock is the
    /// tree lock: shared for lookups, exclusive for mutations.
    file_id: RwLock<Option<FileId>>,
    manager: Arc<AtomicOperationsManager>,
    max_depth: usize,
}

impl BTreeBonsai {
    pub fn new(name: &str, manager: Arc<AtomicOperationsManager>, max_depth: usize) -> Self {
        Self {
            name: name.to_string(),
            full_name: format!("{}{}", name, FILE_EXTENSION),
            file_id: RwLock::new(None),
            manager,
            max_depth,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn file_id(&self) -> Option<FileId> {
        *self.file_id.read()
    }

    fn wrap(&self, operation: &'static str) -> impl FnOnce(anyhow::Error) -> StorageError + '_ {
        move |e| StorageError::tree(operation, self.name.as_str(), e)
    }

    /// Create the backing file with an empty entry point and an empty root leaf.
    pub fn create(&self, op: &AtomicOperation) -> StorageResult<()> {
        self.manager
            .execute_inside_component_operation(op, &self.full_name, |op| {
                let mut state = self.file_id.write();
                let file_id = op.add_file(&self.full_name)?;

                let mut entry_point = EntryPoint::new(op.add_page(file_id)?);
                entry_point.init()?;
                drop(entry_point);

                let mut root = Bucket::new(op.add_page(file_id)?);
                root.init(true)?;
                drop(root);

                *state = Some(file_id);
                info!("Created tree {} in file {}", self.name, file_id);
                Ok(())
            })
            .map_err(self.wrap("create"))
    }

    /// Bind to the existing file of this tree.
    pub fn load(&self) -> StorageResult<()> {
        let mut state = self.file_id.write();
        let file_id = self
            .manager
            .files()
            .open_file(&self.full_name)
            .map_err(self.wrap("load"))?;
        *state = Some(file_id);
        info!("Loaded tree {} from file {}", self.name, file_id);
        Ok(())
    }

    /// Remove the backing file once `op` commits.
    pub fn delete(&self, op: &AtomicOperation) -> StorageResult<()> {
        self.manager
            .execute_inside_component_operation(op, &self.full_name, |op| {
                let state = self.file_id.write();
                let file_id = Self::bound(*state)?;
                op.delete_file(file_id)?;
                info!("Deleting tree {} (file {})", self.name, file_id);
                Ok(())
            })
            .map_err(self.wrap("delete"))
    }

    fn bound(file_id: Option<FileId>) -> Result<FileId> {
        file_id.ok_or_else(|| anyhow!("tree is neither created nor loaded"))
    }

    pub fn get(&self, group_id: i32, position: i64) -> StorageResult<Option<i32>> {
        let _token = self.manager.acquire_read_lock(&self.full_name);
        let state = self.file_id.read();
        self.get_inner(*state, &EdgeKey::new(group_id, position))
            .map_err(self.wrap("get"))
    }

    fn get_inner(&self, file_id: Option<FileId>, key: &EdgeKey) -> Result<Option<i32>> {
        let file_id = Self::bound(file_id)?;
        let (page_id, _) = self.find_leaf(file_id, &KeyBound::Key(*key))?;
        let guard = self.load_for_read(file_id, page_id)?;
        let bucket = Bucket::new(&guard);
        match bucket.find(key)? {
            Ok(index) => Ok(Some(bucket.value(index)?)),
            Err(_) => Ok(None),
        }
    }

    /// Insert or replace the value stored under `(group_id, position)`.
    pub fn put(
        &self,
        op: &AtomicOperation,
        group_id: i32,
        position: i64,
        value: i32,
    ) -> StorageResult<()> {
        self.manager
            .execute_inside_component_operation(op, &self.full_name, |op| {
                let state = self.file_id.write();
                let file_id = Self::bound(*state)?;
                self.put_inner(op, file_id, &EdgeKey::new(group_id, position), value)
            })
            .map_err(self.wrap("put"))
    }

    fn put_inner(
        &self,
        op: &AtomicOperation,
        file_id: FileId,
        key: &EdgeKey,
        value: i32,
    ) -> Result<()> {
        let serialized_key = key.serialize();
        let serialized_value = serialize_value(value);
        let (mut path, found) = self.find_leaf_for_update(op, file_id, key)?;

        let mut page_id = path.last_page()?;
        let mut bucket = Bucket::new(op.load_page_for_write(file_id, page_id)?);

        let mut insertion_index = match found {
            Ok(index) => {
                if bucket.raw_value(index)?.len() == serialized_value.len() {
                    bucket.update_value(index, &serialized_value)?;
                    return Ok(());
                }
                bucket.remove_leaf_entry(index)?;
                index
            }
            Err(index) => index,
        };
        let size_diff = if found.is_ok() { 0 } else { 1 };

        while !bucket.add_leaf_entry(insertion_index, &serialized_key, &serialized_value)? {
            path = self.split_bucket(op, file_id, &mut bucket, page_id, &path, insertion_index)?;
            insertion_index = path.item_index()?;
            let target = path.last_page()?;
            if target != page_id {
                drop(bucket);
                bucket = Bucket::new(op.load_page_for_write(file_id, target)?);
                page_id = target;
            }
        }
        drop(bucket);

        if size_diff != 0 {
            let mut entry_point = EntryPoint::new(op.load_page_for_write(file_id, ENTRY_POINT_INDEX)?);
            let tree_size = entry_point.tree_size();
            entry_point.set_tree_size(tree_size + size_diff)?;
        }
        Ok(())
    }

    /// Number of entries, as kept by the entry point.
    pub fn size(&self) -> StorageResult<i64> {
        let _token = self.manager.acquire_read_lock(&self.full_name);
        let state = self.file_id.read();
        Self::bound(*state)
            .and_then(|file_id| self.load_for_read(file_id, ENTRY_POINT_INDEX))
            .map(|guard| EntryPoint::new(&guard).tree_size())
            .map_err(self.wrap("size"))
    }

    /// Every entry with `from <= key <= to`, in key order.
    pub fn range(&self, from: KeyBound, to: KeyBound) -> StorageResult<Vec<(EdgeKey, i32)>> {
        let _token = self.manager.acquire_read_lock(&self.full_name);
        let state = self.file_id.read();
        self.range_inner(*state, from, to).map_err(self.wrap("range"))
    }

    fn range_inner(
        &self,
        file_id: Option<FileId>,
        from: KeyBound,
        to: KeyBound,
    ) -> Result<Vec<(EdgeKey, i32)>> {
        let file_id = Self::bound(file_id)?;
        let mut result = Vec::new();
        if from > to {
            return Ok(result);
        }

        let (mut page_id, _) = self.find_leaf(file_id, &from)?;
        let max_leaves = self.manager.buffer_pool().filled_up_to(file_id)? as usize;
        let mut visited = 0;
        loop {
            visited += 1;
            if visited > max_leaves {
                bail!("leaf chain of tree {} does not terminate", self.name);
            }
            let guard = self.load_for_read(file_id, page_id)?;
            let bucket = Bucket::new(&guard);
            let start = match from {
                KeyBound::AlwaysLess => 0,
                KeyBound::Key(key) => bucket.find(&key)?.unwrap_or_else(|index| index),
                KeyBound::AlwaysGreater => bucket.size(),
            };
            for index in start..bucket.size() {
                let key = bucket.key(index)?;
                if to.compare_key(&key).is_lt() {
                    return Ok(result);
                }
                result.push((key, bucket.value(index)?));
            }
            match bucket.right_sibling() {
                Some(next) => page_id = next,
                None => return Ok(result),
            }
        }
    }

    /// Walk the leaf chain and check it against the tree's invariants.
    pub fn check_consistency(&self) -> StorageResult<ConsistencyReport> {
        let _token = self.manager.acquire_read_lock(&self.full_name);
        let state = self.file_id.read();
        self.check_inner(*state).map_err(self.wrap("check_consistency"))
    }

    fn check_inner(&self, file_id: Option<FileId>) -> Result<ConsistencyReport> {
        let file_id = Self::bound(file_id)?;
        let (mut page_id, depth) = self.find_leaf(file_id, &KeyBound::AlwaysLess)?;
        let max_leaves = self.manager.buffer_pool().filled_up_to(file_id)? as usize;

        let mut report = ConsistencyReport {
            leaves: 0,
            entries: 0,
            depth,
        };
        let mut previous_page: Option<PageId> = None;
        let mut previous_key: Option<EdgeKey> = None;
        loop {
            report.leaves += 1;
            if report.leaves > max_leaves {
                bail!("leaf chain does not terminate after {} leaves", max_leaves);
            }
            let guard = self.load_for_read(file_id, page_id)?;
            let bucket = Bucket::new(&guard);
            if !bucket.is_leaf() {
                bail!("page {} is chained as a leaf but is an internal node", page_id);
            }
            if bucket.left_sibling() != previous_page {
                bail!(
                    "page {} points back to {:?} instead of {:?}",
                    page_id,
                    bucket.left_sibling(),
                    previous_page
                );
            }
            for index in 0..bucket.size() {
                let key = bucket.key(index)?;
                if previous_key.is_some_and(|previous| previous >= key) {
                    bail!("key {} on page {} is out of order", key, page_id);
                }
                previous_key = Some(key);
                report.entries += 1;
            }
            previous_page = Some(page_id);
            match bucket.right_sibling() {
                Some(next) => page_id = next,
                None => break,
            }
        }

        let guard = self.load_for_read(file_id, ENTRY_POINT_INDEX)?;
        let tree_size = EntryPoint::new(&guard).tree_size();
        if tree_size != report.entries as i64 {
            bail!(
                "entry point counts {} entries, leaves hold {}",
                tree_size,
                report.entries
            );
        }
        Ok(report)
    }

    fn load_for_read(&self, file_id: FileId, page_id: PageId) -> Result<PageReadGuard> {
        self.manager
            .buffer_pool()
            .fetch_page(PageKey::new(file_id, page_id))
    }

    fn corrupted(&self, depth: usize) -> anyhow::Error {
        anyhow!(StorageError::Corrupted { depth })
    }

    /// Descend to the leaf that holds `bound`. Returns the leaf and the
    /// number of levels visited.
    fn find_leaf(&self, file_id: FileId, bound: &KeyBound) -> Result<(PageId, usize)> {
        let mut page_id = ROOT_INDEX;
        let mut depth = 0;
        loop {
            depth += 1;
            if depth > self.max_depth {
                return Err(self.corrupted(self.max_depth));
            }
            let guard = self.load_for_read(file_id, page_id)?;
            let bucket = Bucket::new(&guard);
            if bucket.is_leaf() {
                return Ok((page_id, depth));
            }
            let found = match bound {
                KeyBound::AlwaysLess => Err(0),
                KeyBound::Key(key) => bucket.find(key)?,
                KeyBound::AlwaysGreater => Err(bucket.size()),
            };
            page_id = Self::child_for(&bucket, found)
                .with_context(|| format!("Failed to descend from page {}", page_id))?;
        }
    }

    /// An exact match follows the right child, an insertion point the
    /// left child of the entry there, or the right child of the last entry.
    fn child_for<P: PageView>(
        bucket: &Bucket<P>,
        found: std::result::Result<usize, usize>,
    ) -> Result<PageId> {
        Ok(match found {
            Ok(index) => bucket.right_child(index)?,
            Err(index) if index >= bucket.size() => {
                let last = index
                    .checked_sub(1)
                    .ok_or_else(|| anyhow!("internal node without entries"))?;
                bucket.right_child(last)?
            }
            Err(index) => bucket.left_child(index)?,
        })
    }

    fn find_leaf_for_update(
        &self,
        op: &AtomicOperation,
        file_id: FileId,
        key: &EdgeKey,
    ) -> Result<(UpdatePath, std::result::Result<usize, usize>)> {
        let mut path = UpdatePath {
            pages: Vec::with_capacity(8),
            indexes: Vec::with_capacity(8),
        };
        let mut page_id = ROOT_INDEX;
        loop {
            if path.pages.len() >= self.max_depth {
                return Err(self.corrupted(self.max_depth));
            }
            path.pages.push(page_id);
            let guard = op.load_page_for_read(file_id, page_id)?;
            let bucket = Bucket::new(&guard);
            let found = bucket.find(key)?;
            if bucket.is_leaf() {
                path.indexes.push(found.unwrap_or_else(|index| index));
                return Ok((path, found));
            }
            path.indexes.push(match found {
                Ok(index) => index + 1,
                Err(index) => index,
            });
            page_id = Self::child_for(&bucket, found)?;
        }
    }

    /// Take a page for a new bucket: the next page the tree has not used
    /// yet when the file already has it, a fresh page otherwise.
    fn allocate_bucket<'a>(&self, op: &'a AtomicOperation, file_id: FileId) -> Result<CacheEntry<'a>> {
        let mut entry_point = EntryPoint::new(op.load_page_for_write(file_id, ENTRY_POINT_INDEX)?);
        let pages_size = entry_point.pages_size();
        let page = if pages_size + 1 < op.filled_up_to(file_id)? {
            op.load_page_for_write(file_id, PageId(pages_size + 1))?
        } else {
            op.add_page(file_id)?
        };
        entry_point.set_pages_size(page.page_id().0)?;
        Ok(page)
    }

    /// Split `bucket` in two and return the path to where the entry meant
    /// for `key_index` now belongs.
    fn split_bucket<'a>(
        &self,
        op: &'a AtomicOperation,
        file_id: FileId,
        bucket: &mut WriteBucket<'a>,
        page_id: PageId,
        path: &UpdatePath,
        key_index: usize,
    ) -> Result<UpdatePath> {
        let split_leaf = bucket.is_leaf();
        let size = bucket.size();
        let index_to_split = size / 2;
        let separation_key = bucket.raw_key(index_to_split)?;
        let start_right = if split_leaf {
            index_to_split
        } else {
            index_to_split + 1
        };
        let right_entries = (start_right..size)
            .map(|index| bucket.raw_entry(index))
            .collect::<StorageResult<Vec<_>>>()?;

        if page_id != ROOT_INDEX {
            self.split_non_root_bucket(
                op,
                file_id,
                bucket,
                page_id,
                path,
                key_index,
                index_to_split,
                &separation_key,
                &right_entries,
            )
        } else {
            self.split_root_bucket(
                op,
                file_id,
                bucket,
                key_index,
                index_to_split,
                &separation_key,
                &right_entries,
            )
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn split_non_root_bucket<'a>(
        &self,
        op: &'a AtomicOperation,
        file_id: FileId,
        bucket: &mut WriteBucket<'a>,
        page_id: PageId,
        path: &UpdatePath,
        key_index: usize,
        index_to_split: usize,
        separation_key: &[u8],
        right_entries: &[Vec<u8>],
    ) -> Result<UpdatePath> {
        let split_leaf = bucket.is_leaf();
        let mut right = Bucket::new(self.allocate_bucket(op, file_id)?);
        let right_id = right.page().page_id();
        right.init(split_leaf)?;
        right.add_all(right_entries)?;
        bucket.shrink(index_to_split)?;

        if split_leaf {
            let old_right = bucket.right_sibling();
            right.set_right_sibling(old_right)?;
            right.set_left_sibling(Some(page_id))?;
            bucket.set_right_sibling(Some(right_id))?;
            if let Some(sibling_id) = old_right {
                let mut sibling = Bucket::new(op.load_page_for_write(file_id, sibling_id)?);
                sibling.set_left_sibling(Some(right_id))?;
            }
        }
        debug!(
            "Split {} page {} of tree {} at {}, new right page {}",
            if split_leaf { "leaf" } else { "internal" },
            page_id,
            self.name,
            index_to_split,
            right_id
        );

        let depth = path.pages.len();
        if depth < 2 || path.indexes.len() != depth {
            bail!("split of page {} has no parent on its path", page_id);
        }
        let mut parent_path = UpdatePath {
            pages: path.pages[..depth - 1].to_vec(),
            indexes: path.indexes[..depth - 1].to_vec(),
        };
        let mut parent_id = parent_path.last_page()?;
        let mut insertion_index = parent_path.item_index()?;
        let mut parent = Bucket::new(op.load_page_for_write(file_id, parent_id)?);
        while !parent.add_non_leaf_entry(insertion_index, page_id, right_id, separation_key, true)? {
            parent_path =
                self.split_bucket(op, file_id, &mut parent, parent_id, &parent_path, insertion_index)?;
            insertion_index = parent_path.item_index()?;
            let target = parent_path.last_page()?;
            if target != parent_id {
                drop(parent);
                parent = Bucket::new(op.load_page_for_write(file_id, target)?);
                parent_id = target;
            }
        }
        drop(parent);
        drop(right);

        let mut result = parent_path;
        if let Some(last) = result.indexes.last_mut() {
            *last = insertion_index;
        }
        if key_index <= index_to_split {
            result.pages.push(page_id);
            result.indexes.push(key_index);
            return Ok(result);
        }
        if let Some(last) = result.indexes.last_mut() {
            *last += 1;
        }
        result.pages.push(right_id);
        result.indexes.push(if split_leaf {
            key_index - index_to_split
        } else {
            key_index - index_to_split - 1
        });
        Ok(result)
    }

    /// The root keeps its page: both halves move to new pages and the root
    /// becomes an internal node with a single separator.
    #[allow(clippy::too_many_arguments)]
    fn split_root_bucket<'a>(
        &self,
        op: &'a AtomicOperation,
        file_id: FileId,
        bucket: &mut WriteBucket<'a>,
        key_index: usize,
        index_to_split: usize,
        separation_key: &[u8],
        right_entries: &[Vec<u8>],
    ) -> Result<UpdatePath> {
        let split_leaf = bucket.is_leaf();
        let left_entries = (0..index_to_split)
            .map(|index| bucket.raw_entry(index))
            .collect::<StorageResult<Vec<_>>>()?;

        let mut left = Bucket::new(self.allocate_bucket(op, file_id)?);
        let mut right = Bucket::new(self.allocate_bucket(op, file_id)?);
        let left_id = left.page().page_id();
        let right_id = right.page().page_id();

        left.init(split_leaf)?;
        left.add_all(&left_entries)?;
        right.init(split_leaf)?;
        right.add_all(right_entries)?;
        if split_leaf {
            left.set_right_sibling(Some(right_id))?;
            right.set_left_sibling(Some(left_id))?;
        }
        drop(left);
        drop(right);

        bucket.shrink(0)?;
        if split_leaf {
            bucket.switch_bucket_type()?;
        }
        if !bucket.add_non_leaf_entry(0, left_id, right_id, separation_key, true)? {
            bail!("separator does not fit into the emptied root");
        }
        debug!(
            "Split root of tree {} into pages {} and {}",
            self.name, left_id, right_id
        );

        if key_index <= index_to_split {
            return Ok(UpdatePath {
                pages: vec![ROOT_INDEX, left_id],
                indexes: vec![0, key_index],
            });
        }
        let child_index = if split_leaf {
            key_index - index_to_split
        } else {
            key_index - index_to_split - 1
        };
        Ok(UpdatePath {
            pages: vec![ROOT_INDEX, right_id],
            indexes: vec![1, child_index],
        })
    }
}
