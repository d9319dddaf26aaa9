//! Bucket page: one node of a bonsai tree.
//!
//! Layout after the common page header:
//!
//! ```text
//! [8]      is_leaf (u8)
//! [12..16) size (u32)
//! [16..20) free pointer (u32), start of the entry data area
//! [20..28) left sibling (i64, -1 when absent)
//! [28..36) right sibling (i64, -1 when absent)
//! [36..)   positions array, one u32 per entry, in key order
//! ```
//!
//! Entry bytes are packed from the end of the page downward. Leaf entries
//! are `key | value`, internal entries are `left child | right child | key`.
//! Every byte an entry or a position slot vacates is zeroed, which keeps
//! undo of a page operation exact down to the byte.

use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;

use crate::access::bonsai::EdgeKey;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::utils::{deserialize_value, slice_at, value_len};
use crate::storage::page::{PageId, PageMut, PageView};
use crate::storage::wal::PageOperation;

const IS_LEAF_OFFSET: usize = 8;
const SIZE_OFFSET: usize = 12;
const FREE_POINTER_OFFSET: usize = 16;
const LEFT_SIBLING_OFFSET: usize = 20;
const RIGHT_SIBLING_OFFSET: usize = 28;
const POSITIONS_ARRAY_OFFSET: usize = 36;

/// Bytes covered by the bucket header (excluding the page LSN).
pub const BUCKET_HEADER_RANGE: std::ops::Range<usize> = IS_LEAF_OFFSET..POSITIONS_ARRAY_OFFSET;

const POSITION_SLOT_SIZE: usize = 4;
const CHILD_POINTER_SIZE: usize = 4;

/// Size of an internal entry: two child pointers and the key.
pub const NON_LEAF_ENTRY_SIZE: usize = 2 * CHILD_POINTER_SIZE + EdgeKey::SERIALIZED_SIZE;

fn malformed(message: String) -> StorageError {
    StorageError::MalformedPage(message)
}

pub(crate) fn raw_size(data: &[u8]) -> usize {
    LittleEndian::read_u32(&data[SIZE_OFFSET..]) as usize
}

fn set_raw_size(data: &mut [u8], size: usize) {
    LittleEndian::write_u32(&mut data[SIZE_OFFSET..], size as u32);
}

fn free_pointer(data: &[u8]) -> usize {
    LittleEndian::read_u32(&data[FREE_POINTER_OFFSET..]) as usize
}

fn set_free_pointer(data: &mut [u8], pointer: usize) {
    LittleEndian::write_u32(&mut data[FREE_POINTER_OFFSET..], pointer as u32);
}

fn is_leaf_raw(data: &[u8]) -> bool {
    data[IS_LEAF_OFFSET] != 0
}

fn slot_offset(index: usize) -> usize {
    POSITIONS_ARRAY_OFFSET + index * POSITION_SLOT_SIZE
}

fn positions_end(size: usize) -> usize {
    slot_offset(size)
}

fn position(data: &[u8], index: usize) -> StorageResult<usize> {
    let size = raw_size(data);
    if index >= size {
        return Err(malformed(format!(
            "entry index {} out of range for a bucket of size {}",
            index, size
        )));
    }
    let position = LittleEndian::read_u32(&data[slot_offset(index)..]) as usize;
    if position < free_pointer(data) || position >= data.len() {
        return Err(malformed(format!(
            "entry {} points at {} outside of the data area",
            index, position
        )));
    }
    Ok(position)
}

fn set_position(data: &mut [u8], index: usize, position: usize) {
    LittleEndian::write_u32(&mut data[slot_offset(index)..], position as u32);
}

fn entry_len(data: &[u8], index: usize) -> StorageResult<usize> {
    let position = position(data, index)?;
    if is_leaf_raw(data) {
        let value_at = position + EdgeKey::SERIALIZED_SIZE;
        let value = data
            .get(value_at..)
            .ok_or_else(|| malformed(format!("leaf entry {} is truncated", index)))?;
        Ok(EdgeKey::SERIALIZED_SIZE + value_len(value)?)
    } else {
        Ok(NON_LEAF_ENTRY_SIZE)
    }
}

fn sibling_raw(data: &[u8], offset: usize) -> Option<PageId> {
    let raw = LittleEndian::read_i64(&data[offset..]);
    u32::try_from(raw).ok().map(PageId)
}

fn write_sibling(data: &mut [u8], offset: usize, sibling: Option<PageId>) {
    let raw = sibling.map_or(-1, |page| i64::from(page.0));
    LittleEndian::write_i64(&mut data[offset..], raw);
}

/// Reset the header to an empty bucket. Entry bytes are left untouched.
pub(crate) fn init_header(data: &mut [u8], is_leaf: bool) {
    data[IS_LEAF_OFFSET] = u8::from(is_leaf);
    set_raw_size(data, 0);
    let page_size = data.len();
    set_free_pointer(data, page_size);
    write_sibling(data, LEFT_SIBLING_OFFSET, None);
    write_sibling(data, RIGHT_SIBLING_OFFSET, None);
}

pub(crate) fn restore_header(data: &mut [u8], header: &[u8]) -> StorageResult<()> {
    if header.len() != BUCKET_HEADER_RANGE.len() {
        return Err(malformed(format!(
            "bucket header must be {} bytes, got {}",
            BUCKET_HEADER_RANGE.len(),
            header.len()
        )));
    }
    data[BUCKET_HEADER_RANGE].copy_from_slice(header);
    Ok(())
}

/// Place `entry` at `index`, shifting the positions of later entries.
pub(crate) fn insert_raw(data: &mut [u8], index: usize, entry: &[u8]) -> StorageResult<()> {
    let size = raw_size(data);
    if index > size {
        return Err(malformed(format!(
            "insert index {} beyond bucket size {}",
            index, size
        )));
    }
    let free = free_pointer(data);
    if free < positions_end(size) + POSITION_SLOT_SIZE + entry.len() {
        return Err(malformed(format!(
            "no room for a {} byte entry in bucket",
            entry.len()
        )));
    }

    let new_position = free - entry.len();
    data[new_position..free].copy_from_slice(entry);
    data.copy_within(slot_offset(index)..positions_end(size), slot_offset(index + 1));
    set_position(data, index, new_position);
    set_raw_size(data, size + 1);
    set_free_pointer(data, new_position);
    Ok(())
}

/// Remove the entry at `index`, compacting the data area. Returns the
/// position the entry had and its bytes.
pub(crate) fn remove_raw(data: &mut [u8], index: usize) -> StorageResult<(usize, Vec<u8>)> {
    let size = raw_size(data);
    let removed_at = position(data, index)?;
    let len = entry_len(data, index)?;
    let entry = slice_at(data, removed_at, len)?.to_vec();
    let free = free_pointer(data);

    data.copy_within(free..removed_at, free + len);
    data[free..free + len].fill(0);
    for i in 0..size {
        if i == index {
            continue;
        }
        let p = LittleEndian::read_u32(&data[slot_offset(i)..]) as usize;
        if p < removed_at {
            set_position(data, i, p + len);
        }
    }

    data.copy_within(slot_offset(index + 1)..positions_end(size), slot_offset(index));
    data[slot_offset(size - 1)..positions_end(size)].fill(0);
    set_raw_size(data, size - 1);
    set_free_pointer(data, free + len);
    Ok((removed_at, entry))
}

/// Put back an entry taken out by `remove_raw` at its original position.
pub(crate) fn restore_raw(
    data: &mut [u8],
    index: usize,
    restored_at: usize,
    entry: &[u8],
) -> StorageResult<()> {
    let size = raw_size(data);
    let len = entry.len();
    let free = free_pointer(data);
    if index > size
        || restored_at + len > data.len()
        || restored_at + len < free
        || free < positions_end(size) + POSITION_SLOT_SIZE + len
    {
        return Err(malformed(format!(
            "cannot restore a {} byte entry at {} (index {}, size {})",
            len, restored_at, index, size
        )));
    }

    for i in 0..size {
        let p = LittleEndian::read_u32(&data[slot_offset(i)..]) as usize;
        if p < restored_at + len {
            set_position(data, i, p - len);
        }
    }
    data.copy_within(free..restored_at + len, free - len);
    data[restored_at..restored_at + len].copy_from_slice(entry);

    data.copy_within(slot_offset(index)..positions_end(size), slot_offset(index + 1));
    set_position(data, index, restored_at);
    set_raw_size(data, size + 1);
    set_free_pointer(data, free - len);
    Ok(())
}

pub(crate) fn write_value_raw(
    data: &mut [u8],
    index: usize,
    key_len: usize,
    value: &[u8],
) -> StorageResult<()> {
    let value_at = position(data, index)? + key_len;
    let current = value_len(
        data.get(value_at..)
            .ok_or_else(|| malformed(format!("leaf entry {} is truncated", index)))?,
    )?;
    if current != value.len() {
        return Err(malformed(format!(
            "value of entry {} is {} bytes, cannot overwrite with {} bytes",
            index,
            current,
            value.len()
        )));
    }
    data[value_at..value_at + value.len()].copy_from_slice(value);
    Ok(())
}

pub(crate) fn decode_children(entry: &[u8]) -> StorageResult<(u32, u32)> {
    let children = slice_at(entry, 0, 2 * CHILD_POINTER_SIZE)?;
    Ok((
        LittleEndian::read_u32(&children[0..4]),
        LittleEndian::read_u32(&children[4..8]),
    ))
}

pub(crate) fn set_left_child_raw(data: &mut [u8], index: usize, child: u32) -> StorageResult<()> {
    let at = position(data, index)?;
    LittleEndian::write_u32(&mut data[at..at + 4], child);
    Ok(())
}

pub(crate) fn set_right_child_raw(data: &mut [u8], index: usize, child: u32) -> StorageResult<()> {
    let at = position(data, index)? + CHILD_POINTER_SIZE;
    LittleEndian::write_u32(&mut data[at..at + 4], child);
    Ok(())
}

pub(crate) fn switch_type_raw(data: &mut [u8]) {
    data[IS_LEAF_OFFSET] = u8::from(!is_leaf_raw(data));
}

pub(crate) fn set_left_sibling_raw(data: &mut [u8], sibling: Option<PageId>) {
    write_sibling(data, LEFT_SIBLING_OFFSET, sibling);
}

pub(crate) fn set_right_sibling_raw(data: &mut [u8], sibling: Option<PageId>) {
    write_sibling(data, RIGHT_SIBLING_OFFSET, sibling);
}

/// Encode an internal entry.
pub fn non_leaf_entry(left: PageId, right: PageId, key: &[u8]) -> Vec<u8> {
    let mut entry = vec![0u8; 2 * CHILD_POINTER_SIZE];
    LittleEndian::write_u32(&mut entry[0..4], left.0);
    LittleEndian::write_u32(&mut entry[4..8], right.0);
    entry.extend_from_slice(key);
    entry
}

/// A decoded internal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonLeafEntry {
    pub key: EdgeKey,
    pub left: PageId,
    pub right: PageId,
}

/// Typed view over a bucket page.
///
/// Reads work on any [`PageView`]; mutations need a [`PageMut`] and each of
/// them goes through exactly one [`PageOperation`].
pub struct Bucket<P> {
    page: P,
}

impl<P: PageView> Bucket<P> {
    pub fn new(page: P) -> Self {
        Self { page }
    }

    fn data(&self) -> &[u8] {
        self.page.data()
    }

    pub fn page(&self) -> &P {
        &self.page
    }

    pub fn into_inner(self) -> P {
        self.page
    }

    pub fn is_leaf(&self) -> bool {
        is_leaf_raw(self.data())
    }

    pub fn size(&self) -> usize {
        raw_size(self.data())
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Bytes still available for entries and their position slots.
    pub fn free_space(&self) -> usize {
        free_pointer(self.data()).saturating_sub(positions_end(self.size()))
    }

    /// Binary search for `key`: `Ok(index)` on an exact match, otherwise
    /// `Err(insertion_point)` where the insertion point is the first index
    /// holding a greater key.
    pub fn find(&self, key: &EdgeKey) -> StorageResult<Result<usize, usize>> {
        let mut low = 0usize;
        let mut high = self.size();
        while low < high {
            let mid = low + (high - low) / 2;
            match self.key(mid)?.cmp(key) {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(low))
    }

    pub fn key(&self, index: usize) -> StorageResult<EdgeKey> {
        let data = self.data();
        let at = position(data, index)?;
        if is_leaf_raw(data) {
            EdgeKey::deserialize(&data[at..])
        } else {
            EdgeKey::deserialize(&data[at + 2 * CHILD_POINTER_SIZE..])
        }
    }

    /// Serialized key of the entry at `index`.
    pub fn raw_key(&self, index: usize) -> StorageResult<Vec<u8>> {
        Ok(self.key(index)?.serialize().to_vec())
    }

    /// Value of a leaf entry.
    pub fn value(&self, index: usize) -> StorageResult<i32> {
        let data = self.data();
        if !is_leaf_raw(data) {
            return Err(malformed("internal buckets hold no values".to_string()));
        }
        let at = position(data, index)? + EdgeKey::SERIALIZED_SIZE;
        Ok(deserialize_value(&data[at..])?.0)
    }

    /// Serialized value of a leaf entry.
    pub fn raw_value(&self, index: usize) -> StorageResult<Vec<u8>> {
        let at = position(self.data(), index)? + EdgeKey::SERIALIZED_SIZE;
        let len = entry_len(self.data(), index)? - EdgeKey::SERIALIZED_SIZE;
        Ok(slice_at(self.data(), at, len)?.to_vec())
    }

    /// Raw bytes of the entry at `index`, as `add_all` expects them.
    pub fn raw_entry(&self, index: usize) -> StorageResult<Vec<u8>> {
        let at = position(self.data(), index)?;
        let len = entry_len(self.data(), index)?;
        Ok(slice_at(self.data(), at, len)?.to_vec())
    }

    pub fn non_leaf_entry(&self, index: usize) -> StorageResult<NonLeafEntry> {
        if self.is_leaf() {
            return Err(malformed("leaf buckets hold no child pointers".to_string()));
        }
        let entry = self.raw_entry(index)?;
        let (left, right) = decode_children(&entry)?;
        Ok(NonLeafEntry {
            key: EdgeKey::deserialize(&entry[2 * CHILD_POINTER_SIZE..])?,
            left: PageId(left),
            right: PageId(right),
        })
    }

    pub fn left_child(&self, index: usize) -> StorageResult<PageId> {
        Ok(self.non_leaf_entry(index)?.left)
    }

    pub fn right_child(&self, index: usize) -> StorageResult<PageId> {
        Ok(self.non_leaf_entry(index)?.right)
    }

    pub fn left_sibling(&self) -> Option<PageId> {
        sibling_raw(self.data(), LEFT_SIBLING_OFFSET)
    }

    pub fn right_sibling(&self) -> Option<PageId> {
        sibling_raw(self.data(), RIGHT_SIBLING_OFFSET)
    }

    fn fits(&self, entry_len: usize) -> bool {
        self.free_space() >= entry_len + POSITION_SLOT_SIZE
    }
}

impl<P: PageMut> Bucket<P> {
    pub fn init(&mut self, is_leaf: bool) -> StorageResult<()> {
        let prev_header = self.data()[BUCKET_HEADER_RANGE].to_vec();
        self.page.apply(PageOperation::BucketInit {
            is_leaf,
            prev_header,
        })
    }

    /// Insert a leaf entry at `index`. Returns `false`, leaving the page
    /// untouched, when the bucket has no room for it.
    pub fn add_leaf_entry(&mut self, index: usize, key: &[u8], value: &[u8]) -> StorageResult<bool> {
        let len = key.len() + value.len();
        if !self.fits(len) {
            return Ok(false);
        }
        let mut entry = Vec::with_capacity(len);
        entry.extend_from_slice(key);
        entry.extend_from_slice(value);
        self.page.apply(PageOperation::BucketAddLeafEntry {
            index: index as u32,
            entry,
        })?;
        Ok(true)
    }

    /// Insert a separator at `index`. With `update_neighbors`, the entry to
    /// its left is made to point right at `left` and the entry to its right
    /// to point left at `right`.
    pub fn add_non_leaf_entry(
        &mut self,
        index: usize,
        left: PageId,
        right: PageId,
        key: &[u8],
        update_neighbors: bool,
    ) -> StorageResult<bool> {
        let entry = non_leaf_entry(left, right, key);
        if !self.fits(entry.len()) {
            return Ok(false);
        }
        let size = self.size();
        let (prev_left_neighbor_right, prev_right_neighbor_left) = if update_neighbors {
            let before = if index > 0 {
                Some(self.right_child(index - 1)?.0)
            } else {
                None
            };
            let after = if index < size {
                Some(self.left_child(index)?.0)
            } else {
                None
            };
            (before, after)
        } else {
            (None, None)
        };

        self.page.apply(PageOperation::BucketAddNonLeafEntry {
            index: index as u32,
            entry,
            update_neighbors,
            prev_left_neighbor_right,
            prev_right_neighbor_left,
        })?;
        Ok(true)
    }

    pub fn remove_leaf_entry(&mut self, index: usize) -> StorageResult<()> {
        let position = position(self.data(), index)?;
        let entry = self.raw_entry(index)?;
        self.page.apply(PageOperation::BucketRemoveLeafEntry {
            index: index as u32,
            position: position as u32,
            entry,
        })
    }

    /// Overwrite the value of a leaf entry in place. Only valid when the new
    /// encoding has the same width as the current one.
    pub fn update_value(&mut self, index: usize, value: &[u8]) -> StorageResult<()> {
        let prev_value = self.raw_value(index)?;
        if prev_value.len() != value.len() {
            return Err(malformed(format!(
                "in-place update needs a {} byte value, got {}",
                prev_value.len(),
                value.len()
            )));
        }
        self.page.apply(PageOperation::BucketUpdateValue {
            index: index as u32,
            key_len: EdgeKey::SERIALIZED_SIZE as u32,
            prev_value,
            value: value.to_vec(),
        })
    }

    /// Keep only the first `new_size` entries.
    ///
    /// Each removed entry is recorded with the position it occupies at the
    /// moment redo takes it out, highest index first, so undo can put the
    /// entries back in ascending index order.
    pub fn shrink(&mut self, new_size: usize) -> StorageResult<()> {
        let size = self.size();
        let mut scratch = self.data().to_vec();
        let mut removed = Vec::with_capacity(size.saturating_sub(new_size));
        for index in (new_size..size).rev() {
            let (position, entry) = remove_raw(&mut scratch, index)?;
            removed.push((position as u32, entry));
        }
        removed.reverse();
        self.page.apply(PageOperation::BucketShrink {
            new_size: new_size as u32,
            removed,
        })
    }

    /// Append raw entries, as produced by `raw_entry`, after the current ones.
    pub fn add_all(&mut self, entries: &[Vec<u8>]) -> StorageResult<()> {
        let needed: usize = entries
            .iter()
            .map(|entry| entry.len() + POSITION_SLOT_SIZE)
            .sum();
        if needed > self.free_space() {
            return Err(malformed(format!(
                "{} bytes of entries do not fit into {} free bytes",
                needed,
                self.free_space()
            )));
        }
        self.page.apply(PageOperation::BucketAddAll {
            entries: entries.to_vec(),
        })
    }

    /// Flip between leaf and internal. Only meaningful on an empty bucket.
    pub fn switch_bucket_type(&mut self) -> StorageResult<()> {
        self.page.apply(PageOperation::BucketSwitchType)
    }

    pub fn set_left_sibling(&mut self, sibling: Option<PageId>) -> StorageResult<()> {
        let prev = self.left_sibling();
        self.page.apply(PageOperation::BucketSetLeftSibling { prev, new: sibling })
    }

    pub fn set_right_sibling(&mut self, sibling: Option<PageId>) -> StorageResult<()> {
        let prev = self.right_sibling();
        self.page
            .apply(PageOperation::BucketSetRightSibling { prev, new: sibling })
    }
}
