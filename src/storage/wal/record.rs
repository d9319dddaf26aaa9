//! Page operation records.
//!
//! A page operation describes one mutation of one page. It can re-apply
//! itself to a page buffer (redo) or revert itself (undo), and it travels
//! through the WAL in a fixed little-endian stream encoding.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::bucket;
use crate::storage::page::entry_point;
use crate::storage::page::{FileId, PageId};

/// Log Sequence Number - a unique identifier for WAL frames.
/// LSNs are monotonically increasing and used to order log frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LSN(pub u64);

impl LSN {
    /// Create a new LSN with value 0.
    pub fn new() -> Self {
        LSN(0)
    }

    /// Get the next LSN.
    pub fn next(&self) -> Self {
        LSN(self.0 + 1)
    }

    /// Check if this is an invalid LSN (0).
    pub fn is_invalid(&self) -> bool {
        self.0 == 0
    }
}

impl Default for LSN {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LSN {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({})", self.0)
    }
}

/// One mutation of a bucket or entry point page.
///
/// Every variant carries what it needs to be undone, so the page state
/// before the mutation never has to be re-read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOperation {
    BucketInit {
        is_leaf: bool,
        prev_header: Vec<u8>,
    },
    BucketAddLeafEntry {
        index: u32,
        entry: Vec<u8>,
    },
    BucketRemoveLeafEntry {
        index: u32,
        position: u32,
        entry: Vec<u8>,
    },
    BucketUpdateValue {
        index: u32,
        key_len: u32,
        prev_value: Vec<u8>,
        value: Vec<u8>,
    },
    /// Insert an internal entry. When `update_neighbors` is set, the child
    /// pointers of the adjacent entries are rewritten; their previous
    /// values are kept for undo.
    BucketAddNonLeafEntry {
        index: u32,
        entry: Vec<u8>,
        update_neighbors: bool,
        prev_left_neighbor_right: Option<u32>,
        prev_right_neighbor_left: Option<u32>,
    },
    /// Drop every entry from `new_size` onward. `removed` holds the dropped
    /// entries in index order, each with the position it had when redo,
    /// working from the highest index down, took it out.
    BucketShrink {
        new_size: u32,
        removed: Vec<(u32, Vec<u8>)>,
    },
    BucketAddAll {
        entries: Vec<Vec<u8>>,
    },
    BucketSwitchType,
    BucketSetLeftSibling {
        prev: Option<PageId>,
        new: Option<PageId>,
    },
    BucketSetRightSibling {
        prev: Option<PageId>,
        new: Option<PageId>,
    },
    EntryPointInit {
        prev_header: Vec<u8>,
    },
    EntryPointSetTreeSize {
        prev: i64,
        new: i64,
    },
    EntryPointSetPagesSize {
        prev: u32,
        new: u32,
    },
}

const OP_BUCKET_INIT: u8 = 1;
const OP_BUCKET_ADD_LEAF_ENTRY: u8 = 2;
const OP_BUCKET_REMOVE_LEAF_ENTRY: u8 = 3;
const OP_BUCKET_UPDATE_VALUE: u8 = 4;
const OP_BUCKET_ADD_NON_LEAF_ENTRY: u8 = 5;
const OP_BUCKET_SHRINK: u8 = 6;
const OP_BUCKET_ADD_ALL: u8 = 7;
const OP_BUCKET_SWITCH_TYPE: u8 = 8;
const OP_BUCKET_SET_LEFT_SIBLING: u8 = 9;
const OP_BUCKET_SET_RIGHT_SIBLING: u8 = 10;
const OP_ENTRY_POINT_INIT: u8 = 11;
const OP_ENTRY_POINT_SET_TREE_SIZE: u8 = 12;
const OP_ENTRY_POINT_SET_PAGES_SIZE: u8 = 13;

fn sibling_to_raw(sibling: Option<PageId>) -> i64 {
    sibling.map_or(-1, |page| i64::from(page.0))
}

fn sibling_from_raw(raw: i64) -> StorageResult<Option<PageId>> {
    if raw < 0 {
        return Ok(None);
    }
    u32::try_from(raw)
        .map(|page| Some(PageId(page)))
        .map_err(|_| StorageError::MalformedWal(format!("sibling pointer {} out of range", raw)))
}

impl PageOperation {
    fn type_id(&self) -> u8 {
        match self {
            PageOperation::BucketInit { .. } => OP_BUCKET_INIT,
            PageOperation::BucketAddLeafEntry { .. } => OP_BUCKET_ADD_LEAF_ENTRY,
            PageOperation::BucketRemoveLeafEntry { .. } => OP_BUCKET_REMOVE_LEAF_ENTRY,
            PageOperation::BucketUpdateValue { .. } => OP_BUCKET_UPDATE_VALUE,
            PageOperation::BucketAddNonLeafEntry { .. } => OP_BUCKET_ADD_NON_LEAF_ENTRY,
            PageOperation::BucketShrink { .. } => OP_BUCKET_SHRINK,
            PageOperation::BucketAddAll { .. } => OP_BUCKET_ADD_ALL,
            PageOperation::BucketSwitchType => OP_BUCKET_SWITCH_TYPE,
            PageOperation::BucketSetLeftSibling { .. } => OP_BUCKET_SET_LEFT_SIBLING,
            PageOperation::BucketSetRightSibling { .. } => OP_BUCKET_SET_RIGHT_SIBLING,
            PageOperation::EntryPointInit { .. } => OP_ENTRY_POINT_INIT,
            PageOperation::EntryPointSetTreeSize { .. } => OP_ENTRY_POINT_SET_TREE_SIZE,
            PageOperation::EntryPointSetPagesSize { .. } => OP_ENTRY_POINT_SET_PAGES_SIZE,
        }
    }

    /// Apply the mutation to `data`.
    pub fn redo(&self, data: &mut [u8]) -> StorageResult<()> {
        match self {
            PageOperation::BucketInit { is_leaf, .. } => {
                bucket::init_header(data, *is_leaf);
                Ok(())
            }
            PageOperation::BucketAddLeafEntry { index, entry } => {
                bucket::insert_raw(data, *index as usize, entry)
            }
            PageOperation::BucketRemoveLeafEntry { index, .. } => {
                bucket::remove_raw(data, *index as usize).map(|_| ())
            }
            PageOperation::BucketUpdateValue {
                index,
                key_len,
                value,
                ..
            } => bucket::write_value_raw(data, *index as usize, *key_len as usize, value),
            PageOperation::BucketAddNonLeafEntry {
                index,
                entry,
                update_neighbors,
                ..
            } => {
                let index = *index as usize;
                bucket::insert_raw(data, index, entry)?;
                if *update_neighbors {
                    let (left, right) = bucket::decode_children(entry)?;
                    let size = bucket::raw_size(data);
                    if index + 1 < size {
                        bucket::set_left_child_raw(data, index + 1, right)?;
                    }
                    if index > 0 {
                        bucket::set_right_child_raw(data, index - 1, left)?;
                    }
                }
                Ok(())
            }
            PageOperation::BucketShrink { new_size, .. } => {
                let new_size = *new_size as usize;
                let size = bucket::raw_size(data);
                for index in (new_size..size).rev() {
                    bucket::remove_raw(data, index)?;
                }
                Ok(())
            }
            PageOperation::BucketAddAll { entries } => {
                for entry in entries {
                    let size = bucket::raw_size(data);
                    bucket::insert_raw(data, size, entry)?;
                }
                Ok(())
            }
            PageOperation::BucketSwitchType => {
                bucket::switch_type_raw(data);
                Ok(())
            }
            PageOperation::BucketSetLeftSibling { new, .. } => {
                bucket::set_left_sibling_raw(data, *new);
                Ok(())
            }
            PageOperation::BucketSetRightSibling { new, .. } => {
                bucket::set_right_sibling_raw(data, *new);
                Ok(())
            }
            PageOperation::EntryPointInit { .. } => {
                entry_point::init_header(data);
                Ok(())
            }
            PageOperation::EntryPointSetTreeSize { new, .. } => {
                entry_point::set_tree_size_raw(data, *new);
                Ok(())
            }
            PageOperation::EntryPointSetPagesSize { new, .. } => {
                entry_point::set_pages_size_raw(data, *new);
                Ok(())
            }
        }
    }

    /// Revert the mutation on a buffer that holds its result.
    pub fn undo(&self, data: &mut [u8]) -> StorageResult<()> {
        match self {
            PageOperation::BucketInit { prev_header, .. } => {
                bucket::restore_header(data, prev_header)
            }
            PageOperation::BucketAddLeafEntry { index, .. } => {
                bucket::remove_raw(data, *index as usize).map(|_| ())
            }
            PageOperation::BucketRemoveLeafEntry {
                index,
                position,
                entry,
            } => bucket::restore_raw(data, *index as usize, *position as usize, entry),
            PageOperation::BucketUpdateValue {
                index,
                key_len,
                prev_value,
                ..
            } => bucket::write_value_raw(data, *index as usize, *key_len as usize, prev_value),
            PageOperation::BucketAddNonLeafEntry {
                index,
                prev_left_neighbor_right,
                prev_right_neighbor_left,
                ..
            } => {
                let index = *index as usize;
                if let Some(prev) = prev_right_neighbor_left {
                    bucket::set_left_child_raw(data, index + 1, *prev)?;
                }
                if let Some(prev) = prev_left_neighbor_right {
                    bucket::set_right_child_raw(data, index - 1, *prev)?;
                }
                bucket::remove_raw(data, index).map(|_| ())
            }
            PageOperation::BucketShrink { new_size, removed } => {
                for (offset, (position, entry)) in removed.iter().enumerate() {
                    let index = *new_size as usize + offset;
                    bucket::restore_raw(data, index, *position as usize, entry)?;
                }
                Ok(())
            }
            PageOperation::BucketAddAll { entries } => {
                for _ in entries {
                    let size = bucket::raw_size(data);
                    if size == 0 {
                        return Err(StorageError::MalformedPage(
                            "undo of bulk append found an empty bucket".to_string(),
                        ));
                    }
                    bucket::remove_raw(data, size - 1)?;
                }
                Ok(())
            }
            PageOperation::BucketSwitchType => {
                bucket::switch_type_raw(data);
                Ok(())
            }
            PageOperation::BucketSetLeftSibling { prev, .. } => {
                bucket::set_left_sibling_raw(data, *prev);
                Ok(())
            }
            PageOperation::BucketSetRightSibling { prev, .. } => {
                bucket::set_right_sibling_raw(data, *prev);
                Ok(())
            }
            PageOperation::EntryPointInit { prev_header } => {
                entry_point::restore_header(data, prev_header)
            }
            PageOperation::EntryPointSetTreeSize { prev, .. } => {
                entry_point::set_tree_size_raw(data, *prev);
                Ok(())
            }
            PageOperation::EntryPointSetPagesSize { prev, .. } => {
                entry_point::set_pages_size_raw(data, *prev);
                Ok(())
            }
        }
    }

    fn payload_size(&self) -> usize {
        let bytes = |b: &Vec<u8>| 4 + b.len();
        match self {
            PageOperation::BucketInit { prev_header, .. } => 1 + bytes(prev_header),
            PageOperation::BucketAddLeafEntry { entry, .. } => 4 + bytes(entry),
            PageOperation::BucketRemoveLeafEntry { entry, .. } => 8 + bytes(entry),
            PageOperation::BucketUpdateValue {
                prev_value, value, ..
            } => 8 + bytes(prev_value) + bytes(value),
            PageOperation::BucketAddNonLeafEntry { entry, .. } => 4 + bytes(entry) + 1 + 5 + 5,
            PageOperation::BucketShrink { removed, .. } => {
                8 + removed.iter().map(|(_, e)| 4 + bytes(e)).sum::<usize>()
            }
            PageOperation::BucketAddAll { entries } => {
                4 + entries.iter().map(bytes).sum::<usize>()
            }
            PageOperation::BucketSwitchType => 0,
            PageOperation::BucketSetLeftSibling { .. }
            | PageOperation::BucketSetRightSibling { .. } => 16,
            PageOperation::EntryPointInit { prev_header } => bytes(prev_header),
            PageOperation::EntryPointSetTreeSize { .. } => 16,
            PageOperation::EntryPointSetPagesSize { .. } => 8,
        }
    }

    fn write_payload(&self, out: &mut StreamWriter<'_>) {
        match self {
            PageOperation::BucketInit {
                is_leaf,
                prev_header,
            } => {
                out.put_u8(u8::from(*is_leaf));
                out.put_bytes(prev_header);
            }
            PageOperation::BucketAddLeafEntry { index, entry } => {
                out.put_u32(*index);
                out.put_bytes(entry);
            }
            PageOperation::BucketRemoveLeafEntry {
                index,
                position,
                entry,
            } => {
                out.put_u32(*index);
                out.put_u32(*position);
                out.put_bytes(entry);
            }
            PageOperation::BucketUpdateValue {
                index,
                key_len,
                prev_value,
                value,
            } => {
                out.put_u32(*index);
                out.put_u32(*key_len);
                out.put_bytes(prev_value);
                out.put_bytes(value);
            }
            PageOperation::BucketAddNonLeafEntry {
                index,
                entry,
                update_neighbors,
                prev_left_neighbor_right,
                prev_right_neighbor_left,
            } => {
                out.put_u32(*index);
                out.put_bytes(entry);
                out.put_u8(u8::from(*update_neighbors));
                out.put_opt_u32(*prev_left_neighbor_right);
                out.put_opt_u32(*prev_right_neighbor_left);
            }
            PageOperation::BucketShrink { new_size, removed } => {
                out.put_u32(*new_size);
                out.put_u32(removed.len() as u32);
                for (position, entry) in removed {
                    out.put_u32(*position);
                    out.put_bytes(entry);
                }
            }
            PageOperation::BucketAddAll { entries } => {
                out.put_u32(entries.len() as u32);
                for entry in entries {
                    out.put_bytes(entry);
                }
            }
            PageOperation::BucketSwitchType => {}
            PageOperation::BucketSetLeftSibling { prev, new }
            | PageOperation::BucketSetRightSibling { prev, new } => {
                out.put_i64(sibling_to_raw(*prev));
                out.put_i64(sibling_to_raw(*new));
            }
            PageOperation::EntryPointInit { prev_header } => out.put_bytes(prev_header),
            PageOperation::EntryPointSetTreeSize { prev, new } => {
                out.put_i64(*prev);
                out.put_i64(*new);
            }
            PageOperation::EntryPointSetPagesSize { prev, new } => {
                out.put_u32(*prev);
                out.put_u32(*new);
            }
        }
    }

    fn read_payload(type_id: u8, input: &mut StreamReader<'_>) -> StorageResult<Self> {
        let operation = match type_id {
            OP_BUCKET_INIT => PageOperation::BucketInit {
                is_leaf: input.get_u8()? != 0,
                prev_header: input.get_bytes()?,
            },
            OP_BUCKET_ADD_LEAF_ENTRY => PageOperation::BucketAddLeafEntry {
                index: input.get_u32()?,
                entry: input.get_bytes()?,
            },
            OP_BUCKET_REMOVE_LEAF_ENTRY => PageOperation::BucketRemoveLeafEntry {
                index: input.get_u32()?,
                position: input.get_u32()?,
                entry: input.get_bytes()?,
            },
            OP_BUCKET_UPDATE_VALUE => PageOperation::BucketUpdateValue {
                index: input.get_u32()?,
                key_len: input.get_u32()?,
                prev_value: input.get_bytes()?,
                value: input.get_bytes()?,
            },
            OP_BUCKET_ADD_NON_LEAF_ENTRY => PageOperation::BucketAddNonLeafEntry {
                index: input.get_u32()?,
                entry: input.get_bytes()?,
                update_neighbors: input.get_u8()? != 0,
                prev_left_neighbor_right: input.get_opt_u32()?,
                prev_right_neighbor_left: input.get_opt_u32()?,
            },
            OP_BUCKET_SHRINK => {
                let new_size = input.get_u32()?;
                let count = input.get_u32()?;
                let mut removed = Vec::new();
                for _ in 0..count {
                    let position = input.get_u32()?;
                    removed.push((position, input.get_bytes()?));
                }
                PageOperation::BucketShrink { new_size, removed }
            }
            OP_BUCKET_ADD_ALL => {
                let count = input.get_u32()?;
                let mut entries = Vec::new();
                for _ in 0..count {
                    entries.push(input.get_bytes()?);
                }
                PageOperation::BucketAddAll { entries }
            }
            OP_BUCKET_SWITCH_TYPE => PageOperation::BucketSwitchType,
            OP_BUCKET_SET_LEFT_SIBLING => PageOperation::BucketSetLeftSibling {
                prev: sibling_from_raw(input.get_i64()?)?,
                new: sibling_from_raw(input.get_i64()?)?,
            },
            OP_BUCKET_SET_RIGHT_SIBLING => PageOperation::BucketSetRightSibling {
                prev: sibling_from_raw(input.get_i64()?)?,
                new: sibling_from_raw(input.get_i64()?)?,
            },
            OP_ENTRY_POINT_INIT => PageOperation::EntryPointInit {
                prev_header: input.get_bytes()?,
            },
            OP_ENTRY_POINT_SET_TREE_SIZE => PageOperation::EntryPointSetTreeSize {
                prev: input.get_i64()?,
                new: input.get_i64()?,
            },
            OP_ENTRY_POINT_SET_PAGES_SIZE => PageOperation::EntryPointSetPagesSize {
                prev: input.get_u32()?,
                new: input.get_u32()?,
            },
            other => {
                return Err(StorageError::MalformedWal(format!(
                    "unknown page operation type {}",
                    other
                )))
            }
        };
        Ok(operation)
    }
}

/// A page operation addressed to a page and owned by an atomic operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOperationRecord {
    pub file_id: FileId,
    pub page_index: PageId,
    pub operation_unit_id: u64,
    pub operation: PageOperation,
}

/// Type tag, file id, page index and operation unit id.
const RECORD_HEADER_SIZE: usize = 1 + 4 + 4 + 8;

impl PageOperationRecord {
    pub fn new(
        file_id: FileId,
        page_index: PageId,
        operation_unit_id: u64,
        operation: PageOperation,
    ) -> Self {
        Self {
            file_id,
            page_index,
            operation_unit_id,
            operation,
        }
    }

    pub fn redo(&self, data: &mut [u8]) -> StorageResult<()> {
        self.operation.redo(data)
    }

    pub fn undo(&self, data: &mut [u8]) -> StorageResult<()> {
        self.operation.undo(data)
    }

    /// Exact number of bytes `to_stream` writes.
    pub fn serialized_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.operation.payload_size()
    }

    /// Encode the record into `buf` starting at `offset` and return the
    /// offset right after it. `buf` must hold `serialized_size()` bytes
    /// from `offset` on.
    pub fn to_stream(&self, buf: &mut [u8], offset: usize) -> usize {
        let mut out = StreamWriter { buf, offset };
        out.put_u8(self.operation.type_id());
        out.put_u32(self.file_id.0);
        out.put_u32(self.page_index.0);
        out.put_u64(self.operation_unit_id);
        self.operation.write_payload(&mut out);
        out.offset
    }

    /// Decode a record from `buf` at `offset`, returning it with the offset
    /// right after it.
    pub fn from_stream(buf: &[u8], offset: usize) -> StorageResult<(Self, usize)> {
        let mut input = StreamReader { buf, offset };
        let type_id = input.get_u8()?;
        let file_id = FileId(input.get_u32()?);
        let page_index = PageId(input.get_u32()?);
        let operation_unit_id = input.get_u64()?;
        let operation = PageOperation::read_payload(type_id, &mut input)?;
        Ok((
            Self {
                file_id,
                page_index,
                operation_unit_id,
                operation,
            },
            input.offset,
        ))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.serialized_size()];
        self.to_stream(&mut buf, 0);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> StorageResult<Self> {
        let (record, end) = Self::from_stream(buf, 0)?;
        if end != buf.len() {
            return Err(StorageError::MalformedWal(format!(
                "{} trailing bytes after page operation record",
                buf.len() - end
            )));
        }
        Ok(record)
    }
}

impl fmt::Display for PageOperationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "op {} on {}:{} (unit {})",
            self.operation.type_id(),
            self.file_id,
            self.page_index,
            self.operation_unit_id
        )
    }
}

struct StreamWriter<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl StreamWriter<'_> {
    fn put_u8(&mut self, v: u8) {
        self.buf[self.offset] = v;
        self.offset += 1;
    }

    fn put_u32(&mut self, v: u32) {
        LittleEndian::write_u32(&mut self.buf[self.offset..self.offset + 4], v);
        self.offset += 4;
    }

    fn put_u64(&mut self, v: u64) {
        LittleEndian::write_u64(&mut self.buf[self.offset..self.offset + 8], v);
        self.offset += 8;
    }

    fn put_i64(&mut self, v: i64) {
        LittleEndian::write_i64(&mut self.buf[self.offset..self.offset + 8], v);
        self.offset += 8;
    }

    fn put_opt_u32(&mut self, v: Option<u32>) {
        self.put_u8(u8::from(v.is_some()));
        self.put_u32(v.unwrap_or(0));
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf[self.offset..self.offset + bytes.len()].copy_from_slice(bytes);
        self.offset += bytes.len();
    }
}

struct StreamReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl StreamReader<'_> {
    fn take(&mut self, len: usize) -> StorageResult<&[u8]> {
        let slice = self
            .offset
            .checked_add(len)
            .and_then(|end| self.buf.get(self.offset..end))
            .ok_or_else(|| {
                StorageError::MalformedWal(format!(
                    "page operation record truncated at offset {}",
                    self.offset
                ))
            })?;
        self.offset += len;
        Ok(slice)
    }

    fn get_u8(&mut self) -> StorageResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn get_u32(&mut self) -> StorageResult<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn get_u64(&mut self) -> StorageResult<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    fn get_i64(&mut self) -> StorageResult<i64> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    fn get_opt_u32(&mut self) -> StorageResult<Option<u32>> {
        let present = self.get_u8()? != 0;
        let value = self.get_u32()?;
        Ok(present.then_some(value))
    }

    fn get_bytes(&mut self) -> StorageResult<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::bonsai::EdgeKey;
    use crate::storage::page::{Bucket, DetachedPage, PageView};

    const PAGE_SIZE: usize = 256;

    fn leaf_page() -> StorageResult<DetachedPage> {
        let mut page = DetachedPage::new(PAGE_SIZE);
        Bucket::new(&mut page).init(true)?;
        page.clear_operations();
        Ok(page)
    }

    #[test]
    fn test_lsn_ordering() {
        let lsn = LSN::new();
        assert!(lsn.is_invalid());
        assert_eq!(lsn.next(), LSN(1));
        assert!(LSN(3) < LSN(4));
        assert_eq!(LSN(9).to_string(), "LSN(9)");
    }

    #[test]
    fn test_set_left_sibling_record_fields() -> StorageResult<()> {
        let record = PageOperationRecord::new(
            FileId(42),
            PageId(24),
            1,
            PageOperation::BucketSetLeftSibling {
                prev: Some(PageId(2)),
                new: Some(PageId(12)),
            },
        );

        let mut buf = vec![0u8; record.serialized_size() + 1];
        let end = record.to_stream(&mut buf, 1);
        assert_eq!(end, buf.len());

        let (decoded, offset) = PageOperationRecord::from_stream(&buf, 1)?;
        assert_eq!(offset, end);
        assert_eq!(decoded.file_id, FileId(42));
        assert_eq!(decoded.page_index, PageId(24));
        assert_eq!(decoded.operation_unit_id, 1);
        assert_eq!(decoded, record);
        Ok(())
    }

    #[test]
    fn test_set_left_sibling_redo() -> StorageResult<()> {
        let mut page = leaf_page()?;
        Bucket::new(&mut page).set_left_sibling(Some(PageId(2)))?;
        let before = page.data().to_vec();

        let mut bucket = Bucket::new(&mut page);
        bucket.set_left_sibling(Some(PageId(12)))?;
        let operations = page.operations().to_vec();
        assert_eq!(operations.len(), 2);

        let mut replay = before.clone();
        operations[1].redo(&mut replay)?;
        assert_eq!(replay, page.data());
        assert_eq!(Bucket::new(&replay).left_sibling(), Some(PageId(12)));
        Ok(())
    }

    #[test]
    fn test_set_left_sibling_undo() -> StorageResult<()> {
        let mut page = leaf_page()?;
        Bucket::new(&mut page).set_left_sibling(Some(PageId(2)))?;
        let before = page.data().to_vec();
        page.clear_operations();

        Bucket::new(&mut page).set_left_sibling(Some(PageId(12)))?;
        let operation = page.operations()[0].clone();

        let mut restored = page.data().to_vec();
        operation.undo(&mut restored)?;
        assert_eq!(restored, before);
        Ok(())
    }

    #[test]
    fn test_unset_sibling_encoding() -> StorageResult<()> {
        let record = PageOperationRecord::new(
            FileId(1),
            PageId(3),
            7,
            PageOperation::BucketSetRightSibling {
                prev: None,
                new: Some(PageId(0)),
            },
        );
        assert_eq!(PageOperationRecord::from_bytes(&record.to_bytes())?, record);
        Ok(())
    }

    #[test]
    fn test_redo_then_undo_is_identity_for_bucket_mutations() -> StorageResult<()> {
        let mut page = leaf_page()?;
        {
            let mut bucket = Bucket::new(&mut page);
            for position in 0..6i64 {
                let key = EdgeKey::new(1, position * 10);
                let value = [position as u8 * 2];
                assert!(bucket.add_leaf_entry(position as usize, &key.serialize(), &value)?);
            }
            bucket.remove_leaf_entry(2)?;
            bucket.update_value(0, &[9])?;
            bucket.shrink(3)?;
            bucket.add_all(&[{
                let mut entry = EdgeKey::new(2, 0).serialize().to_vec();
                entry.push(4);
                entry
            }])?;
            bucket.set_right_sibling(Some(PageId(5)))?;
            bucket.switch_bucket_type()?;
            bucket.switch_bucket_type()?;
        }

        let operations = page.operations().to_vec();
        let mut states = vec![leaf_page()?.into_data()];
        for operation in &operations {
            let mut next = states[states.len() - 1].clone();
            operation.redo(&mut next)?;
            states.push(next);
        }
        assert_eq!(states[states.len() - 1], page.data());

        for (i, operation) in operations.iter().enumerate().rev() {
            let mut prev = states[i + 1].clone();
            operation.undo(&mut prev)?;
            assert_eq!(prev, states[i], "undo of operation {} is not exact", i);
        }
        Ok(())
    }

    #[test]
    fn test_every_operation_survives_the_stream() -> StorageResult<()> {
        let operations = vec![
            PageOperation::BucketInit {
                is_leaf: true,
                prev_header: vec![1, 2, 3],
            },
            PageOperation::BucketAddLeafEntry {
                index: 3,
                entry: vec![7; 13],
            },
            PageOperation::BucketRemoveLeafEntry {
                index: 1,
                position: 200,
                entry: vec![1; 14],
            },
            PageOperation::BucketUpdateValue {
                index: 0,
                key_len: 12,
                prev_value: vec![2],
                value: vec![4],
            },
            PageOperation::BucketAddNonLeafEntry {
                index: 2,
                entry: vec![5; 20],
                update_neighbors: true,
                prev_left_neighbor_right: Some(9),
                prev_right_neighbor_left: None,
            },
            PageOperation::BucketShrink {
                new_size: 1,
                removed: vec![(100, vec![1, 2]), (80, vec![3])],
            },
            PageOperation::BucketAddAll {
                entries: vec![vec![1], vec![2, 2]],
            },
            PageOperation::BucketSwitchType,
            PageOperation::EntryPointInit {
                prev_header: vec![0; 12],
            },
            PageOperation::EntryPointSetTreeSize { prev: 4, new: 5 },
            PageOperation::EntryPointSetPagesSize { prev: 1, new: 3 },
        ];

        let records: Vec<_> = operations
            .into_iter()
            .enumerate()
            .map(|(i, op)| PageOperationRecord::new(FileId(2), PageId(i as u32), 11, op))
            .collect();

        let total: usize = records.iter().map(|r| r.serialized_size()).sum();
        let mut buf = vec![0u8; total];
        let mut offset = 0;
        for record in &records {
            offset = record.to_stream(&mut buf, offset);
        }
        assert_eq!(offset, total);

        let mut offset = 0;
        for record in &records {
            let (decoded, next) = PageOperationRecord::from_stream(&buf, offset)?;
            assert_eq!(&decoded, record);
            assert_eq!(next - offset, record.serialized_size());
            offset = next;
        }
        Ok(())
    }

    #[test]
    fn test_truncated_and_unknown_records() {
        let record = PageOperationRecord::new(
            FileId(1),
            PageId(1),
            1,
            PageOperation::EntryPointSetPagesSize { prev: 1, new: 2 },
        );
        let bytes = record.to_bytes();
        assert!(PageOperationRecord::from_bytes(&bytes[..bytes.len() - 1]).is_err());

        let mut unknown = bytes.clone();
        unknown[0] = 200;
        assert!(matches!(
            PageOperationRecord::from_bytes(&unknown),
            Err(StorageError::MalformedWal(_))
        ));
    }
}
