//! WAL manager implementation.
//!
//! The WAL manager appends frames to a single log file, buffers them in
//! memory, and makes them durable on flush. Each frame on disk is
//! `[len u32][crc32 u32][bincode payload]`.

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::record::{PageOperationRecord, LSN};
use crate::config::WalConfig;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::FileId;

/// WAL file prefix.
const WAL_FILE_PREFIX: &str = "wal_";

/// WAL file extension.
const WAL_FILE_EXTENSION: &str = ".log";

/// Length and checksum in front of every frame.
const FRAME_HEADER_SIZE: usize = 8;

/// What a WAL frame records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalFramePayload {
    /// A page operation, encoded with `PageOperationRecord::to_stream`.
    PageOperation { record: Vec<u8> },
    /// The redo-only undo of the frame at `undo_of`.
    Compensation { undo_of: LSN, record: Vec<u8> },
    FileCreated { unit: u64, file_id: FileId },
    Commit { unit: u64 },
    Rollback { unit: u64 },
    Checkpoint { lsn: LSN },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalFrame {
    pub lsn: LSN,
    pub payload: WalFramePayload,
}

impl WalFrame {
    /// The page operation carried by this frame, if any.
    pub fn page_operation(&self) -> StorageResult<Option<PageOperationRecord>> {
        match &self.payload {
            WalFramePayload::PageOperation { record }
            | WalFramePayload::Compensation { record, .. } => {
                PageOperationRecord::from_bytes(record).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Operation unit the frame belongs to.
    pub fn unit(&self) -> StorageResult<Option<u64>> {
        Ok(match &self.payload {
            WalFramePayload::FileCreated { unit, .. }
            | WalFramePayload::Commit { unit }
            | WalFramePayload::Rollback { unit } => Some(*unit),
            WalFramePayload::PageOperation { .. } | WalFramePayload::Compensation { .. } => {
                self.page_operation()?.map(|record| record.operation_unit_id)
            }
            WalFramePayload::Checkpoint { .. } => None,
        })
    }
}

fn encode_frame(frame: &WalFrame, out: &mut BytesMut) -> StorageResult<()> {
    let body = bincode::serialize(frame)?;
    out.reserve(FRAME_HEADER_SIZE + body.len());
    out.put_u32_le(body.len() as u32);
    out.put_u32_le(crc32fast::hash(&body));
    out.put_slice(&body);
    Ok(())
}

/// Decode frames until the end of `bytes` or the first damaged frame.
/// Returns the frames and the length of the intact prefix.
fn decode_frames(bytes: &[u8]) -> (Vec<WalFrame>, usize) {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset + FRAME_HEADER_SIZE <= bytes.len() {
        let mut header = &bytes[offset..offset + FRAME_HEADER_SIZE];
        let len = header.get_u32_le() as usize;
        let crc = header.get_u32_le();
        let start = offset + FRAME_HEADER_SIZE;
        let Some(body) = bytes.get(start..start + len) else {
            break;
        };
        if crc32fast::hash(body) != crc {
            break;
        }
        match bincode::deserialize::<WalFrame>(body) {
            Ok(frame) => frames.push(frame),
            Err(_) => break,
        }
        offset = start + len;
    }
    (frames, offset)
}

struct WalState {
    buffer: BytesMut,
    file: File,
    /// Highest LSN sitting in `buffer`.
    buffered_lsn: LSN,
}

/// WAL manager for handling write-ahead logging.
pub struct WalManager {
    config: WalConfig,
    path: PathBuf,
    state: Mutex<WalState>,
    /// Last LSN handed out.
    current_lsn: AtomicU64,
    /// All frames up to this LSN have been written to the log file.
    flushed_lsn: AtomicU64,
}

impl WalManager {
    /// Open the log in `dir`, creating it when missing.
    ///
    /// Existing frames are scanned to resume the LSN counter. A damaged
    /// tail left by a crash in the middle of a write is cut off.
    pub fn open(dir: &Path, config: WalConfig) -> StorageResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}{}{}", WAL_FILE_PREFIX, 0, WAL_FILE_EXTENSION));

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let (frames, valid_len) = decode_frames(&bytes);
        if valid_len < bytes.len() {
            warn!(
                "Cutting {} bytes of damaged WAL tail from {:?}",
                bytes.len() - valid_len,
                path
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }

        let last_lsn = frames.iter().map(|frame| frame.lsn).max().unwrap_or_default();
        info!(
            "Opened WAL {:?}: {} frames, last {}",
            path,
            frames.len(),
            last_lsn
        );

        Ok(Self {
            config,
            path,
            state: Mutex::new(WalState {
                buffer: BytesMut::new(),
                file,
                buffered_lsn: last_lsn,
            }),
            current_lsn: AtomicU64::new(last_lsn.0),
            flushed_lsn: AtomicU64::new(last_lsn.0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a frame and return the LSN assigned to it.
    ///
    /// The frame is durable only after the next `flush`.
    pub fn append(&self, payload: WalFramePayload) -> StorageResult<LSN> {
        let mut state = self.state.lock();
        let lsn = LSN(self.current_lsn.load(Ordering::SeqCst)).next();
        let frame = WalFrame { lsn, payload };
        encode_frame(&frame, &mut state.buffer)?;
        self.current_lsn.store(lsn.0, Ordering::SeqCst);
        state.buffered_lsn = lsn;
        trace!("WAL append {}", lsn);

        if state.buffer.len() >= self.config.buffer_size {
            self.write_buffer(&mut state)?;
        }
        Ok(lsn)
    }

    /// Write buffered frames to the log file and sync it when configured.
    pub fn flush(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        self.write_buffer(&mut state)?;
        if self.config.sync_on_commit {
            state.file.sync_data()?;
        }
        Ok(())
    }

    fn write_buffer(&self, state: &mut WalState) -> StorageResult<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        let chunk = state.buffer.split();
        state.file.write_all(&chunk)?;
        state.file.flush()?;
        self.flushed_lsn.store(state.buffered_lsn.0, Ordering::SeqCst);
        Ok(())
    }

    /// Every frame currently in the log, buffered ones included, in LSN order.
    pub fn read_all(&self) -> StorageResult<Vec<WalFrame>> {
        let mut state = self.state.lock();
        self.write_buffer(&mut state)?;

        let mut reader = File::open(&self.path)?;
        reader.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let (frames, valid_len) = decode_frames(&bytes);
        if valid_len < bytes.len() {
            return Err(StorageError::MalformedWal(format!(
                "damaged frame at offset {} of {:?}",
                valid_len, self.path
            )));
        }
        Ok(frames)
    }

    /// Drop every frame and restart the log with a checkpoint frame, keeping
    /// LSNs monotonic. Returns the LSN of the checkpoint frame.
    pub fn truncate(&self) -> StorageResult<LSN> {
        let mut state = self.state.lock();
        state.buffer.clear();
        state.file.set_len(0)?;

        let current = LSN(self.current_lsn.load(Ordering::SeqCst));
        let lsn = current.next();
        let frame = WalFrame {
            lsn,
            payload: WalFramePayload::Checkpoint { lsn: current },
        };
        encode_frame(&frame, &mut state.buffer)?;
        self.current_lsn.store(lsn.0, Ordering::SeqCst);
        state.buffered_lsn = lsn;
        self.write_buffer(&mut state)?;
        state.file.sync_all()?;
        debug!("WAL truncated at {}", lsn);
        Ok(lsn)
    }

    /// Last LSN handed out.
    pub fn current_lsn(&self) -> LSN {
        LSN(self.current_lsn.load(Ordering::SeqCst))
    }

    /// Highest LSN written to the log file.
    pub fn flushed_lsn(&self) -> LSN {
        LSN(self.flushed_lsn.load(Ordering::SeqCst))
    }
}
