//! Write-Ahead Logging (WAL) module.
//!
//! This module implements the write-ahead logging subsystem, providing:
//! - Page operation records with redo/undo and a byte stream codec
//! - Framed, checksummed log frames
//! - Log buffering, flushing and truncation at checkpoints
//! - Log sequence number (LSN) management

pub mod manager;
pub mod record;

pub use manager::{WalFrame, WalFramePayload, WalManager};
pub use record::{PageOperation, PageOperationRecord, LSN};
