//! Crash recovery.
//!
//! Run once when a database is opened, before any atomic operation starts:
//! committed changes missing from the data files are redone from the WAL and
//! operations that never finished are rolled back.

pub mod aries;

pub use aries::{AriesRecovery, RecoveryStats};
