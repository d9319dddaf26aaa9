//! Access methods built on the storage layer.
//!
//! - **BTreeBonsai**: a disk-resident B+tree mapping `(group id, position)`
//!   edge keys to integer values, one tree per file

pub mod bonsai;

pub use bonsai::{BTreeBonsai, EdgeKey, KeyBound};
