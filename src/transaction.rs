//! Atomic operations.
//!
//! Every page mutation runs inside an atomic operation, which logs it to
//! the WAL and either commits the whole group or undoes it.

pub mod id;
pub mod manager;
pub mod operation;
pub mod state;

pub use id::{OperationUnitId, OperationUnitIdGenerator};
pub use manager::{AtomicOperationsManager, ComponentFreezeGuard, ComponentReadGuard};
pub use operation::{AtomicOperation, CacheEntry};
pub use state::AtomicOperationState;
