//! Operation unit ids.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of one atomic operation, carried by every WAL frame it writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationUnitId(pub u64);

impl OperationUnitId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for OperationUnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Unit{}", self.0)
    }
}

/// A thread-safe operation unit id generator.
pub struct OperationUnitIdGenerator {
    next_id: AtomicU64,
}

impl OperationUnitIdGenerator {
    /// Creates a generator starting from 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Generates the next unique id.
    pub fn next(&self) -> OperationUnitId {
        OperationUnitId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Returns the last id handed out, without incrementing.
    pub fn current(&self) -> OperationUnitId {
        OperationUnitId(self.next_id.load(Ordering::SeqCst).saturating_sub(1))
    }

    /// Make sure ids handed out from now on are greater than `seen`.
    /// Used after recovery, where ids found in the log must not be reused.
    pub fn advance_past(&self, seen: u64) {
        self.next_id.fetch_max(seen.saturating_add(1), Ordering::SeqCst);
    }
}

impl Default for OperationUnitIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_sequence() {
        let generator = OperationUnitIdGenerator::new();
        assert_eq!(generator.current().value(), 0);
        assert_eq!(generator.next(), OperationUnitId(1));
        assert_eq!(generator.next(), OperationUnitId(2));
        assert_eq!(generator.current().value(), 2);
        assert_eq!(format!("{}", OperationUnitId(2)), "Unit2");
    }

    #[test]
    fn test_advance_past_never_goes_back() {
        let generator = OperationUnitIdGenerator::new();
        generator.advance_past(41);
        assert_eq!(generator.next(), OperationUnitId(42));
        generator.advance_past(10);
        assert_eq!(generator.next(), OperationUnitId(43));
    }

    #[test]
    fn test_generator_thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let generator = Arc::new(OperationUnitIdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gen = Arc::clone(&generator);
                thread::spawn(move || (0..100).map(|_| gen.next().value()).collect::<Vec<_>>())
            })
            .collect();

        let mut all_ids = vec![];
        for handle in handles {
            all_ids.extend(handle.join().unwrap());
        }
        all_ids.sort();
        all_ids.dedup();
        assert_eq!(all_ids.len(), 800);
    }
}
