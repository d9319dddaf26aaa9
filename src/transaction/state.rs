//! Atomic operation state.

/// The possible states of an atomic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOperationState {
    /// The operation is running and can apply page operations.
    Active,
    /// A component failed inside the operation; it can only be rolled back.
    RollbackOnly,
    /// The operation has been committed.
    Committed,
    /// The operation has been rolled back.
    RolledBack,
    /// Undo stopped part way. The unit is left for recovery to finish.
    RollbackFailed,
}

impl AtomicOperationState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::RollbackOnly)
    }

    /// Returns true once the operation can no longer be ended, whether it
    /// committed, rolled back or failed to roll back.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Self::Committed | Self::RolledBack | Self::RollbackFailed
        )
    }
}

impl std::fmt::Display for AtomicOperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::RollbackOnly => write!(f, "RollbackOnly"),
            Self::Committed => write!(f, "Committed"),
            Self::RolledBack => write!(f, "RolledBack"),
            Self::RollbackFailed => write!(f, "RollbackFailed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(AtomicOperationState::Active.is_active());
        assert!(AtomicOperationState::RollbackOnly.is_active());
        assert!(!AtomicOperationState::Committed.is_active());
        assert!(AtomicOperationState::RolledBack.is_finished());
        assert!(!AtomicOperationState::RollbackOnly.is_finished());
        assert_eq!(AtomicOperationState::RollbackOnly.to_string(), "RollbackOnly");
        assert!(AtomicOperationState::RollbackFailed.is_finished());
        assert!(!AtomicOperationState::RollbackFailed.is_active());
    }
}
