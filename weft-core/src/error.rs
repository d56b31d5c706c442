//! Engine error type.
//!
//! Most engine failures are programming errors (contract violations,
//! dependency cycles) and surface as panics carrying these messages at the
//! call site. `StoreError` is also returned directly by the diagnostic
//! surface, where an unknown cell id is an expected condition rather than a
//! bug.

use thiserror::Error;

use crate::cell::CellId;

/// Errors raised by the store engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// An interceptor hook returned without invoking its continuation, or
    /// invoked it more than once. Hooks may only observe and re-dispatch,
    /// never defer.
    #[error("interceptor must call fn sync")]
    InterceptorContract,

    /// A computed cell's read function reached itself again through its own
    /// dependencies.
    #[error("dependency cycle detected at cell {0:?}")]
    DependencyCycle(CellId),

    /// The given cell id has no record in the store.
    #[error("unknown cell {0:?}")]
    UnknownCell(CellId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interceptor_contract_message_is_stable() {
        // Devtools match on this message; it is part of the public contract.
        assert_eq!(
            StoreError::InterceptorContract.to_string(),
            "interceptor must call fn sync"
        );
    }

    #[test]
    fn cycle_error_names_the_cell() {
        let err = StoreError::DependencyCycle(CellId::from(7));
        assert!(err.to_string().contains('7'));
    }
}
