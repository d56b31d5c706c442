//! Cell identity.
//!
//! Every cell gets a process-unique integer id at creation time; assignment
//! order is creation order. Identity, not structural equality, is the key
//! used throughout the engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unique identifier for a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CellId(u64);

impl CellId {
    /// Generate a new unique cell ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for CellId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Unique identifier for a subscription listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// The kind of cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum CellKind {
    /// A mutable leaf value. These are the roots of the graph: they have no
    /// dependencies, only dependents.
    State,

    /// A derived, read-only value. These have dependencies and may have
    /// dependents. They cache their computed value.
    Computed,

    /// An imperative write procedure. Commands hold no value and never
    /// appear in the dependency graph.
    Command,
}

/// Diagnostic snapshot of a cell's identity.
///
/// This is the value handed to interceptor hooks and diagnostic views; it
/// never exposes the cell's behavior or cached value.
#[derive(Debug, Clone)]
pub struct CellMeta {
    /// The cell's unique id.
    pub id: CellId,
    /// What kind of cell this is.
    pub kind: CellKind,
    /// Optional human-readable label, used only for diagnostics.
    pub label: Option<Arc<str>>,
}

impl CellMeta {
    /// The label, if any, as a plain string slice.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}
