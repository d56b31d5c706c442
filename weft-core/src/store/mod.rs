//! The Store
//!
//! The store is the central coordinator that connects state cells, computed
//! cells, and commands. It owns the cell state table, evaluates cells
//! lazily or eagerly depending on whether they are observed, and propagates
//! writes through the mounted subgraph.
//!
//! # How It Works
//!
//! 1. `get` delegates to the evaluation engine, which consults the cell
//!    state table and decides whether a cached value may be reused.
//!
//! 2. `set` and `dispatch` run the mutation engine: store the new value,
//!    bump the epoch, invalidate the mounted dependents (push), re-evaluate
//!    them in dependency order (pull), then notify listeners exactly once.
//!
//! 3. `subscribe` mounts the target cells so they are kept eagerly fresh
//!    while observed; unsubscribing tears the mounts down again.
//!
//! 4. An optional interceptor wraps each internal operation for
//!    diagnostics; it can observe and re-dispatch but never defer.
//!
//! Cloning a `Store` is cheap and yields another handle to the same state.

mod eval;
mod mount;
mod propagate;
mod record;

pub use eval::Tracker;
pub use mount::{SubscribeOptions, Subscription};
pub use propagate::MutationCtx;

use std::sync::Arc;

use parking_lot::RwLock;

use crate::cell::{CellId, CellKind, CellMeta, CellRef, Observable, Readable};
use crate::error::StoreError;
use crate::interceptor::{Continuation, Interceptor};

use self::eval::downcast_value;
use self::record::StoreState;

/// Hooks that wrap an operation and must re-dispatch it synchronously.
#[derive(Clone, Copy)]
pub(crate) enum WrappedHook {
    Get,
    Computed,
    Set,
    Notify,
}

/// Configuration for a [`Store`].
#[derive(Default)]
pub struct StoreOptions {
    /// Observer wrapped around the store's internal operations.
    pub interceptor: Option<Arc<dyn Interceptor>>,
}

pub(crate) struct StoreShared {
    pub(crate) state: RwLock<StoreState>,
    pub(crate) interceptor: Option<Arc<dyn Interceptor>>,
}

/// The central coordinator for a graph of cells.
pub struct Store {
    pub(crate) shared: Arc<StoreShared>,
}

impl Store {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::with_options(StoreOptions::default())
    }

    /// Create a store with explicit options.
    pub fn with_options(options: StoreOptions) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                state: RwLock::new(StoreState::new()),
                interceptor: options.interceptor,
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<StoreShared>) -> Self {
        Self { shared }
    }

    /// Read a cell's current value.
    ///
    /// For a computed cell this may run its read function; for an async
    /// computed cell the returned value is the shared future, which the
    /// caller may await.
    pub fn get<T, C>(&self, cell: &C) -> T
    where
        T: Clone + Send + Sync + 'static,
        C: Readable<T>,
    {
        let meta = cell.core().meta();
        self.hook_wrapped(WrappedHook::Get, &meta, || {
            downcast_value(self.read_core(cell.core()))
        })
    }

    // -- interceptor plumbing -------------------------------------------

    pub(crate) fn hook_wrapped<R>(
        &self,
        which: WrappedHook,
        meta: &CellMeta,
        op: impl FnOnce() -> R,
    ) -> R {
        let Some(interceptor) = self.shared.interceptor.as_ref() else {
            return op();
        };
        let mut result = None;
        let mut op = Some(op);
        {
            let mut run = || {
                if let Some(op) = op.take() {
                    result = Some(op());
                }
            };
            let mut continuation = Continuation::new(&mut run);
            match which {
                WrappedHook::Get => interceptor.get(meta, &mut continuation),
                WrappedHook::Computed => interceptor.computed(meta, &mut continuation),
                WrappedHook::Set => interceptor.set(meta, &mut continuation),
                WrappedHook::Notify => interceptor.notify(meta, &mut continuation),
            }
            continuation.finish();
        }
        result.expect("continuation ran exactly once")
    }

    pub(crate) fn hook_sub(&self, meta: &CellMeta) {
        if let Some(interceptor) = self.shared.interceptor.as_ref() {
            interceptor.sub(meta);
        }
    }

    pub(crate) fn hook_unsub(&self, meta: &CellMeta) {
        if let Some(interceptor) = self.shared.interceptor.as_ref() {
            interceptor.unsub(meta);
        }
    }

    pub(crate) fn hook_mount(&self, meta: &CellMeta) {
        if let Some(interceptor) = self.shared.interceptor.as_ref() {
            interceptor.mount(meta);
        }
    }

    pub(crate) fn hook_unmount(&self, meta: &CellMeta) {
        if let Some(interceptor) = self.shared.interceptor.as_ref() {
            interceptor.unmount(meta);
        }
    }

    // -- diagnostic surface ---------------------------------------------

    /// The cells this cell read during its last committed evaluation, in
    /// read order.
    pub fn dependencies(&self, cell: &dyn Observable) -> Vec<CellId> {
        let state = self.shared.state.read();
        state
            .cells
            .get(&cell.core().id)
            .map(|rec| rec.deps.keys().copied().collect())
            .unwrap_or_default()
    }

    /// The mounted cells that read this cell.
    pub fn dependents(&self, cell: &dyn Observable) -> Vec<CellId> {
        let state = self.shared.state.read();
        state
            .cells
            .get(&cell.core().id)
            .and_then(|rec| rec.mount.as_ref())
            .map(|mount| mount.read_dependents.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether the cell is currently observed.
    pub fn is_mounted(&self, cell: &dyn Observable) -> bool {
        let state = self.shared.state.read();
        state
            .cells
            .get(&cell.core().id)
            .map(|rec| rec.mount.is_some())
            .unwrap_or(false)
    }

    /// Number of direct listeners attached to the cell.
    pub fn listener_count(&self, cell: &dyn Observable) -> usize {
        let state = self.shared.state.read();
        state
            .cells
            .get(&cell.core().id)
            .and_then(|rec| rec.mount.as_ref())
            .map(|mount| mount.listeners.len())
            .unwrap_or(0)
    }

    /// The cell's current epoch, if it has ever been materialized.
    pub fn epoch(&self, cell: &dyn Observable) -> Option<u64> {
        let state = self.shared.state.read();
        state.cells.get(&cell.core().id).map(|rec| rec.epoch)
    }

    /// Snapshot a single cell by id.
    pub fn inspect(&self, id: CellId) -> Result<CellSnapshot, StoreError> {
        let state = self.shared.state.read();
        let rec = state.cells.get(&id).ok_or(StoreError::UnknownCell(id))?;
        Ok(snapshot_record(id, rec))
    }

    /// Snapshot the whole cell state table, ordered by cell id.
    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.shared.state.read();
        let mut cells: Vec<CellSnapshot> = state
            .cells
            .iter()
            .map(|(id, rec)| snapshot_record(*id, rec))
            .collect();
        cells.sort_by_key(|cell| cell.id);
        StoreSnapshot { cells }
    }

    /// Reclaim records of cells that are neither externally referenced nor
    /// mounted. Returns how many records were removed.
    pub fn sweep(&self) -> usize {
        let mut state = self.shared.state.write();
        let before = state.cells.len();
        state
            .cells
            .retain(|_, rec| rec.mount.is_some() || rec.handle.strong_count() > 0);
        let reclaimed = before - state.cells.len();
        if reclaimed > 0 {
            tracing::debug!(reclaimed, "swept unreachable cell records");
        }
        reclaimed
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Store {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.read();
        f.debug_struct("Store")
            .field("cells", &state.cells.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

fn snapshot_record(id: CellId, rec: &record::CellRecord) -> CellSnapshot {
    let (mounted, listeners, dependents) = match rec.mount.as_ref() {
        Some(mount) => (
            true,
            mount.listeners.len(),
            mount.read_dependents.iter().copied().collect(),
        ),
        None => (false, 0, Vec::new()),
    };
    let (kind, label) = match rec.handle.upgrade() {
        Some(core) => (Some(core.kind), core.label.as_deref().map(String::from)),
        None => (None, None),
    };
    CellSnapshot {
        id,
        kind,
        label,
        epoch: rec.epoch,
        mounted,
        listeners,
        dependencies: rec.deps.keys().copied().collect(),
        dependents,
    }
}

/// Read-only diagnostic view of one cell record.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CellSnapshot {
    pub id: CellId,
    /// `None` when the cell handle has been dropped and only the record
    /// remains.
    pub kind: Option<CellKind>,
    pub label: Option<String>,
    pub epoch: u64,
    pub mounted: bool,
    pub listeners: usize,
    pub dependencies: Vec<CellId>,
    pub dependents: Vec<CellId>,
}

/// Read-only diagnostic view of the whole store.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StoreSnapshot {
    pub cells: Vec<CellSnapshot>,
}
