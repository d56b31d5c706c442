//! Cell State Table
//!
//! The store's runtime state: one record per cell that has been read,
//! written, or mounted. Records hold only weak references to cell cores, so
//! a cell that is no longer held by external code and is not mounted can be
//! reclaimed; its absence from the table is equivalent to "never evaluated".
//! Mount records hold the one strong reference the store ever keeps, so an
//! observed cell can never disappear out from under its subscribers.
//!
//! Graph edges are id pairs into this table, never owning pointers in both
//! directions: mount and unmount are index-set mutation, not pointer-graph
//! surgery.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;

use crate::cell::{CellCore, CellId, CellMeta, ErasedValue, ListenerId};

/// Dependencies recorded by an in-flight evaluation before it commits.
///
/// Only the frame whose generation matches the record's current generation
/// is live; a superseded evaluation's tracker finds a mismatch and commits
/// nothing.
pub(crate) struct TrackingFrame {
    pub(crate) generation: u64,
    pub(crate) deps: IndexMap<CellId, u64>,
}

/// A listener installed by a subscription.
pub(crate) struct ListenerEntry {
    pub(crate) id: ListenerId,
    pub(crate) callback: Arc<dyn Fn() + Send + Sync>,
    pub(crate) signal: Option<CancellationToken>,
}

/// Present only while a cell is observed: directly subscribed, or read by
/// another mounted computed cell.
pub(crate) struct MountRecord {
    /// Strong reference keeping the cell's behavior alive while observed.
    pub(crate) core: Arc<CellCore>,
    /// Direct listeners from external subscriptions.
    pub(crate) listeners: SmallVec<[ListenerEntry; 2]>,
    /// Mounted cells that read this cell.
    pub(crate) read_dependents: IndexSet<CellId>,
}

impl MountRecord {
    pub(crate) fn new(core: Arc<CellCore>) -> Self {
        Self {
            core,
            listeners: SmallVec::new(),
            read_dependents: IndexSet::new(),
        }
    }

    /// A mount record may be torn down exactly when both sets are empty.
    pub(crate) fn is_idle(&self) -> bool {
        self.listeners.is_empty() && self.read_dependents.is_empty()
    }
}

/// Runtime record for a single cell.
pub(crate) struct CellRecord {
    /// Liveness probe for reclamation; never used to keep the cell alive.
    pub(crate) handle: Weak<CellCore>,
    /// Current value. `None` means never materialized.
    pub(crate) value: Option<ErasedValue>,
    /// Monotonically increasing version counter. An unchanged epoch is
    /// sufficient proof the value has not changed since last observed.
    pub(crate) epoch: u64,
    /// Each dependency read by the last committed evaluation, at the epoch
    /// it had at that time. Ordered by first read.
    pub(crate) deps: IndexMap<CellId, u64>,
    /// Present while the cell is observed.
    pub(crate) mount: Option<MountRecord>,
    /// Set by push-phase invalidation and by aborted evaluations; forces
    /// the next read to recompute regardless of epoch matches.
    pub(crate) dirty: bool,
    /// Bumped at the start of every evaluation of this cell.
    pub(crate) generation: u64,
    /// Cancellation token of the most recent in-flight evaluation.
    pub(crate) cancel: Option<CancellationToken>,
    /// Dependency map under construction for the current evaluation.
    pub(crate) tracking: Option<TrackingFrame>,
}

impl CellRecord {
    pub(crate) fn new(handle: Weak<CellCore>) -> Self {
        Self {
            handle,
            value: None,
            epoch: 0,
            deps: IndexMap::new(),
            mount: None,
            dirty: false,
            generation: 0,
            cancel: None,
            tracking: None,
        }
    }
}

/// A listener queued for notification at the end of the outermost write.
pub(crate) struct PendingNotify {
    pub(crate) meta: CellMeta,
    pub(crate) callback: Arc<dyn Fn() + Send + Sync>,
    pub(crate) signal: Option<CancellationToken>,
}

/// Everything behind the store's lock.
pub(crate) struct StoreState {
    pub(crate) cells: HashMap<CellId, CellRecord>,
    /// Depth of nested mutation contexts; listeners flush at zero.
    pub(crate) write_depth: usize,
    /// Listeners collected during propagation, deduplicated by listener id.
    pub(crate) pending: IndexMap<ListenerId, PendingNotify>,
    /// True while the pending set is being drained; writes made by
    /// listeners queue behind the current pass instead of flushing inline.
    pub(crate) notifying: bool,
}

impl StoreState {
    pub(crate) fn new() -> Self {
        Self {
            cells: HashMap::new(),
            write_depth: 0,
            pending: IndexMap::new(),
            notifying: false,
        }
    }

    /// Get or create the record for a cell.
    pub(crate) fn ensure_record(&mut self, core: &Arc<CellCore>) -> &mut CellRecord {
        self.cells
            .entry(core.id)
            .or_insert_with(|| CellRecord::new(Arc::downgrade(core)))
    }

    /// Queue every listener of `cell` for notification, keeping the first
    /// occurrence of each listener id.
    pub(crate) fn queue_listeners(&mut self, cell: CellId) {
        let Some(mount) = self.cells.get(&cell).and_then(|rec| rec.mount.as_ref()) else {
            return;
        };
        let meta = mount.core.meta();
        for entry in &mount.listeners {
            self.pending.entry(entry.id).or_insert_with(|| PendingNotify {
                meta: meta.clone(),
                callback: Arc::clone(&entry.callback),
                signal: entry.signal.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellBehavior, CellKind};

    fn test_core() -> Arc<CellCore> {
        CellCore::new(
            CellKind::State,
            None,
            CellBehavior::State {
                init: Box::new(|| Arc::new(0i32) as ErasedValue),
            },
        )
    }

    #[test]
    fn ensure_record_is_idempotent() {
        let mut state = StoreState::new();
        let core = test_core();

        state.ensure_record(&core).epoch = 7;
        assert_eq!(state.ensure_record(&core).epoch, 7);
        assert_eq!(state.cells.len(), 1);
    }

    #[test]
    fn record_starts_unmaterialized() {
        let core = test_core();
        let rec = CellRecord::new(Arc::downgrade(&core));

        assert!(rec.value.is_none());
        assert_eq!(rec.epoch, 0);
        assert!(rec.mount.is_none());
        assert!(!rec.dirty);
    }

    #[test]
    fn mount_record_idle_only_when_both_sets_empty() {
        let core = test_core();
        let mut mount = MountRecord::new(core.clone());
        assert!(mount.is_idle());

        mount.read_dependents.insert(CellId::from(99));
        assert!(!mount.is_idle());

        mount.read_dependents.shift_remove(&CellId::from(99));
        mount.listeners.push(ListenerEntry {
            id: ListenerId::next(),
            callback: Arc::new(|| {}),
            signal: None,
        });
        assert!(!mount.is_idle());
    }

    #[test]
    fn queue_listeners_deduplicates_by_id() {
        let mut state = StoreState::new();
        let core = test_core();

        let id = ListenerId::next();
        let mut mount = MountRecord::new(core.clone());
        mount.listeners.push(ListenerEntry {
            id,
            callback: Arc::new(|| {}),
            signal: None,
        });
        state.ensure_record(&core).mount = Some(mount);

        state.queue_listeners(core.id);
        state.queue_listeners(core.id);
        assert_eq!(state.pending.len(), 1);
    }
}
