//! Evaluation Engine
//!
//! Computes cell values, tracks dependencies, and decides when a cached
//! value may be reused.
//!
//! # How Evaluation Works
//!
//! 1. Reading a state cell materializes its record from the captured
//!    initial value, then returns the stored value.
//!
//! 2. Reading a computed cell first checks cache validity: a mounted,
//!    non-dirty cell is always current (propagation keeps it fresh); an
//!    unmounted cell is current if every recorded dependency epoch still
//!    matches after the dependencies themselves have been refreshed.
//!
//! 3. Otherwise the cell re-evaluates: a fresh generation supersedes (and
//!    cancels) any in-flight evaluation, the read function runs against a
//!    [`Tracker`], and the dependencies it reads are collected into a fresh
//!    map. On commit the new map replaces the old one; dependencies that
//!    disappeared have their read-dependent edge removed and are unmounted
//!    if nothing else observes them.
//!
//! # Panic safety
//!
//! If a read function panics, the panic propagates to the caller and an
//! abort guard marks the record stale without committing any partial value
//! or dependency state. The previous cached value and dependency map remain
//! intact.
//!
//! # Overlapping evaluations
//!
//! An async read function may keep calling [`Tracker::get`] after
//! suspension points. Every commit path compares the tracker's generation
//! against the record's current generation, so a superseded evaluation can
//! resolve values but can no longer mutate dependency bookkeeping or mount
//! edges.

use std::cell::RefCell;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use crate::cell::{CellBehavior, CellCore, CellId, CellRef, ErasedValue, EvalFn, Readable};
use crate::error::StoreError;

use super::record::TrackingFrame;
use super::{Store, WrappedHook};

thread_local! {
    /// Cells currently being evaluated on this thread, keyed by store
    /// address so unrelated stores never collide.
    static EVAL_STACK: RefCell<Vec<(usize, CellId)>> = RefCell::new(Vec::new());
}

/// Guard that pops the evaluation stack when dropped.
///
/// This keeps the stack consistent even if the read function panics.
struct EvalStackGuard {
    key: (usize, CellId),
}

impl EvalStackGuard {
    fn push(store: usize, cell: CellId) -> Self {
        let key = (store, cell);
        EVAL_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.contains(&key) {
                panic!("{}", StoreError::DependencyCycle(cell));
            }
            stack.push(key);
        });
        Self { key }
    }
}

impl Drop for EvalStackGuard {
    fn drop(&mut self) {
        EVAL_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert_eq!(popped, Some(self.key), "evaluation stack mismatch");
        });
    }
}

/// Marks the record stale if the evaluation unwinds before committing.
struct AbortGuard<'a> {
    store: &'a Store,
    cell: CellId,
    generation: u64,
    armed: bool,
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.store.shared.state.write();
        if let Some(rec) = state.cells.get_mut(&self.cell) {
            if rec.generation == self.generation {
                rec.tracking = None;
                rec.dirty = true;
                tracing::warn!(cell = self.cell.raw(), "evaluation aborted, cell marked stale");
            }
        }
    }
}

/// The tracking accessor passed to computed read functions.
///
/// Each `get` resolves the dependency through the store and records it into
/// the dependency map of the evaluation this tracker belongs to — as long
/// as that evaluation is still the current one for its cell. Async read
/// functions receive an owned tracker and may keep using it across
/// suspension points; once superseded, its reads still resolve but register
/// nothing.
pub struct Tracker {
    pub(crate) shared: std::sync::Weak<super::StoreShared>,
    pub(crate) cell: CellId,
    pub(crate) generation: u64,
    pub(crate) token: CancellationToken,
}

impl Tracker {
    /// Read a dependency and record it.
    pub fn get<T, C>(&self, cell: &C) -> T
    where
        T: Clone + Send + Sync + 'static,
        C: Readable<T>,
    {
        let store = self.store();
        let value = store.read_core(cell.core());
        store.record_dependency(self, cell.core());
        downcast_value(value)
    }

    /// Read a cell without recording a dependency on it.
    pub fn peek<T, C>(&self, cell: &C) -> T
    where
        T: Clone + Send + Sync + 'static,
        C: Readable<T>,
    {
        downcast_value(self.store().read_core(cell.core()))
    }

    /// The cancellation token for this evaluation.
    ///
    /// Cancelled when a newer evaluation of the same cell starts. Async
    /// read functions should observe it and stop early; cancellation is
    /// cooperative, never forced.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether this evaluation has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether this evaluation is still the current one for its cell.
    pub fn is_current(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let state = shared.state.read();
        state
            .cells
            .get(&self.cell)
            .map(|rec| rec.generation == self.generation)
            .unwrap_or(false)
    }

    fn store(&self) -> Store {
        let shared = self
            .shared
            .upgrade()
            .expect("store dropped while an evaluation was still running");
        Store::from_shared(shared)
    }
}

impl Clone for Tracker {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            cell: self.cell,
            generation: self.generation,
            token: self.token.clone(),
        }
    }
}

/// Clone a `T` out of an erased cell value.
pub(crate) fn downcast_value<T>(value: ErasedValue) -> T
where
    T: Clone + Send + Sync + 'static,
{
    value
        .downcast::<T>()
        .map(|v| (*v).clone())
        .unwrap_or_else(|_| panic!("cell value held an unexpected type"))
}

impl Store {
    /// Resolve a cell to its erased value, creating records lazily.
    pub(crate) fn read_core(&self, core: &Arc<CellCore>) -> ErasedValue {
        match &core.behavior {
            CellBehavior::State { init } => {
                let mut state = self.shared.state.write();
                let rec = state.ensure_record(core);
                if rec.value.is_none() {
                    rec.value = Some(init());
                    rec.epoch = 1;
                    tracing::trace!(cell = core.id.raw(), "state cell materialized");
                }
                rec.value.clone().expect("state value just materialized")
            }
            CellBehavior::Computed { eval } => self.read_computed(core, eval),
            CellBehavior::Command => unreachable!("commands hold no readable value"),
        }
    }

    fn read_computed(&self, core: &Arc<CellCore>, eval: &EvalFn) -> ErasedValue {
        let _guard = EvalStackGuard::push(self.addr(), core.id);
        if let Some(value) = self.cached_value(core) {
            return value;
        }
        self.evaluate(core, eval)
    }

    /// Return the cached value if it is still valid per the invariant:
    /// mounted and not dirty, or every recorded dependency epoch unchanged.
    fn cached_value(&self, core: &Arc<CellCore>) -> Option<ErasedValue> {
        let deps: Vec<(CellId, u64)> = {
            let state = self.shared.state.read();
            let rec = state.cells.get(&core.id)?;
            let value = rec.value.as_ref()?;
            if rec.dirty {
                return None;
            }
            if rec.mount.is_some() {
                return Some(Arc::clone(value));
            }
            rec.deps.iter().map(|(id, epoch)| (*id, *epoch)).collect()
        };

        // Refresh each dependency first: a stale computed dependency only
        // bumps its epoch when re-evaluated.
        for (dep, recorded) in &deps {
            let dep_core = {
                let state = self.shared.state.read();
                state.cells.get(dep).and_then(|rec| rec.handle.upgrade())
            };
            if let Some(dep_core) = dep_core {
                if matches!(dep_core.behavior, CellBehavior::Computed { .. }) {
                    let _ = self.read_core(&dep_core);
                }
            }
            let current = {
                let state = self.shared.state.read();
                state.cells.get(dep).map(|rec| rec.epoch)
            };
            if current != Some(*recorded) {
                return None;
            }
        }

        // Re-check: refreshing dependencies ran arbitrary read functions.
        let state = self.shared.state.read();
        let rec = state.cells.get(&core.id)?;
        if rec.dirty {
            return None;
        }
        rec.value.clone()
    }

    /// Run the read function and commit its result.
    fn evaluate(&self, core: &Arc<CellCore>, eval: &EvalFn) -> ErasedValue {
        let token = CancellationToken::new();
        let generation = {
            let mut state = self.shared.state.write();
            let rec = state.ensure_record(core);
            rec.generation += 1;
            if let Some(previous) = rec.cancel.take() {
                previous.cancel();
            }
            rec.cancel = Some(token.clone());
            rec.tracking = Some(TrackingFrame {
                generation: rec.generation,
                deps: IndexMap::new(),
            });
            rec.generation
        };

        let tracker = Tracker {
            shared: Arc::downgrade(&self.shared),
            cell: core.id,
            generation,
            token,
        };

        tracing::trace!(cell = core.id.raw(), generation, "evaluating computed cell");

        let mut abort = AbortGuard {
            store: self,
            cell: core.id,
            generation,
            armed: true,
        };
        let meta = core.meta();
        let value = self.hook_wrapped(WrappedHook::Computed, &meta, || eval(&tracker));
        abort.armed = false;

        self.commit_evaluation(core, generation, value)
    }

    fn commit_evaluation(
        &self,
        core: &Arc<CellCore>,
        generation: u64,
        value: ErasedValue,
    ) -> ErasedValue {
        let removed: Vec<CellId> = {
            let mut state = self.shared.state.write();
            let removed;
            {
                let Some(rec) = state.cells.get_mut(&core.id) else {
                    return value;
                };
                if rec.generation != generation {
                    // Superseded mid-evaluation; the caller still gets the
                    // value it computed, but nothing is committed.
                    return value;
                }
                let fresh = match rec.tracking.take() {
                    Some(frame) if frame.generation == generation => frame.deps,
                    _ => IndexMap::new(),
                };
                let old = std::mem::replace(&mut rec.deps, fresh);
                rec.value = Some(Arc::clone(&value));
                rec.epoch += 1;
                rec.dirty = false;
                removed = old
                    .keys()
                    .filter(|dep| !rec.deps.contains_key(*dep))
                    .copied()
                    .collect::<Vec<_>>();
            }
            for dep in &removed {
                if let Some(mount) = state.cells.get_mut(dep).and_then(|rec| rec.mount.as_mut()) {
                    mount.read_dependents.shift_remove(&core.id);
                }
            }
            removed
        };

        for dep in removed {
            self.try_unmount_cell(dep);
        }
        value
    }

    /// Record `dep` into the dependency map of the evaluation `tracker`
    /// belongs to, and keep mount edges in sync when the reading cell is
    /// mounted. No-op for superseded evaluations.
    pub(crate) fn record_dependency(&self, tracker: &Tracker, dep: &Arc<CellCore>) {
        let mounted = {
            let mut state = self.shared.state.write();
            let dep_epoch = match state.cells.get(&dep.id) {
                Some(rec) => rec.epoch,
                None => return,
            };
            let Some(rec) = state.cells.get_mut(&tracker.cell) else {
                return;
            };
            if rec.generation != tracker.generation {
                tracing::trace!(
                    cell = tracker.cell.raw(),
                    generation = tracker.generation,
                    "superseded evaluation, dependency not recorded"
                );
                return;
            }
            match rec.tracking.as_mut() {
                Some(frame) if frame.generation == tracker.generation => {
                    frame.deps.insert(dep.id, dep_epoch);
                }
                // Reads after an async commit land in the live map.
                _ => {
                    rec.deps.insert(dep.id, dep_epoch);
                }
            }
            rec.mount.is_some()
        };

        if mounted {
            self.mount_cell(dep);
            let mut state = self.shared.state.write();
            if let Some(mount) = state.cells.get_mut(&dep.id).and_then(|rec| rec.mount.as_mut()) {
                mount.read_dependents.insert(tracker.cell);
            }
        }
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::cell::{computed, state};
    use crate::store::Store;

    #[test]
    fn computed_runs_on_first_access_only() {
        let store = Store::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let base = state(2);
        let doubled = {
            let base = base.clone();
            let calls = calls.clone();
            computed(move |get| {
                calls.fetch_add(1, Ordering::SeqCst);
                get.get(&base) * 2
            })
        };

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.get(&doubled), 4);
        assert_eq!(store.get(&doubled), 4);
        assert_eq!(store.get(&doubled), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unmounted_computed_recomputes_only_when_epochs_move() {
        let store = Store::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let base = state(1);
        let derived = {
            let base = base.clone();
            let calls = calls.clone();
            computed(move |get| {
                calls.fetch_add(1, Ordering::SeqCst);
                get.get(&base) + 10
            })
        };

        assert_eq!(store.get(&derived), 11);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // No write in between: cache stays valid.
        assert_eq!(store.get(&derived), 11);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        store.set(&base, 5);
        assert_eq!(store.get(&derived), 15);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn chained_computed_refreshes_through_intermediates() {
        let store = Store::new();

        let base = state(1);
        let doubled = {
            let base = base.clone();
            computed(move |get| get.get(&base) * 2)
        };
        let plus_one = {
            let doubled = doubled.clone();
            computed(move |get| get.get(&doubled) + 1)
        };

        assert_eq!(store.get(&plus_one), 3);
        store.set(&base, 10);
        assert_eq!(store.get(&plus_one), 21);
    }

    #[test]
    fn peek_does_not_create_a_dependency() {
        let store = Store::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let tracked = state(1);
        let peeked = state(100);
        let derived = {
            let tracked = tracked.clone();
            let peeked = peeked.clone();
            let calls = calls.clone();
            computed(move |get| {
                calls.fetch_add(1, Ordering::SeqCst);
                get.get(&tracked) + get.peek(&peeked)
            })
        };

        assert_eq!(store.get(&derived), 101);
        assert_eq!(store.dependencies(&derived), vec![tracked.id()]);

        // A write to the peeked cell does not invalidate the cache.
        store.set(&peeked, 200);
        assert_eq!(store.get(&derived), 101);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        store.set(&tracked, 2);
        assert_eq!(store.get(&derived), 202);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropped_dependencies_are_diffed_away() {
        let store = Store::new();

        let flag = state(true);
        let left = state(10);
        let right = state(20);
        let chosen = {
            let flag = flag.clone();
            let left = left.clone();
            let right = right.clone();
            computed(move |get| {
                if get.get(&flag) {
                    get.get(&left)
                } else {
                    get.get(&right)
                }
            })
        };

        assert_eq!(store.get(&chosen), 10);
        assert_eq!(store.dependencies(&chosen), vec![flag.id(), left.id()]);

        store.set(&flag, false);
        assert_eq!(store.get(&chosen), 20);
        assert_eq!(store.dependencies(&chosen), vec![flag.id(), right.id()]);
    }

    #[test]
    #[should_panic(expected = "dependency cycle")]
    fn self_referential_computed_panics() {
        let store = Store::new();

        struct Slot(std::sync::Mutex<Option<crate::cell::Computed<i32>>>);
        let slot = Arc::new(Slot(std::sync::Mutex::new(None)));

        let cell = {
            let slot = slot.clone();
            computed(move |get| {
                let cell = slot.0.lock().unwrap().clone().unwrap();
                get.get(&cell)
            })
        };
        *slot.0.lock().unwrap() = Some(cell.clone());

        let _ = store.get(&cell);
    }

    #[test]
    fn panicking_read_function_leaves_previous_value() {
        let store = Store::new();

        let base = state(1);
        let explode = state(false);
        let derived = {
            let base = base.clone();
            let explode = explode.clone();
            computed(move |get| {
                if get.get(&explode) {
                    panic!("boom");
                }
                get.get(&base)
            })
        };

        assert_eq!(store.get(&derived), 1);

        store.set(&explode, true);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            store.get(&derived)
        }));
        assert!(result.is_err());

        // Recovering the input recovers the cell.
        store.set(&explode, false);
        assert_eq!(store.get(&derived), 1);
    }
}
