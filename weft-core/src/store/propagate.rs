//! Mutation/Propagation Engine
//!
//! Executes writes and pushes the change through the mounted subgraph in
//! two passes:
//!
//! 1. (push) Walk the mounted read-dependent graph breadth-first from the
//!    changed cell, marking every reached computed cell dirty without
//!    evaluating it.
//!
//! 2. (pull) Re-evaluate the reached cells in topological order
//!    (dependencies before dependents), collecting every listener attached
//!    to the changed cell or to a re-evaluated cell.
//!
//! The push-then-pull order is what keeps diamond-shaped graphs from
//! evaluating a shared ancestor more than once and from notifying listeners
//! off a not-yet-settled intermediate value.
//!
//! Writes always bump the epoch and always notify, even when the new value
//! equals the old one; there is no equality short-circuit anywhere in the
//! engine.
//!
//! Nested writes (a command calling `set`, or `set` from within another
//! write) share the outermost mutation context: listeners collected along
//! the way fire once, after the outermost write completes. Writes made by
//! listeners themselves are independent mutation contexts, drained after
//! the current notification pass.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use indexmap::IndexSet;

use crate::cell::{
    CellBehavior, CellCore, CellId, CellRef, Command, ErasedValue, Observable, Readable, State,
};

use super::eval::downcast_value;
use super::record::StoreState;
use super::{Store, WrappedHook};

/// Scoped mutation visitor handed to command write functions.
///
/// Reads through it are untracked; writes through it join the surrounding
/// mutation context, so a command that sets several cells still notifies
/// each listener only once.
pub struct MutationCtx<'a> {
    store: &'a Store,
}

impl MutationCtx<'_> {
    /// Read a cell without registering any dependency.
    pub fn get<T, C>(&self, cell: &C) -> T
    where
        T: Clone + Send + Sync + 'static,
        C: Readable<T>,
    {
        downcast_value(self.store.read_core(cell.core()))
    }

    /// Write a state cell.
    pub fn set<T>(&self, cell: &State<T>, value: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        self.store.set(cell, value);
    }

    /// Write a state cell by applying an updater to its current value.
    pub fn update<T, F>(&self, cell: &State<T>, f: F)
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> T,
    {
        self.store.update(cell, f);
    }

    /// Dispatch another command within the same mutation context.
    pub fn dispatch<A, R>(&self, command: &Command<A, R>, args: A) -> R
    where
        A: 'static,
        R: 'static,
    {
        self.store.dispatch(command, args)
    }
}

/// Keeps the mutation depth balanced even when a write function panics.
///
/// On the success path the scope is finished explicitly, which flushes
/// pending listeners once the outermost write completes. During a panic the
/// pending set of the aborted write is discarded instead of half-notified.
struct WriteScope<'a> {
    store: &'a Store,
}

impl<'a> WriteScope<'a> {
    fn enter(store: &'a Store) -> Self {
        store.shared.state.write().write_depth += 1;
        Self { store }
    }
}

impl Drop for WriteScope<'_> {
    fn drop(&mut self) {
        let at_outermost = {
            let mut state = self.store.shared.state.write();
            state.write_depth -= 1;
            state.write_depth == 0 && !state.notifying
        };
        if !at_outermost {
            return;
        }
        if std::thread::panicking() {
            self.store.shared.state.write().pending.clear();
            return;
        }
        self.store.flush_pending();
    }
}

impl Store {
    /// Write a new value into a state cell and propagate the change.
    pub fn set<T>(&self, cell: &State<T>, value: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        let meta = cell.meta();
        self.hook_wrapped(WrappedHook::Set, &meta, || {
            let _scope = WriteScope::enter(self);
            self.write_state(cell.core(), Arc::new(value));
        });
    }

    /// Write a state cell by applying an updater to its current value.
    pub fn update<T, F>(&self, cell: &State<T>, f: F)
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> T,
    {
        let meta = cell.meta();
        self.hook_wrapped(WrappedHook::Set, &meta, || {
            let _scope = WriteScope::enter(self);
            let current: T = downcast_value(self.read_core(cell.core()));
            self.write_state(cell.core(), Arc::new(f(&current)));
        });
    }

    /// Run a command's write function and return its result.
    pub fn dispatch<A, R>(&self, command: &Command<A, R>, args: A) -> R
    where
        A: 'static,
        R: 'static,
    {
        let meta = command.meta();
        let write = Arc::clone(&command.write);
        self.hook_wrapped(WrappedHook::Set, &meta, move || {
            let _scope = WriteScope::enter(self);
            write(&MutationCtx { store: self }, args)
        })
    }

    /// Store the value, bump the epoch unconditionally, and propagate.
    fn write_state(&self, core: &Arc<CellCore>, value: ErasedValue) {
        debug_assert!(
            matches!(core.behavior, CellBehavior::State { .. }),
            "only state cells are written directly"
        );
        {
            let mut state = self.shared.state.write();
            let rec = state.ensure_record(core);
            rec.value = Some(value);
            rec.epoch += 1;
            tracing::trace!(cell = core.id.raw(), epoch = rec.epoch, "state cell written");
        }
        self.propagate_from(core.id);
    }

    /// Two-pass propagation from a changed cell through the mounted
    /// subgraph, queueing listeners for the flush at the end of the
    /// outermost write.
    fn propagate_from(&self, origin: CellId) {
        let order: Vec<CellId> = {
            let mut state = self.shared.state.write();

            // Pass 1 (push): mark the reachable mounted dependents dirty
            // without evaluating anything.
            let mut reached: IndexSet<CellId> = IndexSet::new();
            let mut queue: VecDeque<CellId> = state
                .cells
                .get(&origin)
                .and_then(|rec| rec.mount.as_ref())
                .map(|mount| mount.read_dependents.iter().copied().collect())
                .unwrap_or_default();

            while let Some(id) = queue.pop_front() {
                if !reached.insert(id) {
                    continue;
                }
                if let Some(rec) = state.cells.get_mut(&id) {
                    rec.dirty = true;
                    if let Some(mount) = rec.mount.as_ref() {
                        for dependent in &mount.read_dependents {
                            queue.push_back(*dependent);
                        }
                    }
                }
            }

            state.queue_listeners(origin);
            topological_order(&state, &reached)
        };

        if !order.is_empty() {
            tracing::trace!(origin = origin.raw(), cells = order.len(), "propagating change");
        }

        // Pass 2 (pull): re-evaluate in dependency order, collecting
        // listeners of every re-evaluated cell.
        for id in order {
            let core = {
                let state = self.shared.state.read();
                state
                    .cells
                    .get(&id)
                    .and_then(|rec| rec.mount.as_ref())
                    .map(|mount| Arc::clone(&mount.core))
            };
            let Some(core) = core else { continue };

            let dirty = {
                let state = self.shared.state.read();
                state.cells.get(&id).map(|rec| rec.dirty).unwrap_or(false)
            };
            if dirty {
                let _ = self.read_core(&core);
            }
            self.shared.state.write().queue_listeners(id);
        }
    }

    /// Drain and invoke pending listeners. Loops because listeners may
    /// trigger further writes, whose own notifications run as later passes.
    pub(crate) fn flush_pending(&self) {
        loop {
            let batch: Vec<_> = {
                let mut state = self.shared.state.write();
                if state.write_depth > 0 || state.notifying || state.pending.is_empty() {
                    return;
                }
                state.notifying = true;
                state.pending.drain(..).collect()
            };

            // Clears the notifying flag even if a listener panics, so the
            // store keeps flushing on later writes.
            let _reset = NotifyingReset { store: self };
            for (listener, notify) in batch {
                if notify.signal.as_ref().is_some_and(|token| token.is_cancelled()) {
                    self.remove_listener_everywhere(listener);
                    continue;
                }
                self.hook_wrapped(WrappedHook::Notify, &notify.meta, || (notify.callback)());
            }
        }
    }
}

struct NotifyingReset<'a> {
    store: &'a Store,
}

impl Drop for NotifyingReset<'_> {
    fn drop(&mut self) {
        self.store.shared.state.write().notifying = false;
    }
}

/// Kahn's algorithm restricted to the reached set: dependencies come before
/// dependents, using the mounted read-dependent edges.
fn topological_order(state: &StoreState, reached: &IndexSet<CellId>) -> Vec<CellId> {
    let mut in_degree: HashMap<CellId, usize> = HashMap::with_capacity(reached.len());
    let mut queue: VecDeque<CellId> = VecDeque::new();
    let mut order = Vec::with_capacity(reached.len());

    for &id in reached {
        let degree = state
            .cells
            .get(&id)
            .map(|rec| rec.deps.keys().filter(|dep| reached.contains(*dep)).count())
            .unwrap_or(0);
        in_degree.insert(id, degree);
        if degree == 0 {
            queue.push_back(id);
        }
    }

    while let Some(id) = queue.pop_front() {
        order.push(id);
        let Some(mount) = state.cells.get(&id).and_then(|rec| rec.mount.as_ref()) else {
            continue;
        };
        for dependent in &mount.read_dependents {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::cell::{command, computed, state};
    use crate::store::Store;

    #[test]
    fn set_notifies_mounted_listener_once() {
        let store = Store::new();
        let cell = state(1);
        let hits = Arc::new(AtomicUsize::new(0));

        let _sub = {
            let hits = hits.clone();
            store.subscribe(&cell, move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        store.set(&cell, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(&cell), 2);
    }

    #[test]
    fn equal_value_writes_still_notify() {
        let store = Store::new();
        let cell = state(5);
        let hits = Arc::new(AtomicUsize::new(0));

        let _sub = {
            let hits = hits.clone();
            store.subscribe(&cell, move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        store.set(&cell, 5);
        store.set(&cell, 5);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn update_applies_the_current_value() {
        let store = Store::new();
        let cell = state(10);

        store.update(&cell, |v| v + 5);
        assert_eq!(store.get(&cell), 15);
    }

    #[test]
    fn command_notifies_once_for_multiple_sets() {
        let store = Store::new();
        let first = state(0);
        let second = state(0);
        let sum = {
            let first = first.clone();
            let second = second.clone();
            computed(move |get| get.get(&first) + get.get(&second))
        };
        let hits = Arc::new(AtomicUsize::new(0));

        let _sub = {
            let hits = hits.clone();
            store.subscribe(&sum, move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        let fill = {
            let first = first.clone();
            let second = second.clone();
            command(move |ctx, n: i32| {
                ctx.set(&first, n);
                ctx.set(&second, n * 2);
            })
        };

        store.dispatch(&fill, 7);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(&sum), 21);
    }

    #[test]
    fn command_returns_its_result() {
        let store = Store::new();
        let cell = state(1);

        let bump = {
            let cell = cell.clone();
            command(move |ctx, by: i32| {
                let next = ctx.get(&cell) + by;
                ctx.set(&cell, next);
                next
            })
        };

        assert_eq!(store.dispatch(&bump, 4), 5);
        assert_eq!(store.get(&cell), 5);
    }

    #[test]
    fn nested_command_dispatch_shares_the_outer_context() {
        let store = Store::new();
        let cell = state(0);
        let hits = Arc::new(AtomicUsize::new(0));

        let _sub = {
            let hits = hits.clone();
            store.subscribe(&cell, move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        let inner = {
            let cell = cell.clone();
            command(move |ctx, n: i32| ctx.set(&cell, n))
        };
        let outer = {
            let cell = cell.clone();
            let inner = inner.clone();
            command(move |ctx, n: i32| {
                ctx.set(&cell, n - 1);
                ctx.dispatch(&inner, n);
            })
        };

        store.dispatch(&outer, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(&cell), 3);
    }

    #[test]
    fn listener_writes_run_as_independent_contexts() {
        let store = Store::new();
        let trigger = state(0);
        let echo = state(0);
        let echo_hits = Arc::new(AtomicUsize::new(0));

        let _echo_sub = {
            let echo_hits = echo_hits.clone();
            store.subscribe(&echo, move || {
                echo_hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _trigger_sub = {
            let store = store.clone();
            let echo = echo.clone();
            store.clone().subscribe(&trigger, move || {
                store.set(&echo, 1);
            })
        };

        store.set(&trigger, 1);
        assert_eq!(echo_hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(&echo), 1);
    }

    #[test]
    fn unmounted_dependents_are_not_evaluated_eagerly() {
        let store = Store::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let base = state(1);
        let lazy = {
            let base = base.clone();
            let calls = calls.clone();
            computed(move |get| {
                calls.fetch_add(1, Ordering::SeqCst);
                get.get(&base)
            })
        };

        assert_eq!(store.get(&lazy), 1);
        store.set(&base, 2);
        store.set(&base, 3);
        // Nothing observes the computed cell, so the writes alone must not
        // have re-run it.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(&lazy), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
