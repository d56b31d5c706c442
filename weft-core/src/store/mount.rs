//! Mount/Lifecycle Manager
//!
//! Governs when a cell transitions between lazily-evaluated and
//! eagerly-kept-fresh, and when graph edges may be torn down.
//!
//! A cell is mounted while it is observed: it has at least one direct
//! listener, or at least one mounted computed cell reads it. Mounting a
//! computed cell evaluates it to discover its dependencies, then mounts
//! those recursively and registers the read-dependent edges propagation
//! walks. Unmounting is the exact inverse and happens as soon as both the
//! listener set and the read-dependent set are empty.
//!
//! Unsubscription is defensive throughout: removing a listener that is
//! already gone, or unmounting a cell that is not mounted, is a silent
//! no-op, never an error.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cell::{CellBehavior, CellCore, CellId, CellMeta, CellRef, ListenerId, Observable};

use super::record::{ListenerEntry, MountRecord};
use super::Store;

/// Options for [`Store::subscribe_with`].
#[derive(Default)]
pub struct SubscribeOptions {
    /// External cancellation token. Once cancelled, the subscription is
    /// removed exactly once; cancellation is observed at notification
    /// boundaries and on explicit unsubscribe.
    pub signal: Option<CancellationToken>,
}

/// Handle to an active subscription.
///
/// Unsubscribes when dropped; call [`Subscription::detach`] to keep the
/// listener installed for the life of the store instead. Unsubscribing is
/// idempotent — calling it on an already-removed subscription is a no-op.
pub struct Subscription {
    store: Store,
    listener: ListenerId,
    targets: Vec<CellId>,
}

impl Subscription {
    /// Remove the listener from every subscribed cell and tear down any
    /// mounts that are no longer observed.
    pub fn unsubscribe(&self) {
        self.store.remove_listener(self.listener, &self.targets);
    }

    /// Keep the listener installed permanently; the handle no longer
    /// unsubscribes on drop.
    pub fn detach(mut self) {
        self.targets.clear();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.store.remove_listener(self.listener, &self.targets);
    }
}

impl Store {
    /// Subscribe a listener to a single cell.
    ///
    /// Mounts the cell (and, transitively, everything it reads) so it is
    /// kept eagerly fresh while observed.
    pub fn subscribe<C>(&self, cell: &C, listener: impl Fn() + Send + Sync + 'static) -> Subscription
    where
        C: Observable,
    {
        self.subscribe_with(&[cell as &dyn Observable], listener, SubscribeOptions::default())
    }

    /// Subscribe one listener to several cells at once.
    ///
    /// The listener is notified at most once per write, no matter how many
    /// of the subscribed cells changed. Subscribing to an empty list is a
    /// no-op returning an inert handle.
    pub fn subscribe_all(
        &self,
        cells: &[&dyn Observable],
        listener: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_with(cells, listener, SubscribeOptions::default())
    }

    /// Subscribe with explicit options.
    pub fn subscribe_with(
        &self,
        cells: &[&dyn Observable],
        listener: impl Fn() + Send + Sync + 'static,
        options: SubscribeOptions,
    ) -> Subscription {
        let listener_id = ListenerId::next();
        let inert = Subscription {
            store: self.clone(),
            listener: listener_id,
            targets: Vec::new(),
        };
        if cells.is_empty() {
            return inert;
        }
        if options.signal.as_ref().is_some_and(|token| token.is_cancelled()) {
            return inert;
        }

        let callback: Arc<dyn Fn() + Send + Sync> = Arc::new(listener);
        let mut targets = Vec::with_capacity(cells.len());
        for cell in cells {
            let core = Arc::clone(cell.core());
            self.mount_cell(&core);
            {
                let mut state = self.shared.state.write();
                if let Some(mount) = state.cells.get_mut(&core.id).and_then(|rec| rec.mount.as_mut())
                {
                    mount.listeners.push(ListenerEntry {
                        id: listener_id,
                        callback: Arc::clone(&callback),
                        signal: options.signal.clone(),
                    });
                }
            }
            self.hook_sub(&core.meta());
            targets.push(core.id);
        }

        Subscription {
            store: self.clone(),
            listener: listener_id,
            targets,
        }
    }

    /// Remove `listener` from the given cells and try to unmount each.
    pub(crate) fn remove_listener(&self, listener: ListenerId, targets: &[CellId]) {
        for cell in targets {
            let removed: Option<CellMeta> = {
                let mut state = self.shared.state.write();
                match state.cells.get_mut(cell).and_then(|rec| rec.mount.as_mut()) {
                    Some(mount) => {
                        let before = mount.listeners.len();
                        mount.listeners.retain(|entry| entry.id != listener);
                        (mount.listeners.len() != before).then(|| mount.core.meta())
                    }
                    None => None,
                }
            };
            if let Some(meta) = removed {
                self.hook_unsub(&meta);
                self.try_unmount_cell(*cell);
            }
        }
    }

    /// Remove `listener` from every mounted cell it is attached to.
    ///
    /// Used when a subscribe-time cancellation token is found cancelled;
    /// the subscription handle is not available at that point.
    pub(crate) fn remove_listener_everywhere(&self, listener: ListenerId) {
        let attached: Vec<CellId> = {
            let state = self.shared.state.read();
            state
                .cells
                .iter()
                .filter(|(_, rec)| {
                    rec.mount
                        .as_ref()
                        .is_some_and(|mount| mount.listeners.iter().any(|entry| entry.id == listener))
                })
                .map(|(id, _)| *id)
                .collect()
        };
        self.remove_listener(listener, &attached);
    }

    /// Create the mount record for a cell, then mount everything it reads.
    ///
    /// Already-mounted cells return immediately, so re-mounting along a
    /// shared dependency path is cheap.
    pub(crate) fn mount_cell(&self, core: &Arc<CellCore>) {
        let created = {
            let mut state = self.shared.state.write();
            let rec = state.ensure_record(core);
            if rec.mount.is_some() {
                false
            } else {
                rec.mount = Some(MountRecord::new(Arc::clone(core)));
                true
            }
        };
        if !created {
            return;
        }
        tracing::debug!(cell = core.id.raw(), "cell mounted");
        self.hook_mount(&core.meta());

        if matches!(core.behavior, CellBehavior::Computed { .. }) {
            // Evaluate to discover the current dependency set. If the cache
            // is already valid this reuses it, and the edges are rebuilt
            // from the recorded map below.
            let _ = self.read_core(core);

            let deps: Vec<CellId> = {
                let state = self.shared.state.read();
                state
                    .cells
                    .get(&core.id)
                    .map(|rec| rec.deps.keys().copied().collect())
                    .unwrap_or_default()
            };
            for dep in deps {
                let dep_core = {
                    let state = self.shared.state.read();
                    state.cells.get(&dep).and_then(|rec| rec.handle.upgrade())
                };
                let Some(dep_core) = dep_core else { continue };
                self.mount_cell(&dep_core);
                let mut state = self.shared.state.write();
                if let Some(mount) = state.cells.get_mut(&dep).and_then(|rec| rec.mount.as_mut()) {
                    mount.read_dependents.insert(core.id);
                }
            }
        }
    }

    /// Tear down the mount record if nothing observes the cell any more,
    /// recursively releasing dependencies that lose their last dependent.
    pub(crate) fn try_unmount_cell(&self, cell: CellId) {
        let mut unmounted = Vec::new();
        self.unmount_walk(cell, &mut unmounted);
        for meta in unmounted {
            tracing::debug!(cell = meta.id.raw(), "cell unmounted");
            self.hook_unmount(&meta);
        }
    }

    fn unmount_walk(&self, cell: CellId, out: &mut Vec<CellMeta>) {
        let deps: Vec<CellId> = {
            let mut state = self.shared.state.write();
            let Some(rec) = state.cells.get_mut(&cell) else {
                return;
            };
            match rec.mount.as_ref() {
                Some(mount) if mount.is_idle() => {}
                _ => return,
            }
            let mount = rec.mount.take().expect("mount record checked above");
            out.push(mount.core.meta());
            rec.deps.keys().copied().collect()
        };

        for dep in deps {
            {
                let mut state = self.shared.state.write();
                if let Some(mount) = state.cells.get_mut(&dep).and_then(|rec| rec.mount.as_mut()) {
                    mount.read_dependents.shift_remove(&cell);
                }
            }
            self.unmount_walk(dep, out);
        }
    }
}
