//! Computed Cells
//!
//! A computed cell is a cached derived value that re-evaluates only when its
//! dependencies change.
//!
//! # How Computed Cells Work
//!
//! 1. On first access, the store runs the read function and caches the
//!    result together with the set of dependencies it read.
//!
//! 2. When accessed again, if the cached value is still valid (the cell is
//!    mounted, or every recorded dependency epoch is unchanged), the cached
//!    value is returned without re-running the read function.
//!
//! 3. When a dependency changes while the cell is mounted, propagation marks
//!    the cell dirty and re-evaluates it eagerly.
//!
//! # Asynchronous reads
//!
//! An [`AsyncComputed`] read function returns a future rather than an
//! immediate value. The store caches the future as a shared handle
//! ([`AsyncValue`]) and bumps the epoch once per evaluation, not once per
//! settlement. Each evaluation gets a fresh cancellation token; starting a
//! new evaluation cancels the previous in-flight one, and a superseded
//! evaluation can no longer register dependencies.

use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;

use super::sealed::CellRef;
use super::{CellBehavior, CellCore, CellId, CellKind, ErasedValue, Observable, Readable};
use crate::store::Tracker;

/// The cached value of an async computed cell: a shareable future.
///
/// Cloning is cheap; every reader observes the same settlement.
pub type AsyncValue<T> = Shared<BoxFuture<'static, T>>;

/// A derived, read-only cell whose value is produced synchronously.
///
/// # Example
///
/// ```rust,ignore
/// let base = state(1);
/// let doubled = computed(move |get| get.get(&base) * 2);
///
/// let store = Store::new();
/// assert_eq!(store.get(&doubled), 2);
/// ```
pub struct Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    core: Arc<CellCore>,
    _marker: PhantomData<fn() -> T>,
}

/// Create a new computed cell from a synchronous read function.
pub fn computed<T, F>(read: F) -> Computed<T>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&Tracker) -> T + Send + Sync + 'static,
{
    Computed::new(read)
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new computed cell from a synchronous read function.
    ///
    /// The read function is not run immediately; it runs on first access.
    pub fn new<F>(read: F) -> Self
    where
        F: Fn(&Tracker) -> T + Send + Sync + 'static,
    {
        Self::build(read, None)
    }

    /// Create a new computed cell with a debug label.
    pub fn labeled<F>(read: F, label: impl Into<Arc<str>>) -> Self
    where
        F: Fn(&Tracker) -> T + Send + Sync + 'static,
    {
        Self::build(read, Some(label.into()))
    }

    fn build<F>(read: F, label: Option<Arc<str>>) -> Self
    where
        F: Fn(&Tracker) -> T + Send + Sync + 'static,
    {
        let eval = Arc::new(move |tracker: &Tracker| Arc::new(read(tracker)) as ErasedValue);
        Self {
            core: CellCore::new(CellKind::Computed, label, CellBehavior::Computed { eval }),
            _marker: PhantomData,
        }
    }

    /// Get the cell's unique ID.
    pub fn id(&self) -> CellId {
        self.core.id
    }

    /// Get the cell's debug label, if any.
    pub fn label(&self) -> Option<&str> {
        self.core.label.as_deref()
    }
}

/// A derived cell whose read function resolves asynchronously.
///
/// Reading it yields an [`AsyncValue`] — the cached shared future — which
/// the caller may await. The engine itself never blocks on it.
///
/// # Example
///
/// ```rust,ignore
/// let base = state(1);
/// let fetched = async_computed(move |get| async move {
///     let id = get.get(&base);
///     lookup(id).await
/// });
///
/// let value = store.get(&fetched).await;
/// ```
pub struct AsyncComputed<T>
where
    T: Clone + Send + Sync + 'static,
{
    core: Arc<CellCore>,
    _marker: PhantomData<fn() -> T>,
}

/// Create a new async computed cell from a future-returning read function.
///
/// The read function receives an owned [`Tracker`] so it can keep reading
/// dependencies after suspension points; dependency registration after the
/// evaluation has been superseded is silently dropped.
pub fn async_computed<T, F, Fut>(read: F) -> AsyncComputed<T>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(Tracker) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    AsyncComputed::new(read)
}

impl<T> AsyncComputed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new async computed cell from a future-returning read function.
    pub fn new<F, Fut>(read: F) -> Self
    where
        F: Fn(Tracker) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self::build(read, None)
    }

    /// Create a new async computed cell with a debug label.
    pub fn labeled<F, Fut>(read: F, label: impl Into<Arc<str>>) -> Self
    where
        F: Fn(Tracker) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self::build(read, Some(label.into()))
    }

    fn build<F, Fut>(read: F, label: Option<Arc<str>>) -> Self
    where
        F: Fn(Tracker) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let eval = Arc::new(move |tracker: &Tracker| {
            let shared: AsyncValue<T> = read(tracker.clone()).boxed().shared();
            Arc::new(shared) as ErasedValue
        });
        Self {
            core: CellCore::new(CellKind::Computed, label, CellBehavior::Computed { eval }),
            _marker: PhantomData,
        }
    }

    /// Get the cell's unique ID.
    pub fn id(&self) -> CellId {
        self.core.id
    }

    /// Get the cell's debug label, if any.
    pub fn label(&self) -> Option<&str> {
        self.core.label.as_deref()
    }
}

impl<T> CellRef for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn core(&self) -> &Arc<CellCore> {
        &self.core
    }
}

impl<T> Readable<T> for Computed<T> where T: Clone + Send + Sync + 'static {}

impl<T> Observable for Computed<T> where T: Clone + Send + Sync + 'static {}

impl<T> CellRef for AsyncComputed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn core(&self) -> &Arc<CellCore> {
        &self.core
    }
}

impl<T> Readable<AsyncValue<T>> for AsyncComputed<T> where T: Clone + Send + Sync + 'static {}

impl<T> Observable for AsyncComputed<T> where T: Clone + Send + Sync + 'static {}

impl<T> Clone for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for AsyncComputed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _marker: PhantomData,
        }
    }
}

impl<T> Debug for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.core.id)
            .field("label", &self.core.label)
            .finish()
    }
}

impl<T> Debug for AsyncComputed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncComputed")
            .field("id", &self.core.id)
            .field("label", &self.core.label)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computed_ids_are_unique() {
        let a: Computed<i32> = computed(|_| 1);
        let b: Computed<i32> = computed(|_| 2);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn computed_clone_shares_identity() {
        let a: Computed<i32> = computed(|_| 1);
        let b = a.clone();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn labeled_computed_carries_label() {
        let cell: Computed<i32> = Computed::labeled(|_| 1, "doubled");
        assert_eq!(cell.label(), Some("doubled"));

        let async_cell: AsyncComputed<i32> = AsyncComputed::labeled(|_| async { 1 }, "fetched");
        assert_eq!(async_cell.label(), Some("fetched"));
    }
}
