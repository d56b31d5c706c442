//! State Cell
//!
//! A state cell is the fundamental mutable primitive: a leaf value in the
//! dependency graph. Writing a state cell is what starts change propagation.
//!
//! The handle carries no value itself. The current value lives in the
//! store's cell state table and is materialized lazily from the captured
//! initial value on first read or write.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use super::sealed::CellRef;
use super::{CellBehavior, CellCore, CellId, CellKind, ErasedValue, Observable, Readable};

/// A mutable leaf cell holding a value of type T.
///
/// # Example
///
/// ```rust,ignore
/// let count = state(0);
/// let store = Store::new();
///
/// assert_eq!(store.get(&count), 0);
/// store.set(&count, 5);
/// assert_eq!(store.get(&count), 5);
/// ```
pub struct State<T>
where
    T: Clone + Send + Sync + 'static,
{
    core: Arc<CellCore>,
    _marker: PhantomData<fn() -> T>,
}

/// Create a new state cell with the given initial value.
pub fn state<T>(initial: T) -> State<T>
where
    T: Clone + Send + Sync + 'static,
{
    State::new(initial)
}

impl<T> State<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new state cell with the given initial value.
    pub fn new(initial: T) -> Self {
        Self::build(initial, None)
    }

    /// Create a new state cell with a debug label.
    ///
    /// The label is used only for diagnostics; it never affects identity.
    pub fn labeled(initial: T, label: impl Into<Arc<str>>) -> Self {
        Self::build(initial, Some(label.into()))
    }

    fn build(initial: T, label: Option<Arc<str>>) -> Self {
        let init = Box::new(move || Arc::new(initial.clone()) as ErasedValue);
        Self {
            core: CellCore::new(CellKind::State, label, CellBehavior::State { init }),
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

impl<T> CellRef for State<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn core(&self) -> &Arc<CellCore> {
        &self.core
    }
}

impl<T> Readable<T> for State<T> where T: Clone + Send + Sync + 'static {}

impl<T> Observable for State<T> where T: Clone + Send + Sync + 'static {}

impl<T> Clone for State<T>
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

impl<T> Debug for State<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("id", &self.core.id)
            .field("label", &self.core.label)
            .finish()
    }
}
