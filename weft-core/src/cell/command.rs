//! Commands
//!
//! A command is an imperative write procedure: it may read and write other
//! cells through a mutation-scoped visitor, and dispatching it returns
//! whatever its write function returns.
//!
//! Commands hold no value and never appear in the dependency graph. Nested
//! writes made by a command run re-entrantly within the same outer mutation
//! context, so listeners are notified once, at the end of the outermost
//! write.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use super::{CellBehavior, CellCore, CellId, CellKind, CellMeta};
use crate::store::MutationCtx;

/// An imperative write procedure taking arguments of type `A` and returning
/// `R`.
///
/// # Example
///
/// ```rust,ignore
/// let count = state(0);
/// let add = {
///     let count = count.clone();
///     command(move |ctx, n: i32| {
///         let current = ctx.get(&count);
///         ctx.set(&count, current + n);
///         current + n
///     })
/// };
///
/// let total = store.dispatch(&add, 3);
/// ```
pub struct Command<A, R>
where
    A: 'static,
    R: 'static,
{
    core: Arc<CellCore>,
    pub(crate) write: Arc<dyn Fn(&MutationCtx<'_>, A) -> R + Send + Sync>,
    _marker: PhantomData<fn(A) -> R>,
}

/// Create a new command from a write function.
pub fn command<A, R, F>(write: F) -> Command<A, R>
where
    A: 'static,
    R: 'static,
    F: Fn(&MutationCtx<'_>, A) -> R + Send + Sync + 'static,
{
    Command::new(write)
}

impl<A, R> Command<A, R>
where
    A: 'static,
    R: 'static,
{
    /// Create a new command from a write function.
    pub fn new<F>(write: F) -> Self
    where
        F: Fn(&MutationCtx<'_>, A) -> R + Send + Sync + 'static,
    {
        Self::build(write, None)
    }

    /// Create a new command with a debug label.
    pub fn labeled<F>(write: F, label: impl Into<Arc<str>>) -> Self
    where
        F: Fn(&MutationCtx<'_>, A) -> R + Send + Sync + 'static,
    {
        Self::build(write, Some(label.into()))
    }

    fn build<F>(write: F, label: Option<Arc<str>>) -> Self
    where
        F: Fn(&MutationCtx<'_>, A) -> R + Send + Sync + 'static,
    {
        Self {
            core: CellCore::new(CellKind::Command, label, CellBehavior::Command),
            write: Arc::new(write),
            _marker: PhantomData,
        }
    }

    /// Get the command's unique ID.
    pub fn id(&self) -> CellId {
        self.core.id
    }

    /// Get the command's debug label, if any.
    pub fn label(&self) -> Option<&str> {
        self.core.label.as_deref()
    }

    /// Diagnostic snapshot of this command's identity.
    pub fn meta(&self) -> CellMeta {
        self.core.meta()
    }
}

impl<A, R> Clone for Command<A, R>
where
    A: 'static,
    R: 'static,
{
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            write: Arc::clone(&self.write),
            _marker: PhantomData,
        }
    }
}

impl<A, R> Debug for Command<A, R>
where
    A: 'static,
    R: 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.core.id)
            .field("label", &self.core.label)
            .finish()
    }
}
