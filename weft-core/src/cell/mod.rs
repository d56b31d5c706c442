//! Cell Kinds
//!
//! This module implements the three cell kinds the store evaluates: state
//! cells (mutable leaves), computed cells (derived, read-only values, with a
//! synchronous and an asynchronous flavor), and commands (imperative write
//! procedures).
//!
//! # Concepts
//!
//! ## State cells
//!
//! A state cell is a container for a mutable value. It is created with an
//! initial value; the store materializes its runtime record lazily on first
//! read or write.
//!
//! ## Computed cells
//!
//! A computed cell derives its value from other cells through a read
//! function. The read function receives a tracking accessor; each dependency
//! it reads is recorded so the store knows when the cached value may be
//! reused. Async computed cells return a future instead of an immediate
//! value; the future is cached and shared between readers.
//!
//! ## Commands
//!
//! A command is a write procedure. It holds no value; dispatching it runs
//! its write function against a mutation-scoped visitor that can read and
//! write other cells.
//!
//! # Implementation Notes
//!
//! Cells are immutable value objects: cheap-clone handles around a shared
//! core. Once created, a cell's behavior never changes. The core's behavior
//! is a tagged variant rather than structural duck-typing, so the engine
//! dispatches on kind explicitly.

mod command;
mod computed;
mod id;
mod state;

pub use command::{command, Command};
pub use computed::{async_computed, computed, AsyncComputed, AsyncValue, Computed};
pub use id::{CellId, CellKind, CellMeta};
pub use state::{state, State};

pub(crate) use id::ListenerId;

use std::any::Any;
use std::sync::Arc;

use crate::store::Tracker;

/// Type-erased cell value as stored in the cell state table.
pub(crate) type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Type-erased evaluator for a computed cell.
pub(crate) type EvalFn = Arc<dyn Fn(&Tracker) -> ErasedValue + Send + Sync>;

/// What a cell does when read or written.
///
/// Tagged variant over the three cell kinds; the engine matches on this
/// instead of probing for capabilities.
pub(crate) enum CellBehavior {
    /// Produces the initial value for the cell's record.
    State {
        init: Box<dyn Fn() -> ErasedValue + Send + Sync>,
    },
    /// Evaluates the cell from its dependencies.
    Computed { eval: EvalFn },
    /// Write procedure; holds no value.
    Command,
}

/// The shared, immutable core behind every cell handle.
pub(crate) struct CellCore {
    pub(crate) id: CellId,
    pub(crate) kind: CellKind,
    pub(crate) label: Option<Arc<str>>,
    pub(crate) behavior: CellBehavior,
}

impl CellCore {
    pub(crate) fn new(kind: CellKind, label: Option<Arc<str>>, behavior: CellBehavior) -> Arc<Self> {
        Arc::new(Self {
            id: CellId::next(),
            kind,
            label,
            behavior,
        })
    }

    pub(crate) fn meta(&self) -> CellMeta {
        CellMeta {
            id: self.id,
            kind: self.kind,
            label: self.label.clone(),
        }
    }
}

mod sealed {
    use std::sync::Arc;

    use super::CellCore;

    pub trait CellRef {
        fn core(&self) -> &Arc<CellCore>;
    }
}

pub(crate) use sealed::CellRef;

/// A cell the store can read a `T` out of.
///
/// Implemented by [`State`], [`Computed`], and [`AsyncComputed`] (whose item
/// is the shared future, not the settled value). Sealed: the store's
/// evaluation engine is the only implementation surface.
pub trait Readable<T>: sealed::CellRef
where
    T: Clone + Send + Sync + 'static,
{
}

/// A cell that can be observed through a subscription.
///
/// Commands are not observable; they hold no value to observe.
pub trait Observable: sealed::CellRef {
    /// Diagnostic snapshot of this cell's identity.
    fn meta(&self) -> CellMeta {
        self.core().meta()
    }
}
