//! Interceptor Protocol
//!
//! A fixed set of synchronous hook points that external observers may wrap
//! around the corresponding internal store operation. Diagnostics and
//! devtools layers build on these hooks; the engine itself never depends on
//! them.
//!
//! # The synchronous-continuation contract
//!
//! Four hooks wrap operations that produce a result: `get`, `computed`,
//! `set`, and `notify`. Each receives the target cell and a [`Continuation`]
//! that performs the real operation. The hook must invoke the continuation
//! synchronously, exactly once, before returning — otherwise the engine
//! panics with "interceptor must call fn sync". This contract exists so
//! observability never changes evaluation order or timing: interceptors may
//! only observe and re-dispatch, never defer.
//!
//! The remaining four hooks (`sub`, `unsub`, `mount`, `unmount`) are plain
//! synchronous observations.

use crate::cell::CellMeta;
use crate::error::StoreError;

/// The deferred inner operation handed to a wrapping hook.
///
/// Borrowed mutably for the duration of the hook call, so it cannot be
/// stored or invoked later; the exactly-once part of the contract is
/// checked when the hook returns.
pub struct Continuation<'a> {
    run: &'a mut dyn FnMut(),
    calls: u32,
}

impl<'a> Continuation<'a> {
    pub(crate) fn new(run: &'a mut dyn FnMut()) -> Self {
        Self { run, calls: 0 }
    }

    /// Perform the wrapped operation.
    pub fn call(&mut self) {
        self.calls += 1;
        if self.calls == 1 {
            (self.run)();
        }
    }

    /// Check the exactly-once contract after the hook has returned.
    pub(crate) fn finish(self) {
        if self.calls != 1 {
            panic!("{}", StoreError::InterceptorContract);
        }
    }
}

/// Synchronous hook points around the store's internal operations.
///
/// All hooks have no-op defaults; implement any subset. An interceptor is
/// installed once, at store construction, through
/// [`StoreOptions`](crate::store::StoreOptions).
pub trait Interceptor: Send + Sync {
    /// Wraps a public read of any cell.
    fn get(&self, cell: &CellMeta, proceed: &mut Continuation<'_>) {
        let _ = cell;
        proceed.call();
    }

    /// Wraps each invocation of a computed cell's read function, including
    /// re-evaluations triggered by propagation.
    fn computed(&self, cell: &CellMeta, proceed: &mut Continuation<'_>) {
        let _ = cell;
        proceed.call();
    }

    /// Wraps a write: a state cell set/update or a command dispatch.
    fn set(&self, cell: &CellMeta, proceed: &mut Continuation<'_>) {
        let _ = cell;
        proceed.call();
    }

    /// Wraps the invocation of a single pending listener.
    fn notify(&self, cell: &CellMeta, proceed: &mut Continuation<'_>) {
        let _ = cell;
        proceed.call();
    }

    /// Observes a listener being attached to a cell.
    fn sub(&self, cell: &CellMeta) {
        let _ = cell;
    }

    /// Observes a listener being removed from a cell.
    fn unsub(&self, cell: &CellMeta) {
        let _ = cell;
    }

    /// Observes a cell's mount record being created.
    fn mount(&self, cell: &CellMeta) {
        let _ = cell;
    }

    /// Observes a cell's mount record being torn down.
    fn unmount(&self, cell: &CellMeta) {
        let _ = cell;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_runs_the_operation_once() {
        let mut ran = 0;
        let mut op = || ran += 1;
        let mut cont = Continuation::new(&mut op);

        cont.call();
        cont.finish();
        assert_eq!(ran, 1);
    }

    #[test]
    #[should_panic(expected = "interceptor must call fn sync")]
    fn continuation_never_called_panics() {
        let mut op = || {};
        let cont = Continuation::new(&mut op);
        cont.finish();
    }

    #[test]
    #[should_panic(expected = "interceptor must call fn sync")]
    fn continuation_called_twice_panics() {
        let mut ran = 0;
        let mut op = || ran += 1;
        let mut cont = Continuation::new(&mut op);

        cont.call();
        cont.call();
        cont.finish();
    }

    #[test]
    fn double_call_does_not_rerun_the_operation() {
        let mut ran = 0;
        {
            let mut op = || ran += 1;
            let mut cont = Continuation::new(&mut op);
            cont.call();
            cont.call();
            // finish() would panic; the operation itself must still have run
            // only once.
        }
        assert_eq!(ran, 1);
    }
}
