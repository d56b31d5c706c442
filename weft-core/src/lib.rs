//! Weft Core
//!
//! This crate provides the evaluation and propagation engine for the Weft
//! reactive state store. It implements:
//!
//! - The three cell kinds: state, computed (sync and async), and command
//! - Lazy evaluation with epoch-based cache validation
//! - The mount lifecycle that keeps observed cells eagerly fresh
//! - Push-pull write propagation that is glitch-free on diamond graphs
//! - Cooperative cancellation of superseded async evaluations
//! - A synchronous interceptor protocol for diagnostics and devtools
//!
//! Framework bindings, devtools transports, and log formatting live in
//! separate crates; they consume only the store's public surface.
//!
//! # Architecture
//!
//! The crate is organized into a few modules:
//!
//! - `cell`: cell identity, the three cell kinds, and their factories
//! - `store`: the coordinator — cell state table, evaluation engine,
//!   mount/lifecycle manager, and mutation/propagation engine
//! - `interceptor`: the hook trait and its synchronous-continuation contract
//! - `error`: the engine error type
//!
//! # Example
//!
//! ```rust,ignore
//! use weft_core::{computed, state, Store};
//!
//! let count = state(1);
//! let doubled = {
//!     let count = count.clone();
//!     computed(move |get| get.get(&count) * 2)
//! };
//!
//! let store = Store::new();
//! let sub = store.subscribe(&doubled, || println!("changed"));
//!
//! store.set(&count, 2);
//! // Prints "changed"; the derived value is already fresh.
//! assert_eq!(store.get(&doubled), 4);
//! drop(sub);
//! ```

pub mod cell;
pub mod error;
pub mod interceptor;
pub mod store;

pub use cell::{
    async_computed, command, computed, state, AsyncComputed, AsyncValue, CellId, CellKind,
    CellMeta, Command, Computed, Observable, Readable, State,
};
pub use error::StoreError;
pub use interceptor::{Continuation, Interceptor};
pub use store::{
    CellSnapshot, MutationCtx, Store, StoreOptions, StoreSnapshot, SubscribeOptions, Subscription,
    Tracker,
};
