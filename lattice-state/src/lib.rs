//! Lattice State
//!
//! This crate provides the state engine behind the Lattice reactive UI
//! framework. It implements:
//!
//! - Atoms (writable state) and selectors (memoized derived state)
//! - Loadables and promises for values that are still loading
//! - Versioned dependency graphs with structural sharing
//! - Selector caches keyed by dependency values
//! - Transactions, subscriptions, snapshots and retention
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `node`: node definitions, the registry, atom effects and families
//! - `engine`: the read/write path and selector evaluation
//! - `state`: trees, the store, snapshots and subscriptions
//! - `graph`: per-version dependency graphs and their traversals
//! - `cache`: selector result caches
//! - `retention`: reference-counted release of unused nodes
//!
//! Node definitions live in a [`Registry`]; every [`Store`] built on the
//! registry keeps its own values, graphs and subscriptions.
//!
//! # Example
//!
//! ```rust,ignore
//! use lattice_state::{Atom, AtomOptions, Registry, Selector, SelectorOptions, Store};
//!
//! let registry = Registry::new();
//! let count = Atom::new(&registry, AtomOptions::new("count", 1));
//!
//! let reader = count.clone();
//! let doubled = Selector::new(
//!     &registry,
//!     SelectorOptions::new("doubled", move |ctx| Ok(ctx.get(&reader)? * 2)),
//! );
//!
//! let store = Store::new(&registry);
//! assert_eq!(store.get_value(&doubled).ok(), Some(2));
//!
//! store.set(&count, 5)?;
//! assert_eq!(store.get_value(&doubled).ok(), Some(10));
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod loadable;
pub mod node;
pub mod retention;
pub mod state;
pub mod value;

pub use cache::{CacheEquality, CachePolicy, Eviction, SelectorCache};
pub use config::StoreConfig;
pub use engine::{ExecutionId, GetContext, SetContext};
pub use error::{Error, Interrupt, Result, Suspension};
pub use graph::GraphSnapshot;
pub use loadable::{Loadable, LoadableState, Promise, Resolver};
pub use node::{
    Atom, AtomDefault, AtomFamily, AtomOptions, Cleanup, EffectContext, NodeKey, NodeRef,
    NodeType, Registry, RetainedBy, RetentionZone, Selector, SelectorFamily, SelectorOptions,
    Trigger, WritableNodeRef, WritableSelector,
};
pub use retention::{RetainGuard, Retainable};
pub use state::{
    MutableSnapshot, NodeFilter, NodeInfo, Snapshot, SnapshotRetain, StateId, Store, StoreState,
    Subscription, SubscriptionId, TreeState, Version,
};
pub use value::{AnyValue, DefaultValue, NodeValue, WriteValue};
