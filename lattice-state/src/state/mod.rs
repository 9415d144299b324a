//! Store State
//!
//! - [`TreeState`]: immutable atom values at one transaction version.
//! - [`StoreState`]: the mutable state of one root: the current, next and
//!   previous trees, dependency graphs by version, subscriptions and
//!   retention bookkeeping.
//! - [`Store`]: the handle everything else goes through.
//! - [`Snapshot`]: a read-only (or privately mutable) copy of a store at one
//!   tree.

mod snapshot;
mod store;
mod subscriber;
mod tree;

pub use snapshot::{MutableSnapshot, NodeFilter, NodeInfo, Snapshot, SnapshotRetain};
pub use store::{Store, StoreId, StoreState, TreeVersions, WeakStore};
pub use subscriber::{Subscription, SubscriptionId};
pub use tree::{PersistentMap, StateId, TreeState, Version};
