//! Transaction subscriptions.
//!
//! A subscription is a callback invoked with the store after a transaction
//! commits. Global subscriptions fire for every transaction that changed
//! something; node subscriptions fire only when their node is downstream of
//! an atom written in the transaction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{Store, WeakStore};
use crate::node::NodeKey;
use crate::retention::RetainGuard;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Generate a new unique subscription ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback run after a transaction commits.
pub(crate) type TransactionCallback = Arc<dyn Fn(&Store) + Send + Sync>;

/// Handle to a subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    store: WeakStore,
    node: Option<NodeKey>,
    retain: Option<RetainGuard>,
    released: bool,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, store: WeakStore, node: Option<NodeKey>) -> Self {
        Self {
            id,
            store,
            node,
            retain: None,
            released: false,
        }
    }

    /// Keep `guard` alive as long as the subscription.
    pub(crate) fn with_retain(mut self, guard: RetainGuard) -> Self {
        self.retain = Some(guard);
        self
    }

    /// The subscription's ID.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The node this subscription watches, if any.
    pub fn node(&self) -> Option<&NodeKey> {
        self.node.as_ref()
    }

    /// Unsubscribe now.
    pub fn release(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(self.id, self.node.as_ref());
        }
        // Unsubscribe before the retain is dropped so a release triggered
        // by it never notifies this subscription.
        if let Some(guard) = self.retain.take() {
            guard.release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("released", &self.released)
            .finish()
    }
}
