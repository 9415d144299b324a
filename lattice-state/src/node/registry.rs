//! Node Registry
//!
//! Maps node keys to their definitions. A registry is shared by every store
//! created from it; cloning a registry clones the handle, not the table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::{Node, NodeKey};
use crate::error::{Error, Result};

/// Key to definition table shared by stores.
#[derive(Clone)]
pub struct Registry {
    nodes: Arc<DashMap<NodeKey, Node>>,
    warn_on_duplicates: Arc<AtomicBool>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(DashMap::new()),
            warn_on_duplicates: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Control whether re-registering a key logs a warning.
    ///
    /// Hot-reloading hosts re-declare nodes on purpose and turn this off.
    pub fn with_duplicate_warnings(self, warn: bool) -> Self {
        self.set_duplicate_warnings(warn);
        self
    }

    /// Whether registering a key twice logs a warning.
    pub fn duplicate_warnings(&self) -> bool {
        self.warn_on_duplicates.load(Ordering::Relaxed)
    }

    /// Same as [`Registry::with_duplicate_warnings`], for every handle.
    pub fn set_duplicate_warnings(&self, warn: bool) {
        self.warn_on_duplicates.store(warn, Ordering::Relaxed);
    }

    /// Register a definition. A duplicate key replaces the old definition.
    pub(crate) fn register(&self, node: Node) -> NodeKey {
        let key = node.key().clone();
        let replaced = self.nodes.insert(key.clone(), node).is_some();
        if replaced && self.warn_on_duplicates.load(Ordering::Relaxed) {
            tracing::warn!(
                target: "recoverable_violation",
                key = %key,
                "{}; this can happen during hot module reloading",
                Error::DuplicateNode(key.clone())
            );
        }
        key
    }

    /// Register the definition `make` builds unless `key` is already taken.
    /// `make` runs without any registry lock held.
    pub(crate) fn register_if_absent(&self, key: &NodeKey, make: impl FnOnce() -> Node) {
        if self.nodes.contains_key(key) {
            return;
        }
        let node = make();
        self.nodes.entry(key.clone()).or_insert(node);
    }

    /// Look up a definition.
    pub fn get(&self, key: &NodeKey) -> Result<Node> {
        self.get_maybe(key)
            .ok_or_else(|| Error::NodeMissing(key.clone()))
    }

    /// Look up a definition, if registered.
    pub fn get_maybe(&self, key: &NodeKey) -> Option<Node> {
        self.nodes.get(key).map(|entry| entry.value().clone())
    }

    /// Whether the key is registered.
    pub fn contains(&self, key: &NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    /// Drop a definition.
    pub(crate) fn remove(&self, key: &NodeKey) -> Option<Node> {
        self.nodes.remove(key).map(|(_, node)| node)
    }

    /// All registered keys, in no particular order.
    pub fn keys(&self) -> Vec<NodeKey> {
        self.nodes.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether two handles share the same table.
    pub fn same_registry(&self, other: &Registry) -> bool {
        Arc::ptr_eq(&self.nodes, &other.nodes)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("nodes", &self.nodes.len())
            .finish()
    }
}
