//! Snapshots
//!
//! A [`Snapshot`] is an independent copy of a store at one tree. It has a
//! private store of its own: the tree is shared copy-on-write and the
//! dependency graph is copied, so nothing done through the snapshot can
//! reach the source store and nothing done to the source store shows up in
//! the snapshot. Selector caches are shared through the registry.
//!
//! Snapshots are released explicitly. Callers that hand a snapshot to
//! other code take a [`SnapshotRetain`] and call
//! [`Snapshot::release_if_idle`] once they are done; dropping the last
//! handle releases it as well. Reading a released snapshot logs a
//! recoverable violation and still answers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

use super::{StateId, Store, TreeState, Version};
use crate::error::Result;
use crate::graph::scheduler;
use crate::loadable::{Loadable, Promise};
use crate::node::{NodeKey, NodeRef, NodeType, WritableNodeRef};
use crate::value::{AnyValue, NodeValue};

/// What a snapshot knows about one node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// The node's value if it is stored or cached, without evaluating it.
    pub loadable: Option<Loadable<AnyValue>>,
    /// Whether the node has been initialized.
    pub is_active: bool,
    /// Whether an atom holds an explicit value.
    pub is_set: bool,
    /// Whether the node was written by the transaction that produced this
    /// tree.
    pub is_modified: bool,
    /// Atom or selector.
    pub node_type: NodeType,
    /// Nodes this node read, sorted.
    pub deps: Vec<NodeKey>,
    /// Nodes that depend on this node, directly or not.
    pub subscribers: Vec<NodeKey>,
}

/// Which nodes [`Snapshot::get_nodes`] lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeFilter {
    /// Only nodes written by the transaction that produced the tree.
    pub modified_only: bool,
    /// Only nodes initialized in the snapshot; otherwise every registered
    /// node.
    pub initialized_only: bool,
}

struct SnapshotInner {
    store: Store,
    retains: AtomicUsize,
    released: AtomicBool,
}

impl SnapshotInner {
    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            tracing::trace!(store = %self.store.id(), "releasing snapshot");
            self.store.teardown();
        }
    }
}

impl Drop for SnapshotInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// An independent, read-mostly copy of a store.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

impl Snapshot {
    pub(crate) fn new(parent: &Store, tree: &TreeState) -> Self {
        Self {
            inner: Arc::new(SnapshotInner {
                store: Store::for_snapshot(parent, tree),
                retains: AtomicUsize::new(0),
                released: AtomicBool::new(false),
            }),
        }
    }

    fn store(&self) -> &Store {
        if self.is_released() {
            tracing::warn!(
                target: "recoverable_violation",
                store = %self.inner.store.id(),
                "snapshot used after release; retain it while in use"
            );
        }
        &self.inner.store
    }

    /// The snapshot's tree.
    pub(crate) fn tree(&self) -> TreeState {
        self.inner.store.current_tree()
    }

    /// Read a node.
    pub fn get_loadable<T, N>(&self, node: &N) -> Result<Loadable<T>>
    where
        T: NodeValue + Clone,
        N: NodeRef<T> + ?Sized,
    {
        self.store().get_loadable(node)
    }

    /// A promise for a node's value.
    pub fn get_promise<T, N>(&self, node: &N) -> Result<Promise<T>>
    where
        T: NodeValue + Clone,
        N: NodeRef<T> + ?Sized,
    {
        self.store().get_promise(node)
    }

    /// Read a node by key.
    pub fn get_loadable_by_key(&self, key: &NodeKey) -> Result<Loadable<AnyValue>> {
        self.store().get_loadable_by_key(key)
    }

    /// Describe a node.
    pub fn get_info<T, N>(&self, node: &N) -> Result<NodeInfo>
    where
        N: NodeRef<T> + ?Sized,
    {
        self.get_info_by_key(node.key())
    }

    /// Describe a node by key.
    pub fn get_info_by_key(&self, key: &NodeKey) -> Result<NodeInfo> {
        let store = self.store();
        let node = store.registry().get(key)?;
        let loadable = store.peek_loadable_by_key(key)?;
        let tree = store.current_tree();
        let is_active =
            store.get_state(|s| s.known_atoms.contains(key) || s.known_selectors.contains(key));
        let (deps, subscribers) = store.with_graph(|graph| {
            let mut deps: Vec<NodeKey> = graph.parents_of_node(tree.version, key).into_iter().collect();
            deps.sort();
            let subscribers: Vec<NodeKey> = scheduler::downstream_nodes(graph, tree.version, [key])
                .into_iter()
                .filter(|downstream| downstream != key)
                .collect();
            (deps, subscribers)
        });
        Ok(NodeInfo {
            loadable,
            is_active,
            is_set: tree.atom_values.contains_key(key),
            is_modified: tree.dirty_atoms.contains(key),
            node_type: node.node_type(),
            deps,
            subscribers,
        })
    }

    /// Keys of the nodes matching `filter`, sorted.
    pub fn get_nodes(&self, filter: NodeFilter) -> Vec<NodeKey> {
        let store = self.store();
        let tree = store.current_tree();
        let mut keys: Vec<NodeKey> = if filter.initialized_only {
            store.get_state(|s| {
                s.known_atoms
                    .iter()
                    .chain(s.known_selectors.iter())
                    .cloned()
                    .collect()
            })
        } else {
            store.registry().keys()
        };
        if filter.modified_only {
            keys.retain(|key| tree.dirty_atoms.contains(key));
        }
        keys.sort();
        keys
    }

    /// A new snapshot with the changes `mutate` makes. This snapshot is
    /// left unchanged.
    pub fn map<F>(&self, mutate: F) -> Result<Snapshot>
    where
        F: FnOnce(&MutableSnapshot<'_>) -> Result<()>,
    {
        let store = self.store();
        let mapped = Snapshot::new(store, &store.current_tree());
        mutate(&MutableSnapshot { snapshot: &mapped })?;
        Ok(mapped)
    }

    /// Identity of the state this snapshot shows.
    pub fn state_id(&self) -> StateId {
        self.tree().state_id
    }

    /// Version of the snapshot's tree.
    pub fn version(&self) -> Version {
        self.tree().version
    }

    /// Keep the snapshot alive across [`Snapshot::release_if_idle`].
    pub fn retain(&self) -> SnapshotRetain {
        self.inner.retains.fetch_add(1, Ordering::SeqCst);
        SnapshotRetain {
            inner: Arc::clone(&self.inner),
            released: false,
        }
    }

    /// Release the snapshot unless something retains it. Returns whether it
    /// is released.
    pub fn release_if_idle(&self) -> bool {
        if self.inner.retains.load(Ordering::SeqCst) == 0 {
            self.inner.release();
        }
        self.is_released()
    }

    /// Whether the snapshot was released.
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("store", &self.inner.store.id())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Keeps a snapshot from being released as idle.
pub struct SnapshotRetain {
    inner: Arc<SnapshotInner>,
    released: bool,
}

impl SnapshotRetain {
    /// Drop the retain now.
    pub fn release(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if !std::mem::replace(&mut self.released, true) {
            self.inner.retains.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SnapshotRetain {
    fn drop(&mut self) {
        self.release_now();
    }
}

/// Writable view of a snapshot being built by [`Snapshot::map`].
pub struct MutableSnapshot<'a> {
    snapshot: &'a Snapshot,
}

impl MutableSnapshot<'_> {
    /// Set a node.
    pub fn set<T, N>(&self, node: &N, value: T) -> Result<()>
    where
        T: NodeValue + Clone,
        N: WritableNodeRef<T> + ?Sized,
    {
        self.snapshot.store().set(node, value)
    }

    /// Reset a node to its default.
    pub fn reset<T, N>(&self, node: &N) -> Result<()>
    where
        N: WritableNodeRef<T> + ?Sized,
    {
        self.snapshot.store().reset(node)
    }

    /// Set a node to a loadable.
    pub fn set_loadable<T, N>(&self, node: &N, loadable: Loadable<T>) -> Result<()>
    where
        T: NodeValue + Clone,
        N: WritableNodeRef<T> + ?Sized,
    {
        self.snapshot.store().set_loadable(node, loadable)
    }

    /// Read a node, seeing the changes made so far.
    pub fn get_loadable<T, N>(&self, node: &N) -> Result<Loadable<T>>
    where
        T: NodeValue + Clone,
        N: NodeRef<T> + ?Sized,
    {
        self.snapshot.get_loadable(node)
    }
}
