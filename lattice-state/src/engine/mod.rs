//! Evaluation Engine
//!
//! Dispatches reads and writes to the right node implementation and owns
//! the selector evaluation algorithm.
//!
//! # Read path
//!
//! 1. Look the key up in the registry (a missing key is a programming
//!    error).
//! 2. Initialize the node for the store on first use: run atom effects,
//!    count the store as live for a selector, record zone membership.
//! 3. Atoms read their tree value, a restored raw value passed through the
//!    validator, or their default. Selectors go through [`evaluate`].
//!
//! # Write path
//!
//! Writes produce a [`WriteSet`] (atom key to new loadable or reset) that
//! the store applies to the next tree in one go. Writable selectors turn a
//! write into the writes their setter makes.

pub mod context;
pub(crate) mod evaluate;
pub(crate) mod execution;

pub use context::{GetContext, SetContext};
pub use execution::ExecutionId;

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::graph::scheduler;
use crate::loadable::Loadable;
use crate::node::{self, Node, NodeKey, Trigger};
use crate::state::{Store, TreeState};
use crate::value::{AnyValue, WriteValue};

/// A single pending write to an atom.
#[derive(Debug, Clone)]
pub(crate) enum WriteEntry {
    /// Store this loadable.
    Set(Loadable<AnyValue>),
    /// Remove the stored value so the default applies again.
    Reset,
}

/// Writes in the order they were made.
pub(crate) type WriteSet = IndexMap<NodeKey, WriteEntry>;

/// Read a node, initializing it for the store on first use.
pub(crate) fn get_node_loadable(
    store: &Store,
    tree: &TreeState,
    key: &NodeKey,
) -> Result<Loadable<AnyValue>> {
    let node = store.registry().get(key)?;
    initialize_node(store, tree, &node, Trigger::Get);
    match &node {
        Node::Atom(def) => node::atom::get(store, tree, def),
        Node::Selector(def) => evaluate::get_selector_loadable(store, tree, def),
    }
}

/// Read a node without evaluating, initializing or recording anything.
pub(crate) fn peek_node_loadable(
    store: &Store,
    tree: &TreeState,
    key: &NodeKey,
) -> Result<Option<Loadable<AnyValue>>> {
    let node = store.registry().get(key)?;
    Ok(match &node {
        Node::Atom(def) => node::atom::peek(store, tree, def),
        Node::Selector(def) => evaluate::peek_selector(store, tree, def),
    })
}

/// What a node reads as once reset.
pub(crate) fn default_loadable(
    store: &Store,
    tree: &TreeState,
    key: &NodeKey,
) -> Result<Loadable<AnyValue>> {
    match store.registry().get(key)? {
        Node::Atom(def) => node::atom::default_loadable(store, tree, &def),
        Node::Selector(_) => get_node_loadable(store, tree, key),
    }
}

/// Compute the writes that setting `key` to `write` makes.
pub(crate) fn set_node_value(
    store: &Store,
    tree: &TreeState,
    key: &NodeKey,
    write: WriteValue<AnyValue>,
) -> Result<WriteSet> {
    let node = store.registry().get(key)?;
    match &node {
        Node::Atom(def) => {
            initialize_node(store, tree, &node, Trigger::Set);
            Ok(node::atom::set(store, tree, def, write))
        }
        Node::Selector(def) => {
            let Some(set) = def.set.clone() else {
                return Err(Error::ReadOnlyNode(key.clone()));
            };
            initialize_node(store, tree, &node, Trigger::Set);
            evaluate::set_selector(store, tree, def, &set, write)
        }
    }
}

/// First-use setup of a node in a store. Runs once per store and node
/// until the node is released.
pub(crate) fn initialize_node(store: &Store, tree: &TreeState, node: &Node, trigger: Trigger) {
    if !store.mark_known(node) {
        return;
    }
    tracing::trace!(key = %node.key(), store = %store.id(), ?trigger, "initializing node");
    match node {
        Node::Atom(def) => node::effect::init_atom(store, tree, def, trigger),
        Node::Selector(def) => {
            def.attach_store();
            let def = def.clone();
            let store_id = store.id();
            store.add_cleanup(
                node.key(),
                Box::new(move || def.detach_store(store_id)),
            );
        }
    }
}

/// Apply writes to a tree. Applied keys become dirty.
pub(crate) fn apply_writes(tree: &mut TreeState, writes: WriteSet) {
    for (key, entry) in writes {
        match entry {
            WriteEntry::Set(loadable) => tree.atom_values.insert(key.clone(), loadable),
            WriteEntry::Reset => {
                tree.atom_values.remove(&key);
            }
        }
        tree.nonvalidated_atoms.remove(&key);
        tree.dirty_atoms.insert(key);
    }
}

/// Drop node-local caches and per-version memos for everything downstream
/// of the tree's dirty atoms.
pub(crate) fn invalidate_downstream(store: &Store, tree: &TreeState) {
    if tree.dirty_atoms.is_empty() {
        return;
    }
    let downstream = store.with_graph(|graph| {
        scheduler::downstream_nodes(graph, tree.version, tree.dirty_atoms.iter())
    });
    store.overlay_invalidate(tree.version, downstream.iter());
    for key in &downstream {
        if let Some(Node::Atom(def)) = store.registry().get_maybe(key) {
            def.invalidate();
        }
    }
}
