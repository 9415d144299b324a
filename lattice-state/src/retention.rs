//! Retention
//!
//! Nodes stay in a store while something retains them: a subscription, an
//! explicit [`RetainGuard`], a retained zone they belong to, or a root
//! lifetime. When the last retain of a node or zone goes away it is
//! scheduled for release. Release waits for the end of the transaction in
//! progress, if any, so a transaction never sees nodes vanish halfway.
//!
//! # Algorithm
//!
//! Starting from the scheduled nodes, walk the current graph children
//! before parents. A node can be released unless
//!
//! - it is retained by the root,
//! - its own retain count is positive,
//! - one of its zones has a positive retain count, or
//! - one of its children cannot be released.
//!
//! Releasing a node may leave its parents unreferenced, so the walk is
//! repeated from the parents of every node found releasable until nothing
//! new turns up.

use std::collections::{HashMap, HashSet};

use indexmap::IndexSet;

use crate::graph::scheduler;
use crate::node::{Node, NodeKey, RetainedBy, RetentionZone};
use crate::state::{Store, WeakStore};

/// Something that can be retained.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Retainable {
    /// A single node.
    Node(NodeKey),
    /// Every node retained by a zone.
    Zone(RetentionZone),
}

/// Retention bookkeeping of one store.
#[derive(Debug, Default)]
pub struct Retention {
    pub(crate) reference_counts: HashMap<Retainable, usize>,
    pub(crate) nodes_retained_by_zone: HashMap<RetentionZone, HashSet<NodeKey>>,
    pub(crate) retainables_to_check: IndexSet<Retainable>,
}

impl Retention {
    /// Current retain count.
    pub fn reference_count(&self, retainable: &Retainable) -> usize {
        self.reference_counts.get(retainable).copied().unwrap_or(0)
    }

    /// Nodes initialized in the store that list `zone`.
    pub fn nodes_in_zone(&self, zone: &RetentionZone) -> Option<&HashSet<NodeKey>> {
        self.nodes_retained_by_zone.get(zone)
    }

    /// Retainables waiting for the end of the current transaction.
    pub fn scheduled(&self) -> &IndexSet<Retainable> {
        &self.retainables_to_check
    }
}

/// Adjust a retain count by `delta`.
pub(crate) fn update_retain_count(store: &Store, retainable: &Retainable, delta: isize) {
    let release_now = {
        let mut state = store.state();
        let current = state.retention.reference_count(retainable);
        if delta < 0 && current == 0 {
            tracing::warn!(
                target: "recoverable_violation",
                retainable = ?retainable,
                "released a retain that was never taken"
            );
            return;
        }
        let count = current.saturating_add_signed(delta);
        if count > 0 {
            state
                .retention
                .reference_counts
                .insert(retainable.clone(), count);
            return;
        }
        state.retention.reference_counts.remove(retainable);
        state
            .retention
            .retainables_to_check
            .insert(retainable.clone());
        state.next_tree.is_none()
    };
    if release_now {
        release_scheduled_retainables(store);
    }
}

/// Release everything scheduled while a transaction was in progress.
pub(crate) fn release_scheduled_retainables(store: &Store) {
    let scheduled = std::mem::take(&mut store.state().retention.retainables_to_check);
    if !scheduled.is_empty() {
        release_retainables_now(store, scheduled);
    }
}

fn release_retainables_now(store: &Store, retainables: IndexSet<Retainable>) {
    if !store.config().retention_enabled || store.is_torn_down() {
        return;
    }
    let candidates: IndexSet<NodeKey> = {
        let state = store.state();
        retainables
            .iter()
            .flat_map(|retainable| match retainable {
                Retainable::Node(key) => vec![key.clone()],
                Retainable::Zone(zone) => state
                    .retention
                    .nodes_retained_by_zone
                    .get(zone)
                    .map(|nodes| {
                        let mut nodes: Vec<NodeKey> = nodes.iter().cloned().collect();
                        nodes.sort();
                        nodes
                    })
                    .unwrap_or_default(),
            })
            .collect()
    };

    let releasable = find_releasable(store, candidates);
    if !releasable.is_empty() {
        tracing::debug!(store = %store.id(), nodes = releasable.len(), "releasing nodes");
    }
    for key in &releasable {
        release_node(store, key);
    }
}

fn find_releasable(store: &Store, candidates: IndexSet<NodeKey>) -> IndexSet<NodeKey> {
    let registry = store.registry().clone();
    let state = store.state();
    let version = state.current_tree.version;

    let mut releasable: IndexSet<NodeKey> = IndexSet::new();
    let mut nonreleasable: HashSet<NodeKey> = HashSet::new();
    let mut roots = candidates;

    while !roots.is_empty() {
        let skip: HashSet<NodeKey> = releasable
            .iter()
            .chain(nonreleasable.iter())
            .cloned()
            .collect();
        let order = scheduler::children_before_parents(&state.graphs, version, &roots, &skip);

        let mut found: Vec<NodeKey> = Vec::new();
        for key in order {
            let retained_by = registry
                .get_maybe(&key)
                .map(|node| node.retained_by().clone())
                .unwrap_or_default();
            let keep = match &retained_by {
                RetainedBy::Root => true,
                RetainedBy::Components => false,
                RetainedBy::Zones(zones) => zones.iter().any(|zone| {
                    state
                        .retention
                        .reference_count(&Retainable::Zone(zone.clone()))
                        > 0
                }),
            } || state
                .retention
                .reference_count(&Retainable::Node(key.clone()))
                > 0
                || state
                    .graphs
                    .children_of_node(version, &key)
                    .iter()
                    .any(|child| nonreleasable.contains(child));

            if keep {
                nonreleasable.insert(key);
            } else {
                releasable.insert(key.clone());
                found.push(key);
            }
        }

        roots = found
            .iter()
            .flat_map(|key| state.graphs.parents_of_node(version, key))
            .filter(|parent| !releasable.contains(parent) && !nonreleasable.contains(parent))
            .collect();
    }

    releasable
}

/// Remove a node from the store: run its cleanups, then forget its value,
/// edges, memo, subscriptions and counts.
fn release_node(store: &Store, key: &NodeKey) {
    let cleanups = store
        .state()
        .node_cleanup_functions
        .remove(key)
        .unwrap_or_default();
    for cleanup in cleanups {
        cleanup();
    }

    {
        let mut state = store.state();
        state.known_atoms.remove(key);
        state.known_selectors.remove(key);
        state.node_transaction_subscriptions.remove(key);
        state
            .retention
            .reference_counts
            .remove(&Retainable::Node(key.clone()));
        for members in state.retention.nodes_retained_by_zone.values_mut() {
            members.remove(key);
        }
        state.current_tree.remove_node(key);
        let version = state.current_tree.version;
        state.graphs.remove_node(version, key);
        for memo in state.overlays.values_mut() {
            memo.remove(key);
        }
    }

    let Some(node) = store.registry().get_maybe(key) else {
        return;
    };
    match &node {
        Node::Atom(def) => def.invalidate(),
        Node::Selector(def) => {
            if !def.is_live() {
                def.clear_cache();
            }
        }
    }
    if node.should_delete_config_on_release() {
        tracing::debug!(key = %key, "dropping family member definition");
        store.registry().remove(key);
    }
    tracing::debug!(key = %key, store = %store.id(), "released node");
}

/// Keeps a node or zone retained until released or dropped.
pub struct RetainGuard {
    store: WeakStore,
    retainable: Retainable,
    released: bool,
}

impl RetainGuard {
    pub(crate) fn new(store: &Store, retainable: Retainable) -> Self {
        update_retain_count(store, &retainable, 1);
        Self {
            store: store.downgrade(),
            retainable,
            released: false,
        }
    }

    /// What this guard retains.
    pub fn retainable(&self) -> &Retainable {
        &self.retainable
    }

    /// Drop the retain now.
    pub fn release(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        if let Some(store) = self.store.upgrade() {
            update_retain_count(&store, &self.retainable, -1);
        }
    }
}

impl Drop for RetainGuard {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for RetainGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetainGuard")
            .field("retainable", &self.retainable)
            .field("released", &self.released)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Atom, AtomOptions, Registry, Selector, SelectorOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn known(store: &Store, key: &NodeKey) -> bool {
        store.get_state(|s| s.known_atoms().contains(key) || s.known_selectors().contains(key))
    }

    #[test]
    fn released_selectors_take_unretained_deps_with_them() {
        let registry = Registry::new();
        let base = Atom::new(&registry, AtomOptions::new("base", 1_i32));
        let reader = base.clone();
        let plus = Selector::new(
            &registry,
            SelectorOptions::new("plus", move |ctx| Ok(ctx.get(&reader)? + 1)),
        );
        let store = Store::new(&registry);

        let guard = store.retain(&plus);
        assert_eq!(store.get_value(&plus).ok(), Some(2));
        assert!(known(&store, plus.key()));
        assert!(known(&store, base.key()));

        guard.release();
        assert!(!known(&store, plus.key()));
        assert!(!known(&store, base.key()));
        assert!(store.graph(store.tree_versions().current).node_deps.is_empty());
    }

    #[test]
    fn retained_children_keep_parents() {
        let registry = Registry::new();
        let base = Atom::new(&registry, AtomOptions::new("base", 1_i32));
        let reader = base.clone();
        let plus = Selector::new(
            &registry,
            SelectorOptions::new("plus", move |ctx| Ok(ctx.get(&reader)? + 1)),
        );
        let store = Store::new(&registry);

        let selector_guard = store.retain(&plus);
        let atom_guard = store.retain(&base);
        store.get_value(&plus).ok();

        atom_guard.release();
        assert!(known(&store, base.key()));

        selector_guard.release();
        assert!(!known(&store, base.key()));
    }

    #[test]
    fn zones_keep_members_alive() {
        let registry = Registry::new();
        let zone = RetentionZone::new("panel");
        let atom = Atom::new(
            &registry,
            AtomOptions::new("in_zone", 0_i32).retained_by(RetainedBy::zone(zone.clone())),
        );
        let store = Store::new(&registry);

        let zone_guard = store.retain_zone(&zone);
        let node_guard = store.retain(&atom);
        store.set(&atom, 3).expect("set");
        node_guard.release();
        assert_eq!(store.get_value(&atom).ok(), Some(3));

        zone_guard.release();
        assert!(!known(&store, atom.key()));
        assert_eq!(store.get_value(&atom).ok(), Some(0));
    }

    #[test]
    fn root_nodes_are_never_released() {
        let registry = Registry::new();
        let atom = Atom::new(
            &registry,
            AtomOptions::new("forever", 0_i32).retained_by(RetainedBy::Root),
        );
        let store = Store::new(&registry);
        store.retain(&atom).release();
        store.set(&atom, 1).expect("set");
        store.retain(&atom).release();
        assert_eq!(store.get_value(&atom).ok(), Some(1));
    }

    #[test]
    fn release_waits_for_the_transaction_in_progress() {
        let registry = Registry::new();
        let atom = Atom::new(&registry, AtomOptions::new("a", 0_i32));
        let store = Store::new(&registry);
        let guard = store.retain(&atom);

        store.batch(|| {
            store.set(&atom, 1).expect("set");
            guard.release();
            assert!(store.get_state(|s| s.retention().scheduled().len()) == 1);
            assert!(known(&store, atom.key()));
        });
        assert!(!known(&store, atom.key()));
    }

    #[test]
    fn cleanups_run_on_release() {
        let registry = Registry::new();
        let cleaned = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cleaned);
        let atom = Atom::new(
            &registry,
            AtomOptions::new("with_cleanup", 0_i32).effect(move |_ctx| {
                let counter = Arc::clone(&counter);
                Ok(Some(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }) as crate::node::Cleanup))
            }),
        );
        let store = Store::new(&registry);
        let guard = store.retain(&atom);
        store.get_value(&atom).ok();
        assert_eq!(cleaned.load(Ordering::SeqCst), 0);
        guard.release();
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disabled_retention_keeps_everything() {
        let registry = Registry::new();
        let atom = Atom::new(&registry, AtomOptions::new("kept", 0_i32));
        let config = crate::StoreConfig {
            retention_enabled: false,
            ..Default::default()
        };
        let store = Store::with_config(&registry, config);
        store.get_value(&atom).ok();
        store.retain(&atom).release();
        assert!(known(&store, atom.key()));
    }
}
