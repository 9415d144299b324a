//! Tree State
//!
//! A [`TreeState`] is one immutable snapshot of every atom value at a given
//! transaction version. Transactions derive a new tree from the current
//! one; the maps are shared until written (`Arc::make_mut`), so deriving a
//! tree is cheap and older trees are never disturbed.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::loadable::Loadable;
use crate::node::NodeKey;
use crate::value::AnyValue;

/// Tree version. Every derived tree gets a fresh one.
pub type Version = u64;

/// Identity of a rendered state. Unlike the version, it is reused when a
/// store goes back to a previously visited snapshot.
pub type StateId = u64;

static VERSION_COUNTER: AtomicU64 = AtomicU64::new(0);
static STATE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Allocate a fresh version.
pub(crate) fn next_version() -> Version {
    VERSION_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Allocate a fresh state id.
pub(crate) fn next_state_id() -> StateId {
    STATE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Copy-on-write map.
#[derive(Debug)]
pub struct PersistentMap<K, V>(Arc<HashMap<K, V>>);

impl<K, V> Clone for PersistentMap<K, V> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<K, V> Default for PersistentMap<K, V> {
    fn default() -> Self {
        Self(Arc::new(HashMap::new()))
    }
}

impl<K, V> PersistentMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Look up a key.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.0.get(key)
    }

    /// Whether the key is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.0.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate entries.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.0.iter()
    }

    /// Iterate keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.0.keys()
    }

    pub(crate) fn insert(&mut self, key: K, value: V) {
        Arc::make_mut(&mut self.0).insert(key, value);
    }

    pub(crate) fn remove(&mut self, key: &K) -> Option<V> {
        if self.0.contains_key(key) {
            Arc::make_mut(&mut self.0).remove(key)
        } else {
            None
        }
    }

    /// Whether both maps share the same storage.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Snapshot of atom values at one version.
#[derive(Debug, Clone)]
pub struct TreeState {
    pub(crate) version: Version,
    pub(crate) state_id: StateId,
    pub(crate) transaction_metadata: IndexMap<String, serde_json::Value>,
    pub(crate) dirty_atoms: HashSet<NodeKey>,
    pub(crate) atom_values: PersistentMap<NodeKey, Loadable<AnyValue>>,
    pub(crate) nonvalidated_atoms: PersistentMap<NodeKey, serde_json::Value>,
}

impl TreeState {
    /// An empty tree with a fresh version and state id.
    pub fn new() -> Self {
        let version = next_version();
        Self {
            version,
            state_id: next_state_id(),
            transaction_metadata: IndexMap::new(),
            dirty_atoms: HashSet::new(),
            atom_values: PersistentMap::default(),
            nonvalidated_atoms: PersistentMap::default(),
        }
    }

    /// Version of this tree.
    pub fn version(&self) -> Version {
        self.version
    }

    /// State id of this tree.
    pub fn state_id(&self) -> StateId {
        self.state_id
    }

    /// Explicitly stored atom values.
    pub fn atom_values(&self) -> &PersistentMap<NodeKey, Loadable<AnyValue>> {
        &self.atom_values
    }

    /// Raw restored values still waiting for validation.
    pub fn nonvalidated_atoms(&self) -> &PersistentMap<NodeKey, serde_json::Value> {
        &self.nonvalidated_atoms
    }

    /// Atoms written in the transaction that produced this tree.
    pub fn dirty_atoms(&self) -> &HashSet<NodeKey> {
        &self.dirty_atoms
    }

    /// Metadata attached to the transaction that produced this tree.
    pub fn transaction_metadata(&self) -> &IndexMap<String, serde_json::Value> {
        &self.transaction_metadata
    }

    /// Derive the starting tree of a new transaction.
    pub(crate) fn derive(&self) -> TreeState {
        Self {
            version: next_version(),
            state_id: next_state_id(),
            transaction_metadata: IndexMap::new(),
            dirty_atoms: HashSet::new(),
            atom_values: self.atom_values.clone(),
            nonvalidated_atoms: self.nonvalidated_atoms.clone(),
        }
    }

    /// Copy of this tree under a fresh version, keeping its state id.
    pub(crate) fn clone_for_snapshot(&self) -> TreeState {
        Self {
            version: next_version(),
            state_id: self.state_id,
            transaction_metadata: self.transaction_metadata.clone(),
            dirty_atoms: self.dirty_atoms.clone(),
            atom_values: self.atom_values.clone(),
            nonvalidated_atoms: self.nonvalidated_atoms.clone(),
        }
    }

    /// Forget everything stored for `key`.
    pub(crate) fn remove_node(&mut self, key: &NodeKey) {
        self.atom_values.remove(key);
        self.nonvalidated_atoms.remove(key);
        self.dirty_atoms.remove(key);
    }
}

impl Default for TreeState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::erase;

    #[test]
    fn derived_trees_share_until_written() {
        let mut base = TreeState::new();
        base.atom_values
            .insert(NodeKey::from("a"), Loadable::Value(erase(1_i32)));

        let mut next = base.derive();
        assert!(next.atom_values.ptr_eq(&base.atom_values));
        assert_ne!(next.version(), base.version());
        assert_ne!(next.state_id(), base.state_id());

        next.atom_values
            .insert(NodeKey::from("b"), Loadable::Value(erase(2_i32)));
        assert!(!next.atom_values.ptr_eq(&base.atom_values));
        assert_eq!(base.atom_values().len(), 1);
        assert_eq!(next.atom_values().len(), 2);
    }

    #[test]
    fn snapshot_copies_keep_state_id() {
        let tree = TreeState::new();
        let copy = tree.clone_for_snapshot();
        assert_eq!(copy.state_id(), tree.state_id());
        assert_ne!(copy.version(), tree.version());
    }
}
