//! Store
//!
//! A [`Store`] owns the mutable state of one root: the committed tree, the
//! tree of the transaction in progress, per-version dependency graphs,
//! per-version selector memos, subscriptions and retention bookkeeping.
//!
//! # Transactions
//!
//! Every write goes through [`Store::replace_state`]. The first write of a
//! transaction derives the *next* tree from the current one and forks the
//! current graph for it. When the outermost write (or [`Store::batch`])
//! finishes, the next tree is committed:
//!
//! 1. next becomes current and the old current is kept as *previous*;
//! 2. node subscriptions of everything downstream of the dirty atoms fire,
//!    dependencies first, then the global subscriptions;
//! 3. the previous tree's graph and memo are dropped;
//! 4. nodes whose retain count dropped to zero during the transaction are
//!    released.
//!
//! A transaction that changed nothing and carries no metadata commits
//! without notifying anyone.
//!
//! # Locking
//!
//! The state lives behind one mutex that is only ever held for
//! bookkeeping. Getters, setters, effects and subscription callbacks always
//! run with the lock released, so they are free to call back into the
//! store.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};

use super::snapshot::Snapshot;
use super::subscriber::{Subscription, SubscriptionId, TransactionCallback};
use super::tree::{TreeState, Version};
use crate::config::StoreConfig;
use crate::engine::{self, WriteEntry, WriteSet};
use crate::error::{Error, Interrupt, Result};
use crate::graph::{scheduler, GraphArena, GraphSnapshot};
use crate::loadable::{Loadable, Promise};
use crate::node::{Cleanup, Node, NodeKey, NodeRef, Registry, RetentionZone, Trigger, WritableNodeRef};
use crate::retention::{self, RetainGuard, Retainable, Retention};
use crate::value::{self, AnyValue, DefaultValue, NodeValue, WriteValue};

/// Unique identifier for a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId(u64);

impl StoreId {
    /// Generate a new unique store ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for StoreId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Versions of the trees a store currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeVersions {
    /// The committed tree.
    pub current: Version,
    /// The tree of the transaction in progress.
    pub next: Option<Version>,
    /// The tree replaced by the last commit, while its subscribers run.
    pub previous: Option<Version>,
}

/// Mutable state of one store.
pub struct StoreState {
    pub(crate) current_tree: TreeState,
    pub(crate) next_tree: Option<TreeState>,
    pub(crate) previous_tree: Option<TreeState>,
    pub(crate) commit_depth: usize,
    pub(crate) known_atoms: HashSet<NodeKey>,
    pub(crate) known_selectors: HashSet<NodeKey>,
    pub(crate) transaction_subscriptions: IndexMap<SubscriptionId, TransactionCallback>,
    pub(crate) node_transaction_subscriptions:
        HashMap<NodeKey, IndexMap<SubscriptionId, TransactionCallback>>,
    pub(crate) node_cleanup_functions: HashMap<NodeKey, Vec<Cleanup>>,
    pub(crate) retention: Retention,
    pub(crate) graphs: GraphArena,
    /// Selector results memoized per tree version.
    pub(crate) overlays: HashMap<Version, HashMap<NodeKey, Loadable<AnyValue>>>,
    /// Initial atom values written while an updater was running. They are
    /// merged into the updater's result so they survive the write.
    pub(crate) init_writes: Vec<(NodeKey, Loadable<AnyValue>)>,
}

impl StoreState {
    fn new(tree: TreeState, graphs: GraphArena) -> Self {
        Self {
            current_tree: tree,
            next_tree: None,
            previous_tree: None,
            commit_depth: 0,
            known_atoms: HashSet::new(),
            known_selectors: HashSet::new(),
            transaction_subscriptions: IndexMap::new(),
            node_transaction_subscriptions: HashMap::new(),
            node_cleanup_functions: HashMap::new(),
            retention: Retention::default(),
            graphs,
            overlays: HashMap::new(),
            init_writes: Vec::new(),
        }
    }

    /// The committed tree.
    pub fn current_tree(&self) -> &TreeState {
        &self.current_tree
    }

    /// The tree of the transaction in progress.
    pub fn next_tree(&self) -> Option<&TreeState> {
        self.next_tree.as_ref()
    }

    /// The tree replaced by the last commit, while it is still around.
    pub fn previous_tree(&self) -> Option<&TreeState> {
        self.previous_tree.as_ref()
    }

    /// Atoms initialized in this store.
    pub fn known_atoms(&self) -> &HashSet<NodeKey> {
        &self.known_atoms
    }

    /// Selectors initialized in this store.
    pub fn known_selectors(&self) -> &HashSet<NodeKey> {
        &self.known_selectors
    }

    /// Retain counts and zone membership.
    pub fn retention(&self) -> &Retention {
        &self.retention
    }

    /// Depth of nested batches.
    pub fn commit_depth(&self) -> usize {
        self.commit_depth
    }

    /// Number of tree versions with a live dependency graph.
    pub fn graph_version_count(&self) -> usize {
        self.graphs.version_count()
    }

    fn versions(&self) -> TreeVersions {
        TreeVersions {
            current: self.current_tree.version,
            next: self.next_tree.as_ref().map(|t| t.version),
            previous: self.previous_tree.as_ref().map(|t| t.version),
        }
    }

    fn is_live_version(&self, version: Version) -> bool {
        let versions = self.versions();
        version == versions.current
            || Some(version) == versions.next
            || Some(version) == versions.previous
    }

    fn tree_mut(&mut self, version: Version) -> Option<&mut TreeState> {
        if self.current_tree.version == version {
            Some(&mut self.current_tree)
        } else if self.next_tree.as_ref().map(|t| t.version) == Some(version) {
            self.next_tree.as_mut()
        } else {
            self.previous_tree.as_mut().filter(|t| t.version == version)
        }
    }

    fn tree(&self, version: Version) -> Option<&TreeState> {
        [Some(&self.current_tree), self.next_tree.as_ref(), self.previous_tree.as_ref()]
            .into_iter()
            .flatten()
            .find(|t| t.version == version)
    }
}

impl fmt::Debug for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreState")
            .field("versions", &self.versions())
            .field("commit_depth", &self.commit_depth)
            .field("known_atoms", &self.known_atoms.len())
            .field("known_selectors", &self.known_selectors.len())
            .field("subscriptions", &self.transaction_subscriptions.len())
            .finish()
    }
}

pub(crate) struct StoreInner {
    id: StoreId,
    registry: Registry,
    config: StoreConfig,
    state: Mutex<StoreState>,
    updating: AtomicBool,
    torn_down: AtomicBool,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let cleanups: Vec<Cleanup> = self
            .state
            .get_mut()
            .node_cleanup_functions
            .drain()
            .flat_map(|(_, cleanups)| cleanups)
            .collect();
        for cleanup in cleanups {
            cleanup();
        }
    }
}

/// Handle to a store. Clones share the same state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

/// Non-owning store handle, held by async continuations and subscriptions.
#[derive(Clone)]
pub struct WeakStore(Weak<StoreInner>);

impl WeakStore {
    /// The store, if it is still alive.
    pub fn upgrade(&self) -> Option<Store> {
        self.0.upgrade().map(|inner| Store { inner })
    }

    /// Whether both handles point at the same store.
    pub fn same_store(&self, other: &WeakStore) -> bool {
        Weak::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for WeakStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(store) => write!(f, "WeakStore({})", store.id()),
            None => write!(f, "WeakStore(<dropped>)"),
        }
    }
}

/// Clears the reentrancy flag when an updater finishes, even on panic.
struct UpdatingFlag<'a>(&'a AtomicBool);

impl<'a> UpdatingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Result<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            return Err(Error::ReentrantWrite);
        }
        Ok(Self(flag))
    }
}

impl Drop for UpdatingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One level of [`Store::batch`].
struct BatchScope<'a>(&'a Store);

impl<'a> BatchScope<'a> {
    fn enter(store: &'a Store) -> Self {
        store.state().commit_depth += 1;
        Self(store)
    }
}

impl Drop for BatchScope<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state();
        state.commit_depth = state.commit_depth.saturating_sub(1);
    }
}

impl Store {
    /// Create a store with the default configuration.
    pub fn new(registry: &Registry) -> Self {
        Self::with_config(registry, StoreConfig::default())
    }

    /// Create a store.
    pub fn with_config(registry: &Registry, config: StoreConfig) -> Self {
        let tree = TreeState::new();
        let mut graphs = GraphArena::new(config.graph_compaction_depth);
        graphs.ensure(tree.version);
        Self::from_parts(registry, config, StoreState::new(tree, graphs))
    }

    fn from_parts(registry: &Registry, config: StoreConfig, state: StoreState) -> Self {
        let store = Self {
            inner: Arc::new(StoreInner {
                id: StoreId::new(),
                registry: registry.clone(),
                config,
                state: Mutex::new(state),
                updating: AtomicBool::new(false),
                torn_down: AtomicBool::new(false),
            }),
        };
        tracing::debug!(store = %store.id(), "created store");
        store
    }

    /// A private store starting from a copy of `tree`, used by snapshots.
    ///
    /// Nodes known to `parent` stay known so their effects do not run
    /// again, and the dependency graph of `tree` is carried over.
    pub(crate) fn for_snapshot(parent: &Store, tree: &TreeState) -> Self {
        let graph = parent.graph(tree.version);
        let tree = tree.clone_for_snapshot();
        let config = StoreConfig {
            retention_enabled: false,
            ..parent.config().clone()
        };
        let mut graphs = GraphArena::new(config.graph_compaction_depth);
        graphs.seed(tree.version, &graph);

        let (known_atoms, known_selectors) =
            parent.get_state(|s| (s.known_atoms.clone(), s.known_selectors.clone()));
        let mut state = StoreState::new(tree, graphs);
        state.known_atoms = known_atoms;
        state.known_selectors = known_selectors;

        let store = Self::from_parts(parent.registry(), config, state);
        let copied: Vec<NodeKey> = store.get_state(|s| {
            s.known_atoms
                .iter()
                .chain(s.known_selectors.iter())
                .cloned()
                .collect()
        });
        for key in copied {
            let Some(node) = store.registry().get_maybe(&key) else {
                continue;
            };
            let cleanup: Cleanup = match node {
                Node::Atom(def) => {
                    def.attach_store();
                    Box::new(move || def.detach_store())
                }
                Node::Selector(def) => {
                    def.attach_store();
                    let id = store.id();
                    Box::new(move || def.detach_store(id))
                }
            };
            store.add_cleanup(&key, cleanup);
        }
        store
    }

    /// The store's ID.
    pub fn id(&self) -> StoreId {
        self.inner.id
    }

    /// The registry nodes are looked up in.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// The store's configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// A non-owning handle.
    pub fn downgrade(&self) -> WeakStore {
        WeakStore(Arc::downgrade(&self.inner))
    }

    /// Whether [`Store::teardown`] ran.
    pub fn is_torn_down(&self) -> bool {
        self.inner.torn_down.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner.state.lock()
    }

    /// Inspect the store state. `f` must not call back into the store.
    pub fn get_state<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        f(&self.state())
    }

    /// The dependency graph of `version`.
    pub fn graph(&self, version: Version) -> GraphSnapshot {
        self.state().graphs.snapshot(version)
    }

    pub(crate) fn with_graph<R>(&self, f: impl FnOnce(&GraphArena) -> R) -> R {
        f(&self.state().graphs)
    }

    /// The committed tree.
    pub fn current_tree(&self) -> TreeState {
        self.state().current_tree.clone()
    }

    /// The tree replaced by the last commit, while it is still around.
    pub fn previous_tree(&self) -> Option<TreeState> {
        self.state().previous_tree.clone()
    }

    /// The tree of the transaction in progress, or the committed tree.
    pub fn latest_tree(&self) -> TreeState {
        let state = self.state();
        state
            .next_tree
            .clone()
            .unwrap_or_else(|| state.current_tree.clone())
    }

    /// Versions of the trees the store holds.
    pub fn tree_versions(&self) -> TreeVersions {
        self.state().versions()
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    /// Run `updater` on the tree of the transaction in progress and store
    /// its result.
    ///
    /// Commits right away unless called inside [`Store::batch`]. Fails with
    /// [`Error::ReentrantWrite`] when called while another updater runs.
    pub fn replace_state<F>(&self, updater: F) -> Result<()>
    where
        F: FnOnce(TreeState) -> Result<TreeState>,
    {
        let outcome = {
            let _updating = UpdatingFlag::raise(&self.inner.updating)?;
            let next = self.start_next_tree_if_needed();
            updater(next)
        };

        let (result, updated) = match outcome {
            Ok(tree) => (Ok(()), Some(tree)),
            Err(err) => (Err(err), None),
        };
        let commit = {
            let mut state = self.state();
            let init_writes = std::mem::take(&mut state.init_writes);
            if let Some(mut tree) = updated {
                for (key, loadable) in init_writes {
                    if !tree.dirty_atoms.contains(&key) {
                        tree.atom_values.insert(key, loadable);
                    }
                }
                state.next_tree = Some(tree);
            }
            state.commit_depth == 0
        };
        if commit {
            self.end_transaction();
        }
        result
    }

    fn start_next_tree_if_needed(&self) -> TreeState {
        let mut state = self.state();
        if let Some(next) = &state.next_tree {
            return next.clone();
        }
        let next = state.current_tree.derive();
        let current = state.current_tree.version;
        state.graphs.fork(current, next.version);
        state.next_tree = Some(next.clone());
        tracing::trace!(store = %self.id(), base = current, version = next.version, "started transaction");
        next
    }

    fn end_transaction(&self) {
        let (callbacks, released_version) = {
            let mut state = self.state();
            let Some(next) = state.next_tree.take() else {
                return;
            };
            let quiet = next.dirty_atoms.is_empty() && next.transaction_metadata.is_empty();
            let committed = next.version;
            let dirty = next.dirty_atoms.len();
            let previous = std::mem::replace(&mut state.current_tree, next);
            let previous_version = previous.version;

            if quiet {
                state.graphs.release(previous_version);
                state.overlays.remove(&previous_version);
                tracing::trace!(store = %self.id(), version = committed, "committed empty transaction");
                (Vec::new(), None)
            } else {
                state.previous_tree = Some(previous);
                let downstream = scheduler::downstream_nodes(
                    &state.graphs,
                    committed,
                    state.current_tree.dirty_atoms.iter(),
                );
                let order = scheduler::topological_sort(&state.graphs, committed, &downstream);
                let mut callbacks: Vec<TransactionCallback> = Vec::new();
                for key in &order {
                    if let Some(subscriptions) = state.node_transaction_subscriptions.get(key) {
                        callbacks.extend(subscriptions.values().cloned());
                    }
                }
                callbacks.extend(state.transaction_subscriptions.values().cloned());
                tracing::debug!(
                    store = %self.id(),
                    version = committed,
                    dirty,
                    downstream = downstream.len(),
                    subscribers = callbacks.len(),
                    "transaction committed"
                );
                (callbacks, Some(previous_version))
            }
        };

        for callback in callbacks {
            callback(self);
        }

        if let Some(version) = released_version {
            let mut state = self.state();
            state.graphs.release(version);
            state.overlays.remove(&version);
            // A transaction committed by a subscriber may already have
            // replaced the previous tree.
            if state.previous_tree.as_ref().map(|t| t.version) == Some(version) {
                state.previous_tree = None;
            }
        }

        retention::release_scheduled_retainables(self);
    }

    /// Run `f` with every write it makes coalesced into one transaction.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let result = {
            let _scope = BatchScope::enter(self);
            f()
        };
        let pending = {
            let state = self.state();
            state.commit_depth == 0 && state.next_tree.is_some()
        };
        if pending {
            self.end_transaction();
        }
        result
    }

    /// Attach metadata to the next transaction that commits.
    pub fn add_transaction_metadata(&self, metadata: IndexMap<String, serde_json::Value>) {
        self.start_next_tree_if_needed();
        if let Some(next) = self.state().next_tree.as_mut() {
            next.transaction_metadata.extend(metadata);
        }
    }

    /// Mark a node as changed so its subscribers are notified and its
    /// dependents re-evaluate.
    pub fn mark_modified(&self, key: &NodeKey) -> Result<()> {
        self.replace_state(|mut tree| {
            tree.dirty_atoms.insert(key.clone());
            engine::invalidate_downstream(self, &tree);
            Ok(tree)
        })
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Read a node by key.
    pub fn get_loadable_by_key(&self, key: &NodeKey) -> Result<Loadable<AnyValue>> {
        let tree = self.latest_tree();
        engine::get_node_loadable(self, &tree, key)
    }

    /// Read a node by key without evaluating or initializing anything.
    pub fn peek_loadable_by_key(&self, key: &NodeKey) -> Result<Option<Loadable<AnyValue>>> {
        let tree = self.latest_tree();
        engine::peek_node_loadable(self, &tree, key)
    }

    /// Read a node.
    pub fn get_loadable<T, N>(&self, node: &N) -> Result<Loadable<T>>
    where
        T: NodeValue + Clone,
        N: NodeRef<T> + ?Sized,
    {
        let key = node.key();
        Ok(self.get_loadable_by_key(key)?.downcast(key))
    }

    /// Read a node's value. Fails with [`Interrupt::Pending`] while it is
    /// loading.
    pub fn get_value<T, N>(&self, node: &N) -> Result<T, Interrupt>
    where
        T: NodeValue + Clone,
        N: NodeRef<T> + ?Sized,
    {
        self.get_loadable(node)?.value()
    }

    /// A promise for a node's value.
    pub fn get_promise<T, N>(&self, node: &N) -> Result<Promise<T>>
    where
        T: NodeValue + Clone,
        N: NodeRef<T> + ?Sized,
    {
        Ok(self.get_loadable(node)?.to_promise())
    }

    /// Read a node's stored or cached value without evaluating it.
    pub fn peek_loadable<T, N>(&self, node: &N) -> Result<Option<Loadable<T>>>
    where
        T: NodeValue + Clone,
        N: NodeRef<T> + ?Sized,
    {
        let key = node.key();
        Ok(self.peek_loadable_by_key(key)?.map(|l| l.downcast(key)))
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Write a node by key.
    pub fn set_by_key(&self, key: &NodeKey, write: WriteValue<AnyValue>) -> Result<()> {
        self.replace_state(|mut tree| {
            let writes = engine::set_node_value(self, &tree, key, write)?;
            engine::apply_writes(&mut tree, writes);
            engine::invalidate_downstream(self, &tree);
            Ok(tree)
        })
    }

    /// Reset a node by key.
    pub fn reset_by_key(&self, key: &NodeKey) -> Result<()> {
        self.set_by_key(key, WriteValue::Reset(DefaultValue))
    }

    /// Write a loadable by key. Only atoms can hold an error or a pending
    /// promise.
    pub fn set_loadable_by_key(&self, key: &NodeKey, loadable: Loadable<AnyValue>) -> Result<()> {
        let loadable = match loadable {
            Loadable::Value(value) => return self.set_by_key(key, WriteValue::Value(value)),
            other => other,
        };
        let node = self.registry().get(key)?;
        let Node::Atom(def) = &node else {
            return Err(Error::msg(format!(
                "only atoms can be set to an error or a loading value, `{}` is a selector",
                key
            )));
        };
        self.replace_state(|mut tree| {
            engine::initialize_node(self, &tree, &node, Trigger::Set);
            def.invalidate();
            let mut writes = WriteSet::new();
            writes.insert(key.clone(), WriteEntry::Set(loadable));
            engine::apply_writes(&mut tree, writes);
            engine::invalidate_downstream(self, &tree);
            Ok(tree)
        })
    }

    /// Set a node's value.
    pub fn set<T, N>(&self, node: &N, value: T) -> Result<()>
    where
        T: NodeValue + Clone,
        N: WritableNodeRef<T> + ?Sized,
    {
        self.set_by_key(node.key(), WriteValue::Value(value::erase(value)))
    }

    /// Reset a node to its default.
    pub fn reset<T, N>(&self, node: &N) -> Result<()>
    where
        N: WritableNodeRef<T> + ?Sized,
    {
        self.reset_by_key(node.key())
    }

    /// Set a node to a loadable.
    pub fn set_loadable<T, N>(&self, node: &N, loadable: Loadable<T>) -> Result<()>
    where
        T: NodeValue + Clone,
        N: WritableNodeRef<T> + ?Sized,
    {
        self.set_loadable_by_key(node.key(), loadable.into_any())
    }

    /// Replace a node's value with `update(old)`.
    ///
    /// Fails with [`Error::StillLoading`] while the node is loading and
    /// with the node's error if it holds one.
    pub fn update<T, N, F>(&self, node: &N, update: F) -> Result<()>
    where
        T: NodeValue + Clone,
        N: WritableNodeRef<T> + ?Sized,
        F: FnOnce(T) -> T,
    {
        let key = node.key();
        self.replace_state(|mut tree| {
            let old = match engine::get_node_loadable(self, &tree, key)? {
                Loadable::Value(v) => value::downcast::<T>(key, &v)?,
                Loadable::Error(e) => return Err(e),
                Loadable::Loading(_) => return Err(Error::StillLoading(key.clone())),
            };
            let write = WriteValue::Value(value::erase(update(old)));
            let writes = engine::set_node_value(self, &tree, key, write)?;
            engine::apply_writes(&mut tree, writes);
            engine::invalidate_downstream(self, &tree);
            Ok(tree)
        })
    }

    /// Drop a selector's cached results so the next read evaluates it
    /// again. Atoms are left alone.
    pub fn refresh<T, N>(&self, node: &N) -> Result<()>
    where
        N: NodeRef<T> + ?Sized,
    {
        let key = node.key();
        let Node::Selector(def) = self.registry().get(key)? else {
            return Ok(());
        };
        def.clear_cache();
        def.executions.clear(self.id());
        self.overlay_remove_key(key);
        tracing::debug!(key = %key, store = %self.id(), "refreshed selector");
        self.mark_modified(key)
    }

    /// Restore raw persisted values. They are validated by each atom's
    /// persistence settings when first read.
    pub fn restore_raw<I>(&self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (NodeKey, serde_json::Value)>,
    {
        self.replace_state(|mut tree| {
            for (key, raw) in values {
                tree.atom_values.remove(&key);
                tree.nonvalidated_atoms.insert(key.clone(), raw);
                tree.dirty_atoms.insert(key);
            }
            engine::invalidate_downstream(self, &tree);
            Ok(tree)
        })
    }

    // ------------------------------------------------------------------------
    // Subscriptions and retention
    // ------------------------------------------------------------------------

    /// Call `callback` after every transaction that committed changes. With
    /// a node key, only after transactions that changed something the node
    /// depends on.
    pub fn subscribe_to_transactions<F>(&self, callback: F, node: Option<NodeKey>) -> Subscription
    where
        F: Fn(&Store) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        let callback: TransactionCallback = Arc::new(callback);
        {
            let mut state = self.state();
            match &node {
                Some(key) => {
                    state
                        .node_transaction_subscriptions
                        .entry(key.clone())
                        .or_default()
                        .insert(id, callback);
                }
                None => {
                    state.transaction_subscriptions.insert(id, callback);
                }
            }
        }
        Subscription::new(id, self.downgrade(), node)
    }

    /// Subscribe to a node, keeping it retained while subscribed.
    pub fn subscribe<T, N, F>(&self, node: &N, callback: F) -> Subscription
    where
        N: NodeRef<T> + ?Sized,
        F: Fn(&Store) + Send + Sync + 'static,
    {
        let guard = self.retain(node);
        self.subscribe_to_transactions(callback, Some(node.key().clone()))
            .with_retain(guard)
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId, node: Option<&NodeKey>) {
        let removed = {
            let mut state = self.state();
            match node {
                Some(key) => {
                    let removed = state
                        .node_transaction_subscriptions
                        .get_mut(key)
                        .and_then(|subscriptions| subscriptions.shift_remove(&id))
                        .is_some();
                    if state
                        .node_transaction_subscriptions
                        .get(key)
                        .map(|s| s.is_empty())
                        .unwrap_or(false)
                    {
                        state.node_transaction_subscriptions.remove(key);
                    }
                    removed
                }
                None => state.transaction_subscriptions.shift_remove(&id).is_some(),
            }
        };
        if !removed {
            tracing::warn!(
                target: "recoverable_violation",
                subscription = ?id,
                node = ?node,
                "released a subscription that was not registered"
            );
        }
    }

    /// Keep a node alive until the guard is released.
    pub fn retain<T, N>(&self, node: &N) -> RetainGuard
    where
        N: NodeRef<T> + ?Sized,
    {
        RetainGuard::new(self, Retainable::Node(node.key().clone()))
    }

    /// Keep every node retained by `zone` alive until the guard is released.
    pub fn retain_zone(&self, zone: &RetentionZone) -> RetainGuard {
        RetainGuard::new(self, Retainable::Zone(zone.clone()))
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    /// A snapshot of the latest tree.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self, &self.latest_tree())
    }

    /// Make the store's atoms match `snapshot`. Only atoms whose value
    /// differs are written; the store takes over the snapshot's state id.
    pub fn goto_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let target = snapshot.tree();
        self.replace_state(|mut tree| {
            let keys: HashSet<NodeKey> = tree
                .atom_values
                .keys()
                .chain(target.atom_values.keys())
                .cloned()
                .collect();
            let mut writes = WriteSet::new();
            for key in keys {
                let ours = tree.atom_values.get(&key);
                let theirs = target.atom_values.get(&key);
                let same = match (ours, theirs) {
                    (Some(a), Some(b)) => a.same_as(b),
                    (None, None) => true,
                    _ => false,
                };
                if !same {
                    let entry = theirs.cloned().map(WriteEntry::Set).unwrap_or(WriteEntry::Reset);
                    writes.insert(key, entry);
                }
            }

            let raw_changed: Vec<NodeKey> = tree
                .nonvalidated_atoms
                .keys()
                .chain(target.nonvalidated_atoms.keys())
                .filter(|key| tree.nonvalidated_atoms.get(key) != target.nonvalidated_atoms.get(key))
                .cloned()
                .collect();

            tracing::debug!(
                store = %self.id(),
                state_id = target.state_id,
                writes = writes.len(),
                "going to snapshot"
            );
            engine::apply_writes(&mut tree, writes);
            tree.nonvalidated_atoms = target.nonvalidated_atoms.clone();
            tree.dirty_atoms.extend(raw_changed);
            engine::invalidate_downstream(self, &tree);
            tree.state_id = target.state_id;
            Ok(tree)
        })
    }

    /// Run every node cleanup and stop using this store's nodes. Async
    /// results settling afterwards are discarded.
    pub fn teardown(&self) {
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let cleanups: Vec<Cleanup> = {
            let mut state = self.state();
            state.known_atoms.clear();
            state.known_selectors.clear();
            state.overlays.clear();
            state
                .node_cleanup_functions
                .drain()
                .flat_map(|(_, cleanups)| cleanups)
                .collect()
        };
        tracing::debug!(store = %self.id(), cleanups = cleanups.len(), "tearing down store");
        for cleanup in cleanups {
            cleanup();
        }
    }

    // ------------------------------------------------------------------------
    // Engine bookkeeping
    // ------------------------------------------------------------------------

    /// Record that `node` is in use. Returns `true` the first time, which is
    /// when the node has to be initialized.
    pub(crate) fn mark_known(&self, node: &Node) -> bool {
        if self.is_torn_down() {
            return false;
        }
        let mut state = self.state();
        let key = node.key().clone();
        let inserted = match node {
            Node::Atom(_) => state.known_atoms.insert(key.clone()),
            Node::Selector(_) => state.known_selectors.insert(key.clone()),
        };
        if inserted {
            for zone in node.retained_by().zones() {
                state
                    .retention
                    .nodes_retained_by_zone
                    .entry(zone.clone())
                    .or_default()
                    .insert(key.clone());
            }
        }
        inserted
    }

    /// Run `cleanup` when the node is released or the store torn down.
    pub(crate) fn add_cleanup(&self, key: &NodeKey, cleanup: Cleanup) {
        self.state()
            .node_cleanup_functions
            .entry(key.clone())
            .or_default()
            .push(cleanup);
    }

    /// Save the dependencies of `key` read in `version`.
    ///
    /// Writing the previous or current version also updates the newer
    /// graphs, as long as they still agree with the old dependencies.
    pub(crate) fn save_deps(&self, key: &NodeKey, deps: HashSet<NodeKey>, version: Version) {
        let mut state = self.state();
        if !state.is_live_version(version) {
            tracing::warn!(
                target: "recoverable_violation",
                key = %key,
                version,
                "tried to save dependencies to a discarded tree"
            );
            return;
        }
        let versions = state.versions();
        let old = state.graphs.parents_of_node(version, key);
        state.graphs.set_parents_of_node(version, key, deps.clone());

        let mut newer: Vec<Version> = Vec::new();
        if Some(version) == versions.previous {
            newer.push(versions.current);
        }
        if Some(version) == versions.previous || version == versions.current {
            newer.extend(versions.next);
        }
        for target in newer {
            if state.graphs.parents_of_node(target, key) == old {
                state.graphs.set_parents_of_node(target, key, deps.clone());
            }
        }
        tracing::trace!(key = %key, version, deps = deps.len(), "saved dependencies");
    }

    pub(crate) fn overlay_get(&self, version: Version, key: &NodeKey) -> Option<Loadable<AnyValue>> {
        self.state().overlays.get(&version)?.get(key).cloned()
    }

    pub(crate) fn overlay_set(&self, version: Version, key: &NodeKey, loadable: Loadable<AnyValue>) {
        let mut state = self.state();
        if state.is_live_version(version) {
            state
                .overlays
                .entry(version)
                .or_default()
                .insert(key.clone(), loadable);
        }
    }

    pub(crate) fn overlay_invalidate<'a, I>(&self, version: Version, keys: I)
    where
        I: IntoIterator<Item = &'a NodeKey>,
    {
        let mut state = self.state();
        if let Some(memo) = state.overlays.get_mut(&version) {
            for key in keys {
                memo.remove(key);
            }
        }
    }

    pub(crate) fn overlay_remove_key(&self, key: &NodeKey) {
        for memo in self.state().overlays.values_mut() {
            memo.remove(key);
        }
    }

    /// An atom's stored value in whichever live tree has `version`.
    pub(crate) fn canonical_atom_value(&self, version: Version, key: &NodeKey) -> Option<Loadable<AnyValue>> {
        self.state().tree(version)?.atom_values.get(key).cloned()
    }

    /// Write an atom's initial value into the tree being read and into the
    /// transaction in progress, unless they already hold one.
    pub(crate) fn write_initial_atom_value(&self, version: Version, key: &NodeKey, loadable: Loadable<AnyValue>) {
        let mut state = self.state();
        if let Some(tree) = state.tree_mut(version) {
            if !tree.atom_values.contains_key(key) {
                tree.atom_values.insert(key.clone(), loadable.clone());
            }
        }
        if let Some(next) = state.next_tree.as_mut() {
            if !next.atom_values.contains_key(key) {
                next.atom_values.insert(key.clone(), loadable.clone());
            }
        }
        if self.inner.updating.load(Ordering::SeqCst) {
            state.init_writes.push((key.clone(), loadable));
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Store");
        out.field("id", &self.inner.id);
        if let Some(state) = self.inner.state.try_lock() {
            out.field("state", &*state);
        }
        out.finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Atom, AtomOptions, Selector, SelectorOptions};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn store_ids_are_unique() {
        assert_ne!(StoreId::new(), StoreId::new());
    }

    #[test]
    fn writes_commit_and_keep_one_graph_per_live_tree() {
        let registry = Registry::new();
        let count = Atom::new(&registry, AtomOptions::new("count", 0_i32));
        let store = Store::new(&registry);

        let before = store.tree_versions();
        store.set(&count, 5).expect("set");
        let after = store.tree_versions();

        assert_ne!(before.current, after.current);
        assert_eq!(after.next, None);
        assert_eq!(after.previous, None);
        assert_eq!(store.get_state(|s| s.graph_version_count()), 1);
        assert_eq!(store.get_value(&count).ok(), Some(5));
    }

    #[test]
    fn empty_transactions_commit_quietly() {
        let registry = Registry::new();
        let store = Store::new(&registry);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let _sub = store.subscribe_to_transactions(
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );

        store.replace_state(Ok).expect("replace");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn updaters_cannot_write_reentrantly() {
        let registry = Registry::new();
        let count = Atom::new(&registry, AtomOptions::new("count", 0_i32));
        let store = Store::new(&registry);

        let inner = store.clone();
        let nested = count.clone();
        let result = store.replace_state(move |tree| {
            let err = inner.set(&nested, 1).err();
            assert!(matches!(err, Some(Error::ReentrantWrite)));
            Ok(tree)
        });
        assert!(result.is_ok());
        assert_eq!(store.get_value(&count).ok(), Some(0));
    }

    #[test]
    fn batches_coalesce_notifications() {
        let registry = Registry::new();
        let a = Atom::new(&registry, AtomOptions::new("a", 0_i32));
        let b = Atom::new(&registry, AtomOptions::new("b", 0_i32));
        let store = Store::new(&registry);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let _sub = store.subscribe_to_transactions(
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );

        store.batch(|| {
            store.set(&a, 1).expect("set a");
            store.set(&b, 2).expect("set b");
            store.batch(|| store.set(&a, 3).expect("nested set"));
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_value(&a).ok(), Some(3));
        assert_eq!(store.get_value(&b).ok(), Some(2));
    }

    #[test]
    fn node_subscriptions_fire_for_downstream_changes_only() {
        let registry = Registry::new();
        let a = Atom::new(&registry, AtomOptions::new("a", 1_i32));
        let other = Atom::new(&registry, AtomOptions::new("other", 0_i32));
        let reader = a.clone();
        let double = Selector::new(
            &registry,
            SelectorOptions::new("double", move |ctx| Ok(ctx.get(&reader)? * 2)),
        );
        let store = Store::new(&registry);
        assert_eq!(store.get_value(&double).ok(), Some(2));

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let _sub = store.subscribe(&double, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        store.set(&other, 1).expect("set other");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        store.set(&a, 2).expect("set a");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_value(&double).ok(), Some(4));
    }

    #[test]
    fn updates_fail_on_loading_values() {
        let registry = Registry::new();
        let (pending, _resolver) = Promise::<i32>::pending();
        let slow = Atom::new(&registry, AtomOptions::with_promise("slow", pending));
        let store = Store::new(&registry);

        let err = store.update(&slow, |n| n + 1).err();
        assert!(matches!(err, Some(Error::StillLoading(_))));
    }

    #[test]
    fn metadata_rides_on_the_next_commit() {
        let registry = Registry::new();
        let a = Atom::new(&registry, AtomOptions::new("a", 0_i32));
        let store = Store::new(&registry);
        let mut metadata = IndexMap::new();
        metadata.insert("source".to_string(), serde_json::json!("test"));
        store.add_transaction_metadata(metadata);
        store.set(&a, 1).expect("set");

        let tree = store.current_tree();
        assert_eq!(
            tree.transaction_metadata().get("source"),
            Some(&serde_json::json!("test"))
        );
    }
}
