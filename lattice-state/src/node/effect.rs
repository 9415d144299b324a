//! Atom Effects
//!
//! An effect is a callback attached to an atom that runs when the atom is
//! first used in a store. Effects are used to synchronize an atom with the
//! outside world:
//!
//! - Seeding the initial value from storage
//! - Logging or persisting changes through `on_set`
//! - Pushing external updates back in with `set_self`
//!
//! # Initialization
//!
//! While effects run, `set_self` only records the initial value. Once every
//! effect has run, the initial value is written into the tree being read,
//! so the very read that triggered initialization already sees it. After
//! initialization `set_self` is a normal write.
//!
//! # Cleanup
//!
//! An effect may return a cleanup function. It runs when the atom is
//! released from the store or the store is torn down, together with the
//! release of every `on_set` subscription the effect made.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use super::atom::{self, AtomDef, ErasedDefault};
use super::{NodeKey, NodeRef};
use crate::engine;
use crate::error::{Error, Result};
use crate::loadable::{Loadable, Promise};
use crate::state::{Store, TreeState, WeakStore};
use crate::value::{self, AnyValue, NodeValue, WriteValue};

/// Cleanup returned by an effect.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Type-erased effect callback: the scope and the effect's index.
pub(crate) type EffectFn =
    Arc<dyn Fn(&Arc<EffectScope>, usize) -> Result<Option<Cleanup>> + Send + Sync>;

/// What caused the atom to be initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// First used by a read.
    Get,
    /// First used by a write.
    Set,
}

/// Initial value recorded while effects run.
#[derive(Clone)]
enum InitValue {
    Default,
    Value(AnyValue),
    /// A promise and the index of the effect that set it.
    Promise(Promise<AnyValue>, usize),
    Error(Error),
}

/// State shared by every effect of one atom in one store.
pub(crate) struct EffectScope {
    def: Arc<AtomDef>,
    store: WeakStore,
    tree: TreeState,
    trigger: Trigger,
    during_init: Mutex<bool>,
    init_value: Mutex<InitValue>,
    /// The last value an effect wrote itself, so its `on_set` can skip the
    /// echo.
    pending_set_self: Mutex<Option<(usize, AnyValue)>>,
}

impl EffectScope {
    fn store(&self) -> Result<Store> {
        self.store.upgrade().ok_or(Error::Released)
    }

    fn is_during_init(&self) -> bool {
        *self.during_init.lock()
    }

    /// The atom's own value as effects see it.
    fn own_loadable(&self, store: &Store) -> Loadable<AnyValue> {
        let init = self.init_value.lock().clone();
        match init {
            InitValue::Default => {
                atom::peek(store, &self.tree, &self.def).unwrap_or_else(Loadable::loading_forever)
            }
            InitValue::Value(v) => Loadable::Value(v),
            InitValue::Promise(p, _) => Loadable::from_promise(p),
            InitValue::Error(e) => Loadable::Error(e),
        }
    }

    fn read(&self, key: &NodeKey) -> Loadable<AnyValue> {
        let store = match self.store() {
            Ok(store) => store,
            Err(err) => return Loadable::Error(err),
        };
        if self.is_during_init() && *key == self.def.key {
            return self.own_loadable(&store);
        }
        store
            .get_loadable_by_key(key)
            .unwrap_or_else(Loadable::Error)
    }

    fn write(&self, index: usize, write: WriteValue<AnyValue>) -> Result<()> {
        if self.is_during_init() {
            *self.init_value.lock() = match write {
                WriteValue::Value(v) => InitValue::Value(v),
                WriteValue::Reset(_) => InitValue::Default,
            };
            return Ok(());
        }
        let store = self.store()?;
        if let WriteValue::Value(v) = &write {
            *self.pending_set_self.lock() = Some((index, Arc::clone(v)));
        }
        store.set_by_key(&self.def.key, write)
    }
}

/// What an effect sees.
pub struct EffectContext<T> {
    scope: Arc<EffectScope>,
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: NodeValue + Clone> EffectContext<T> {
    pub(crate) fn new(scope: Arc<EffectScope>, index: usize) -> Self {
        Self {
            scope,
            index,
            _marker: PhantomData,
        }
    }

    /// Key of the atom.
    pub fn node_key(&self) -> &NodeKey {
        &self.scope.def.key
    }

    /// What caused initialization.
    pub fn trigger(&self) -> Trigger {
        self.scope.trigger
    }

    /// The store the atom is being initialized in, while it is alive.
    pub fn store(&self) -> Option<Store> {
        self.scope.store.upgrade()
    }

    /// Read a node. Reading the atom itself during initialization sees the
    /// initial value recorded so far.
    pub fn get_loadable<U, N>(&self, node: &N) -> Loadable<U>
    where
        U: Clone + Send + 'static,
        N: NodeRef<U> + ?Sized,
    {
        self.scope.read(node.key()).downcast(node.key())
    }

    /// Read a node as a promise.
    pub fn get_promise<U, N>(&self, node: &N) -> Promise<U>
    where
        U: Clone + Send + 'static,
        N: NodeRef<U> + ?Sized,
    {
        self.get_loadable(node).to_promise()
    }

    /// Set the atom.
    pub fn set_self(&self, value: T) -> Result<()> {
        self.scope
            .write(self.index, WriteValue::Value(value::erase(value)))
    }

    /// Set the atom from its current value (`None` while it has none).
    pub fn update_self<F>(&self, update: F) -> Result<()>
    where
        F: FnOnce(Option<T>) -> T,
    {
        let current = self.get_loadable::<T, _>(&SelfRef(self.node_key().clone()));
        self.set_self(update(current.value_maybe()))
    }

    /// Initialize the atom with a value that arrives later. Only allowed
    /// while effects run.
    pub fn set_self_promise(&self, promise: Promise<T>) -> Result<()> {
        if !self.scope.is_during_init() {
            return Err(Error::msg(format!(
                "atom \"{}\" can only be set to a promise during initialization",
                self.node_key()
            )));
        }
        let erased = promise.then(|v| Ok(value::erase(v)));
        *self.scope.init_value.lock() = InitValue::Promise(erased, self.index);
        Ok(())
    }

    /// Reset the atom to its default.
    pub fn reset_self(&self) -> Result<()> {
        self.scope
            .write(self.index, WriteValue::Reset(value::DefaultValue))
    }

    /// Call `handler(new, old, is_reset)` after every committed transaction
    /// that changed the atom, except writes made by this effect itself.
    /// `old` is `None` when the previous value was not available.
    pub fn on_set<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(T, Option<T>, bool) + Send + Sync + 'static,
    {
        let store = self.scope.store()?;
        let scope = Arc::clone(&self.scope);
        let index = self.index;
        let key = self.node_key().clone();
        let subscription = store.subscribe_to_transactions(
            move |store| {
                let current = store.current_tree();
                let previous = store.previous_tree().unwrap_or_else(|| {
                    tracing::warn!(
                        target: "recoverable_violation",
                        key = %key,
                        "transaction subscribers notified without a previous tree"
                    );
                    current.clone()
                });
                let Some(new) = settled_value(store, &current, &scope.def) else {
                    return;
                };
                {
                    let mut pending = scope.pending_set_self.lock();
                    if let Some((effect, value)) = pending.as_ref() {
                        if *effect == index && value::same_value(value, &new) {
                            *pending = None;
                            return;
                        }
                    }
                }
                let old = settled_value(store, &previous, &scope.def);
                let is_reset = !current.atom_values.contains_key(&key);
                let (Ok(new), old) = (
                    value::downcast::<T>(&key, &new),
                    old.and_then(|old| value::downcast::<T>(&key, &old).ok()),
                ) else {
                    return;
                };
                handler(new, old, is_reset);
            },
            Some(self.node_key().clone()),
        );
        store.add_cleanup(self.node_key(), Box::new(move || subscription.release()));
        Ok(())
    }
}

/// Handle to the atom an effect belongs to.
struct SelfRef(NodeKey);

impl<T> NodeRef<T> for SelfRef {
    fn key(&self) -> &NodeKey {
        &self.0
    }
}

/// The atom's value in `tree`, if it has one.
fn settled_value(store: &Store, tree: &TreeState, def: &Arc<AtomDef>) -> Option<AnyValue> {
    let loadable = match tree.atom_values.get(&def.key) {
        Some(stored) => stored.clone(),
        None => engine::default_loadable(store, tree, &def.key).ok()?,
    };
    loadable.value_maybe()
}

/// First use of an atom in a store: count the store, watch a pending
/// default, run the effects and write the initial value.
pub(crate) fn init_atom(store: &Store, tree: &TreeState, def: &Arc<AtomDef>, trigger: Trigger) {
    def.attach_store();
    let detach = Arc::clone(def);
    store.add_cleanup(&def.key, Box::new(move || detach.detach_store()));

    if let ErasedDefault::Promise(default) = &def.default {
        if !default.is_settled() && !tree.atom_values.contains_key(&def.key) {
            let weak = store.downgrade();
            let key = def.key.clone();
            default.on_settle(move |_| {
                let Some(store) = weak.upgrade() else {
                    return;
                };
                if store.latest_tree().atom_values.contains_key(&key) {
                    return;
                }
                if let Err(err) = store.mark_modified(&key) {
                    tracing::warn!(key = %key, error = %err, "could not publish atom default");
                }
            });
        }
    }

    if def.effects.is_empty() {
        return;
    }

    let scope = Arc::new(EffectScope {
        def: Arc::clone(def),
        store: store.downgrade(),
        tree: tree.clone(),
        trigger,
        during_init: Mutex::new(true),
        init_value: Mutex::new(InitValue::Default),
        pending_set_self: Mutex::new(None),
    });

    for (index, effect) in def.effects.iter().enumerate() {
        match effect(&scope, index) {
            Ok(Some(cleanup)) => store.add_cleanup(&def.key, cleanup),
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(key = %def.key, effect = index, error = %err, "atom effect failed");
                *scope.init_value.lock() = InitValue::Error(err);
            }
        }
    }
    *scope.during_init.lock() = false;

    let init = scope.init_value.lock().clone();
    let loadable = match init {
        InitValue::Default => return,
        InitValue::Value(v) => Loadable::Value(v),
        InitValue::Error(e) => Loadable::Error(e),
        InitValue::Promise(promise, index) => match promise.peek() {
            Some(Ok(v)) => Loadable::Value(v),
            Some(Err(e)) => Loadable::Error(e),
            None => Loadable::Loading(wrap_init_promise(&scope, promise, index)),
        },
    };
    tracing::trace!(key = %def.key, "atom initialized by effects");
    store.write_initial_atom_value(tree.version, &def.key, loadable);
}

/// Set the atom once an initial promise settles, if the atom still holds it.
fn wrap_init_promise(
    scope: &Arc<EffectScope>,
    promise: Promise<AnyValue>,
    index: usize,
) -> Promise<AnyValue> {
    let (wrapped, resolver) = Promise::pending();
    let wrapped_id = wrapped.id();
    let scope = Arc::clone(scope);
    promise.on_settle(move |outcome| {
        if let Some(store) = scope.store.upgrade() {
            let key = &scope.def.key;
            let still_pending = matches!(
                store.latest_tree().atom_values.get(key),
                Some(Loadable::Loading(p)) if p.id() == wrapped_id
            );
            if still_pending {
                let written = match &outcome {
                    Ok(v) => {
                        *scope.pending_set_self.lock() = Some((index, Arc::clone(v)));
                        store.set_by_key(key, WriteValue::Value(Arc::clone(v)))
                    }
                    Err(e) => store.set_loadable_by_key(key, Loadable::Error(e.clone())),
                };
                if let Err(err) = written {
                    tracing::warn!(key = %key, error = %err, "could not write settled initial value");
                }
            }
        }
        resolver.settle(outcome);
    });
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triggers_compare() {
        assert_ne!(Trigger::Get, Trigger::Set);
        assert_eq!(format!("{:?}", Trigger::Get), "Get");
    }
}
