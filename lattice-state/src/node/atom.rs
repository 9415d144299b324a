//! Atoms
//!
//! An atom is a leaf of state. Its value lives in the tree state of each
//! store; the definition only knows how to produce a default.
//!
//! # Reads
//!
//! An atom reads, in order:
//!
//! 1. the value stored in the tree being read;
//! 2. a value written during initialization into the store's live tree of
//!    the same version (effects may set the initial value while the tree
//!    being read is already borrowed);
//! 3. a raw restored value, passed through the persistence validator and
//!    cached until the atom is invalidated;
//! 4. the default: a value, a promise, or another node to fall back to.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use super::effect::{EffectContext, EffectFn, EffectScope};
use super::{Cleanup, Node, NodeKey, NodeRef, Registry, RetainedBy, WritableNodeRef};
use crate::engine::{self, WriteEntry, WriteSet};
use crate::error::Result;
use crate::loadable::{Loadable, Promise};
use crate::state::{Store, TreeState};
use crate::value::{self, AnyValue, NodeValue, WriteValue};

/// Validates a raw restored value. `None` means "use the default".
pub(crate) type Validator = Arc<dyn Fn(&serde_json::Value) -> Option<AnyValue> + Send + Sync>;

/// Type-erased atom default.
#[derive(Clone)]
pub(crate) enum ErasedDefault {
    Value(AnyValue),
    Promise(Promise<AnyValue>),
    Node(NodeKey),
}

/// A registered atom.
pub struct AtomDef {
    pub(crate) key: NodeKey,
    pub(crate) default: ErasedDefault,
    pub(crate) effects: Vec<EffectFn>,
    pub(crate) validator: Option<Validator>,
    pub(crate) retained_by: RetainedBy,
    pub(crate) dangerously_allow_mutability: bool,
    pub(crate) family: Option<NodeKey>,
    validated: Mutex<Option<Loadable<AnyValue>>>,
    live_stores: AtomicUsize,
}

impl AtomDef {
    /// Number of stores this atom is initialized in.
    pub(crate) fn live_stores(&self) -> usize {
        self.live_stores.load(Ordering::SeqCst)
    }

    pub(crate) fn attach_store(&self) {
        self.live_stores.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn detach_store(&self) {
        let _ = self
            .live_stores
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Drop the cached answer for a restored raw value.
    pub(crate) fn invalidate(&self) {
        *self.validated.lock() = None;
    }

    /// The default loadable, when it does not depend on another node.
    pub(crate) fn static_default(&self) -> Option<Loadable<AnyValue>> {
        match &self.default {
            ErasedDefault::Value(v) => Some(Loadable::Value(Arc::clone(v))),
            ErasedDefault::Promise(p) => Some(Loadable::from_promise(p.clone())),
            ErasedDefault::Node(_) => None,
        }
    }
}

/// Read an atom.
pub(crate) fn get(store: &Store, tree: &TreeState, def: &Arc<AtomDef>) -> Result<Loadable<AnyValue>> {
    if let Some(stored) = stored_value(store, tree, def) {
        set_fallback_deps(store, tree, def, false);
        return Ok(stored);
    }
    if let Some(validated) = validated_value(store, tree, def)? {
        set_fallback_deps(store, tree, def, false);
        return Ok(validated);
    }
    default_loadable(store, tree, def)
}

/// Read an atom without evaluating a fallback node.
pub(crate) fn peek(store: &Store, tree: &TreeState, def: &Arc<AtomDef>) -> Option<Loadable<AnyValue>> {
    if let Some(stored) = stored_value(store, tree, def) {
        return Some(stored);
    }
    if tree.nonvalidated_atoms.contains_key(&def.key) {
        if let Ok(Some(validated)) = validated_value(store, tree, def) {
            return Some(validated);
        }
    }
    match &def.default {
        ErasedDefault::Node(fallback) => engine::peek_node_loadable(store, tree, fallback).ok().flatten(),
        _ => def.static_default(),
    }
}

/// What the atom reads as with no stored value.
pub(crate) fn default_loadable(
    store: &Store,
    tree: &TreeState,
    def: &Arc<AtomDef>,
) -> Result<Loadable<AnyValue>> {
    match &def.default {
        ErasedDefault::Node(fallback) => {
            set_fallback_deps(store, tree, def, true);
            engine::get_node_loadable(store, tree, fallback)
        }
        _ => Ok(def.static_default().unwrap_or_else(Loadable::loading_forever)),
    }
}

/// Compute the writes for setting the atom.
pub(crate) fn set(
    store: &Store,
    tree: &TreeState,
    def: &Arc<AtomDef>,
    write: WriteValue<AnyValue>,
) -> WriteSet {
    let mut writes = WriteSet::new();
    let stored = stored_value(store, tree, def);
    match (&write, &stored) {
        (WriteValue::Value(new), Some(Loadable::Value(existing))) if value::same_value(new, existing) => {
            return writes;
        }
        (WriteValue::Reset(_), None) if !tree.nonvalidated_atoms.contains_key(&def.key) => {
            return writes;
        }
        _ => {}
    }
    def.invalidate();
    let entry = match write {
        WriteValue::Value(v) => WriteEntry::Set(Loadable::Value(v)),
        WriteValue::Reset(_) => WriteEntry::Reset,
    };
    writes.insert(def.key.clone(), entry);
    writes
}

fn stored_value(store: &Store, tree: &TreeState, def: &AtomDef) -> Option<Loadable<AnyValue>> {
    tree.atom_values
        .get(&def.key)
        .cloned()
        .or_else(|| store.canonical_atom_value(tree.version, &def.key))
}

fn validated_value(
    store: &Store,
    tree: &TreeState,
    def: &Arc<AtomDef>,
) -> Result<Option<Loadable<AnyValue>>> {
    let Some(raw) = tree.nonvalidated_atoms.get(&def.key) else {
        return Ok(None);
    };
    if let Some(cached) = def.validated.lock().clone() {
        return Ok(Some(cached));
    }
    let Some(validator) = &def.validator else {
        tracing::warn!(
            target: "recoverable_violation",
            key = %def.key,
            "restored a raw value for an atom without persistence settings"
        );
        return default_loadable(store, tree, def).map(Some);
    };
    let answer = match validator(raw) {
        Some(value) => Loadable::Value(value),
        None => default_loadable(store, tree, def)?,
    };
    *def.validated.lock() = Some(answer.clone());
    Ok(Some(answer))
}

/// Record the fallback node as the atom's parent while the default applies.
fn set_fallback_deps(store: &Store, tree: &TreeState, def: &AtomDef, reading_default: bool) {
    let ErasedDefault::Node(fallback) = &def.default else {
        return;
    };
    let deps: HashSet<NodeKey> = if reading_default {
        HashSet::from([fallback.clone()])
    } else {
        HashSet::new()
    };
    let versions = store.tree_versions();
    if tree.version == versions.current || Some(tree.version) == versions.next {
        store.save_deps(&def.key, deps, versions.next.unwrap_or(versions.current));
    }
}

// ----------------------------------------------------------------------------
// Public handles
// ----------------------------------------------------------------------------

/// Default of a typed atom.
pub enum AtomDefault<T> {
    /// A plain value.
    Value(T),
    /// A value that arrives later.
    Promise(Promise<T>),
    /// Read another node while the atom has no value of its own.
    Node(NodeKey),
}

/// Options for declaring an atom.
pub struct AtomOptions<T> {
    key: NodeKey,
    default: AtomDefault<T>,
    effects: Vec<EffectFn>,
    validator: Option<Validator>,
    retained_by: RetainedBy,
    dangerously_allow_mutability: bool,
}

impl<T: NodeValue + Clone> AtomOptions<T> {
    /// An atom with a plain default.
    pub fn new(key: impl Into<NodeKey>, default: T) -> Self {
        Self::with_default(key, AtomDefault::Value(default))
    }

    /// An atom whose default arrives later.
    pub fn with_promise(key: impl Into<NodeKey>, default: Promise<T>) -> Self {
        Self::with_default(key, AtomDefault::Promise(default))
    }

    /// An atom that reads `fallback` until it is set.
    pub fn with_fallback<N: NodeRef<T> + ?Sized>(key: impl Into<NodeKey>, fallback: &N) -> Self {
        Self::with_default(key, AtomDefault::Node(fallback.key().clone()))
    }

    /// An atom with an explicit default.
    pub fn with_default(key: impl Into<NodeKey>, default: AtomDefault<T>) -> Self {
        Self {
            key: key.into(),
            default,
            effects: Vec::new(),
            validator: None,
            retained_by: RetainedBy::default(),
            dangerously_allow_mutability: false,
        }
    }

    /// Add an effect, run when the atom is first used in a store.
    pub fn effect<F>(mut self, effect: F) -> Self
    where
        F: Fn(&EffectContext<T>) -> Result<Option<Cleanup>> + Send + Sync + 'static,
    {
        self.effects.push(Arc::new(move |scope: &Arc<EffectScope>, index: usize| {
            effect(&EffectContext::new(Arc::clone(scope), index))
        }));
        self
    }

    /// Validate raw restored values with `validator`.
    pub fn persistence<F>(mut self, validator: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Option<T> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(move |raw| validator(raw).map(value::erase)));
        self
    }

    /// Validate raw restored values by deserializing them.
    pub fn persistence_serde(self) -> Self
    where
        T: DeserializeOwned,
    {
        self.persistence(|raw| serde_json::from_value(raw.clone()).ok())
    }

    /// Set what keeps the atom alive.
    pub fn retained_by(mut self, retained_by: RetainedBy) -> Self {
        self.retained_by = retained_by;
        self
    }

    /// Allow values read from the atom to be mutated in place.
    pub fn dangerously_allow_mutability(mut self, allow: bool) -> Self {
        self.dangerously_allow_mutability = allow;
        self
    }

    /// Replace the key.
    pub fn rekey(mut self, key: impl Into<NodeKey>) -> Self {
        self.key = key.into();
        self
    }

    /// The key.
    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub(crate) fn into_def(self, family: Option<NodeKey>) -> AtomDef {
        let default = match self.default {
            AtomDefault::Value(v) => ErasedDefault::Value(value::erase(v)),
            AtomDefault::Promise(p) => ErasedDefault::Promise(p.then(|v| Ok(value::erase(v)))),
            AtomDefault::Node(key) => ErasedDefault::Node(key),
        };
        AtomDef {
            key: self.key,
            default,
            effects: self.effects,
            validator: self.validator,
            retained_by: self.retained_by,
            dangerously_allow_mutability: self.dangerously_allow_mutability,
            family,
            validated: Mutex::new(None),
            live_stores: AtomicUsize::new(0),
        }
    }
}

/// Typed atom handle.
pub struct Atom<T> {
    key: NodeKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T: NodeValue + Clone> Atom<T> {
    /// Register an atom.
    pub fn new(registry: &Registry, options: AtomOptions<T>) -> Self {
        let def = options.into_def(None);
        Self::from_key(registry.register(Node::Atom(Arc::new(def))))
    }

    pub(crate) fn from_key(key: NodeKey) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }

    /// Key of the atom.
    pub fn key(&self) -> &NodeKey {
        &self.key
    }
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Atom({})", self.key)
    }
}

impl<T> NodeRef<T> for Atom<T> {
    fn key(&self) -> &NodeKey {
        &self.key
    }
}

impl<T> WritableNodeRef<T> for Atom<T> {}
