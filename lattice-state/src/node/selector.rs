//! Selectors
//!
//! A selector derives its value from other nodes. The getter reads its
//! dependencies through a [`GetContext`]; every read is recorded so the
//! result can be cached under the values it was computed from.
//!
//! # Getter flavours
//!
//! - [`SelectorOptions::new`]: returns a value.
//! - [`SelectorOptions::new_async`]: returns a [`Promise`].
//! - [`SelectorOptions::new_loadable`]: returns a [`Loadable`].
//! - [`SelectorOptions::new_alias`]: resolves to another node.
//!
//! A getter that reads a dependency still loading returns
//! `Err(Interrupt::Pending(..))` (usually via `?`) and is replayed once the
//! dependency settles.
//!
//! # Shared state
//!
//! The cache and the in-flight execution table live on the definition and
//! are shared by every store built on the same registry.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Node, NodeKey, NodeRef, Registry, RetainedBy, WritableNodeRef};
use crate::cache::{CachePolicy, SelectorCache};
use crate::engine::execution::ExecutionTable;
use crate::engine::{GetContext, SetContext};
use crate::error::{Interrupt, Result};
use crate::loadable::{Loadable, Promise};
use crate::state::StoreId;
use crate::value::{self, AnyValue, NodeValue, WriteValue};

/// What one run of a getter produced.
#[derive(Debug, Clone)]
pub(crate) enum Produced {
    Value(AnyValue),
    Promise(Promise<AnyValue>),
    Loadable(Loadable<AnyValue>),
    Node(NodeKey),
}

/// Type-erased getter.
pub(crate) type GetFn = Arc<dyn Fn(&GetContext<'_>) -> Result<Produced, Interrupt> + Send + Sync>;

/// Type-erased setter.
pub(crate) type SetFn =
    Arc<dyn Fn(&SetContext<'_>, WriteValue<AnyValue>) -> Result<()> + Send + Sync>;

/// A registered selector.
pub struct SelectorDef {
    pub(crate) key: NodeKey,
    pub(crate) get: GetFn,
    pub(crate) set: Option<SetFn>,
    pub(crate) retained_by: RetainedBy,
    pub(crate) dangerously_allow_mutability: bool,
    pub(crate) family: Option<NodeKey>,
    pub(crate) executions: ExecutionTable,
    cache_policy: Option<CachePolicy>,
    cache: Mutex<Option<Box<dyn SelectorCache>>>,
    live_stores: AtomicUsize,
}

impl SelectorDef {
    /// Run `f` on the cache, creating it from the selector's policy (or
    /// `default_policy`) on first use.
    pub(crate) fn with_cache<R>(
        &self,
        default_policy: &CachePolicy,
        f: impl FnOnce(&mut dyn SelectorCache) -> R,
    ) -> R {
        let mut slot = self.cache.lock();
        let cache = slot.get_or_insert_with(|| {
            self.cache_policy
                .unwrap_or(*default_policy)
                .build(&self.key)
        });
        f(cache.as_mut())
    }

    /// Drop every cached result.
    pub(crate) fn clear_cache(&self) {
        if let Some(cache) = self.cache.lock().as_mut() {
            cache.clear();
        }
    }

    /// Number of cached results.
    #[cfg(test)]
    pub(crate) fn cache_len(&self) -> usize {
        self.cache.lock().as_ref().map(|c| c.len()).unwrap_or(0)
    }

    pub(crate) fn live_stores(&self) -> usize {
        self.live_stores.load(Ordering::SeqCst)
    }

    /// Whether any store still uses this selector.
    pub(crate) fn is_live(&self) -> bool {
        self.live_stores() > 0
    }

    pub(crate) fn attach_store(&self) {
        self.live_stores.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn detach_store(&self, store: StoreId) {
        let _ = self
            .live_stores
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.executions.clear(store);
    }
}

// ----------------------------------------------------------------------------
// Public handles
// ----------------------------------------------------------------------------

/// Options for declaring a selector.
pub struct SelectorOptions<T> {
    key: NodeKey,
    get: GetFn,
    cache_policy: Option<CachePolicy>,
    cache: Option<Box<dyn SelectorCache>>,
    retained_by: RetainedBy,
    dangerously_allow_mutability: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: NodeValue + Clone> SelectorOptions<T> {
    fn with_getter(key: impl Into<NodeKey>, get: GetFn) -> Self {
        Self {
            key: key.into(),
            get,
            cache_policy: None,
            cache: None,
            retained_by: RetainedBy::default(),
            dangerously_allow_mutability: false,
            _marker: PhantomData,
        }
    }

    /// A selector computing a value.
    pub fn new<F>(key: impl Into<NodeKey>, get: F) -> Self
    where
        F: Fn(&GetContext<'_>) -> Result<T, Interrupt> + Send + Sync + 'static,
    {
        Self::with_getter(
            key,
            Arc::new(move |ctx: &GetContext<'_>| get(ctx).map(|v| Produced::Value(value::erase(v)))),
        )
    }

    /// A selector computing a promise.
    pub fn new_async<F>(key: impl Into<NodeKey>, get: F) -> Self
    where
        F: Fn(&GetContext<'_>) -> Result<Promise<T>, Interrupt> + Send + Sync + 'static,
    {
        Self::with_getter(
            key,
            Arc::new(move |ctx: &GetContext<'_>| {
                get(ctx).map(|p| Produced::Promise(p.then(|v| Ok(value::erase(v)))))
            }),
        )
    }

    /// A selector computing a loadable.
    pub fn new_loadable<F>(key: impl Into<NodeKey>, get: F) -> Self
    where
        F: Fn(&GetContext<'_>) -> Loadable<T> + Send + Sync + 'static,
    {
        Self::with_getter(
            key,
            Arc::new(move |ctx: &GetContext<'_>| Ok(Produced::Loadable(get(ctx).into_any()))),
        )
    }

    /// A selector that reads as `node`.
    pub fn new_alias<N: NodeRef<T> + ?Sized>(key: impl Into<NodeKey>, node: &N) -> Self {
        let target = node.key().clone();
        Self::with_getter(
            key,
            Arc::new(move |_: &GetContext<'_>| Ok(Produced::Node(target.clone()))),
        )
    }

    /// Cache results under `policy` instead of the store default.
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    /// Use a custom cache.
    pub fn cache(mut self, cache: Box<dyn SelectorCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set what keeps the selector alive.
    pub fn retained_by(mut self, retained_by: RetainedBy) -> Self {
        self.retained_by = retained_by;
        self
    }

    /// Allow produced values to be mutated in place.
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

    pub(crate) fn into_def(self, set: Option<SetFn>, family: Option<NodeKey>) -> SelectorDef {
        SelectorDef {
            key: self.key,
            get: self.get,
            set,
            retained_by: self.retained_by,
            dangerously_allow_mutability: self.dangerously_allow_mutability,
            family,
            executions: ExecutionTable::default(),
            cache_policy: self.cache_policy,
            cache: Mutex::new(self.cache),
            live_stores: AtomicUsize::new(0),
        }
    }
}

/// Erase a typed setter.
pub(crate) fn erase_setter<T, F>(key: NodeKey, set: F) -> SetFn
where
    T: NodeValue + Clone,
    F: Fn(&SetContext<'_>, WriteValue<T>) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(move |ctx: &SetContext<'_>, write: WriteValue<AnyValue>| {
        let typed = match write {
            WriteValue::Value(v) => WriteValue::Value(value::downcast::<T>(&key, &v)?),
            WriteValue::Reset(d) => WriteValue::Reset(d),
        };
        set(ctx, typed)
    })
}

/// Typed read-only selector handle.
pub struct Selector<T> {
    key: NodeKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T: NodeValue + Clone> Selector<T> {
    /// Register a read-only selector.
    pub fn new(registry: &Registry, options: SelectorOptions<T>) -> Self {
        let def = options.into_def(None, None);
        Self::from_key(registry.register(Node::Selector(Arc::new(def))))
    }

    pub(crate) fn from_key(key: NodeKey) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }

    /// Key of the selector.
    pub fn key(&self) -> &NodeKey {
        &self.key
    }
}

/// Typed writable selector handle.
pub struct WritableSelector<T> {
    key: NodeKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T: NodeValue + Clone> WritableSelector<T> {
    /// Register a selector that turns writes into writes of other nodes.
    pub fn new<F>(registry: &Registry, options: SelectorOptions<T>, set: F) -> Self
    where
        F: Fn(&SetContext<'_>, WriteValue<T>) -> Result<()> + Send + Sync + 'static,
    {
        let set = erase_setter(options.key().clone(), set);
        let def = options.into_def(Some(set), None);
        Self::from_key(registry.register(Node::Selector(Arc::new(def))))
    }

    pub(crate) fn from_key(key: NodeKey) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }

    /// Key of the selector.
    pub fn key(&self) -> &NodeKey {
        &self.key
    }
}

macro_rules! impl_handle {
    ($handle:ident, $label:literal) => {
        impl<T> Clone for $handle<T> {
            fn clone(&self) -> Self {
                Self {
                    key: self.key.clone(),
                    _marker: PhantomData,
                }
            }
        }

        impl<T> std::fmt::Debug for $handle<T> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($label, "({})"), self.key)
            }
        }

        impl<T> NodeRef<T> for $handle<T> {
            fn key(&self) -> &NodeKey {
                &self.key
            }
        }
    };
}

impl_handle!(Selector, "Selector");
impl_handle!(WritableSelector, "WritableSelector");

impl<T> WritableNodeRef<T> for WritableSelector<T> {}
