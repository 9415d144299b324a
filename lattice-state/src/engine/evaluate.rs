//! Selector Evaluation
//!
//! Reading a selector goes through four layers, cheapest first:
//!
//! 1. the per-version memo of the store, so a selector is evaluated at most
//!    once per tree version;
//! 2. the selector cache, walked one dependency at a time: the cache names
//!    the next dependency to read, we read it, and its value picks the
//!    branch;
//! 3. an execution still in flight (in this store or another one) whose
//!    recorded dependencies all still read the same;
//! 4. a new execution of the getter.
//!
//! # Async
//!
//! A getter that reads a loading dependency is interrupted. The read
//! returns a loading loadable whose promise is settled by replaying the
//! getter once the dependency settles, with the settled value substituted
//! for that dependency. A getter that returns a promise settles when the
//! promise does. Only the latest execution for a store publishes its result
//! into that store (by committing a transaction that marks the selector
//! modified); every settlement is written to the cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;

use super::context::{EvaluationFrame, GetContext, PendingRead, SetContext};
use super::execution::{next_execution_id, ExecutionId, ExecutionInfo};
use super::WriteSet;
use crate::cache::{CacheLookup, DepValueKey, RouteStep};
use crate::error::{Error, Interrupt, Result, Suspension};
use crate::loadable::{Loadable, Promise, Resolver};
use crate::node::{NodeKey, Produced, SelectorDef, SetFn};
use crate::state::{Store, TreeState, WeakStore};
use crate::value::{AnyValue, WriteValue};

type DepValues = IndexMap<NodeKey, Loadable<AnyValue>>;

/// Read a selector.
pub(crate) fn get_selector_loadable(
    store: &Store,
    tree: &TreeState,
    def: &Arc<SelectorDef>,
) -> Result<Loadable<AnyValue>> {
    let _frame = match EvaluationFrame::enter(&def.key) {
        Ok(frame) => frame,
        Err(cycle) => {
            tracing::debug!(key = %def.key, error = %cycle, "circular selector read");
            return Ok(Loadable::Error(cycle));
        }
    };

    if let Some(memo) = store.overlay_get(tree.version, &def.key) {
        return Ok(memo);
    }

    if let Some(cached) = cached_loadable(store, tree, def) {
        store.overlay_set(tree.version, &def.key, cached.clone());
        return Ok(cached);
    }

    if let Some(in_flight) = in_progress_loadable(store, tree, def) {
        return Ok(in_flight);
    }

    evaluate_new_execution(store, tree, def)
}

/// Read a selector's cached value without evaluating anything.
pub(crate) fn peek_selector(
    store: &Store,
    tree: &TreeState,
    def: &Arc<SelectorDef>,
) -> Option<Loadable<AnyValue>> {
    if let Some(memo) = store.overlay_get(tree.version, &def.key) {
        return Some(memo);
    }
    let policy = store.config().default_cache_policy;
    let equality = def.with_cache(&policy, |cache| cache.equality());
    let mut route: Vec<RouteStep> = Vec::new();
    loop {
        match def.with_cache(&policy, |cache| cache.lookup(&route)) {
            CacheLookup::Hit(loadable) => return Some(loadable),
            CacheLookup::Miss => return None,
            CacheLookup::Branch(dep) => {
                let value = super::peek_node_loadable(store, tree, &dep).ok().flatten()?;
                let step = DepValueKey::of(&value, equality);
                route.push((dep, step));
            }
        }
    }
}

/// Run a writable selector's setter and collect its writes.
pub(crate) fn set_selector(
    store: &Store,
    tree: &TreeState,
    def: &Arc<SelectorDef>,
    set: &SetFn,
    write: WriteValue<AnyValue>,
) -> Result<WriteSet> {
    let ctx = SetContext::new(store, tree, &def.key);
    let result = set(&ctx, write);
    if let Some(fatal) = ctx.take_fatal() {
        return Err(fatal);
    }
    result?;
    Ok(ctx.into_writes())
}

// ----------------------------------------------------------------------------
// Cache and in-flight reuse
// ----------------------------------------------------------------------------

/// Walk the cache, reading each dependency it asks for.
fn cached_loadable(
    store: &Store,
    tree: &TreeState,
    def: &Arc<SelectorDef>,
) -> Option<Loadable<AnyValue>> {
    let policy = store.config().default_cache_policy;
    let equality = def.with_cache(&policy, |cache| cache.equality());
    let mut route: Vec<RouteStep> = Vec::new();
    loop {
        // The cache lock is released before the dependency is read, since
        // reading it may evaluate other selectors.
        match def.with_cache(&policy, |cache| cache.lookup(&route)) {
            CacheLookup::Hit(loadable) => {
                tracing::trace!(key = %def.key, deps = route.len(), "selector cache hit");
                let deps: HashSet<NodeKey> = route.into_iter().map(|(key, _)| key).collect();
                let latest = def.executions.latest_id(store.id());
                update_deps(store, tree, def, deps, latest);
                def.executions.clear(store.id());
                return Some(loadable);
            }
            CacheLookup::Miss => return None,
            CacheLookup::Branch(dep) => match super::get_node_loadable(store, tree, &dep) {
                Ok(value) => {
                    let step = DepValueKey::of(&value, equality);
                    route.push((dep, step));
                }
                Err(err) => {
                    tracing::trace!(key = %def.key, dep = %dep, %err, "cache walk stopped");
                    return None;
                }
            },
        }
    }
}

/// Reuse an in-flight execution whose dependencies still read the same.
fn in_progress_loadable(
    store: &Store,
    tree: &TreeState,
    def: &Arc<SelectorDef>,
) -> Option<Loadable<AnyValue>> {
    for (owner, info) in def.executions.candidates(store.id()) {
        let matched = match info.state_versions.get(&tree.version) {
            Some(&matched) => matched,
            None => {
                let matched = deps_unchanged(store, tree, &info.dep_values);
                def.executions
                    .mark_version(owner, info.execution_id, tree.version, matched);
                matched
            }
        };
        if !matched {
            continue;
        }
        if owner != store.id() && info.loadable.is_loading() {
            def.executions
                .add_waiting_store(info.execution_id, store.downgrade());
        }
        tracing::trace!(
            key = %def.key,
            execution_id = info.execution_id,
            "reusing in-flight execution"
        );
        return Some(info.loadable);
    }
    None
}

fn deps_unchanged(store: &Store, tree: &TreeState, deps: &DepValues) -> bool {
    deps.iter().all(|(key, previous)| {
        super::get_node_loadable(store, tree, key)
            .map(|current| current.same_as(previous))
            .unwrap_or(false)
    })
}

// ----------------------------------------------------------------------------
// Executions
// ----------------------------------------------------------------------------

fn evaluate_new_execution(
    store: &Store,
    tree: &TreeState,
    def: &Arc<SelectorDef>,
) -> Result<Loadable<AnyValue>> {
    let execution_id = next_execution_id();
    tracing::debug!(
        key = %def.key,
        execution_id,
        version = tree.version,
        "evaluating selector"
    );

    let (loadable, deps) = evaluate_getter(store, tree, def, execution_id, None)?;
    let loadable = match loadable {
        Loadable::Loading(promise) if promise.is_settled() => Loadable::from_promise(promise),
        other => other,
    };

    if loadable.is_loading() {
        def.executions.set(
            store.id(),
            ExecutionInfo {
                execution_id,
                loadable: loadable.clone(),
                dep_values: deps,
                state_versions: HashMap::from([(tree.version, true)]),
            },
        );
    } else {
        def.executions.clear(store.id());
        write_cache(store, def, &deps, loadable.clone())?;
        store.overlay_set(tree.version, &def.key, loadable.clone());
    }
    Ok(loadable)
}

/// What one run of a getter produced.
enum Outcome {
    Settled(Loadable<AnyValue>),
    Promise(Promise<AnyValue>),
    Pending(Suspension),
}

impl From<Result<AnyValue, Interrupt>> for Outcome {
    fn from(result: Result<AnyValue, Interrupt>) -> Self {
        match result {
            Ok(value) => Outcome::Settled(Loadable::Value(value)),
            Err(Interrupt::Failed(err)) => Outcome::Settled(Loadable::Error(err)),
            Err(Interrupt::Pending(suspension)) => Outcome::Pending(suspension),
        }
    }
}

/// Run the getter once.
fn evaluate_getter(
    store: &Store,
    tree: &TreeState,
    def: &Arc<SelectorDef>,
    execution_id: ExecutionId,
    substitute: Option<(NodeKey, Loadable<AnyValue>)>,
) -> Result<(Loadable<AnyValue>, DepValues)> {
    let ctx = GetContext::new(store, tree, &def.key, substitute);
    let outcome = match (def.get)(&ctx) {
        Ok(Produced::Value(value)) => Outcome::Settled(Loadable::Value(value)),
        Ok(Produced::Node(key)) => Outcome::from(ctx.get_by_key(&key)),
        Ok(Produced::Promise(promise)) | Ok(Produced::Loadable(Loadable::Loading(promise))) => {
            Outcome::Promise(promise)
        }
        Ok(Produced::Loadable(settled)) => Outcome::Settled(settled),
        Err(interrupt) => Outcome::from(Err(interrupt)),
    };
    if let Some(fatal) = ctx.take_fatal() {
        return Err(fatal);
    }
    let (deps, pending) = ctx.into_parts();

    let loadable = match outcome {
        Outcome::Settled(loadable) => loadable,
        Outcome::Promise(promise) => match promise.peek() {
            Some(Ok(value)) => Loadable::Value(value),
            Some(Err(err)) => Loadable::Error(err),
            None => Loadable::Loading(wrap_result_promise(
                store,
                tree,
                def,
                execution_id,
                promise,
                deps.clone(),
            )),
        },
        Outcome::Pending(suspension) => Loadable::Loading(wrap_pending_dependency(
            store,
            tree,
            def,
            execution_id,
            suspension,
            pending,
            deps.clone(),
        )),
    };

    def.executions
        .update_dep_values(store.id(), execution_id, &deps);
    update_deps(
        store,
        tree,
        def,
        deps.keys().cloned().collect(),
        Some(execution_id),
    );
    Ok((loadable, deps))
}

/// Settle with the promise a getter returned.
fn wrap_result_promise(
    store: &Store,
    tree: &TreeState,
    def: &Arc<SelectorDef>,
    execution_id: ExecutionId,
    promise: Promise<AnyValue>,
    deps: DepValues,
) -> Promise<AnyValue> {
    let (wrapped, resolver) = Promise::pending();
    let resume = Resumption::new(store, tree, def, execution_id, resolver, deps);
    promise.on_settle(move |outcome| {
        let loadable = match outcome {
            Ok(value) => Loadable::Value(value),
            Err(err) => Loadable::Error(err),
        };
        resume.finish(loadable);
    });
    wrapped
}

/// Replay the getter once the dependency that interrupted it settles.
fn wrap_pending_dependency(
    store: &Store,
    tree: &TreeState,
    def: &Arc<SelectorDef>,
    execution_id: ExecutionId,
    suspension: Suspension,
    pending: Option<PendingRead>,
    deps: DepValues,
) -> Promise<AnyValue> {
    let (wrapped, resolver) = Promise::pending();
    let resume = Resumption::new(store, tree, def, execution_id, resolver, deps);
    let pending = pending.filter(|(key, _)| suspension.key() == Some(key));
    match pending {
        Some((dep, dep_promise)) => dep_promise.on_settle(move |outcome| match outcome {
            Ok(value) => resume.replay(Some((dep, Loadable::Value(value)))),
            Err(err) => resume.finish(Loadable::Error(err)),
        }),
        None => suspension.ready().on_settle(move |outcome| match outcome {
            Ok(()) => resume.replay(None),
            Err(err) => resume.finish(Loadable::Error(err)),
        }),
    }
    wrapped
}

/// Everything an async continuation needs to finish an execution.
struct Resumption {
    store: WeakStore,
    tree: TreeState,
    def: Arc<SelectorDef>,
    execution_id: ExecutionId,
    resolver: Resolver<AnyValue>,
    deps: DepValues,
}

impl Resumption {
    fn new(
        store: &Store,
        tree: &TreeState,
        def: &Arc<SelectorDef>,
        execution_id: ExecutionId,
        resolver: Resolver<AnyValue>,
        deps: DepValues,
    ) -> Self {
        Self {
            store: store.downgrade(),
            tree: tree.clone(),
            def: Arc::clone(def),
            execution_id,
            resolver,
            deps,
        }
    }

    /// The store, if the selector is still worth settling for.
    fn live_store(&self) -> Option<Store> {
        let store = self.store.upgrade().filter(|_| self.def.is_live());
        if store.is_none() {
            tracing::debug!(
                key = %self.def.key,
                execution_id = self.execution_id,
                "selector released before its execution settled"
            );
            if !self.def.is_live() {
                self.def.clear_cache();
            }
            self.resolver.reject(Error::Released);
        }
        store
    }

    /// Publish a settled result.
    fn finish(self, loadable: Loadable<AnyValue>) {
        let Some(store) = self.live_store() else {
            return;
        };
        resolve_async(&store, &self.def, self.execution_id, &self.deps, loadable.clone());
        settle_with(&self.resolver, loadable);
    }

    /// Run the getter again after a dependency settled.
    fn replay(self, substitute: Option<(NodeKey, Loadable<AnyValue>)>) {
        let Some(store) = self.live_store() else {
            return;
        };
        let _frame = match EvaluationFrame::enter(&self.def.key) {
            Ok(frame) => frame,
            Err(cycle) => {
                resolve_async(
                    &store,
                    &self.def,
                    self.execution_id,
                    &self.deps,
                    Loadable::Error(cycle.clone()),
                );
                self.resolver.reject(cycle);
                return;
            }
        };

        let store_id = store.id();
        if let Some(cached) = cached_loadable(&store, &self.tree, &self.def) {
            if !cached.is_loading() {
                let latest = self.def.executions.is_latest(store_id, self.execution_id);
                if latest || self.def.executions.get(store_id).is_none() {
                    notify_resolved(&store, &self.def, self.execution_id);
                }
            }
            settle_with(&self.resolver, cached);
            return;
        }

        if !self.def.executions.is_latest(store_id, self.execution_id) {
            if let Some(in_flight) = in_progress_loadable(&store, &self.tree, &self.def) {
                settle_with(&self.resolver, in_flight);
                return;
            }
        }

        match evaluate_getter(&store, &self.tree, &self.def, self.execution_id, substitute) {
            Ok((Loadable::Loading(promise), _)) => promise.on_settle(move |outcome| {
                self.resolver.settle(outcome);
            }),
            Ok((settled, deps)) => {
                resolve_async(&store, &self.def, self.execution_id, &deps, settled.clone());
                settle_with(&self.resolver, settled);
            }
            Err(err) => {
                tracing::warn!(
                    key = %self.def.key,
                    execution_id = self.execution_id,
                    error = %err,
                    "selector replay failed"
                );
                resolve_async(
                    &store,
                    &self.def,
                    self.execution_id,
                    &self.deps,
                    Loadable::Error(err.clone()),
                );
                self.resolver.reject(err);
            }
        }
    }
}

/// Settle `resolver` with a loadable, chaining if it is still loading.
fn settle_with(resolver: &Resolver<AnyValue>, loadable: Loadable<AnyValue>) {
    match loadable {
        Loadable::Value(value) => {
            resolver.resolve(value);
        }
        Loadable::Error(err) => {
            resolver.reject(err);
        }
        Loadable::Loading(promise) => {
            let resolver = resolver.clone();
            promise.on_settle(move |outcome| {
                resolver.settle(outcome);
            });
        }
    }
}

/// Record an async settlement: always cached, published only by the latest
/// execution of a store.
fn resolve_async(
    store: &Store,
    def: &Arc<SelectorDef>,
    execution_id: ExecutionId,
    deps: &DepValues,
    loadable: Loadable<AnyValue>,
) {
    let latest = def.executions.is_latest(store.id(), execution_id);
    if latest {
        def.executions.clear(store.id());
    }
    if let Err(err) = write_cache(store, def, deps, loadable) {
        tracing::error!(key = %def.key, execution_id, error = %err, "failed to cache selector result");
    }
    tracing::debug!(key = %def.key, execution_id, latest, "async selector settled");
    if latest {
        notify_resolved(store, def, execution_id);
    } else {
        notify_waiting(def, execution_id);
    }
}

/// Mark the selector modified in `store` and in every store that reused
/// the execution.
fn notify_resolved(store: &Store, def: &Arc<SelectorDef>, execution_id: ExecutionId) {
    if let Err(err) = store.mark_modified(&def.key) {
        tracing::warn!(key = %def.key, error = %err, "could not publish async selector result");
    }
    notify_waiting(def, execution_id);
}

fn notify_waiting(def: &Arc<SelectorDef>, execution_id: ExecutionId) {
    for waiting in def.executions.take_waiting_stores(execution_id) {
        let Some(waiting) = waiting.upgrade() else {
            continue;
        };
        if let Err(err) = waiting.mark_modified(&def.key) {
            tracing::warn!(key = %def.key, error = %err, "could not publish async selector result");
        }
    }
}

fn write_cache(
    store: &Store,
    def: &Arc<SelectorDef>,
    deps: &DepValues,
    loadable: Loadable<AnyValue>,
) -> Result<()> {
    let policy = store.config().default_cache_policy;
    let equality = def.with_cache(&policy, |cache| cache.equality());
    let route: Vec<RouteStep> = deps
        .iter()
        .map(|(key, value)| (key.clone(), DepValueKey::of(value, equality)))
        .collect();
    def.with_cache(&policy, |cache| cache.insert(&route, loadable))
}

/// Save the dependencies an evaluation discovered into the store graph.
fn update_deps(
    store: &Store,
    tree: &TreeState,
    def: &Arc<SelectorDef>,
    deps: HashSet<NodeKey>,
    execution_id: Option<ExecutionId>,
) {
    let latest = execution_id
        .map(|id| def.executions.is_latest(store.id(), id))
        .unwrap_or(false);
    let versions = store.tree_versions();
    if latest || tree.version == versions.current || Some(tree.version) == versions.next {
        let target = versions.next.unwrap_or(versions.current);
        store.save_deps(&def.key, deps, target);
    }
}
