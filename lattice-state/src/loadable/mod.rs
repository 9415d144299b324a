//! Loadable Values
//!
//! A [`Loadable`] is the tri-state container every node read produces:
//!
//! - `Value`: the node has a value.
//! - `Error`: computing the node failed.
//! - `Loading`: the node is waiting on a [`Promise`].
//!
//! Loadables are immutable. A state transition always produces a new
//! loadable; a `Loading` loadable's promise settles with the contents of
//! its successor rather than flipping the loadable in place.
//!
//! # Suspend and retry
//!
//! [`Loadable::map`] takes a mapper returning `Result<U, Interrupt>`. A
//! mapper that reports [`Interrupt::Pending`] produces a `Loading` result
//! and is invoked again once the suspension settles, so "wait for this
//! other value, then try again" composes through `map` chains.

mod promise;

pub use promise::{Promise, Resolver};

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::{Error, Interrupt, Result, Suspension};
use crate::node::NodeKey;
use crate::value::{self, AnyValue, NodeValue};

/// Discriminant of a [`Loadable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadableState {
    /// The loadable holds a value.
    HasValue,
    /// The loadable holds an error.
    HasError,
    /// The loadable holds a pending promise.
    Loading,
}

/// A value, an error, or a promise of a value.
#[derive(Clone)]
pub enum Loadable<T> {
    /// A value is available.
    Value(T),
    /// Computing the value failed.
    Error(Error),
    /// The value is not available yet.
    Loading(Promise<T>),
}

impl<T> Loadable<T>
where
    T: Clone + Send + 'static,
{
    /// A loadable holding `value`.
    pub fn of(value: T) -> Self {
        Loadable::Value(value)
    }

    /// A loadable holding `error`.
    pub fn error(error: Error) -> Self {
        Loadable::Error(error)
    }

    /// A loadable waiting on `promise`.
    ///
    /// An already settled promise is unwrapped right away.
    pub fn from_promise(promise: Promise<T>) -> Self {
        match promise.peek() {
            Some(Ok(v)) => Loadable::Value(v),
            Some(Err(e)) => Loadable::Error(e),
            None => Loadable::Loading(promise),
        }
    }

    /// A loadable that is loading forever.
    pub fn loading_forever() -> Self {
        Loadable::Loading(Promise::never())
    }

    /// Which of the three states this loadable is in.
    pub fn state(&self) -> LoadableState {
        match self {
            Loadable::Value(_) => LoadableState::HasValue,
            Loadable::Error(_) => LoadableState::HasError,
            Loadable::Loading(_) => LoadableState::Loading,
        }
    }

    /// Whether a value is available.
    pub fn has_value(&self) -> bool {
        matches!(self, Loadable::Value(_))
    }

    /// Whether this loadable holds an error.
    pub fn has_error(&self) -> bool {
        matches!(self, Loadable::Error(_))
    }

    /// Whether this loadable is still loading.
    pub fn is_loading(&self) -> bool {
        matches!(self, Loadable::Loading(_))
    }

    /// The value, or why it is not available.
    ///
    /// An error comes back as [`Interrupt::Failed`], a pending promise as
    /// [`Interrupt::Pending`]. Getters propagate both with `?`.
    pub fn value(&self) -> Result<T, Interrupt> {
        match self {
            Loadable::Value(v) => Ok(v.clone()),
            Loadable::Error(e) => Err(Interrupt::Failed(e.clone())),
            Loadable::Loading(p) => Err(Interrupt::Pending(Suspension::new(None, p.ready()))),
        }
    }

    /// The value, if available.
    pub fn value_maybe(&self) -> Option<T> {
        match self {
            Loadable::Value(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// The error, if any.
    pub fn error_maybe(&self) -> Option<&Error> {
        match self {
            Loadable::Error(e) => Some(e),
            _ => None,
        }
    }

    /// The pending promise, if loading.
    pub fn promise_maybe(&self) -> Option<&Promise<T>> {
        match self {
            Loadable::Loading(p) => Some(p),
            _ => None,
        }
    }

    /// A promise of the value.
    ///
    /// Settled loadables produce already-settled promises; a loading
    /// loadable hands back its own promise.
    pub fn to_promise(&self) -> Promise<T> {
        match self {
            Loadable::Value(v) => Promise::resolved(v.clone()),
            Loadable::Error(e) => Promise::rejected(e.clone()),
            Loadable::Loading(p) => p.clone(),
        }
    }

    /// Transform the value.
    ///
    /// Errors pass through untouched. A mapper error becomes `Error`. A
    /// mapper suspension becomes `Loading`, and the mapper runs again with
    /// the same input once the suspension settles.
    pub fn map<U, F>(&self, f: F) -> Loadable<U>
    where
        U: Clone + Send + 'static,
        F: Fn(T) -> Result<U, Interrupt> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        match self {
            Loadable::Value(v) => apply_mapper(v.clone(), f),
            Loadable::Error(e) => Loadable::Error(e.clone()),
            Loadable::Loading(p) => {
                let (next, resolver) = Promise::pending();
                p.on_settle(move |outcome| match outcome {
                    Ok(v) => settle_mapped(v, f, resolver),
                    Err(e) => {
                        resolver.reject(e);
                    }
                });
                Loadable::Loading(next)
            }
        }
    }

    /// Transform the value into another loadable and flatten.
    pub fn and_then<U, F>(&self, f: F) -> Loadable<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Loadable<U> + Send + 'static,
    {
        match self {
            Loadable::Value(v) => f(v.clone()),
            Loadable::Error(e) => Loadable::Error(e.clone()),
            Loadable::Loading(p) => {
                let (next, resolver) = Promise::pending();
                p.on_settle(move |outcome| match outcome {
                    Ok(v) => match f(v) {
                        Loadable::Value(u) => {
                            resolver.resolve(u);
                        }
                        Loadable::Error(e) => {
                            resolver.reject(e);
                        }
                        Loadable::Loading(inner) => {
                            inner.on_settle(move |outcome| {
                                resolver.settle(outcome);
                            });
                        }
                    },
                    Err(e) => {
                        resolver.reject(e);
                    }
                });
                Loadable::Loading(next)
            }
        }
    }

    /// Combine loadables.
    ///
    /// All values give a vector of values; any error gives the first error
    /// in input order; otherwise the result waits for every input.
    pub fn all(loadables: Vec<Loadable<T>>) -> Loadable<Vec<T>> {
        if let Some(err) = loadables.iter().find_map(|l| l.error_maybe()) {
            return Loadable::Error(err.clone());
        }
        if loadables.iter().all(|l| l.has_value()) {
            return Loadable::Value(loadables.iter().filter_map(|l| l.value_maybe()).collect());
        }

        let len = loadables.len();
        let slots: Arc<Mutex<(Vec<Option<T>>, usize)>> =
            Arc::new(Mutex::new((vec![None; len], len)));
        let (promise, resolver) = Promise::pending();

        for (index, loadable) in loadables.into_iter().enumerate() {
            let slots = Arc::clone(&slots);
            let resolver = resolver.clone();
            loadable.to_promise().on_settle(move |outcome| match outcome {
                Ok(v) => {
                    let done = {
                        let mut guard = slots.lock();
                        guard.0[index] = Some(v);
                        guard.1 -= 1;
                        if guard.1 == 0 {
                            Some(guard.0.iter().flatten().cloned().collect::<Vec<_>>())
                        } else {
                            None
                        }
                    };
                    if let Some(values) = done {
                        resolver.resolve(values);
                    }
                }
                Err(e) => {
                    resolver.reject(e);
                }
            });
        }

        Loadable::Loading(promise)
    }

    /// Keyed form of [`Loadable::all`]; keys keep their order.
    pub fn all_map<K>(loadables: IndexMap<K, Loadable<T>>) -> Loadable<IndexMap<K, T>>
    where
        K: Clone + Hash + Eq + Send + Sync + 'static,
    {
        let keys: Vec<K> = loadables.keys().cloned().collect();
        Loadable::all(loadables.into_values().collect()).map(move |values| {
            Ok(keys.iter().cloned().zip(values).collect::<IndexMap<K, T>>())
        })
    }
}

fn apply_mapper<T, U, F>(value: T, f: Arc<F>) -> Loadable<U>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    F: Fn(T) -> Result<U, Interrupt> + Send + Sync + 'static,
{
    match f(value.clone()) {
        Ok(u) => Loadable::Value(u),
        Err(Interrupt::Failed(e)) => Loadable::Error(e),
        Err(Interrupt::Pending(suspension)) => {
            let (next, resolver) = Promise::pending();
            retry_after(suspension, value, f, resolver);
            Loadable::Loading(next)
        }
    }
}

fn settle_mapped<T, U, F>(value: T, f: Arc<F>, resolver: Resolver<U>)
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    F: Fn(T) -> Result<U, Interrupt> + Send + Sync + 'static,
{
    match f(value.clone()) {
        Ok(u) => {
            resolver.resolve(u);
        }
        Err(Interrupt::Failed(e)) => {
            resolver.reject(e);
        }
        Err(Interrupt::Pending(suspension)) => retry_after(suspension, value, f, resolver),
    }
}

fn retry_after<T, U, F>(suspension: Suspension, value: T, f: Arc<F>, resolver: Resolver<U>)
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    F: Fn(T) -> Result<U, Interrupt> + Send + Sync + 'static,
{
    suspension.ready().on_settle(move |outcome| match outcome {
        Ok(()) => settle_mapped(value, f, resolver),
        Err(e) => {
            resolver.reject(e);
        }
    });
}

impl<T: NodeValue + Clone> Loadable<T> {
    /// Erase the value type.
    pub fn into_any(self) -> Loadable<AnyValue> {
        match self {
            Loadable::Value(v) => Loadable::Value(value::erase(v)),
            Loadable::Error(e) => Loadable::Error(e),
            Loadable::Loading(p) => Loadable::Loading(p.then(|v| Ok(value::erase(v)))),
        }
    }
}

impl Loadable<AnyValue> {
    /// Downcast an erased loadable for a typed handle.
    pub(crate) fn downcast<T>(&self, key: &NodeKey) -> Loadable<T>
    where
        T: Clone + Send + 'static,
    {
        let key = key.clone();
        match self {
            Loadable::Value(v) => match value::downcast::<T>(&key, v) {
                Ok(v) => Loadable::Value(v),
                Err(e) => Loadable::Error(e),
            },
            Loadable::Error(e) => Loadable::Error(e.clone()),
            Loadable::Loading(p) => {
                Loadable::Loading(p.then(move |v| value::downcast::<T>(&key, &v)))
            }
        }
    }

    /// Whether two erased loadables are interchangeable for dependency
    /// tracking: same state and same contents.
    pub(crate) fn same_as(&self, other: &Loadable<AnyValue>) -> bool {
        match (self, other) {
            (Loadable::Value(a), Loadable::Value(b)) => value::same_value(a, b),
            (Loadable::Error(a), Loadable::Error(b)) => a.same_as(b),
            (Loadable::Loading(a), Loadable::Loading(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Loadable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Loadable::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Loadable::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Loadable::Loading(p) => f.debug_tuple("Loading").field(p).finish(),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn value_reports_state() {
        let l = Loadable::of(3);
        assert_eq!(l.state(), LoadableState::HasValue);
        assert_eq!(l.value().ok(), Some(3));

        let e: Loadable<i32> = Loadable::error(Error::msg("bad"));
        assert!(matches!(e.value(), Err(Interrupt::Failed(_))));

        let p: Loadable<i32> = Loadable::loading_forever();
        assert!(matches!(p.value(), Err(Interrupt::Pending(_))));
    }

    #[test]
    fn to_promise_settles_immediately_for_settled_states() {
        assert_eq!(
            Loadable::of(1).to_promise().peek().and_then(|r| r.ok()),
            Some(1)
        );
        let err: Loadable<i32> = Loadable::error(Error::msg("x"));
        assert!(matches!(err.to_promise().peek(), Some(Err(_))));

        let (promise, _resolver) = Promise::<i32>::pending();
        let loading = Loadable::Loading(promise.clone());
        assert_eq!(loading.to_promise().id(), promise.id());
    }

    #[test]
    fn map_applies_to_values_and_skips_errors() {
        let mapped = Loadable::of(2).map(|v| Ok(v * 10));
        assert_eq!(mapped.value_maybe(), Some(20));

        let failed = Loadable::of(2).map(|_| -> Result<i32, Interrupt> {
            Err(Error::msg("mapper failed").into())
        });
        assert_eq!(
            failed.error_maybe().map(|e| e.to_string()),
            Some("mapper failed".to_string())
        );

        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();
        let err: Loadable<i32> = Loadable::error(Error::msg("upstream"));
        let passed = err.map(move |v| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(v)
        });
        assert!(passed.has_error());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn map_chains_through_loading() {
        let (promise, resolver) = Promise::<i32>::pending();
        let mapped = Loadable::Loading(promise).map(|v| Ok(v + 1));
        assert!(mapped.is_loading());

        resolver.resolve(41);
        let out = mapped.to_promise().peek().and_then(|r| r.ok());
        assert_eq!(out, Some(42));
    }

    #[test]
    fn map_retries_after_suspension() {
        let (gate, open) = Promise::<()>::pending();
        let ready = Arc::new(AtomicI32::new(0));
        let calls = Arc::new(AtomicI32::new(0));

        let ready_clone = ready.clone();
        let calls_clone = calls.clone();
        let gate_clone = gate.clone();
        let mapped = Loadable::of(5).map(move |v| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            if ready_clone.load(Ordering::SeqCst) == 0 {
                return Err(Interrupt::Pending(Suspension::new(None, gate_clone.clone())));
            }
            Ok(v * 2)
        });
        assert!(mapped.is_loading());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        ready.store(1, Ordering::SeqCst);
        open.resolve(());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(mapped.to_promise().peek().and_then(|r| r.ok()), Some(10));
    }

    #[test]
    fn all_combines_states() {
        let values = Loadable::all(vec![Loadable::of(1), Loadable::of(2)]);
        assert_eq!(values.value_maybe(), Some(vec![1, 2]));

        let (promise, _r) = Promise::<i32>::pending();
        let with_error = Loadable::all(vec![
            Loadable::Loading(promise),
            Loadable::error(Error::msg("first")),
            Loadable::error(Error::msg("second")),
        ]);
        assert_eq!(
            with_error.error_maybe().map(|e| e.to_string()),
            Some("first".to_string())
        );

        let (p1, r1) = Promise::<i32>::pending();
        let (p2, r2) = Promise::<i32>::pending();
        let waiting = Loadable::all(vec![
            Loadable::Loading(p1),
            Loadable::of(0),
            Loadable::Loading(p2),
        ]);
        assert!(waiting.is_loading());
        r2.resolve(2);
        assert!(waiting.to_promise().peek().is_none());
        r1.resolve(1);
        assert_eq!(
            waiting.to_promise().peek().and_then(|r| r.ok()),
            Some(vec![1, 0, 2])
        );
    }

    #[test]
    fn all_map_keeps_keys() {
        let mut input = IndexMap::new();
        input.insert("b", Loadable::of(2));
        input.insert("a", Loadable::of(1));
        let out = Loadable::all_map(input).value_maybe().unwrap_or_default();
        assert_eq!(out.keys().copied().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(out.get("a"), Some(&1));
    }
}
