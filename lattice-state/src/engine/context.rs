//! Evaluation Context
//!
//! Tracks which selectors are being evaluated and gives getters and setters
//! their view of the store.
//!
//! # Implementation
//!
//! We use a thread-local stack of selector keys. Entering a selector read
//! pushes its key; the guard pops it when dropped. If a key is already on
//! the stack when it is entered again, the read is circular and fails with
//! the path from the first occurrence back to the key.
//!
//! [`GetContext`] is handed to selector getters. Every read through it is
//! recorded, in order, as a dependency of the running execution.
//! [`SetContext`] is handed to selector setters and collects their writes.

use std::cell::RefCell;

use indexmap::IndexMap;

use super::{WriteEntry, WriteSet};
use crate::error::{Error, Interrupt, Result, Suspension};
use crate::loadable::{Loadable, Promise};
use crate::node::{NodeKey, NodeRef, WritableNodeRef};
use crate::state::{Store, TreeState};
use crate::value::{self, AnyValue, NodeValue, WriteValue};

thread_local! {
    static EVALUATION_STACK: RefCell<Vec<NodeKey>> = const { RefCell::new(Vec::new()) };
}

/// Guard that pops the evaluation stack when dropped.
pub(crate) struct EvaluationFrame {
    key: NodeKey,
}

impl EvaluationFrame {
    /// Push `key`, or fail if it is already being evaluated.
    pub(crate) fn enter(key: &NodeKey) -> Result<Self> {
        EVALUATION_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(start) = stack.iter().position(|k| k == key) {
                let mut path = stack[start..].to_vec();
                path.push(key.clone());
                return Err(Error::CircularDependency { path });
            }
            stack.push(key.clone());
            Ok(Self { key: key.clone() })
        })
    }

    /// Number of selectors currently being evaluated on this thread.
    #[cfg(test)]
    pub(crate) fn depth() -> usize {
        EVALUATION_STACK.with(|stack| stack.borrow().len())
    }
}

impl Drop for EvaluationFrame {
    fn drop(&mut self) {
        EVALUATION_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            if let Some(key) = popped {
                debug_assert_eq!(
                    key, self.key,
                    "EvaluationFrame mismatch: expected {:?}, got {:?}",
                    self.key, key
                );
            }
        });
    }
}

/// A read of a node that is still loading.
pub(crate) type PendingRead = (NodeKey, Promise<AnyValue>);

/// What a getter sees.
pub struct GetContext<'a> {
    store: &'a Store,
    tree: &'a TreeState,
    selector: &'a NodeKey,
    substitute: Option<(NodeKey, Loadable<AnyValue>)>,
    deps: RefCell<IndexMap<NodeKey, Loadable<AnyValue>>>,
    pending: RefCell<Option<PendingRead>>,
    fatal: RefCell<Option<Error>>,
}

impl<'a> GetContext<'a> {
    pub(crate) fn new(
        store: &'a Store,
        tree: &'a TreeState,
        selector: &'a NodeKey,
        substitute: Option<(NodeKey, Loadable<AnyValue>)>,
    ) -> Self {
        Self {
            store,
            tree,
            selector,
            substitute,
            deps: RefCell::new(IndexMap::new()),
            pending: RefCell::new(None),
            fatal: RefCell::new(None),
        }
    }

    /// Key of the selector being evaluated.
    pub fn selector_key(&self) -> &NodeKey {
        self.selector
    }

    fn record_fatal(&self, err: Error) -> Interrupt {
        self.fatal.borrow_mut().get_or_insert_with(|| err.clone());
        Interrupt::Failed(err)
    }

    fn read(&self, key: &NodeKey) -> Loadable<AnyValue> {
        let loadable = match &self.substitute {
            Some((substituted, loadable)) if substituted == key => loadable.clone(),
            _ => match super::get_node_loadable(self.store, self.tree, key) {
                Ok(loadable) => loadable,
                Err(err) => {
                    self.record_fatal(err.clone());
                    Loadable::Error(err)
                }
            },
        };
        self.deps.borrow_mut().insert(key.clone(), loadable.clone());
        loadable
    }

    fn value_of(&self, key: &NodeKey, loadable: Loadable<AnyValue>) -> Result<AnyValue, Interrupt> {
        match loadable {
            Loadable::Value(v) => Ok(v),
            Loadable::Error(e) => Err(Interrupt::Failed(e)),
            Loadable::Loading(promise) => {
                let ready = promise.ready();
                *self.pending.borrow_mut() = Some((key.clone(), promise));
                Err(Interrupt::Pending(Suspension::new(Some(key.clone()), ready)))
            }
        }
    }

    /// Read a dependency's value.
    ///
    /// Fails with [`Interrupt::Pending`] while the dependency is loading and
    /// with [`Interrupt::Failed`] if it holds an error. Propagate both with
    /// `?`.
    pub fn get<T, N>(&self, node: &N) -> Result<T, Interrupt>
    where
        T: Clone + Send + 'static,
        N: NodeRef<T> + ?Sized,
    {
        let key = node.key();
        let erased = self.value_of(key, self.read(key))?;
        value::downcast::<T>(key, &erased).map_err(|e| self.record_fatal(e))
    }

    /// Read a dependency without suspending on it.
    pub fn get_loadable<T, N>(&self, node: &N) -> Loadable<T>
    where
        T: Clone + Send + 'static,
        N: NodeRef<T> + ?Sized,
    {
        let key = node.key();
        self.read(key).downcast(key)
    }

    /// Read a dependency by key.
    pub fn get_by_key(&self, key: &NodeKey) -> Result<AnyValue, Interrupt> {
        self.value_of(key, self.read(key))
    }

    pub(crate) fn take_fatal(&self) -> Option<Error> {
        self.fatal.borrow_mut().take()
    }

    pub(crate) fn into_parts(self) -> (IndexMap<NodeKey, Loadable<AnyValue>>, Option<PendingRead>) {
        (self.deps.into_inner(), self.pending.into_inner())
    }
}

/// What a setter sees.
pub struct SetContext<'a> {
    store: &'a Store,
    tree: &'a TreeState,
    selector: &'a NodeKey,
    writes: RefCell<WriteSet>,
    fatal: RefCell<Option<Error>>,
}

impl<'a> SetContext<'a> {
    pub(crate) fn new(store: &'a Store, tree: &'a TreeState, selector: &'a NodeKey) -> Self {
        Self {
            store,
            tree,
            selector,
            writes: RefCell::new(IndexMap::new()),
            fatal: RefCell::new(None),
        }
    }

    /// Key of the selector being written.
    pub fn selector_key(&self) -> &NodeKey {
        self.selector
    }

    fn record_fatal(&self, err: Error) -> Interrupt {
        self.fatal.borrow_mut().get_or_insert_with(|| err.clone());
        Interrupt::Failed(err)
    }

    /// Read a node, seeing the writes this setter already made.
    ///
    /// Reading a node that is still loading is an error.
    pub fn get<T, N>(&self, node: &N) -> Result<T, Interrupt>
    where
        T: Clone + Send + 'static,
        N: NodeRef<T> + ?Sized,
    {
        let key = node.key();
        let written = self.writes.borrow().get(key).cloned();
        let loadable = match written {
            Some(WriteEntry::Set(loadable)) => loadable,
            Some(WriteEntry::Reset) => super::default_loadable(self.store, self.tree, key)
                .map_err(|e| self.record_fatal(e))?,
            None => super::get_node_loadable(self.store, self.tree, key)
                .map_err(|e| self.record_fatal(e))?,
        };
        match loadable {
            Loadable::Value(v) => value::downcast::<T>(key, &v).map_err(|e| self.record_fatal(e)),
            Loadable::Error(e) => Err(Interrupt::Failed(e)),
            Loadable::Loading(_) => Err(self.record_fatal(Error::AsyncInSetter {
                setter: self.selector.clone(),
                dependency: key.clone(),
            })),
        }
    }

    /// Write a node. Writes are applied in call order when the setter
    /// returns.
    pub fn set<T, N>(&self, node: &N, value: T) -> Result<()>
    where
        T: NodeValue,
        N: WritableNodeRef<T> + ?Sized,
    {
        self.write(node.key(), WriteValue::Value(value::erase(value)))
    }

    /// Reset a node to its default.
    pub fn reset<T, N>(&self, node: &N) -> Result<()>
    where
        N: WritableNodeRef<T> + ?Sized,
    {
        self.write(node.key(), WriteValue::Reset(value::DefaultValue))
    }

    fn write(&self, key: &NodeKey, write: WriteValue<AnyValue>) -> Result<()> {
        let writes = super::set_node_value(self.store, self.tree, key, write)?;
        self.writes.borrow_mut().extend(writes);
        Ok(())
    }

    pub(crate) fn take_fatal(&self) -> Option<Error> {
        self.fatal.borrow_mut().take()
    }

    pub(crate) fn into_writes(self) -> WriteSet {
        self.writes.into_inner()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
