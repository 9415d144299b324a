//! Executions
//!
//! One run of a selector getter is an *execution*, tagged with a globally
//! increasing id. A selector keeps, per store, the info of the latest
//! execution still in flight: what it has read so far and the loadable it
//! handed out. A new read reuses that execution when every dependency it
//! recorded still has the same value; otherwise a new execution takes its
//! place and the old one can no longer publish into that store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::loadable::Loadable;
use crate::node::NodeKey;
use crate::state::{StoreId, Version, WeakStore};
use crate::value::AnyValue;

/// Execution identifier.
pub type ExecutionId = u64;

static EXECUTION_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Allocate a fresh execution id.
pub(crate) fn next_execution_id() -> ExecutionId {
    EXECUTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// What a store knows about a selector's in-flight execution.
#[derive(Debug, Clone)]
pub(crate) struct ExecutionInfo {
    pub(crate) execution_id: ExecutionId,
    pub(crate) loadable: Loadable<AnyValue>,
    pub(crate) dep_values: IndexMap<NodeKey, Loadable<AnyValue>>,
    /// Versions already checked against this execution. `true` means the
    /// execution's dependencies matched that version.
    pub(crate) state_versions: HashMap<Version, bool>,
}

/// Per-selector execution bookkeeping, shared by every store.
#[derive(Default)]
pub(crate) struct ExecutionTable {
    latest: Mutex<HashMap<StoreId, ExecutionInfo>>,
    waiting: Mutex<HashMap<ExecutionId, Vec<WeakStore>>>,
}

impl ExecutionTable {
    pub(crate) fn get(&self, store: StoreId) -> Option<ExecutionInfo> {
        self.latest.lock().get(&store).cloned()
    }

    /// Infos of every store, `store` first.
    pub(crate) fn candidates(&self, store: StoreId) -> Vec<(StoreId, ExecutionInfo)> {
        let latest = self.latest.lock();
        let mut out: Vec<(StoreId, ExecutionInfo)> = Vec::with_capacity(latest.len());
        if let Some(own) = latest.get(&store) {
            out.push((store, own.clone()));
        }
        out.extend(
            latest
                .iter()
                .filter(|(id, _)| **id != store)
                .map(|(id, info)| (*id, info.clone())),
        );
        out
    }

    pub(crate) fn set(&self, store: StoreId, info: ExecutionInfo) {
        self.latest.lock().insert(store, info);
    }

    pub(crate) fn clear(&self, store: StoreId) -> Option<ExecutionInfo> {
        self.latest.lock().remove(&store)
    }

    pub(crate) fn is_latest(&self, store: StoreId, execution_id: ExecutionId) -> bool {
        self.latest
            .lock()
            .get(&store)
            .map(|info| info.execution_id == execution_id)
            .unwrap_or(false)
    }

    pub(crate) fn latest_id(&self, store: StoreId) -> Option<ExecutionId> {
        self.latest.lock().get(&store).map(|info| info.execution_id)
    }

    /// Record the dependencies the latest execution has read so far.
    pub(crate) fn update_dep_values(
        &self,
        store: StoreId,
        execution_id: ExecutionId,
        deps: &IndexMap<NodeKey, Loadable<AnyValue>>,
    ) {
        if let Some(info) = self.latest.lock().get_mut(&store) {
            if info.execution_id == execution_id {
                info.dep_values = deps.clone();
            }
        }
    }

    /// Remember whether `version` matched the execution `execution_id`.
    pub(crate) fn mark_version(
        &self,
        store: StoreId,
        execution_id: ExecutionId,
        version: Version,
        matched: bool,
    ) {
        if let Some(info) = self.latest.lock().get_mut(&store) {
            if info.execution_id == execution_id {
                info.state_versions.insert(version, matched);
            }
        }
    }

    /// Register a store that reused another store's execution.
    pub(crate) fn add_waiting_store(&self, execution_id: ExecutionId, store: WeakStore) {
        let mut waiting = self.waiting.lock();
        let stores = waiting.entry(execution_id).or_default();
        if !stores.iter().any(|s| s.same_store(&store)) {
            stores.push(store);
        }
    }

    pub(crate) fn take_waiting_stores(&self, execution_id: ExecutionId) -> Vec<WeakStore> {
        self.waiting.lock().remove(&execution_id).unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.latest.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(execution_id: ExecutionId) -> ExecutionInfo {
        ExecutionInfo {
            execution_id,
            loadable: Loadable::loading_forever(),
            dep_values: IndexMap::new(),
            state_versions: HashMap::new(),
        }
    }

    #[test]
    fn execution_ids_increase() {
        let a = next_execution_id();
        let b = next_execution_id();
        assert!(b > a);
    }

    #[test]
    fn only_the_latest_execution_matches() {
        let table = ExecutionTable::default();
        let store = StoreId::new();
        table.set(store, info(1));
        table.set(store, info(2));
        assert!(!table.is_latest(store, 1));
        assert!(table.is_latest(store, 2));

        table.mark_version(store, 1, 10, true);
        assert!(table.get(store).is_some_and(|i| i.state_versions.is_empty()));
        table.mark_version(store, 2, 10, true);
        assert_eq!(
            table.get(store).and_then(|i| i.state_versions.get(&10).copied()),
            Some(true)
        );

        assert_eq!(table.clear(store).map(|i| i.execution_id), Some(2));
        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn candidates_list_own_store_first() {
        let table = ExecutionTable::default();
        let own = StoreId::new();
        let other = StoreId::new();
        table.set(other, info(5));
        table.set(own, info(6));
        let candidates = table.candidates(own);
        assert_eq!(candidates.first().map(|(id, _)| *id), Some(own));
        assert_eq!(candidates.len(), 2);
    }
}
