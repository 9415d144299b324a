//! LRU eviction over a [`TreeCache`].
//!
//! Hits and insertions move a route to the back of the recency list; once
//! the number of entries exceeds `max_size`, routes are evicted from the
//! front and deleted from the underlying tree.

use indexmap::IndexSet;

use super::{CacheEquality, CacheLookup, RouteStep, SelectorCache, TreeCache};
use crate::error::Result;
use crate::loadable::Loadable;
use crate::value::AnyValue;

/// Tree cache bounded to `max_size` entries.
#[derive(Debug)]
pub struct LruCache {
    tree: TreeCache,
    recency: IndexSet<Vec<RouteStep>>,
    max_size: usize,
}

impl LruCache {
    /// Bound `tree` to `max_size` entries. A zero size is treated as one.
    pub fn new(tree: TreeCache, max_size: usize) -> Self {
        Self {
            tree,
            recency: IndexSet::new(),
            max_size: max_size.max(1),
        }
    }

    /// Capacity.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn touch(&mut self, route: &[RouteStep]) {
        if let Some(index) = self.recency.get_index_of(route) {
            let last = self.recency.len() - 1;
            self.recency.move_index(index, last);
        } else {
            self.recency.insert(route.to_vec());
        }
    }

    fn evict(&mut self) {
        while self.recency.len() > self.max_size {
            let Some(oldest) = self.recency.shift_remove_index(0) else {
                break;
            };
            self.tree.delete(&oldest);
        }
    }
}

impl SelectorCache for LruCache {
    fn equality(&self) -> CacheEquality {
        self.tree.equality()
    }

    fn lookup(&mut self, route: &[RouteStep]) -> CacheLookup {
        let found = self.tree.lookup(route);
        if let CacheLookup::Hit(_) = &found {
            self.touch(route);
        }
        found
    }

    fn insert(&mut self, route: &[RouteStep], loadable: Loadable<AnyValue>) -> Result<()> {
        self.tree.insert(route, loadable)?;
        self.touch(route);
        // A route replaced as a prefix of a longer one no longer exists.
        let tree = &mut self.tree;
        self.recency
            .retain(|route| matches!(tree.lookup(route), CacheLookup::Hit(_)));
        self.evict();
        Ok(())
    }

    fn delete(&mut self, route: &[RouteStep]) -> bool {
        self.recency.shift_remove(route);
        self.tree.delete(route)
    }

    fn clear(&mut self) {
        self.recency.clear();
        self.tree.clear();
    }

    fn len(&self) -> usize {
        self.tree.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DepValueKey;
    use crate::node::NodeKey;
    use crate::value::erase;

    fn route(value: &str) -> Vec<RouteStep> {
        vec![(NodeKey::from("dep"), DepValueKey::Stable(value.to_string()))]
    }

    fn lru(max_size: usize) -> LruCache {
        LruCache::new(TreeCache::new(NodeKey::from("sel"), CacheEquality::Value), max_size)
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = lru(2);
        cache.insert(&route("1"), Loadable::Value(erase(1_i32))).expect("insert");
        cache.insert(&route("2"), Loadable::Value(erase(2_i32))).expect("insert");

        // Touch 1 so that 2 becomes the oldest.
        assert!(matches!(cache.lookup(&route("1")), CacheLookup::Hit(_)));
        cache.insert(&route("3"), Loadable::Value(erase(3_i32))).expect("insert");

        assert_eq!(cache.len(), 2);
        assert!(matches!(cache.lookup(&route("1")), CacheLookup::Hit(_)));
        assert!(matches!(cache.lookup(&route("2")), CacheLookup::Miss));
        assert!(matches!(cache.lookup(&route("3")), CacheLookup::Hit(_)));
    }

    #[test]
    fn most_recent_keeps_one_entry() {
        let mut cache = lru(1);
        cache.insert(&route("a"), Loadable::Value(erase(1_i32))).expect("insert");
        cache.insert(&route("b"), Loadable::Value(erase(2_i32))).expect("insert");
        assert_eq!(cache.len(), 1);
        assert!(matches!(cache.lookup(&route("a")), CacheLookup::Miss));
        assert_eq!(cache.max_size(), 1);
    }
}
