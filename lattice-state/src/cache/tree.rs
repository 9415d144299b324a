//! Tree Cache
//!
//! Entries are stored along their route: each branch is keyed by the
//! dependency read at that depth and fans out by that dependency's value.
//! Because a selector reads its dependencies deterministically, every
//! branch at a given position of a given path always names the same
//! dependency. Inserting a route that disagrees is a corrupted cache.

use std::collections::HashMap;

use super::{corrupted, CacheEquality, CacheLookup, DepValueKey, RouteStep, SelectorCache};
use crate::error::Result;
use crate::loadable::Loadable;
use crate::node::NodeKey;
use crate::value::AnyValue;

#[derive(Debug)]
enum TreeNode {
    Branch {
        key: NodeKey,
        branches: HashMap<DepValueKey, TreeNode>,
    },
    Leaf(Loadable<AnyValue>),
}

/// Route-keyed cache with no eviction.
#[derive(Debug)]
pub struct TreeCache {
    selector: NodeKey,
    equality: CacheEquality,
    root: Option<TreeNode>,
    leaves: usize,
}

impl TreeCache {
    /// Create an empty cache for `selector`.
    pub fn new(selector: NodeKey, equality: CacheEquality) -> Self {
        Self {
            selector,
            equality,
            root: None,
            leaves: 0,
        }
    }

    /// Dependency read first by every cached evaluation, if any.
    pub fn root_key(&self) -> Option<&NodeKey> {
        match &self.root {
            Some(TreeNode::Branch { key, .. }) => Some(key),
            _ => None,
        }
    }

    fn find(&self, route: &[RouteStep]) -> Option<&TreeNode> {
        let mut node = self.root.as_ref()?;
        for (key, value) in route {
            match node {
                TreeNode::Branch { key: branch_key, branches } if branch_key == key => {
                    node = branches.get(value)?;
                }
                _ => return None,
            }
        }
        Some(node)
    }
}

fn count_leaves(node: &TreeNode) -> usize {
    match node {
        TreeNode::Leaf(_) => 1,
        TreeNode::Branch { branches, .. } => branches.values().map(count_leaves).sum(),
    }
}

/// Remove the leaf at the end of `route` below `node`, pruning branches
/// left empty. Returns whether a leaf was removed and whether `node`
/// itself is now empty.
fn delete_below(node: &mut TreeNode, route: &[RouteStep]) -> (bool, bool) {
    let Some(((key, value), rest)) = route.split_first() else {
        return (matches!(node, TreeNode::Leaf(_)), true);
    };
    let TreeNode::Branch { key: branch_key, branches } = node else {
        return (false, false);
    };
    if branch_key != key {
        return (false, false);
    }
    let Some(child) = branches.get_mut(value) else {
        return (false, false);
    };
    let (removed, child_empty) = delete_below(child, rest);
    if removed && child_empty {
        branches.remove(value);
    }
    (removed, branches.is_empty())
}

impl SelectorCache for TreeCache {
    fn equality(&self) -> CacheEquality {
        self.equality
    }

    fn lookup(&mut self, route: &[RouteStep]) -> CacheLookup {
        match self.find(route) {
            Some(TreeNode::Leaf(loadable)) => CacheLookup::Hit(loadable.clone()),
            Some(TreeNode::Branch { key, .. }) => CacheLookup::Branch(key.clone()),
            None => CacheLookup::Miss,
        }
    }

    fn insert(&mut self, route: &[RouteStep], loadable: Loadable<AnyValue>) -> Result<()> {
        let delta = insert_at(&mut self.root, route, loadable, &self.selector)?;
        self.leaves = self.leaves.saturating_add_signed(delta);
        Ok(())
    }

    fn delete(&mut self, route: &[RouteStep]) -> bool {
        let Some(root) = self.root.as_mut() else {
            return false;
        };
        let (removed, empty) = delete_below(root, route);
        if removed {
            self.leaves -= 1;
            if empty {
                self.root = None;
            }
        }
        removed
    }

    fn clear(&mut self) {
        self.root = None;
        self.leaves = 0;
    }

    fn len(&self) -> usize {
        self.leaves
    }
}

/// Store `loadable` at the end of `route` below `slot`. Returns the change
/// in the number of leaves.
fn insert_at(
    slot: &mut Option<TreeNode>,
    route: &[RouteStep],
    loadable: Loadable<AnyValue>,
    selector: &NodeKey,
) -> Result<isize> {
    let Some(((key, value), rest)) = route.split_first() else {
        let replaced = slot.as_ref().map(count_leaves).unwrap_or(0) as isize;
        *slot = Some(TreeNode::Leaf(loadable));
        return Ok(1 - replaced);
    };

    let mut delta = 0;
    if !matches!(slot, Some(TreeNode::Branch { .. })) {
        if slot.is_some() {
            // A shorter route ended here before; the getter now reads more.
            tracing::trace!(selector = %selector, dependency = %key, "replacing leaf with branch");
            delta -= 1;
        }
        *slot = Some(TreeNode::Branch {
            key: key.clone(),
            branches: HashMap::new(),
        });
    }

    if let Some(TreeNode::Branch { key: branch_key, branches }) = slot {
        if branch_key != key {
            return Err(corrupted(selector, key, branch_key));
        }
        let mut child = branches.remove(value);
        let inserted = insert_at(&mut child, rest, loadable, selector);
        if let Some(child) = child {
            branches.insert(value.clone(), child);
        }
        delta += inserted?;
    }
    Ok(delta)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::value::erase;

    fn step(key: &str, value: &str) -> RouteStep {
        (NodeKey::from(key), DepValueKey::Stable(value.to_string()))
    }

    fn cache() -> TreeCache {
        TreeCache::new(NodeKey::from("sel"), CacheEquality::Value)
    }

    #[test]
    fn stepwise_lookup_walks_branches() {
        let mut cache = cache();
        let route = vec![step("a", "1"), step("b", "2")];
        cache
            .insert(&route, Loadable::Value(erase(3_i32)))
            .expect("insert");

        assert!(matches!(cache.lookup(&[]), CacheLookup::Branch(k) if k.as_str() == "a"));
        assert!(matches!(cache.lookup(&route[..1]), CacheLookup::Branch(k) if k.as_str() == "b"));
        assert!(matches!(cache.lookup(&route), CacheLookup::Hit(_)));
        assert!(matches!(cache.lookup(&[step("a", "9")]), CacheLookup::Miss));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.root_key().map(|k| k.as_str()), Some("a"));
    }

    #[test]
    fn no_dependencies_is_a_root_leaf() {
        let mut cache = cache();
        assert!(matches!(cache.lookup(&[]), CacheLookup::Miss));
        cache.insert(&[], Loadable::Value(erase(1_u8))).expect("insert");
        assert!(matches!(cache.lookup(&[]), CacheLookup::Hit(_)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn mismatched_branch_is_corruption() {
        let mut cache = cache();
        cache
            .insert(&[step("a", "1"), step("b", "2")], Loadable::Value(erase(0_i32)))
            .expect("insert");
        let err = cache
            .insert(&[step("a", "1"), step("c", "2")], Loadable::Value(erase(0_i32)))
            .err();
        assert!(matches!(err, Some(Error::CacheCorrupted { .. })));
    }

    #[test]
    fn delete_prunes_to_the_root() {
        let mut cache = cache();
        let first = vec![step("a", "1"), step("b", "1")];
        let second = vec![step("a", "1"), step("b", "2")];
        cache.insert(&first, Loadable::Value(erase(1_i32))).expect("insert");
        cache.insert(&second, Loadable::Value(erase(2_i32))).expect("insert");
        assert_eq!(cache.len(), 2);

        assert!(cache.delete(&first));
        assert!(!cache.delete(&first));
        assert!(matches!(cache.lookup(&second), CacheLookup::Hit(_)));
        assert!(cache.delete(&second));
        assert!(cache.is_empty());
        assert!(cache.root_key().is_none());
    }
}
