//! Graph Traversals
//!
//! Orderings over one version of the dependency graph.
//!
//! # Algorithms
//!
//! - [`downstream_nodes`]: breadth-first walk from changed nodes along child
//!   edges. This is the set that must be invalidated after a write and the
//!   set whose subscribers are notified at the end of a transaction.
//! - [`topological_sort`]: Kahn's algorithm restricted to a node set, so
//!   that dependencies come before their dependents. Notifications go out in
//!   this order.
//! - [`children_before_parents`]: depth-first post-order used by garbage
//!   collection, which has to look at every child before deciding whether
//!   a parent can go.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexSet;

use super::GraphArena;
use crate::node::NodeKey;
use crate::state::Version;

/// Every node reachable from `changed` through child edges, `changed`
/// included, in breadth-first order.
pub fn downstream_nodes<'a, I>(graph: &GraphArena, version: Version, changed: I) -> IndexSet<NodeKey>
where
    I: IntoIterator<Item = &'a NodeKey>,
{
    let mut visited = IndexSet::new();
    let mut queue: VecDeque<NodeKey> = changed.into_iter().cloned().collect();

    while let Some(key) = queue.pop_front() {
        if !visited.insert(key.clone()) {
            continue;
        }
        for child in graph.children_of_node(version, &key) {
            if !visited.contains(&child) {
                queue.push_back(child);
            }
        }
    }

    visited
}

/// Sort `nodes` so that dependencies come before dependents.
///
/// Only edges inside `nodes` count. Nodes caught in a cycle are appended at
/// the end in input order.
pub fn topological_sort(graph: &GraphArena, version: Version, nodes: &IndexSet<NodeKey>) -> Vec<NodeKey> {
    let mut in_degree: HashMap<&NodeKey, usize> = HashMap::new();
    let mut result = Vec::with_capacity(nodes.len());
    let mut queue = VecDeque::new();

    // Calculate in-degrees (only counting edges within the node set)
    for key in nodes {
        let degree = graph
            .parents_of_node(version, key)
            .iter()
            .filter(|parent| nodes.contains(*parent))
            .count();
        in_degree.insert(key, degree);
        if degree == 0 {
            queue.push_back(key.clone());
        }
    }

    // Kahn's algorithm
    while let Some(key) = queue.pop_front() {
        for child in graph.children_of_node(version, &key) {
            if let Some(degree) = in_degree.get_mut(&child) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    queue.push_back(child);
                }
            }
        }
        result.push(key);
    }

    if result.len() < nodes.len() {
        let placed: HashSet<&NodeKey> = result.iter().collect();
        let rest: Vec<NodeKey> = nodes
            .iter()
            .filter(|key| !placed.contains(key))
            .cloned()
            .collect();
        result.extend(rest);
    }

    result
}

/// Post-order over `roots` and everything downstream of them: every node
/// appears after all of its children.
///
/// Nodes in `skip` are neither visited nor returned.
pub fn children_before_parents(
    graph: &GraphArena,
    version: Version,
    roots: &IndexSet<NodeKey>,
    skip: &HashSet<NodeKey>,
) -> Vec<NodeKey> {
    enum Step {
        Enter(NodeKey),
        Exit(NodeKey),
    }

    let mut visited: HashSet<NodeKey> = HashSet::new();
    let mut order = Vec::new();

    for root in roots {
        let mut stack = vec![Step::Enter(root.clone())];
        while let Some(step) = stack.pop() {
            match step {
                Step::Enter(key) => {
                    if skip.contains(&key) || !visited.insert(key.clone()) {
                        continue;
                    }
                    stack.push(Step::Exit(key.clone()));
                    let mut children: Vec<NodeKey> =
                        graph.children_of_node(version, &key).into_iter().collect();
                    children.sort();
                    for child in children.into_iter().rev() {
                        stack.push(Step::Enter(child));
                    }
                }
                Step::Exit(key) => order.push(key),
            }
        }
    }

    order
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
