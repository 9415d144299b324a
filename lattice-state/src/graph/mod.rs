//! Dependency Graph
//!
//! This module tracks the edges between nodes: which nodes a node read the
//! last time it was evaluated (its *parents*), and the inverse relation (its
//! *children*, i.e. the nodes that must be invalidated when it changes).
//!
//! # Overview
//!
//! Every tree version has its own logical graph. Most transactions only
//! touch a handful of edges, so versions are stored as a chain of
//! generations instead of full copies:
//!
//! - A generation holds the parents that were set in it, plus the child
//!   edges added in it, and points at the generation it was forked from.
//! - `parents_of_node` walks the chain and returns the newest entry.
//! - `children_of_node` unions child edges along the chain and drops any
//!   edge the child's *current* parent set no longer contains. Stale edges
//!   recorded by older generations therefore never leak into newer answers.
//!
//! Writing to a version only ever touches that version's own generation,
//! so older versions keep answering exactly as they did.
//!
//! # Compaction
//!
//! Forking a version whose chain is deeper than the configured compaction
//! depth flattens the chain into a fresh generation first. Flattening builds
//! new maps and never mutates a shared generation.

pub mod scheduler;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::Serialize;

use crate::node::NodeKey;
use crate::state::Version;

type GenerationId = u64;

/// One link of a version chain.
#[derive(Debug, Default)]
struct Generation {
    base: Option<GenerationId>,
    depth: usize,
    /// Parent sets overridden in this generation. An empty set masks any
    /// older entry.
    parents: HashMap<NodeKey, HashSet<NodeKey>>,
    /// Child edges added in this generation. Never holds empty sets.
    children: HashMap<NodeKey, HashSet<NodeKey>>,
    /// Versions and generations pointing here.
    refs: usize,
}

/// Versioned dependency graphs for one store.
#[derive(Debug)]
pub struct GraphArena {
    generations: HashMap<GenerationId, Generation>,
    versions: HashMap<Version, GenerationId>,
    next_generation: GenerationId,
    compaction_depth: usize,
}

impl GraphArena {
    /// Create an empty arena.
    pub fn new(compaction_depth: usize) -> Self {
        Self {
            generations: HashMap::new(),
            versions: HashMap::new(),
            next_generation: 0,
            compaction_depth: compaction_depth.max(1),
        }
    }

    /// Whether the arena holds a graph for `version`.
    pub fn has_version(&self, version: Version) -> bool {
        self.versions.contains_key(&version)
    }

    /// Number of live versions.
    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    /// Number of live generations, shared ones counted once.
    pub fn generation_count(&self) -> usize {
        self.generations.len()
    }

    /// Length of the generation chain behind `version`.
    pub fn depth(&self, version: Version) -> usize {
        self.versions
            .get(&version)
            .and_then(|id| self.generations.get(id))
            .map(|gen| gen.depth)
            .unwrap_or(0)
    }

    fn alloc(&mut self, generation: Generation) -> GenerationId {
        let id = self.next_generation;
        self.next_generation += 1;
        if let Some(base) = generation.base {
            if let Some(base) = self.generations.get_mut(&base) {
                base.refs += 1;
            }
        }
        self.generations.insert(id, generation);
        id
    }

    fn bind(&mut self, version: Version, id: GenerationId) {
        if let Some(gen) = self.generations.get_mut(&id) {
            gen.refs += 1;
        }
        if let Some(previous) = self.versions.insert(version, id) {
            self.unref(previous);
        }
    }

    fn unref(&mut self, id: GenerationId) {
        let mut next = Some(id);
        while let Some(id) = next.take() {
            let Some(gen) = self.generations.get_mut(&id) else {
                return;
            };
            gen.refs = gen.refs.saturating_sub(1);
            if gen.refs == 0 {
                next = self.generations.remove(&id).and_then(|gen| gen.base);
            }
        }
    }

    /// Make sure `version` has a graph, creating an empty one if needed.
    pub fn ensure(&mut self, version: Version) {
        if !self.has_version(version) {
            let id = self.alloc(Generation::default());
            self.bind(version, id);
        }
    }

    /// Create the graph for `version` as a copy of `base`.
    ///
    /// The copy is structural: the new version shares every edge with its
    /// base until it is written to.
    pub fn fork(&mut self, base: Version, version: Version) {
        if self.has_version(version) {
            return;
        }
        let Some(&base_id) = self.versions.get(&base) else {
            self.ensure(version);
            return;
        };

        let base_depth = self.generations.get(&base_id).map(|g| g.depth).unwrap_or(0);
        let base_id = if base_depth + 1 > self.compaction_depth {
            self.flatten_generation(base_id)
        } else {
            base_id
        };
        let depth = self.generations.get(&base_id).map(|g| g.depth).unwrap_or(0) + 1;

        let id = self.alloc(Generation {
            base: Some(base_id),
            depth,
            ..Generation::default()
        });
        self.bind(version, id);
    }

    /// Replace the graph for `version` with a single flat generation.
    ///
    /// Answers for every version are unchanged.
    pub fn compact(&mut self, version: Version) {
        if let Some(&id) = self.versions.get(&version) {
            let flat = self.flatten_generation(id);
            self.bind(version, flat);
        }
    }

    /// Drop the graph for `version`.
    pub fn release(&mut self, version: Version) {
        if let Some(id) = self.versions.remove(&version) {
            self.unref(id);
        }
    }

    /// Seed `version` from a materialized snapshot.
    pub fn seed(&mut self, version: Version, snapshot: &GraphSnapshot) {
        let mut gen = Generation::default();
        for (node, parents) in &snapshot.node_deps {
            if parents.is_empty() {
                continue;
            }
            gen.parents
                .insert(node.clone(), parents.iter().cloned().collect());
            for parent in parents {
                gen.children
                    .entry(parent.clone())
                    .or_default()
                    .insert(node.clone());
            }
        }
        let id = self.alloc(gen);
        self.bind(version, id);
    }

    /// Build a fresh flat generation equal to `id`'s view and return it.
    ///
    /// The caller decides what to bind the result to; an unbound result is
    /// dropped on the next `unref` of anything pointing at it.
    fn flatten_generation(&mut self, id: GenerationId) -> GenerationId {
        let parents = self.materialize_parents(id);
        let mut gen = Generation::default();
        for (node, deps) in parents {
            for parent in &deps {
                gen.children
                    .entry(parent.clone())
                    .or_default()
                    .insert(node.clone());
            }
            gen.parents.insert(node, deps);
        }
        tracing::trace!(generation = id, edges = gen.children.len(), "flattened graph generation");
        self.alloc(gen)
    }

    /// Chain from newest to oldest.
    fn chain(&self, id: GenerationId) -> impl Iterator<Item = &Generation> {
        let mut next = self.generations.get(&id);
        std::iter::from_fn(move || {
            let current = next?;
            next = current.base.and_then(|base| self.generations.get(&base));
            Some(current)
        })
    }

    fn materialize_parents(&self, id: GenerationId) -> HashMap<NodeKey, HashSet<NodeKey>> {
        let mut out: HashMap<NodeKey, HashSet<NodeKey>> = HashMap::new();
        let mut masked: HashSet<&NodeKey> = HashSet::new();
        for gen in self.chain(id) {
            for (node, parents) in &gen.parents {
                if masked.insert(node) && !parents.is_empty() {
                    out.insert(node.clone(), parents.clone());
                }
            }
        }
        out
    }

    /// The nodes `key` read in `version`.
    pub fn parents_of_node(&self, version: Version, key: &NodeKey) -> HashSet<NodeKey> {
        let Some(&id) = self.versions.get(&version) else {
            return HashSet::new();
        };
        self.chain(id)
            .find_map(|gen| gen.parents.get(key))
            .cloned()
            .unwrap_or_default()
    }

    /// The nodes that read `key` in `version`.
    pub fn children_of_node(&self, version: Version, key: &NodeKey) -> HashSet<NodeKey> {
        let Some(&id) = self.versions.get(&version) else {
            return HashSet::new();
        };
        let candidates: HashSet<&NodeKey> = self
            .chain(id)
            .filter_map(|gen| gen.children.get(key))
            .flatten()
            .collect();
        candidates
            .into_iter()
            .filter(|child| self.parents_of_node(version, child).contains(key))
            .cloned()
            .collect()
    }

    /// Replace the parents of `key` in `version`.
    pub fn set_parents_of_node(
        &mut self,
        version: Version,
        key: &NodeKey,
        parents: HashSet<NodeKey>,
    ) {
        self.ensure(version);
        let old = self.parents_of_node(version, key);
        if old == parents {
            return;
        }
        let Some(&id) = self.versions.get(&version) else {
            return;
        };
        let Some(gen) = self.generations.get_mut(&id) else {
            return;
        };

        for added in parents.difference(&old) {
            gen.children
                .entry(added.clone())
                .or_default()
                .insert(key.clone());
        }
        for removed in old.difference(&parents) {
            if let Some(children) = gen.children.get_mut(removed) {
                children.remove(key);
                if children.is_empty() {
                    gen.children.remove(removed);
                }
            }
        }
        gen.parents.insert(key.clone(), parents);
    }

    /// Forget every edge out of `key` in `version`.
    pub fn remove_node(&mut self, version: Version, key: &NodeKey) {
        if self.has_version(version) {
            self.set_parents_of_node(version, key, HashSet::new());
        }
    }

    /// Materialize `version` as plain sorted maps.
    pub fn snapshot(&self, version: Version) -> GraphSnapshot {
        let parents = self
            .versions
            .get(&version)
            .map(|&id| self.materialize_parents(id))
            .unwrap_or_default();

        let mut snapshot = GraphSnapshot::default();
        for (node, deps) in parents {
            for parent in &deps {
                snapshot
                    .node_to_node_subscriptions
                    .entry(parent.clone())
                    .or_default()
                    .insert(node.clone());
            }
            snapshot
                .node_deps
                .insert(node, deps.into_iter().collect());
        }
        snapshot
    }
}

/// A materialized graph for one version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphSnapshot {
    /// Node to the nodes it read.
    pub node_deps: BTreeMap<NodeKey, BTreeSet<NodeKey>>,
    /// Node to the nodes that read it.
    pub node_to_node_subscriptions: BTreeMap<NodeKey, BTreeSet<NodeKey>>,
}

impl GraphSnapshot {
    /// Parents of `key`.
    pub fn parents_of(&self, key: &NodeKey) -> BTreeSet<NodeKey> {
        self.node_deps.get(key).cloned().unwrap_or_default()
    }

    /// Children of `key`.
    pub fn children_of(&self, key: &NodeKey) -> BTreeSet<NodeKey> {
        self.node_to_node_subscriptions
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
