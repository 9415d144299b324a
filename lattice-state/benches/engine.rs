//! # Engine Benchmarks
//!
//! Graph edits across versions and selector reads through the store.
//!
//! Run with: `cargo bench -p lattice-state`

use std::collections::HashSet;
use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use lattice_state::graph::GraphArena;
use lattice_state::{Atom, AtomOptions, NodeKey, Registry, Selector, SelectorOptions, Store};

/// A chain of `size` selectors, each reading the previous one.
fn selector_chain(registry: &Registry, size: usize) -> (Atom<u64>, Selector<u64>) {
    let root = Atom::new(registry, AtomOptions::new("chain_root", 0_u64));
    let first = {
        let root = root.clone();
        Selector::new(
            registry,
            SelectorOptions::new("chain_0", move |ctx| Ok(ctx.get(&root)? + 1)),
        )
    };
    let mut last = first;
    for i in 1..size {
        let prev = last.clone();
        last = Selector::new(
            registry,
            SelectorOptions::new(format!("chain_{}", i), move |ctx| Ok(ctx.get(&prev)? + 1)),
        );
    }
    (root, last)
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_graph_versions(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_versions");

    for size in [100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let keys: Vec<NodeKey> = (0..size).map(|i| NodeKey::new(format!("n{}", i))).collect();
            b.iter(|| {
                let mut graphs = GraphArena::new(3);
                graphs.ensure(0);
                for (i, key) in keys.iter().enumerate().skip(1) {
                    graphs.set_parents_of_node(0, key, HashSet::from([keys[i - 1].clone()]));
                }
                // Each version rewires one node, then the old version goes away.
                for version in 1..=10_u64 {
                    graphs.fork(version - 1, version);
                    let i = (version as usize * 7) % size;
                    graphs.set_parents_of_node(version, &keys[i], HashSet::from([keys[0].clone()]));
                    graphs.release(version - 1);
                }
                black_box(graphs.children_of_node(10, &keys[0]))
            });
        });
    }

    group.finish();
}

fn bench_selector_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("selector_chain");

    for size in [10, 100].iter() {
        group.bench_with_input(BenchmarkId::new("cached", size), size, |b, &size| {
            let registry = Registry::new();
            let (_, tail) = selector_chain(&registry, size);
            let store = Store::new(&registry);
            b.iter(|| black_box(store.get_value(&tail).ok()));
        });

        group.bench_with_input(BenchmarkId::new("after_write", size), size, |b, &size| {
            let registry = Registry::new();
            let (root, tail) = selector_chain(&registry, size);
            let store = Store::new(&registry);
            let mut n = 0_u64;
            b.iter(|| {
                n += 1;
                let _ = store.set(&root, n);
                black_box(store.get_value(&tail).ok())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_graph_versions, bench_selector_reads);
criterion_main!(benches);
