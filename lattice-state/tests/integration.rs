//! Integration Tests for the State Engine
//!
//! These tests drive atoms, selectors, caches and retention together through
//! the public store API.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use lattice_state::graph::GraphArena;
use lattice_state::value::erase;
use lattice_state::{
    Atom, AtomFamily, AtomOptions, CacheEquality, CachePolicy, Cleanup, EffectContext, Error,
    Eviction, Interrupt, NodeKey, Promise, Registry, Resolver, Selector, SelectorFamily,
    SelectorOptions, Store, Trigger, WritableSelector, WriteValue,
};

/// A selector reading `atom` plus one, counting its runs.
fn plus_one(registry: &Registry, key: &str, atom: &Atom<i32>, runs: &Arc<AtomicUsize>) -> Selector<i32> {
    let atom = atom.clone();
    let runs = Arc::clone(runs);
    Selector::new(
        registry,
        SelectorOptions::new(key, move |ctx| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(ctx.get(&atom)? + 1)
        }),
    )
}

type Pending = Arc<Mutex<Vec<(i32, Resolver<i32>)>>>;

/// An async selector whose promises are settled by the test.
fn deferred(registry: &Registry, key: &str, atom: &Atom<i32>, runs: &Arc<AtomicUsize>) -> (Selector<i32>, Pending) {
    let pending: Pending = Arc::new(Mutex::new(Vec::new()));
    let atom = atom.clone();
    let runs = Arc::clone(runs);
    let queue = Arc::clone(&pending);
    let selector = Selector::new(
        registry,
        SelectorOptions::new_async(key, move |ctx| {
            let base = ctx.get(&atom)?;
            runs.fetch_add(1, Ordering::SeqCst);
            let (promise, resolver) = Promise::pending();
            queue.lock().unwrap().push((base, resolver));
            Ok(promise)
        }),
    );
    (selector, pending)
}

// ----------------------------------------------------------------------------
// Atoms
// ----------------------------------------------------------------------------

/// Test that an atom reads back what was written, and its default once reset.
#[test]
fn atom_reads_back_writes_and_resets() {
    let registry = Registry::new();
    let count = Atom::new(&registry, AtomOptions::new("count", 7_i32));
    let store = Store::new(&registry);

    assert_eq!(store.get_value(&count).unwrap(), 7);

    store.set(&count, 3).unwrap();
    let loadable = store.get_loadable(&count).unwrap();
    assert!(loadable.has_value());
    assert_eq!(loadable.value_maybe(), Some(3));

    store.update(&count, |n| n * 10).unwrap();
    assert_eq!(store.get_value(&count).unwrap(), 30);

    store.reset(&count).unwrap();
    assert_eq!(store.get_value(&count).unwrap(), 7);
}

/// Test that two stores over one registry keep separate values.
#[test]
fn stores_share_definitions_not_values() {
    let registry = Registry::new();
    let name = Atom::new(&registry, AtomOptions::new("name", "ada".to_string()));
    let first = Store::new(&registry);
    let second = Store::new(&registry);

    first.set(&name, "grace".to_string()).unwrap();

    assert_eq!(first.get_value(&name).unwrap(), "grace");
    assert_eq!(second.get_value(&name).unwrap(), "ada");
}

/// Test that an atom with a fallback node follows it until written.
#[test]
fn fallback_default_follows_its_node() {
    let registry = Registry::new();
    let base = Atom::new(&registry, AtomOptions::new("base", 1_i32));
    let runs = Arc::new(AtomicUsize::new(0));
    let derived = plus_one(&registry, "derived", &base, &runs);
    let linked = Atom::new(&registry, AtomOptions::with_fallback("linked", &derived));
    let store = Store::new(&registry);

    assert_eq!(store.get_value(&linked).unwrap(), 2);
    store.set(&base, 5).unwrap();
    assert_eq!(store.get_value(&linked).unwrap(), 6);

    store.set(&linked, 100).unwrap();
    store.set(&base, 9).unwrap();
    assert_eq!(store.get_value(&linked).unwrap(), 100);

    store.reset(&linked).unwrap();
    assert_eq!(store.get_value(&linked).unwrap(), 10);
}

// ----------------------------------------------------------------------------
// Selectors
// ----------------------------------------------------------------------------

/// Test that a selector is memoized and re-evaluated once per change.
#[test]
fn selector_memoizes_until_a_dependency_changes() {
    let registry = Registry::new();
    let a = Atom::new(&registry, AtomOptions::new("memo_a", 0_i32));
    let b = Atom::new(&registry, AtomOptions::new("memo_b", 0_i32));
    let runs = Arc::new(AtomicUsize::new(0));

    let sum = {
        let (a, b, runs) = (a.clone(), b.clone(), Arc::clone(&runs));
        Selector::new(
            &registry,
            SelectorOptions::new("memo_sum", move |ctx| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(ctx.get(&a)? + ctx.get(&b)?)
            }),
        )
    };
    let store = Store::new(&registry);

    assert_eq!(store.get_value(&sum).unwrap(), 0);
    assert_eq!(store.get_value(&sum).unwrap(), 0);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Two changed deps in one transaction cost one evaluation.
    store
        .batch(|| -> lattice_state::Result<()> {
            store.set(&a, 1)?;
            store.set(&b, 2)?;
            Ok(())
        })
        .unwrap();
    assert_eq!(store.get_value(&sum).unwrap(), 3);
    assert_eq!(store.get_value(&sum).unwrap(), 3);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Test that mutually dependent selectors both report the cycle.
#[test]
fn circular_selectors_name_both_keys() {
    let registry = Registry::new();
    let first = Selector::new(
        &registry,
        SelectorOptions::new("cycle_first", |ctx| {
            ctx.get_by_key(&NodeKey::from("cycle_second"))?;
            Ok(0_i32)
        }),
    );
    let second = Selector::new(
        &registry,
        SelectorOptions::new("cycle_second", |ctx| {
            ctx.get_by_key(&NodeKey::from("cycle_first"))?;
            Ok(0_i32)
        }),
    );
    let store = Store::new(&registry);

    let loadable = store.get_loadable(&first).unwrap();
    match loadable.error_maybe() {
        Some(Error::CircularDependency { path }) => {
            let names: Vec<&str> = path.iter().map(|k| k.as_str()).collect();
            assert_eq!(names, vec!["cycle_first", "cycle_second", "cycle_first"]);
        }
        other => panic!("expected a cycle, got {:?}", other),
    }

    let message = store
        .get_loadable(&second)
        .unwrap()
        .error_maybe()
        .map(|e| e.to_string())
        .unwrap_or_default();
    assert!(message.contains("cycle_first"));
    assert!(message.contains("cycle_second"));
}

/// Test that errors flow through dependent selectors as data.
#[test]
fn errors_propagate_through_selectors() {
    let registry = Registry::new();
    let input = Atom::new(&registry, AtomOptions::new("input", -1_i32));
    let checked = {
        let input = input.clone();
        Selector::new(
            &registry,
            SelectorOptions::new("checked", move |ctx| {
                let n = ctx.get(&input)?;
                if n < 0 {
                    return Err(Error::msg(format!("{} is negative", n)).into());
                }
                Ok(n)
            }),
        )
    };
    let doubled = {
        let checked = checked.clone();
        Selector::new(
            &registry,
            SelectorOptions::new("checked_doubled", move |ctx| Ok(ctx.get(&checked)? * 2)),
        )
    };
    let store = Store::new(&registry);

    let loadable = store.get_loadable(&doubled).unwrap();
    assert!(loadable.has_error());
    assert_eq!(loadable.error_maybe().map(|e| e.to_string()).as_deref(), Some("-1 is negative"));
    assert!(matches!(store.get_value(&doubled), Err(Interrupt::Failed(_))));

    store.set(&input, 4).unwrap();
    assert_eq!(store.get_value(&doubled).unwrap(), 8);
}

/// Test that a writable selector turns writes into writes of its sources.
#[test]
fn writable_selector_writes_through() {
    let registry = Registry::new();
    let celsius = Atom::new(&registry, AtomOptions::new("celsius", 0_i32));
    let fahrenheit = {
        let read = celsius.clone();
        let write = celsius.clone();
        WritableSelector::new(
            &registry,
            SelectorOptions::new("fahrenheit", move |ctx| Ok(ctx.get(&read)? * 9 / 5 + 32)),
            move |ctx, value| match value {
                WriteValue::Value(f) => ctx.set(&write, (f - 32) * 5 / 9),
                WriteValue::Reset(_) => ctx.reset(&write),
            },
        )
    };
    let runs = Arc::new(AtomicUsize::new(0));
    let read_only = plus_one(&registry, "celsius_plus_one", &celsius, &runs);
    let store = Store::new(&registry);

    assert_eq!(store.get_value(&fahrenheit).unwrap(), 32);
    store.set(&fahrenheit, 212).unwrap();
    assert_eq!(store.get_value(&celsius).unwrap(), 100);

    store.reset(&fahrenheit).unwrap();
    assert_eq!(store.get_value(&celsius).unwrap(), 0);

    let result = store.set_by_key(read_only.key(), WriteValue::Value(erase(5_i32)));
    assert!(matches!(result, Err(Error::ReadOnlyNode(_))));
}

/// Test that dependency edges follow the selector's control flow.
#[test]
fn dependency_edges_follow_control_flow() {
    let registry = Registry::new();
    let use_left = Atom::new(&registry, AtomOptions::new("use_left", true));
    let left = Atom::new(&registry, AtomOptions::new("left", 1_i32));
    let right = Atom::new(&registry, AtomOptions::new("right", 2_i32));
    let pick = {
        let (flag, left, right) = (use_left.clone(), left.clone(), right.clone());
        Selector::new(
            &registry,
            SelectorOptions::new("pick", move |ctx| {
                if ctx.get(&flag)? {
                    ctx.get(&left)
                } else {
                    ctx.get(&right)
                }
            }),
        )
    };
    let store = Store::new(&registry);

    assert_eq!(store.get_value(&pick).unwrap(), 1);
    let graph = store.graph(store.current_tree().version());
    assert_eq!(
        graph.parents_of(pick.key()),
        BTreeSet::from([use_left.key().clone(), left.key().clone()])
    );

    store.set(&use_left, false).unwrap();
    assert_eq!(store.get_value(&pick).unwrap(), 2);
    let graph = store.graph(store.current_tree().version());
    assert_eq!(
        graph.parents_of(pick.key()),
        BTreeSet::from([use_left.key().clone(), right.key().clone()])
    );
    assert!(graph.children_of(left.key()).is_empty());
    assert!(graph.children_of(right.key()).contains(pick.key()));
}

/// Test that graph versions share structure without leaking edits.
#[test]
fn graph_versions_share_structure() {
    let a = NodeKey::from("a");
    let zero = NodeKey::from("0");
    let one = NodeKey::from("1");

    let mut graphs = GraphArena::new(3);
    graphs.ensure(0);
    graphs.set_parents_of_node(0, &a, HashSet::from([zero.clone()]));
    graphs.fork(0, 1);
    graphs.set_parents_of_node(1, &a, HashSet::from([one.clone()]));

    assert_eq!(graphs.children_of_node(0, &zero), HashSet::from([a.clone()]));
    assert!(graphs.children_of_node(1, &zero).is_empty());
    assert_eq!(graphs.children_of_node(1, &one), HashSet::from([a.clone()]));
}

/// Test that refresh drops the cache and forces a new evaluation.
#[test]
fn refresh_forces_reevaluation() {
    let registry = Registry::new();
    let source = Atom::new(&registry, AtomOptions::new("source", 1_i32));
    let runs = Arc::new(AtomicUsize::new(0));
    let cached = plus_one(&registry, "cached", &source, &runs);
    let store = Store::new(&registry);

    assert_eq!(store.get_value(&cached).unwrap(), 2);
    assert_eq!(store.get_value(&cached).unwrap(), 2);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    store.refresh(&cached).unwrap();
    assert_eq!(store.get_value(&cached).unwrap(), 2);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Test that the value cache hits on equal values and the LRU evicts.
#[test]
fn cache_policies_control_hits() {
    let registry = Registry::new();
    let source = Atom::new(&registry, AtomOptions::new("policy_source", 0_i32));

    let keep_runs = Arc::new(AtomicUsize::new(0));
    let keep_all = {
        let (source, runs) = (source.clone(), Arc::clone(&keep_runs));
        Selector::new(
            &registry,
            SelectorOptions::new("keep_all", move |ctx| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(ctx.get(&source)? * 2)
            })
            .cache_policy(CachePolicy {
                equality: CacheEquality::Value,
                eviction: Eviction::KeepAll,
            }),
        )
    };
    let recent_runs = Arc::new(AtomicUsize::new(0));
    let most_recent = {
        let (source, runs) = (source.clone(), Arc::clone(&recent_runs));
        Selector::new(
            &registry,
            SelectorOptions::new("most_recent", move |ctx| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(ctx.get(&source)? * 2)
            })
            .cache_policy(CachePolicy {
                equality: CacheEquality::Value,
                eviction: Eviction::MostRecent,
            }),
        )
    };
    let store = Store::new(&registry);

    for value in [0, 1, 0] {
        store.set(&source, value).unwrap();
        assert_eq!(store.get_value(&keep_all).unwrap(), value * 2);
        assert_eq!(store.get_value(&most_recent).unwrap(), value * 2);
    }

    assert_eq!(keep_runs.load(Ordering::SeqCst), 2);
    assert_eq!(recent_runs.load(Ordering::SeqCst), 3);
}

/// Test that the default cache hits when a dependency returns to an earlier value.
#[test]
fn default_cache_hits_on_a_returning_value() {
    let registry = Registry::new();
    let source = Atom::new(&registry, AtomOptions::new("returning_source", 0_i32));
    let runs = Arc::new(AtomicUsize::new(0));
    let next = plus_one(&registry, "returning_next", &source, &runs);
    let store = Store::new(&registry);

    for value in [0, 1, 0, 1] {
        store.set(&source, value).unwrap();
        assert_eq!(store.get_value(&next).unwrap(), value + 1);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Test that values JSON cannot key still invalidate the value cache.
#[test]
fn value_cache_tells_apart_unserializable_values() {
    let registry = Registry::new();
    let first: HashMap<(u8, u8), i32> = HashMap::from([((1, 1), 1)]);
    let second: HashMap<(u8, u8), i32> = HashMap::from([((2, 2), 99)]);
    let grid = Atom::new(&registry, AtomOptions::new("grid", first.clone()));
    let runs = Arc::new(AtomicUsize::new(0));
    let total = {
        let (grid, runs) = (grid.clone(), Arc::clone(&runs));
        Selector::new(
            &registry,
            SelectorOptions::new("grid_total", move |ctx| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(ctx.get(&grid)?.values().sum::<i32>())
            })
            .cache_policy(CachePolicy {
                equality: CacheEquality::Value,
                eviction: Eviction::KeepAll,
            }),
        )
    };
    let store = Store::new(&registry);

    assert_eq!(store.get_value(&total).unwrap(), 1);
    store.set(&grid, second).unwrap();
    assert_eq!(store.get_value(&total).unwrap(), 99);
    store.set(&grid, first).unwrap();
    assert_eq!(store.get_value(&total).unwrap(), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

// ----------------------------------------------------------------------------
// Async
// ----------------------------------------------------------------------------

/// Test that a settled promise result reads as a value right away.
#[test]
fn resolved_promise_reads_as_value() {
    let registry = Registry::new();
    let a = Atom::new(&registry, AtomOptions::new("ready_base", 0_i32));
    let s = {
        let a = a.clone();
        Selector::new(
            &registry,
            SelectorOptions::new_async("ready_plus_one", move |ctx| {
                Ok(Promise::resolved(ctx.get(&a)? + 1))
            }),
        )
    };
    let store = Store::new(&registry);

    assert_eq!(store.get_value(&s).unwrap(), 1);
}

/// Test that an async selector settles, then reads from its cache.
#[tokio::test]
async fn async_selector_settles_then_hits_cache() {
    let registry = Registry::new();
    let a = Atom::new(&registry, AtomOptions::new("async_base", 0_i32));
    let runs = Arc::new(AtomicUsize::new(0));
    let (s, pending) = deferred(&registry, "async_plus_one", &a, &runs);
    let store = Store::new(&registry);

    let loadable = store.get_loadable(&s).unwrap();
    assert!(loadable.is_loading());
    assert!(store.get_value(&s).unwrap_err().is_pending());
    let promise = loadable.to_promise();

    let (base, resolver) = pending.lock().unwrap().pop().unwrap();
    resolver.resolve(base + 1);

    assert_eq!(promise.await.unwrap(), 1);
    assert_eq!(store.get_value(&s).unwrap(), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

/// Test that a stale execution never overwrites the published value.
#[tokio::test]
async fn stale_execution_does_not_overwrite_latest() {
    let registry = Registry::new();
    let a = Atom::new(&registry, AtomOptions::new("race_base", 0_i32));
    let runs = Arc::new(AtomicUsize::new(0));
    let (s, pending) = deferred(&registry, "race_scaled", &a, &runs);
    let store = Store::new(&registry);

    let first = store.get_promise(&s).unwrap();
    store.set(&a, 1).unwrap();
    let second = store.get_promise(&s).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    let (stale, latest) = {
        let mut queue = pending.lock().unwrap();
        let latest = queue.pop().unwrap();
        let stale = queue.pop().unwrap();
        (stale, latest)
    };
    assert_eq!((stale.0, latest.0), (0, 1));

    latest.1.resolve(latest.0 * 10);
    assert_eq!(second.await.unwrap(), 10);
    stale.1.resolve(stale.0 * 10);
    assert_eq!(first.await.unwrap(), 0);

    assert_eq!(store.get_value(&s).unwrap(), 10);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // The superseded result was still cached under the value it read.
    store.set(&a, 0).unwrap();
    assert_eq!(store.get_value(&s).unwrap(), 0);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Test that a selector waiting on a loading atom resumes once it settles.
#[tokio::test]
async fn selector_resumes_after_pending_atom() {
    let registry = Registry::new();
    let (default, resolver) = Promise::pending();
    let remote = Atom::new(&registry, AtomOptions::with_promise("remote", default));
    let doubled = {
        let remote = remote.clone();
        Selector::new(
            &registry,
            SelectorOptions::new("remote_doubled", move |ctx| Ok(ctx.get(&remote)? * 2)),
        )
    };
    let store = Store::new(&registry);

    let promise = store.get_promise(&doubled).unwrap();
    assert!(!promise.is_settled());

    resolver.resolve(21_i32);

    assert_eq!(promise.await.unwrap(), 42);
    assert_eq!(store.get_value(&remote).unwrap(), 21);
    assert_eq!(store.get_value(&doubled).unwrap(), 42);
}

// ----------------------------------------------------------------------------
// Transactions
// ----------------------------------------------------------------------------

/// Test that a batch commits once and notifies once.
#[test]
fn batch_notifies_once() {
    let registry = Registry::new();
    let a = Atom::new(&registry, AtomOptions::new("batch_a", 0_i32));
    let b = Atom::new(&registry, AtomOptions::new("batch_b", 0_i32));
    let store = Store::new(&registry);
    let commits = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&commits);
    let _subscription = store.subscribe_to_transactions(
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        None,
    );

    store.batch(|| {
        store.set(&a, 1).unwrap();
        store.set(&b, 2).unwrap();
    });

    assert_eq!(commits.load(Ordering::SeqCst), 1);
    assert_eq!(store.get_value(&a).unwrap(), 1);
    assert_eq!(store.get_value(&b).unwrap(), 2);
}

/// Test that a subscriber may write after a commit, but an updater may not.
#[test]
fn writes_from_subscribers_commit_and_nested_updates_fail() {
    let registry = Registry::new();
    let source = Atom::new(&registry, AtomOptions::new("mirror_source", 0_i32));
    let mirror = Atom::new(&registry, AtomOptions::new("mirror", 0_i32));
    let store = Store::new(&registry);

    let _subscription = {
        let (reader, mirror) = (source.clone(), mirror.clone());
        store.subscribe(&source, move |store| {
            if let Ok(value) = store.get_value(&reader) {
                store.set(&mirror, value).unwrap();
            }
        })
    };

    store.set(&source, 4).unwrap();
    assert_eq!(store.get_value(&mirror).unwrap(), 4);

    let nested = store.clone();
    let inner = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&inner);
    store
        .replace_state(|tree| {
            *seen.lock().unwrap() = Some(nested.set(&source, 9));
            Ok(tree)
        })
        .unwrap();
    assert!(matches!(*inner.lock().unwrap(), Some(Err(Error::ReentrantWrite))));
    assert_eq!(store.get_value(&source).unwrap(), 4);
}

// ----------------------------------------------------------------------------
// Retention
// ----------------------------------------------------------------------------

/// Test that released nodes are forgotten and come back from their default.
#[test]
fn released_nodes_reinitialize_from_default() {
    let registry = Registry::new();
    let count = Atom::new(&registry, AtomOptions::new("released_count", 0_i32));
    let runs = Arc::new(AtomicUsize::new(0));
    let next = plus_one(&registry, "released_next", &count, &runs);
    let store = Store::new(&registry);

    let subscription = store.subscribe(&next, |_| {});
    assert_eq!(store.get_value(&next).unwrap(), 1);
    store.set(&count, 5).unwrap();
    assert_eq!(store.get_value(&next).unwrap(), 6);
    assert!(store.get_state(|s| s.known_atoms().contains(count.key())));

    drop(subscription);

    store.get_state(|s| {
        assert!(!s.known_atoms().contains(count.key()));
        assert!(!s.known_selectors().contains(next.key()));
    });
    let graph = store.graph(store.current_tree().version());
    assert!(graph.children_of(count.key()).is_empty());
    assert!(graph.parents_of(next.key()).is_empty());

    assert_eq!(store.get_value(&count).unwrap(), 0);
    assert_eq!(store.get_value(&next).unwrap(), 1);
}

// ----------------------------------------------------------------------------
// Effects, families and persistence
// ----------------------------------------------------------------------------

/// Test that effects initialize the atom, observe writes and clean up.
#[test]
fn atom_effects_initialize_and_observe() {
    let registry = Registry::new();
    let seen: Arc<Mutex<Vec<(i32, Option<i32>, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let triggers: Arc<Mutex<Vec<Trigger>>> = Arc::new(Mutex::new(Vec::new()));
    let cleaned = Arc::new(AtomicBool::new(false));

    let observed = {
        let (seen, triggers, cleaned) = (Arc::clone(&seen), Arc::clone(&triggers), Arc::clone(&cleaned));
        Atom::new(
            &registry,
            AtomOptions::new("observed", 0_i32).effect(move |ctx: &EffectContext<i32>| {
                triggers.lock().unwrap().push(ctx.trigger());
                ctx.set_self(10)?;
                let seen = Arc::clone(&seen);
                ctx.on_set(move |new, old, is_reset| seen.lock().unwrap().push((new, old, is_reset)))?;
                let cleaned = Arc::clone(&cleaned);
                let cleanup: Cleanup = Box::new(move || cleaned.store(true, Ordering::SeqCst));
                Ok(Some(cleanup))
            }),
        )
    };
    let store = Store::new(&registry);

    assert_eq!(store.get_value(&observed).unwrap(), 10);
    assert_eq!(*triggers.lock().unwrap(), vec![Trigger::Get]);

    store.set(&observed, 11).unwrap();
    store.reset(&observed).unwrap();
    assert_eq!(store.get_value(&observed).unwrap(), 0);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(11, Some(10), false), (0, Some(11), true)]
    );

    assert!(!cleaned.load(Ordering::SeqCst));
    store.teardown();
    assert!(cleaned.load(Ordering::SeqCst));
}

/// Test that family members are independent nodes keyed by parameter.
#[test]
fn families_keep_members_independent() {
    let registry = Registry::new();
    let todos = Arc::new(AtomFamily::new(&registry, "todo", |id: &u32| format!("todo #{}", id)));
    let lengths = {
        let todos = Arc::clone(&todos);
        SelectorFamily::new(&registry, "todo_length", move |id: &u32| {
            let member = todos.get(id);
            SelectorOptions::new("todo_length", move |ctx| Ok(ctx.get(&member)?.len()))
        })
    };
    let store = Store::new(&registry);

    let first = todos.get(&1);
    let second = todos.get(&2);
    assert_eq!(first.key().as_str(), "todo__1");
    assert_ne!(first.key(), second.key());

    store.set(&second, "write docs".to_string()).unwrap();

    assert_eq!(store.get_value(&first).unwrap(), "todo #1");
    assert_eq!(store.get_value(&second).unwrap(), "write docs");
    assert_eq!(store.get_value(&lengths.get(&1)).unwrap(), 7);
    assert_eq!(store.get_value(&lengths.get(&2)).unwrap(), 10);
}

/// Test that restored raw values go through the atom's validator.
#[test]
fn restored_values_are_validated() {
    let registry = Registry::new();
    let theme = Atom::new(
        &registry,
        AtomOptions::new("theme", "light".to_string()).persistence_serde(),
    );
    let volume = Atom::new(
        &registry,
        AtomOptions::new("volume", 5_u8)
            .persistence(|raw| raw.as_u64().filter(|v| *v <= 10).map(|v| v as u8)),
    );
    let store = Store::new(&registry);

    store
        .restore_raw([
            (theme.key().clone(), serde_json::json!("dark")),
            (volume.key().clone(), serde_json::json!(99)),
        ])
        .unwrap();

    assert_eq!(store.get_value(&theme).unwrap(), "dark");
    assert_eq!(store.get_value(&volume).unwrap(), 5);

    store.set(&volume, 8).unwrap();
    assert_eq!(store.get_value(&volume).unwrap(), 8);
}

// ----------------------------------------------------------------------------
// Snapshots
// ----------------------------------------------------------------------------

/// Test that snapshots are isolated and can be restored.
#[test]
fn snapshots_are_isolated_and_restorable() {
    let registry = Registry::new();
    let count = Atom::new(&registry, AtomOptions::new("snap_count", 0_i32));
    let runs = Arc::new(AtomicUsize::new(0));
    let next = plus_one(&registry, "snap_next", &count, &runs);
    let store = Store::new(&registry);

    store.set(&count, 1).unwrap();
    let snapshot = store.snapshot();
    store.set(&count, 2).unwrap();

    assert_eq!(snapshot.get_loadable(&count).unwrap().value_maybe(), Some(1));
    assert_eq!(snapshot.get_loadable(&next).unwrap().value_maybe(), Some(2));
    assert_eq!(store.get_value(&next).unwrap(), 3);

    let edited = snapshot.map(|snap| snap.set(&count, 40)).unwrap();
    assert_eq!(edited.get_loadable(&count).unwrap().value_maybe(), Some(40));
    assert_eq!(snapshot.get_loadable(&count).unwrap().value_maybe(), Some(1));

    store.goto_snapshot(&snapshot).unwrap();
    assert_eq!(store.get_value(&count).unwrap(), 1);
    assert_eq!(store.get_value(&next).unwrap(), 2);
    assert_eq!(store.current_tree().state_id(), snapshot.state_id());
}
