//! Selector Caches
//!
//! A selector's results are memoized by the values of the dependencies it
//! read, in the order it read them. Caches store entries along a *route*:
//! an ordered list of `(dependency key, dependency value)` steps.
//!
//! Lookups are stepwise. The engine asks the cache what to read next
//! ([`CacheLookup::Branch`]), reads that dependency itself, appends the
//! step and asks again until it gets a hit or a miss. The cache lock is
//! therefore never held while a dependency evaluates.
//!
//! Two orthogonal settings make up a [`CachePolicy`]:
//!
//! - **Equality**: dependency values are compared with their own
//!   `PartialEq` (`Reference`) or by their stable serialized form (`Value`).
//!   A value whose serialized form is missing or contains `null` falls back
//!   to `PartialEq`, since `None` and a non-finite float both print as
//!   `null`.
//! - **Eviction**: keep everything, keep the least recently used
//!   `max_size` entries, or keep only the most recent entry.

pub mod lru;
pub mod tree;

pub use lru::LruCache;
pub use tree::TreeCache;

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::loadable::Loadable;
use crate::node::NodeKey;
use crate::value::{same_value, AnyValue};

/// How dependency values are compared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheEquality {
    /// Same shared allocation or `PartialEq`-equal values.
    #[default]
    Reference,
    /// Same stable serialized form.
    Value,
}

/// Which entries are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Eviction {
    /// Never evict.
    #[default]
    KeepAll,
    /// Keep the `max_size` most recently used entries.
    Lru {
        /// Capacity.
        max_size: usize,
    },
    /// Keep only the latest entry.
    MostRecent,
}

/// Cache configuration for one selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Key equality.
    pub equality: CacheEquality,
    /// Eviction strategy.
    pub eviction: Eviction,
}

impl CachePolicy {
    /// Build a cache implementing this policy.
    pub fn build(&self, selector: &NodeKey) -> Box<dyn SelectorCache> {
        let tree = TreeCache::new(selector.clone(), self.equality);
        match self.eviction {
            Eviction::KeepAll => Box::new(tree),
            Eviction::Lru { max_size } => Box::new(LruCache::new(tree, max_size)),
            Eviction::MostRecent => Box::new(LruCache::new(tree, 1)),
        }
    }
}

/// A dependency value as it appears in a cache route.
///
/// The state is part of the key, so a value never matches an error that
/// happens to print the same way.
#[derive(Clone)]
pub enum DepValueKey {
    /// A value compared with `PartialEq`. The hash covers the type and the
    /// serialized form when there is one.
    Equal {
        /// The dependency value.
        value: AnyValue,
        /// Precomputed hash.
        hash: u64,
    },
    /// A value keyed by its stable serialized form.
    Stable(String),
    /// An error, keyed by its message.
    Error(String),
    /// A pending promise, keyed by its identity.
    Loading(u64),
}

impl DepValueKey {
    /// Key a dependency loadable under `equality`.
    pub fn of(loadable: &Loadable<AnyValue>, equality: CacheEquality) -> Self {
        match loadable {
            Loadable::Value(v) => {
                let stable = v.stable_key();
                match (equality, stable) {
                    (CacheEquality::Value, Some(key)) if !key.contains("null") => DepValueKey::Stable(key),
                    (_, stable) => DepValueKey::equal(v, stable.as_deref()),
                }
            }
            Loadable::Error(e) => DepValueKey::Error(e.to_string()),
            Loadable::Loading(p) => DepValueKey::Loading(p.id()),
        }
    }

    fn equal(value: &AnyValue, stable: Option<&str>) -> Self {
        let mut hasher = DefaultHasher::new();
        value.type_name().hash(&mut hasher);
        stable.hash(&mut hasher);
        DepValueKey::Equal {
            value: Arc::clone(value),
            hash: hasher.finish(),
        }
    }
}

impl PartialEq for DepValueKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DepValueKey::Equal { value: a, .. }, DepValueKey::Equal { value: b, .. }) => same_value(a, b),
            (DepValueKey::Stable(a), DepValueKey::Stable(b)) => a == b,
            (DepValueKey::Error(a), DepValueKey::Error(b)) => a == b,
            (DepValueKey::Loading(a), DepValueKey::Loading(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for DepValueKey {}

impl Hash for DepValueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            DepValueKey::Equal { hash, .. } => hash.hash(state),
            DepValueKey::Stable(s) | DepValueKey::Error(s) => s.hash(state),
            DepValueKey::Loading(id) => id.hash(state),
        }
    }
}

impl fmt::Debug for DepValueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepValueKey::Equal { value, .. } => write!(f, "Equal({:?})", value),
            DepValueKey::Stable(s) => write!(f, "Stable({})", s),
            DepValueKey::Error(s) => write!(f, "Error({})", s),
            DepValueKey::Loading(id) => write!(f, "Loading(#{})", id),
        }
    }
}

/// One step of a cache route.
pub type RouteStep = (NodeKey, DepValueKey);

/// Result of one lookup step.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    /// An entry is stored at the end of this route.
    Hit(Loadable<AnyValue>),
    /// The route continues; read this dependency next.
    Branch(NodeKey),
    /// Nothing is stored for these dependency values.
    Miss,
}

/// Memoization table for one selector.
pub trait SelectorCache: Send {
    /// How the engine should key dependency values for this cache.
    fn equality(&self) -> CacheEquality;

    /// Walk `route` and report what is stored at its end.
    fn lookup(&mut self, route: &[RouteStep]) -> CacheLookup;

    /// Store `loadable` at the end of `route`.
    ///
    /// Fails with [`Error::CacheCorrupted`] if a branch on the way is keyed
    /// by a different dependency than the route says.
    fn insert(&mut self, route: &[RouteStep], loadable: Loadable<AnyValue>) -> Result<()>;

    /// Remove the entry at the end of `route`. Returns whether one existed.
    fn delete(&mut self, route: &[RouteStep]) -> bool;

    /// Remove every entry.
    fn clear(&mut self);

    /// Number of entries.
    fn len(&self) -> usize;

    /// Whether there are no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn corrupted(selector: &NodeKey, expected: &NodeKey, found: &NodeKey) -> Error {
    Error::CacheCorrupted {
        selector: selector.clone(),
        expected: expected.clone(),
        found: found.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::erase;

    fn hash_of(key: &DepValueKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn reference_keys_compare_equal_values() {
        let shared = erase(1_i32);
        let a = DepValueKey::of(&Loadable::Value(Arc::clone(&shared)), CacheEquality::Reference);
        let b = DepValueKey::of(&Loadable::Value(shared), CacheEquality::Reference);
        let c = DepValueKey::of(&Loadable::Value(erase(1_i32)), CacheEquality::Reference);
        let d = DepValueKey::of(&Loadable::Value(erase(2_i32)), CacheEquality::Reference);
        assert_eq!(a, b);
        // A fresh allocation of an equal value is the same key.
        assert_eq!(a, c);
        assert_eq!(hash_of(&a), hash_of(&c));
        assert_ne!(a, d);
        assert_ne!(a, DepValueKey::of(&Loadable::Value(erase(1_i64)), CacheEquality::Reference));
    }

    #[test]
    fn values_without_a_clean_serialized_form_compare_by_eq() {
        use std::collections::HashMap;

        let first: HashMap<(u8, u8), i32> = HashMap::from([((1, 1), 1)]);
        let second: HashMap<(u8, u8), i32> = HashMap::from([((2, 2), 99)]);
        let a = DepValueKey::of(&Loadable::Value(erase(first.clone())), CacheEquality::Value);
        let b = DepValueKey::of(&Loadable::Value(erase(second)), CacheEquality::Value);
        let c = DepValueKey::of(&Loadable::Value(erase(first)), CacheEquality::Value);
        assert_ne!(a, b);
        assert_eq!(a, c);

        let nan = DepValueKey::of(&Loadable::Value(erase(Some(f64::NAN))), CacheEquality::Value);
        let none = DepValueKey::of(&Loadable::Value(erase(None::<f64>)), CacheEquality::Value);
        assert_ne!(nan, none);
    }

    #[test]
    fn value_keys_compare_serialized_form() {
        let a = DepValueKey::of(&Loadable::Value(erase(vec![1, 2])), CacheEquality::Value);
        let b = DepValueKey::of(&Loadable::Value(erase(vec![1, 2])), CacheEquality::Value);
        assert_eq!(a, b);
    }

    #[test]
    fn state_is_part_of_the_key() {
        let value = DepValueKey::of(&Loadable::Value(erase(String::from("x"))), CacheEquality::Value);
        let error = DepValueKey::of(&Loadable::Error(Error::msg("\"x\"")), CacheEquality::Value);
        assert_ne!(value, error);
    }

    #[test]
    fn policy_deserializes_from_json() {
        let policy: CachePolicy = serde_json::from_str(
            r#"{"equality": "value", "eviction": {"type": "lru", "max_size": 4}}"#,
        )
        .expect("valid policy");
        assert_eq!(policy.equality, CacheEquality::Value);
        assert_eq!(policy.eviction, Eviction::Lru { max_size: 4 });
        assert_eq!(CachePolicy::default().eviction, Eviction::KeepAll);
    }
}
