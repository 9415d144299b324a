//! Dynamic node values.
//!
//! Every node stores its value type-erased as an [`AnyValue`]. Typed handles
//! downcast on the way out. Values must be comparable (for dependency
//! change detection) and serializable (for the value-equality cache and for
//! persistence).

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::node::NodeKey;

/// A value that can be held by an atom or produced by a selector.
pub trait NodeValue: Any + Send + Sync + Debug {
    /// Upcast for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Semantic equality against another erased value.
    fn value_eq(&self, other: &dyn NodeValue) -> bool;

    /// Stable serialized form, or `None` if the value does not serialize to
    /// JSON. Object keys are sorted so equal values always produce equal
    /// strings.
    fn stable_key(&self) -> Option<String>;

    /// Name of the concrete type.
    fn type_name(&self) -> &'static str;
}

impl<T> NodeValue for T
where
    T: Clone + PartialEq + Debug + Serialize + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn value_eq(&self, other: &dyn NodeValue) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .map(|other| other == self)
            .unwrap_or(false)
    }

    fn stable_key(&self) -> Option<String> {
        match stable_stringify(self) {
            Ok(key) => Some(key),
            Err(err) => {
                tracing::trace!(%err, "value has no stable key");
                None
            }
        }
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Shared, type-erased node value.
pub type AnyValue = Arc<dyn NodeValue>;

/// Erase a typed value.
pub fn erase<T: NodeValue>(value: T) -> AnyValue {
    Arc::new(value)
}

/// Downcast an erased value back to `T`.
pub fn downcast<T>(key: &NodeKey, value: &AnyValue) -> Result<T>
where
    T: Clone + 'static,
{
    value
        .as_any()
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| Error::TypeMismatch {
            key: key.clone(),
            expected: std::any::type_name::<T>(),
        })
}

/// Identity or equality of two erased values.
pub(crate) fn same_value(a: &AnyValue, b: &AnyValue) -> bool {
    Arc::ptr_eq(a, b) || a.value_eq(b.as_ref())
}

/// Serialize to JSON with object keys in sorted order.
///
/// `serde_json::Value` maps are ordered by key, so routing through `Value`
/// gives a canonical string regardless of the source map's iteration order.
///
/// Fails for values JSON cannot represent, such as maps with non-string keys.
pub fn stable_stringify<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    serde_json::to_value(value).map(|json| json.to_string())
}

/// Sentinel meaning "reset this node to its default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DefaultValue;

/// A value written to a node: either a concrete value or the reset sentinel.
#[derive(Debug, Clone)]
pub enum WriteValue<T> {
    /// Set the node to this value.
    Value(T),
    /// Reset the node to its default.
    Reset(DefaultValue),
}

impl<T> From<DefaultValue> for WriteValue<T> {
    fn from(value: DefaultValue) -> Self {
        WriteValue::Reset(value)
    }
}

impl<T> WriteValue<T> {
    /// Whether this write is a reset.
    pub fn is_reset(&self) -> bool {
        matches!(self, WriteValue::Reset(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn erased_values_compare_semantically() {
        let a = erase(5_i32);
        let b = erase(5_i32);
        let c = erase(6_i32);
        assert!(same_value(&a, &b));
        assert!(!same_value(&a, &c));
        // Different types never compare equal.
        assert!(!same_value(&a, &erase(5_i64)));
    }

    #[test]
    fn downcast_reports_type_mismatch() {
        let key = NodeKey::from("k");
        let v = erase(String::from("hi"));
        assert_eq!(downcast::<String>(&key, &v).ok(), Some("hi".to_string()));
        assert!(matches!(
            downcast::<i32>(&key, &v),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn stable_stringify_sorts_keys() {
        let mut first = HashMap::new();
        let mut second = HashMap::new();
        for (k, v) in [("b", 2), ("a", 1), ("c", 3)] {
            first.insert(k, v);
        }
        for (k, v) in [("c", 3), ("a", 1), ("b", 2)] {
            second.insert(k, v);
        }
        assert_eq!(stable_stringify(&first).ok(), stable_stringify(&second).ok());
        assert_eq!(stable_stringify(&first).ok().as_deref(), Some(r#"{"a":1,"b":2,"c":3}"#));
    }

    #[test]
    fn tuple_keyed_maps_have_no_stable_key() {
        let map: HashMap<(u8, u8), i32> = HashMap::from([((1, 1), 1)]);
        assert!(stable_stringify(&map).is_err());
        assert_eq!(erase(map).stable_key(), None);
        assert_eq!(erase(vec![1, 2]).stable_key().as_deref(), Some("[1,2]"));
    }
}
