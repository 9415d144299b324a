//! Families
//!
//! A family declares one node per parameter. Members are registered lazily
//! the first time a parameter is used, under the key
//! `"{family}__{param}"` where `param` is the parameter's stable JSON form,
//! so equal parameters always map to the same member.
//!
//! A member released from its last store is dropped from the registry; the
//! next `get` with the same parameter registers it again.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;

use super::selector::erase_setter;
use super::{Atom, AtomOptions, Node, NodeKey, Registry, Selector, SelectorOptions, WritableSelector};
use crate::engine::SetContext;
use crate::error::Result;
use crate::value::{stable_stringify, NodeValue, WriteValue};

fn member_key(family: &NodeKey, param: &impl Serialize) -> NodeKey {
    let param = stable_stringify(param).unwrap_or_else(|err| {
        tracing::warn!(%family, %err, "family parameter does not serialize to JSON");
        format!("<{}>", err)
    });
    NodeKey::from(format!("{}__{}", family, param))
}

type AtomFactory<P, T> = Arc<dyn Fn(&P) -> AtomOptions<T> + Send + Sync>;

/// A family of atoms.
pub struct AtomFamily<P, T> {
    key: NodeKey,
    registry: Registry,
    make: AtomFactory<P, T>,
}

impl<P, T> AtomFamily<P, T>
where
    P: Serialize + 'static,
    T: NodeValue + Clone,
{
    /// A family whose members default to `default(param)`.
    pub fn new<F>(registry: &Registry, key: impl Into<NodeKey>, default: F) -> Self
    where
        F: Fn(&P) -> T + Send + Sync + 'static,
    {
        let key = key.into();
        let base = key.clone();
        Self::with_options(registry, key, move |param| {
            AtomOptions::new(base.clone(), default(param))
        })
    }

    /// A family whose members are declared by `options(param)`. The key in
    /// the returned options is replaced by the member key.
    pub fn with_options<F>(registry: &Registry, key: impl Into<NodeKey>, options: F) -> Self
    where
        F: Fn(&P) -> AtomOptions<T> + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            registry: registry.clone(),
            make: Arc::new(options),
        }
    }

    /// The member for `param`, registering it if needed.
    pub fn get(&self, param: &P) -> Atom<T> {
        let key = member_key(&self.key, param);
        self.registry.register_if_absent(&key, || {
            let options = (self.make)(param).rekey(key.clone());
            Node::Atom(Arc::new(options.into_def(Some(self.key.clone()))))
        });
        Atom::from_key(key)
    }

    /// Key of the member for `param`.
    pub fn member_key(&self, param: &P) -> NodeKey {
        member_key(&self.key, param)
    }

    /// Key of the family.
    pub fn key(&self) -> &NodeKey {
        &self.key
    }
}

type SelectorFactory<P, T> = Arc<dyn Fn(&P) -> SelectorOptions<T> + Send + Sync>;
type SetterFactory<P, T> =
    Arc<dyn Fn(&P, &SetContext<'_>, WriteValue<T>) -> Result<()> + Send + Sync>;

/// A family of selectors.
pub struct SelectorFamily<P, T> {
    key: NodeKey,
    registry: Registry,
    make: SelectorFactory<P, T>,
    set: Option<SetterFactory<P, T>>,
    _marker: PhantomData<fn() -> P>,
}

impl<P, T> SelectorFamily<P, T>
where
    P: Serialize + Clone + Send + Sync + 'static,
    T: NodeValue + Clone,
{
    /// A family of read-only selectors declared by `options(param)`.
    pub fn new<F>(registry: &Registry, key: impl Into<NodeKey>, options: F) -> Self
    where
        F: Fn(&P) -> SelectorOptions<T> + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            registry: registry.clone(),
            make: Arc::new(options),
            set: None,
            _marker: PhantomData,
        }
    }

    /// A family of writable selectors; `set(param, ctx, value)` handles
    /// writes to a member.
    pub fn writable<F, S>(registry: &Registry, key: impl Into<NodeKey>, options: F, set: S) -> Self
    where
        F: Fn(&P) -> SelectorOptions<T> + Send + Sync + 'static,
        S: Fn(&P, &SetContext<'_>, WriteValue<T>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            set: Some(Arc::new(set)),
            ..Self::new(registry, key, options)
        }
    }

    fn register(&self, param: &P) -> NodeKey {
        let key = member_key(&self.key, param);
        self.registry.register_if_absent(&key, || {
            let options = (self.make)(param).rekey(key.clone());
            let set = self.set.as_ref().map(|set| {
                let set = Arc::clone(set);
                let param = param.clone();
                erase_setter(key.clone(), move |ctx: &SetContext<'_>, write: WriteValue<T>| {
                    set(&param, ctx, write)
                })
            });
            Node::Selector(Arc::new(options.into_def(set, Some(self.key.clone()))))
        });
        key
    }

    /// The read-only member for `param`, registering it if needed.
    pub fn get(&self, param: &P) -> Selector<T> {
        Selector::from_key(self.register(param))
    }

    /// The writable member for `param`, or `None` for a read-only family.
    pub fn get_writable(&self, param: &P) -> Option<WritableSelector<T>> {
        self.set.as_ref()?;
        Some(WritableSelector::from_key(self.register(param)))
    }

    /// Key of the member for `param`.
    pub fn member_key(&self, param: &P) -> NodeKey {
        member_key(&self.key, param)
    }

    /// Key of the family.
    pub fn key(&self) -> &NodeKey {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Params {
        b: u32,
        a: &'static str,
    }

    #[test]
    fn member_keys_use_stable_json() {
        let registry = Registry::new();
        let family = AtomFamily::new(&registry, "item", |_: &Params| 0_i32);
        let key = family.member_key(&Params { b: 2, a: "x" });
        assert_eq!(key.as_str(), r#"item__{"a":"x","b":2}"#);
    }

    #[test]
    fn members_register_once() {
        let registry = Registry::new();
        let family = AtomFamily::new(&registry, "count", |n: &u32| *n as i64);
        let first = family.get(&3);
        let again = family.get(&3);
        let other = family.get(&4);
        assert_eq!(first.key(), again.key());
        assert_ne!(first.key(), other.key());
        assert_eq!(registry.len(), 2);

        match registry.get(first.key()) {
            Ok(Node::Atom(def)) => {
                assert_eq!(def.family.as_ref().map(|k| k.as_str()), Some("count"));
            }
            other => panic!("expected an atom, got {:?}", other),
        }
    }

    #[test]
    fn read_only_families_have_no_writable_members() {
        let registry = Registry::new();
        let family = SelectorFamily::new(&registry, "double", |n: &i32| {
            let n = *n;
            SelectorOptions::new("ignored", move |_| Ok(n * 2))
        });
        assert!(family.get_writable(&1).is_none());
        let member = family.get(&1);
        assert_eq!(member.key().as_str(), "double__1");
    }
}
