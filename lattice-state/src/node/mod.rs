//! Nodes
//!
//! A node is a named, independently subscribable piece of state. There are
//! two kinds:
//!
//! - **Atoms** hold writable values and may declare a default, effects and
//!   persistence validation.
//! - **Selectors** derive their value from other nodes through a getter
//!   and may be writable through a setter.
//!
//! Node definitions live in a [`Registry`] and are shared by every store
//! built on it. All per-store state (values, dependency edges, retention
//! counts) lives in the store, never in the definition, with the exception
//! of the selector cache and the in-flight execution table which are shared
//! across stores on purpose.
//!
//! # Typed handles
//!
//! [`Atom`], [`Selector`] and [`WritableSelector`] are cheap typed handles
//! around a [`NodeKey`]. They implement [`NodeRef`] so the store and getter
//! contexts can read them with the right value type.

pub(crate) mod atom;
pub(crate) mod effect;
mod family;
mod registry;
mod selector;

pub use atom::{Atom, AtomDefault, AtomOptions};
pub use effect::{Cleanup, EffectContext, Trigger};
pub use family::{AtomFamily, SelectorFamily};
pub use registry::Registry;
pub use selector::{Selector, SelectorOptions, WritableSelector};

pub(crate) use atom::AtomDef;
pub(crate) use selector::{Produced, SelectorDef, SetFn};

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Globally unique node identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeKey(Arc<str>);

impl NodeKey {
    /// Create a key.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for NodeKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

impl From<&NodeKey> for NodeKey {
    fn from(key: &NodeKey) -> Self {
        key.clone()
    }
}

impl Borrow<str> for NodeKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

/// Whether a node is an atom or a selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// A writable source node.
    Atom,
    /// A derived node.
    Selector,
}

/// A named retention zone.
///
/// Nodes retained by a zone stay alive as long as the zone itself is
/// retained, regardless of their own reference counts.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetentionZone(Arc<str>);

impl RetentionZone {
    /// Create a zone.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// The zone name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RetentionZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RetentionZone({:?})", &*self.0)
    }
}

/// What keeps a node alive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetainedBy {
    /// Alive while subscriptions or explicit retains hold it.
    #[default]
    Components,
    /// Never released.
    Root,
    /// Alive while any of these zones is retained.
    Zones(SmallVec<[RetentionZone; 2]>),
}

impl RetainedBy {
    /// Retained by a single zone.
    pub fn zone(zone: RetentionZone) -> Self {
        RetainedBy::Zones(SmallVec::from_iter([zone]))
    }

    /// The zones listed, if any.
    pub fn zones(&self) -> &[RetentionZone] {
        match self {
            RetainedBy::Zones(zones) => zones,
            _ => &[],
        }
    }
}

/// A registered node definition.
#[derive(Clone)]
pub enum Node {
    /// An atom.
    Atom(Arc<AtomDef>),
    /// A selector.
    Selector(Arc<SelectorDef>),
}

impl Node {
    /// The node's key.
    pub fn key(&self) -> &NodeKey {
        match self {
            Node::Atom(def) => &def.key,
            Node::Selector(def) => &def.key,
        }
    }

    /// Atom or selector.
    pub fn node_type(&self) -> NodeType {
        match self {
            Node::Atom(_) => NodeType::Atom,
            Node::Selector(_) => NodeType::Selector,
        }
    }

    /// What keeps this node alive.
    pub fn retained_by(&self) -> &RetainedBy {
        match self {
            Node::Atom(def) => &def.retained_by,
            Node::Selector(def) => &def.retained_by,
        }
    }

    /// Whether the node accepts writes.
    pub fn is_writable(&self) -> bool {
        match self {
            Node::Atom(_) => true,
            Node::Selector(def) => def.set.is_some(),
        }
    }

    /// Whether values read from this node may be mutated in place.
    pub fn allows_mutability(&self) -> bool {
        match self {
            Node::Atom(def) => def.dangerously_allow_mutability,
            Node::Selector(def) => def.dangerously_allow_mutability,
        }
    }

    /// Whether the definition should be dropped from the registry once the
    /// node is released from its last store.
    pub(crate) fn should_delete_config_on_release(&self) -> bool {
        match self {
            Node::Atom(def) => def.family.is_some() && def.live_stores() == 0,
            Node::Selector(def) => def.family.is_some() && def.live_stores() == 0,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("key", self.key())
            .field("type", &self.node_type())
            .field("writable", &self.is_writable())
            .finish()
    }
}

/// A typed, readable node handle.
pub trait NodeRef<T> {
    /// Key of the node this handle refers to.
    fn key(&self) -> &NodeKey;
}

/// A typed, writable node handle.
pub trait WritableNodeRef<T>: NodeRef<T> {}
