//! Error types for the state engine.
//!
//! Errors fall into three groups:
//!
//! - Programming errors (missing node, write to a read-only node, a write
//!   issued while another write is being applied). These are returned as
//!   `Err` from the store API and are never cached.
//! - Computed errors (`CircularDependency`, `User`, `Message`). These travel
//!   as data inside [`Loadable::Error`](crate::Loadable) so that every
//!   downstream selector sees them through the normal read path.
//! - Pending dependencies. These are not errors at all; they surface as
//!   [`Interrupt::Pending`] and never reach a log.

use std::fmt;
use std::sync::Arc;

use crate::loadable::Promise;
use crate::node::NodeKey;

/// Engine errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No node is registered under the key.
    #[error("no node registered for key `{0}`")]
    NodeMissing(NodeKey),

    /// A node was registered twice. Only ever logged.
    #[error("duplicate node key `{0}`")]
    DuplicateNode(NodeKey),

    /// Attempted to write to a read-only selector.
    #[error("attempted to set read-only node `{0}`")]
    ReadOnlyNode(NodeKey),

    /// A write was issued while another write was being applied.
    #[error("reentrant write: a state update was issued while another update was being applied")]
    ReentrantWrite,

    /// An updater function was applied to a node whose value is still loading.
    #[error("tried to update `{0}` while its value is still loading")]
    StillLoading(NodeKey),

    /// A selector setter read a node whose value is still loading.
    #[error("setter of `{setter}` read asynchronous node `{dependency}`")]
    AsyncInSetter {
        /// The writable selector whose setter ran.
        setter: NodeKey,
        /// The dependency that was still loading.
        dependency: NodeKey,
    },

    /// A typed handle was used against a node holding another type.
    #[error("node `{key}` does not hold a value of type `{expected}`")]
    TypeMismatch {
        /// The node read.
        key: NodeKey,
        /// The Rust type the caller asked for.
        expected: &'static str,
    },

    /// A selector depends on itself, directly or transitively.
    #[error("circular dependency detected: {}", format_path(path))]
    CircularDependency {
        /// Keys forming the cycle, first key repeated at the end.
        path: Vec<NodeKey>,
    },

    /// A selector cache route did not match the branch layout already stored.
    #[error("selector cache for `{selector}` is corrupted: expected branch `{expected}`, found `{found}`")]
    CacheCorrupted {
        /// The selector owning the cache.
        selector: NodeKey,
        /// The dependency key the route carried.
        expected: NodeKey,
        /// The dependency key stored in the branch.
        found: NodeKey,
    },

    /// The store or snapshot was released.
    #[error("store has been released")]
    Released,

    /// An error raised by user code.
    #[error("{0}")]
    User(Arc<dyn std::error::Error + Send + Sync>),

    /// A plain error message.
    #[error("{0}")]
    Message(String),
}

fn format_path(path: &[NodeKey]) -> String {
    path.iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl Error {
    /// Wrap a user error.
    pub fn user<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::User(Arc::new(err))
    }

    /// Build an error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Message(message.into())
    }

    /// Whether this error is a programming error rather than computed data.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Error::NodeMissing(_)
                | Error::ReadOnlyNode(_)
                | Error::ReentrantWrite
                | Error::StillLoading(_)
                | Error::AsyncInSetter { .. }
                | Error::TypeMismatch { .. }
                | Error::CacheCorrupted { .. }
        )
    }

    /// Attempt to downcast a user error.
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Error::User(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Equality used when comparing loadables: same variant and message.
    pub(crate) fn same_as(&self, other: &Error) -> bool {
        match (self, other) {
            (Error::User(a), Error::User(b)) if Arc::ptr_eq(a, b) => true,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other)
                && self.to_string() == other.to_string(),
        }
    }
}

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A dependency that is not ready yet.
///
/// Carries the node that suspended (if known) and a promise that settles
/// once the value becomes available.
#[derive(Clone)]
pub struct Suspension {
    key: Option<NodeKey>,
    ready: Promise<()>,
}

impl Suspension {
    pub(crate) fn new(key: Option<NodeKey>, ready: Promise<()>) -> Self {
        Self { key, ready }
    }

    /// The node that was loading, if the suspension came from a node read.
    pub fn key(&self) -> Option<&NodeKey> {
        self.key.as_ref()
    }

    /// Promise settling when the dependency settles.
    pub fn ready(&self) -> &Promise<()> {
        &self.ready
    }
}

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspension")
            .field("key", &self.key)
            .field("promise", &self.ready.id())
            .finish()
    }
}

/// Why a read inside a getter did not produce a value.
///
/// This is what getters propagate with `?`: either a dependency is still
/// loading, or it failed.
#[derive(Debug, Clone)]
pub enum Interrupt {
    /// The dependency is still loading.
    Pending(Suspension),
    /// The dependency, or the getter itself, failed.
    Failed(Error),
}

impl Interrupt {
    /// Whether this interrupt is a pending dependency.
    pub fn is_pending(&self) -> bool {
        matches!(self, Interrupt::Pending(_))
    }

    /// The error, if this interrupt is a failure.
    pub fn error(&self) -> Option<&Error> {
        match self {
            Interrupt::Failed(e) => Some(e),
            Interrupt::Pending(_) => None,
        }
    }
}

impl From<Error> for Interrupt {
    fn from(err: Error) -> Self {
        Interrupt::Failed(err)
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Pending(s) => match s.key() {
                Some(key) => write!(f, "waiting for `{}`", key),
                None => write!(f, "waiting for a pending value"),
            },
            Interrupt::Failed(e) => fmt::Display::fmt(e, f),
        }
    }
}
