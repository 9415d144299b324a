//! Settle-once promises.
//!
//! A [`Promise`] is a shared cell that is settled exactly once through its
//! [`Resolver`]. Callbacks registered with [`Promise::on_settle`] run
//! synchronously when the promise settles (or immediately if it already
//! has), which keeps evaluation order deterministic. A promise is also a
//! [`Future`], so it can be awaited on any executor.
//!
//! No lock is held while callbacks run: a callback may freely register new
//! callbacks, settle other promises or touch the store.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Counter for generating unique promise IDs.
static PROMISE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

type Callback<T> = Box<dyn FnOnce(Result<T>) + Send>;

struct Inner<T> {
    outcome: Option<Result<T>>,
    callbacks: Vec<Callback<T>>,
    wakers: Vec<Waker>,
}

struct Shared<T> {
    id: u64,
    inner: Mutex<Inner<T>>,
}

/// A value that will be available later.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

/// The write half of a [`Promise`].
pub struct Resolver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + 'static,
{
    fn with_outcome(outcome: Option<Result<T>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: PROMISE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                inner: Mutex::new(Inner {
                    outcome,
                    callbacks: Vec::new(),
                    wakers: Vec::new(),
                }),
            }),
        }
    }

    /// Create an unsettled promise and its resolver.
    pub fn pending() -> (Self, Resolver<T>) {
        let promise = Self::with_outcome(None);
        let resolver = Resolver {
            shared: Arc::clone(&promise.shared),
        };
        (promise, resolver)
    }

    /// A promise already resolved with `value`.
    pub fn resolved(value: T) -> Self {
        Self::with_outcome(Some(Ok(value)))
    }

    /// A promise already rejected with `error`.
    pub fn rejected(error: Error) -> Self {
        Self::with_outcome(Some(Err(error)))
    }

    /// A promise that never settles.
    pub fn never() -> Self {
        Self::with_outcome(None)
    }

    /// Identity of this promise. Clones share it.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The outcome, if settled.
    pub fn peek(&self) -> Option<Result<T>> {
        self.shared.inner.lock().outcome.clone()
    }

    /// Whether the promise has settled.
    pub fn is_settled(&self) -> bool {
        self.shared.inner.lock().outcome.is_some()
    }

    /// Run `callback` once the promise settles.
    ///
    /// Runs immediately on the calling thread if already settled.
    pub fn on_settle<F>(&self, callback: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let settled = {
            let mut inner = self.shared.inner.lock();
            if inner.outcome.is_none() {
                inner.callbacks.push(Box::new(callback));
                return;
            }
            inner.outcome.clone()
        };
        if let Some(outcome) = settled {
            callback(outcome);
        }
    }

    /// Chain a fallible continuation.
    pub fn then<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        let (next, resolver) = Promise::pending();
        self.on_settle(move |outcome| {
            resolver.settle(outcome.and_then(f));
        });
        next
    }

    /// A promise that settles (with the same error, if any) when this one does.
    pub fn ready(&self) -> Promise<()> {
        self.then(|_| Ok(()))
    }
}

impl<T> Resolver<T>
where
    T: Clone + Send + 'static,
{
    /// Resolve with a value. Returns `false` if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Reject with an error. Returns `false` if already settled.
    pub fn reject(&self, error: Error) -> bool {
        self.settle(Err(error))
    }

    /// Settle with an outcome. Later settlements are ignored.
    pub fn settle(&self, outcome: Result<T>) -> bool {
        let (callbacks, wakers) = {
            let mut inner = self.shared.inner.lock();
            if inner.outcome.is_some() {
                tracing::trace!(promise = self.shared.id, "ignoring second settlement");
                return false;
            }
            inner.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut inner.callbacks),
                std::mem::take(&mut inner.wakers),
            )
        };

        tracing::trace!(
            promise = self.shared.id,
            ok = outcome.is_ok(),
            callbacks = callbacks.len(),
            "promise settled"
        );

        for callback in callbacks {
            callback(outcome.clone());
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// The promise this resolver settles.
    pub fn promise(&self) -> Promise<T> {
        Promise {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Future for Promise<T>
where
    T: Clone + Send + 'static,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.shared.inner.lock();
        if let Some(outcome) = inner.outcome.clone() {
            return Poll::Ready(outcome);
        }
        if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let settled = self.shared.inner.lock().outcome.is_some();
        f.debug_struct("Promise")
            .field("id", &self.shared.id)
            .field("settled", &settled)
            .finish()
    }
}
