//! Asynchronous values
//!
//! A `Deferred<T>` settles exactly once, to a value or to a `Rejection`. The only
//! way to observe it is to subscribe to its settlement; there is no synchronous
//! peek. Knowledge about which deferred values already settled lives out of band,
//! in the [`Registry`](crate::registry::Registry).
//!
//! `Eventual<T>` is the "maybe asynchronous" shape every public operation of this
//! crate returns: either a value available now, or a deferred one.

use std::any::Any;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::error::{EngineError, Rejection};

/// Bound shared by every value that flows through the engine
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Clone + Send + Sync + 'static {}

/// Reference identity of a deferred value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeferredId(usize);

impl fmt::Display for DeferredId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deferred#{:x}", self.0)
    }
}

/* ===================== Slot ===================== */

type Outcome<T> = Option<Result<T, Rejection>>;

struct Slot<T> {
    state: watch::Sender<Outcome<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self { state }
    }

    /// First settlement wins; later ones are ignored
    fn settle(&self, outcome: Result<T, Rejection>) -> bool {
        let mut outcome = Some(outcome);
        self.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = outcome.take();
            true
        })
    }
}

/* ===================== Deferred ===================== */

/// A one-shot asynchronous value, compared and keyed by identity
pub struct Deferred<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Deferred<T> {
    pub fn id(&self) -> DeferredId {
        DeferredId(Arc::as_ptr(&self.slot) as *const () as usize)
    }

    pub fn ptr_eq(&self, other: &Deferred<T>) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<T: Payload> Deferred<T> {
    /// A pending value together with the handle that settles it
    pub fn channel() -> (Deferred<T>, Settler<T>) {
        let slot = Arc::new(Slot::new());
        let settler = Settler {
            slot: Some(slot.clone()),
        };
        (Deferred { slot }, settler)
    }

    pub fn fulfilled(value: T) -> Self {
        let (deferred, settler) = Self::channel();
        settler.resolve(value);
        deferred
    }

    pub fn rejected(reason: impl Into<Rejection>) -> Self {
        let (deferred, settler) = Self::channel();
        settler.reject(reason);
        deferred
    }

    /// Drive `future` eagerly on the current tokio runtime.
    ///
    /// Outside of a runtime the value settles immediately to
    /// `EngineError::NoRuntime`.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, Rejection>> + Send + 'static,
    {
        let (deferred, settler) = Self::channel();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    settler.settle(future.await);
                });
            }
            Err(_) => settler.reject(EngineError::NoRuntime),
        }
        deferred
    }

    /// Wait for settlement
    pub async fn settled(&self) -> Result<T, Rejection> {
        let mut receiver = self.slot.state.subscribe();
        let result = match receiver.wait_for(Option::is_some).await {
            Ok(state) => match &*state {
                Some(outcome) => outcome.clone(),
                None => Err(EngineError::Abandoned.into()),
            },
            Err(_) => Err(EngineError::Abandoned.into()),
        };
        result
    }

    /// Non-owning handle used by the registry to tell live identities from dead ones
    pub(crate) fn downgrade(&self) -> Weak<dyn Any + Send + Sync> {
        let slot: Arc<dyn Any + Send + Sync> = self.slot.clone();
        Arc::downgrade(&slot)
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> PartialEq for Deferred<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T> Eq for Deferred<T> {}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Deferred").field(&self.id()).finish()
    }
}

impl<T: Payload> IntoFuture for Deferred<T> {
    type Output = Result<T, Rejection>;
    type IntoFuture = BoxFuture<'static, Result<T, Rejection>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.settled().await })
    }
}

/* ===================== Settler ===================== */

/// Settles its `Deferred` exactly once. Dropping it unsettled rejects the value
/// with `EngineError::Abandoned`.
pub struct Settler<T> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T> Settler<T> {
    pub fn resolve(self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(self, reason: impl Into<Rejection>) {
        self.settle(Err(reason.into()));
    }

    pub fn settle(mut self, outcome: Result<T, Rejection>) {
        if let Some(slot) = self.slot.take() {
            slot.settle(outcome);
        }
    }
}

impl<T> Drop for Settler<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.settle(Err(EngineError::Abandoned.into()));
        }
    }
}

/* ===================== Eventual ===================== */

/// A value that is either available now or will be later
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eventual<T> {
    Now(T),
    Later(Deferred<T>),
}

impl<T> Eventual<T> {
    /// The structural test for "is an asynchronous value"
    pub fn is_deferred(&self) -> bool {
        matches!(self, Eventual::Later(_))
    }

    pub fn as_deferred(&self) -> Option<&Deferred<T>> {
        match self {
            Eventual::Now(_) => None,
            Eventual::Later(deferred) => Some(deferred),
        }
    }
}

impl<T: Payload> Eventual<T> {
    /// Wait for the value, however it is held
    pub async fn resolve(self) -> Result<T, Rejection> {
        match self {
            Eventual::Now(value) => Ok(value),
            Eventual::Later(deferred) => deferred.settled().await,
        }
    }
}

impl<T> From<Deferred<T>> for Eventual<T> {
    fn from(deferred: Deferred<T>) -> Self {
        Eventual::Later(deferred)
    }
}
