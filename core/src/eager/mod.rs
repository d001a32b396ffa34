//! Eager resolver
//!
//! Runs a read function written as if every dependency were synchronous. A read
//! that touches a pending dependency is interrupted with a suspension carrying
//! that dependency; the resolver waits for it to settle and then re-runs the
//! whole read from the top. Reads therefore must not have side effects that are
//! observable across retries.
//!
//! Per attempt: Running -> Returned | Suspended | Failed, and
//! Suspended -> Running | Aborted once the dependency settled or the
//! evaluation was cancelled.

use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::deferred::{Deferred, DeferredId, Eventual, Payload};
use crate::error::{EngineError, Rejection};
use crate::registry::{Registry, Settlement};
use crate::store::{Atom, Getter};

/* ===================== Interrupt ===================== */

/// Why an eager read did not return a value
#[derive(Debug, Clone, Error)]
pub enum Interrupt {
    /// A dependency is still pending. Never a user-facing error: the resolver
    /// waits for the dependency and retries.
    #[error("suspended on {}", .0.pending_id())]
    Suspend(Suspension),

    /// A dependency rejected, or the read itself failed
    #[error(transparent)]
    Fail(Rejection),
}

impl Interrupt {
    pub fn is_suspension(&self) -> bool {
        matches!(self, Interrupt::Suspend(_))
    }
}

impl From<Rejection> for Interrupt {
    fn from(reason: Rejection) -> Self {
        Interrupt::Fail(reason)
    }
}

impl From<EngineError> for Interrupt {
    fn from(error: EngineError) -> Self {
        Interrupt::Fail(error.into())
    }
}

impl From<anyhow::Error> for Interrupt {
    /// Recovers an interrupt that went through `anyhow`, so a suspension raised
    /// inside consumer code using `?` is still recognized as one
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<Interrupt>() {
            Ok(interrupt) => interrupt,
            Err(error) => Interrupt::Fail(Rejection::from(error)),
        }
    }
}

/// True if `error` carries a suspension.
///
/// Reads with their own error handling around dependency access must re-raise
/// such errors unchanged; swallowing one makes the read behave as if the
/// dependency produced no value.
pub fn is_suspension_signal(error: &anyhow::Error) -> bool {
    matches!(error.downcast_ref::<Interrupt>(), Some(Interrupt::Suspend(_)))
}

/// The pending dependency an eager read stopped on
#[derive(Clone)]
pub struct Suspension {
    pending: Arc<dyn PendingValue>,
}

/// A pending deferred value with its payload type erased
trait PendingValue: Send + Sync {
    fn id(&self) -> DeferredId;

    /// Wait for settlement and record it
    fn wait(&self, registry: &Registry) -> BoxFuture<'static, Result<(), Rejection>>;
}

impl<T: Payload> PendingValue for Deferred<T> {
    fn id(&self) -> DeferredId {
        Deferred::id(self)
    }

    fn wait(&self, registry: &Registry) -> BoxFuture<'static, Result<(), Rejection>> {
        let registry = registry.clone();
        let deferred = self.clone();
        async move { registry.observe(&deferred).await.map(|_| ()) }.boxed()
    }
}

impl Suspension {
    fn new<T: Payload>(pending: Deferred<T>) -> Self {
        Self {
            pending: Arc::new(pending),
        }
    }

    pub fn pending_id(&self) -> DeferredId {
        self.pending.id()
    }
}

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspension")
            .field("pending", &self.pending.id())
            .finish()
    }
}

/* ===================== Dependency access ===================== */

/// Dependency access handed to eager reads
#[derive(Clone)]
pub struct EagerGetter {
    getter: Getter,
}

impl EagerGetter {
    pub fn new(getter: Getter) -> Self {
        Self { getter }
    }

    /// The fulfilled value of an asynchronous atom.
    ///
    /// Suspends if the value is pending and fails with its rejection if it
    /// rejected (or if reading the atom failed).
    pub fn get<U: Payload, W>(&self, atom: &Atom<Eventual<U>, W>) -> Result<U, Interrupt> {
        let value = self.getter.get(atom)?;
        self.unwrap(value)
    }

    /// The value of a synchronous atom
    pub fn value<U: Payload, W>(&self, atom: &Atom<U, W>) -> Result<U, Interrupt> {
        Ok(self.getter.get(atom)?)
    }

    /// Unwrap any eventual value: plain or fulfilled values pass, pending ones
    /// suspend, rejected ones fail
    pub fn unwrap<U: Payload>(&self, value: Eventual<U>) -> Result<U, Interrupt> {
        let deferred = match value {
            Eventual::Now(value) => return Ok(value),
            Eventual::Later(deferred) => deferred,
        };
        match self.registry().settlement(&deferred) {
            Settlement::Fulfilled(value) => Ok(value),
            Settlement::Rejected(reason) => Err(Interrupt::Fail(reason)),
            Settlement::Pending => {
                trace!(pending = %deferred.id(), "Dependency pending");
                Err(Interrupt::Suspend(Suspension::new(deferred)))
            }
        }
    }

    /// Read every atom first, so independent asynchronous work starts together,
    /// then unwrap them in order, suspending on the first one still pending.
    pub fn all<U: Payload, W>(&self, atoms: &[&Atom<Eventual<U>, W>]) -> Result<Vec<U>, Interrupt> {
        let values = atoms
            .iter()
            .map(|atom| self.getter.get(*atom))
            .collect::<Result<Vec<_>, _>>()?;
        values.into_iter().map(|value| self.unwrap(value)).collect()
    }

    pub fn registry(&self) -> &Registry {
        self.getter.registry()
    }

    pub fn getter(&self) -> &Getter {
        &self.getter
    }
}

/* ===================== Resolver ===================== */

/// Run `read` eagerly.
///
/// A read that returns is passed through as `Now`, a read that fails becomes an
/// already rejected value. A suspended read yields a pending value settling with
/// the result of the first retry that does not suspend. Once `signal` is
/// cancelled no further retry starts and the pending value settles with
/// [`EngineError::Cancelled`]. Awaiting such a superseded value therefore yields
/// an error for which [`Rejection::is_cancelled`] holds, and the registry never
/// records it: its settlement stays pending.
pub fn resolve_eagerly<T, R>(read: R, getter: EagerGetter, signal: CancellationToken) -> Eventual<T>
where
    T: Payload,
    R: Fn(&EagerGetter) -> Result<T, Interrupt> + Send + Sync + 'static,
{
    let suspension = match read(&getter) {
        Ok(value) => return Eventual::Now(value),
        Err(Interrupt::Fail(reason)) => {
            trace!(reason = %reason, "Eager read failed");
            return Eventual::Later(getter.registry().rejected(reason));
        }
        Err(Interrupt::Suspend(suspension)) => suspension,
    };

    let registry = getter.registry().clone();
    Eventual::Later(registry.spawn(retry(read, getter, signal, suspension)))
}

async fn retry<T, R>(
    read: R,
    getter: EagerGetter,
    signal: CancellationToken,
    mut suspension: Suspension,
) -> Result<T, Rejection>
where
    T: Payload,
    R: Fn(&EagerGetter) -> Result<T, Interrupt> + Send + Sync + 'static,
{
    let mut attempt = 1_u32;
    loop {
        debug!(pending = %suspension.pending_id(), attempt, "Eager read suspended");
        tokio::select! {
            outcome = suspension.pending.wait(getter.registry()) => outcome?,
            _ = signal.cancelled() => {}
        }
        if signal.is_cancelled() {
            debug!(attempt, "Eager read aborted");
            return Err(EngineError::Cancelled.into());
        }

        attempt += 1;
        trace!(attempt, "Retrying eager read");
        match read(&getter) {
            Ok(value) => return Ok(value),
            Err(Interrupt::Fail(reason)) => return Err(reason),
            Err(Interrupt::Suspend(next)) => suspension = next,
        }
    }
}

/// An asynchronous atom computed eagerly by `read`.
///
/// Each evaluation passes its own cancellation signal to the resolver, so a
/// superseded evaluation stops retrying.
pub fn eager_atom<T, R>(read: R) -> Atom<Eventual<T>>
where
    T: Payload,
    R: Fn(&EagerGetter) -> Result<T, Interrupt> + Send + Sync + 'static,
{
    let read = Arc::new(read);
    Atom::derived_async(move |get, ctx| {
        let read = read.clone();
        Ok(resolve_eagerly(
            move |eager: &EagerGetter| read(eager),
            EagerGetter::new(get.clone()),
            ctx.signal().clone(),
        ))
    })
}

#[cfg(test)]
#[path = "eager_tests.rs"]
mod tests;
