//! Stale-fallback wrapper
//!
//! Wraps an asynchronous atom into a synchronous one. While the source holds a
//! pending value the wrapper shows a fallback computed from the previous value;
//! once the value settles the wrapper is invalidated and shows the new value.
//!
//! One settlement handler is attached per distinct pending value, however often
//! the wrapper is read in the meantime.

use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::deferred::{Deferred, Eventual, Payload};
use crate::error::Rejection;
use crate::registry::{Registry, Settlement};
use crate::store::{Atom, Getter, Invalidator, ReadContext};

/// What a fallback function gets to see
pub struct FallbackContext<'a, T> {
    /// The last fulfilled value of the source, if any
    pub previous: Option<&'a T>,
    /// The value the source is waiting for
    pub pending: &'a Deferred<T>,
    /// Read access to other atoms
    pub get: &'a Getter,
}

/// Per-store state behind a wrapper
#[derive(Clone)]
pub(crate) struct Stale<T, P> {
    /// The deferred value seen on the last evaluation
    observed: Option<Deferred<T>>,
    /// The last fulfilled value, kept across rejections
    fulfilled: Option<T>,
    pub(crate) output: Result<P, Rejection>,
}

impl<T: Payload, P> Stale<T, P> {
    fn is_waiting_on(&self, deferred: &Deferred<T>) -> bool {
        self.observed.as_ref() == Some(deferred)
    }
}

/// Show the settled value of `source`, or `fallback` while it is pending.
///
/// Writes to the returned atom go to `source` unchanged.
pub fn with_fallback<T, W, F>(source: &Atom<Eventual<T>, W>, fallback: F) -> Atom<T, W>
where
    T: Payload,
    W: 'static,
    F: Fn(&FallbackContext<'_, T>) -> T + Send + Sync + 'static,
{
    forward(source, stale_state(source, |value| value, fallback))
}

/// Show `Some` settled value of `source`, or `None` while it is pending
pub fn with_pending<T, W>(source: &Atom<Eventual<T>, W>) -> Atom<Option<T>, W>
where
    T: Payload,
    W: 'static,
{
    forward(source, stale_state(source, Some, |_| None))
}

fn forward<T, W, P>(source: &Atom<Eventual<T>, W>, state: Atom<Stale<T, P>>) -> Atom<P, W>
where
    T: Payload,
    W: 'static,
    P: Payload,
{
    let source = source.clone();
    Atom::writable(
        move |get, _| Ok(get.get(&state)?.output?),
        move |set, arg: W| {
            set.set(&source, arg)?;
            Ok(())
        },
    )
}

/// The state atom shared by every stale-fallback flavour. `fulfilled` maps a
/// settled value to the output, `fallback` computes the output while pending.
/// A rejection is kept in the output so the state itself never fails.
pub(crate) fn stale_state<T, W, P, F>(
    source: &Atom<Eventual<T>, W>,
    fulfilled: fn(T) -> P,
    fallback: F,
) -> Atom<Stale<T, P>>
where
    T: Payload,
    W: 'static,
    P: Payload,
    F: Fn(&FallbackContext<'_, T>) -> P + Send + Sync + 'static,
{
    let source = source.clone();
    Atom::derived(move |get, ctx: &ReadContext<Stale<T, P>>| {
        let previous = ctx.previous();
        let last = || previous.and_then(|state| state.fulfilled.clone());

        let deferred = match get.get(&source) {
            Ok(Eventual::Now(value)) => {
                return Ok(Stale {
                    observed: None,
                    fulfilled: Some(value.clone()),
                    output: Ok(fulfilled(value)),
                });
            }
            Ok(Eventual::Later(deferred)) => deferred,
            Err(reason) => {
                return Ok(Stale {
                    observed: None,
                    fulfilled: last(),
                    output: Err(reason),
                });
            }
        };

        match get.registry().settlement(&deferred) {
            Settlement::Fulfilled(value) => Ok(Stale {
                observed: Some(deferred),
                fulfilled: Some(value.clone()),
                output: Ok(fulfilled(value)),
            }),
            Settlement::Rejected(reason) => Ok(Stale {
                observed: Some(deferred),
                fulfilled: last(),
                output: Err(reason),
            }),
            Settlement::Pending => {
                if let Some(previous) = previous.filter(|state| state.is_waiting_on(&deferred)) {
                    trace!(pending = %deferred.id(), "Still waiting on the same value");
                    return Ok(previous.clone());
                }

                watch_settlement(get.registry(), &deferred, ctx.invalidator());
                let last = last();
                let output = fallback(&FallbackContext {
                    previous: last.as_ref(),
                    pending: &deferred,
                    get,
                });
                Ok(Stale {
                    observed: Some(deferred),
                    fulfilled: last,
                    output: Ok(output),
                })
            }
        }
    })
}

/// Record the settlement of `deferred` once it happens, then invalidate
fn watch_settlement<T: Payload>(registry: &Registry, deferred: &Deferred<T>, invalidator: &Invalidator) {
    let Ok(handle) = Handle::try_current() else {
        debug!(pending = %deferred.id(), "No runtime, the fallback will not be replaced");
        return;
    };
    debug!(pending = %deferred.id(), atom = %invalidator.atom(), "Attaching settlement handler");

    let registry = registry.clone();
    let deferred = deferred.clone();
    let invalidator = invalidator.clone();
    handle.spawn(async move {
        let _ = registry.observe(&deferred).await;
        trace!(settled = %deferred.id(), "Pending value settled");
        invalidator.invalidate();
    });
}

#[cfg(test)]
#[path = "fallback_tests.rs"]
mod tests;
