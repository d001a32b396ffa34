//! All-then-apply derivation
//!
//! Superseded by [`eager_atom`](crate::eager::eager_atom), which reads
//! dependencies only as far as the computation needs them.

use std::sync::Arc;

use crate::combinators::{soon, soon_all};
use crate::deferred::{Eventual, Payload};
use crate::store::Atom;

/// Wait for every atom in `deps`, then run `op` on their values in order.
///
/// Failures, including a dependency that cannot be read, surface as a rejected
/// value whether they happen synchronously or not.
pub fn derive<T, W, U, F>(deps: &[Atom<Eventual<T>, W>], op: F) -> Atom<Eventual<U>>
where
    T: Payload,
    W: 'static,
    U: Payload,
    F: Fn(Vec<T>) -> anyhow::Result<U> + Send + Sync + 'static,
{
    let deps = deps.to_vec();
    let op = Arc::new(op);
    Atom::derived_async(move |get, _| {
        let values = match deps.iter().map(|dep| get.get(dep)).collect::<Result<Vec<_>, _>>() {
            Ok(values) => values,
            Err(reason) => return Ok(Eventual::Later(get.registry().rejected(reason))),
        };
        let op = op.clone();
        let all = soon_all(get.registry(), values);
        Ok(soon(get.registry(), all, move |values| op(values)))
    })
}
