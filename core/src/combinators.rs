//! Fast-path combinators
//!
//! `soon` and `soon_all` apply work "as soon as possible": synchronously when
//! every input is already known to the registry, otherwise once the inputs
//! settle. Either way the result has the same shape, an `Eventual`, and a failing
//! transform never escapes as an error of the call itself: it becomes an already
//! rejected deferred value.

use futures::future::try_join_all;

use crate::deferred::{Eventual, Payload};
use crate::error::Rejection;
use crate::registry::{Registry, Settlement};

/// Apply `transform` to `input` now if it is known, later if it is pending.
///
/// A rejected input short-circuits to a rejected value with the same reason,
/// without calling `transform`.
pub fn soon<T, U, F>(registry: &Registry, input: Eventual<T>, transform: F) -> Eventual<U>
where
    T: Payload,
    U: Payload,
    F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
{
    match input {
        Eventual::Now(value) => apply(registry, value, transform),
        Eventual::Later(deferred) => match registry.settlement(&deferred) {
            Settlement::Fulfilled(value) => apply(registry, value, transform),
            Settlement::Rejected(reason) => Eventual::Later(registry.rejected(reason)),
            Settlement::Pending => {
                let observer = registry.clone();
                Eventual::Later(registry.spawn(async move {
                    let value = observer.observe(&deferred).await?;
                    transform(value).map_err(Rejection::from)
                }))
            }
        },
    }
}

/// Data-last form of [`soon`], for building pipelines
pub fn soon_with<T, U, F>(transform: F) -> impl FnOnce(&Registry, Eventual<T>) -> Eventual<U>
where
    T: Payload,
    U: Payload,
    F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
{
    move |registry, input| soon(registry, input, transform)
}

fn apply<T, U, F>(registry: &Registry, value: T, transform: F) -> Eventual<U>
where
    U: Payload,
    F: FnOnce(T) -> anyhow::Result<U>,
{
    match transform(value) {
        Ok(output) => Eventual::Now(output),
        Err(error) => Eventual::Later(registry.rejected(Rejection::from(error))),
    }
}

/* ===================== soon_all ===================== */

/// Collections of eventual values that can be gathered into one
pub trait SoonAll {
    type Output: Payload;

    fn soon_all(self, registry: &Registry) -> Eventual<Self::Output>;
}

/// Gather `values` into one eventual value, preserving their order.
///
/// If every element is known the unwrapped values are returned synchronously.
/// Otherwise the result settles once all elements have, rejecting with the first
/// rejection to occur. Every deferred element's settlement is recorded, so a
/// repeated call over the same elements takes the fast path.
pub fn soon_all<V: SoonAll>(registry: &Registry, values: V) -> Eventual<V::Output> {
    values.soon_all(registry)
}

fn known<T: Payload>(registry: &Registry, value: &Eventual<T>) -> Option<T> {
    match value {
        Eventual::Now(value) => Some(value.clone()),
        Eventual::Later(deferred) => match registry.settlement(deferred) {
            Settlement::Fulfilled(value) => Some(value),
            Settlement::Pending | Settlement::Rejected(_) => None,
        },
    }
}

async fn settle<T: Payload>(registry: &Registry, value: Eventual<T>) -> Result<T, Rejection> {
    match value {
        Eventual::Now(value) => Ok(value),
        Eventual::Later(deferred) => registry.observe(&deferred).await,
    }
}

impl<T: Payload> SoonAll for Vec<Eventual<T>> {
    type Output = Vec<T>;

    fn soon_all(self, registry: &Registry) -> Eventual<Vec<T>> {
        let settled: Option<Vec<T>> = self.iter().map(|value| known(registry, value)).collect();
        if let Some(values) = settled {
            return Eventual::Now(values);
        }

        let observer = registry.clone();
        Eventual::Later(registry.spawn(async move {
            try_join_all(self.into_iter().map(|value| settle(&observer, value))).await
        }))
    }
}

impl SoonAll for () {
    type Output = ();

    fn soon_all(self, _registry: &Registry) -> Eventual<()> {
        Eventual::Now(())
    }
}

macro_rules! impl_soon_all_for_tuple {
    ($($name:ident),+) => {
        #[allow(non_snake_case)]
        impl<$($name: Payload),+> SoonAll for ($(Eventual<$name>,)+) {
            type Output = ($($name,)+);

            fn soon_all(self, registry: &Registry) -> Eventual<Self::Output> {
                let ($($name,)+) = self;
                if let ($(Some($name),)+) = ($(known(registry, &$name),)+) {
                    return Eventual::Now(($($name,)+));
                }

                let observer = registry.clone();
                Eventual::Later(registry.spawn(async move {
                    futures::try_join!($(settle(&observer, $name)),+)
                }))
            }
        }
    };
}

impl_soon_all_for_tuple!(A, B);
impl_soon_all_for_tuple!(A, B, C);
impl_soon_all_for_tuple!(A, B, C, D);

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::deferred::Deferred;

    #[test]
    fn test_soon_applies_synchronously_to_plain_values() {
        let registry = Registry::new();
        let result = soon(&registry, Eventual::Now(4), |x| Ok(x * 3));
        assert_eq!(result, Eventual::Now(12));
    }

    #[tokio::test]
    async fn test_soon_converts_transform_failure_to_rejection() {
        let registry = Registry::new();
        let result: Eventual<i32> =
            soon(&registry, Eventual::Now(4), |_| anyhow::bail!("cannot process"));

        assert!(result.is_deferred());
        assert!(registry.get_settlement(&result).unwrap().is_rejected());
        let reason = result.resolve().await.unwrap_err();
        assert_eq!(reason.to_string(), "cannot process");
    }

    #[tokio::test]
    async fn test_soon_uses_known_settlement() {
        let registry = Registry::new();
        let input = Eventual::Later(registry.fulfilled("abc".to_string()));

        let result = soon(&registry, input, |s| Ok(s.len()));
        assert_eq!(result, Eventual::Now(3));
    }

    #[tokio::test]
    async fn test_soon_skips_transform_on_rejected_input() {
        let registry = Registry::new();
        let called = Arc::new(AtomicBool::new(false));
        let input = Eventual::Later(registry.rejected::<i32>(Rejection::msg("E")));

        let flag = called.clone();
        let result = soon(&registry, input, move |x| {
            flag.store(true, Ordering::SeqCst);
            Ok(x)
        });

        assert!(registry.get_settlement(&result).unwrap().is_rejected());
        assert_eq!(result.resolve().await.unwrap_err().to_string(), "E");
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_soon_waits_for_pending_input() {
        let registry = Registry::new();
        let (deferred, settler) = Deferred::channel();

        let result = soon(&registry, Eventual::Later(deferred.clone()), |x: i32| Ok(x + 1));
        assert!(result.is_deferred());

        settler.resolve(41);
        assert_eq!(result.clone().resolve().await.unwrap(), 42);
        // both the input and the output are now known
        assert!(registry.is_known(&Eventual::Later(deferred)));
        assert!(registry.is_known(&result));
    }

    #[tokio::test]
    async fn test_soon_propagates_pending_rejection() {
        let registry = Registry::new();
        let (deferred, settler) = Deferred::<i32>::channel();

        let result = soon(&registry, Eventual::Later(deferred), |x| Ok(x + 1));
        settler.reject(Rejection::msg("upstream failed"));

        assert_eq!(result.resolve().await.unwrap_err().to_string(), "upstream failed");
    }

    #[test]
    fn test_soon_with_is_data_last() {
        let registry = Registry::new();
        let shout = soon_with(|s: String| Ok(s.to_uppercase()));
        assert_eq!(
            shout(&registry, Eventual::Now("hey".to_string())),
            Eventual::Now("HEY".to_string())
        );
    }

    #[test]
    fn test_soon_all_of_plain_values_is_synchronous() {
        let registry = Registry::new();
        let values = vec![Eventual::Now(1), Eventual::Now(2), Eventual::Now(3)];
        assert_eq!(soon_all(&registry, values), Eventual::Now(vec![1, 2, 3]));
    }

    #[test]
    fn test_soon_all_of_nothing() {
        let registry = Registry::new();
        assert_eq!(
            soon_all(&registry, Vec::<Eventual<u8>>::new()),
            Eventual::Now(Vec::new())
        );
        assert_eq!(soon_all(&registry, ()), Eventual::Now(()));
    }

    #[tokio::test]
    async fn test_soon_all_preserves_input_order() {
        let registry = Registry::new();
        let (first, settle_first) = Deferred::channel();
        let (second, settle_second) = Deferred::channel();

        let all = soon_all(
            &registry,
            vec![Eventual::Later(first), Eventual::Now(0), Eventual::Later(second)],
        );

        // settle in reverse order
        settle_second.resolve(2);
        tokio::task::yield_now().await;
        settle_first.resolve(1);

        assert_eq!(all.resolve().await.unwrap(), vec![1, 0, 2]);
    }

    #[tokio::test]
    async fn test_soon_all_rejects_if_any_rejects() {
        let registry = Registry::new();
        let all = soon_all(
            &registry,
            vec![
                Eventual::Now(1),
                Eventual::Later(Deferred::rejected(Rejection::msg("E"))),
                Eventual::Now(2),
            ],
        );

        assert_eq!(all.resolve().await.unwrap_err().to_string(), "E");
    }

    #[tokio::test]
    async fn test_soon_all_backfills_registry() {
        let registry = Registry::new();
        let two = Deferred::fulfilled(2);
        let values = || vec![Eventual::Now(1), Eventual::Later(two.clone()), Eventual::Now(3)];

        let first = soon_all(&registry, values());
        assert!(first.is_deferred());
        assert_eq!(first.resolve().await.unwrap(), vec![1, 2, 3]);

        let second = soon_all(&registry, values());
        assert_eq!(second, Eventual::Now(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_soon_all_of_mixed_tuple() {
        let registry = Registry::new();
        let (count, settle_count) = Deferred::channel();

        let all = soon_all(
            &registry,
            (Eventual::Now("label".to_string()), Eventual::Later(count)),
        );
        settle_count.resolve(7_u32);

        assert_eq!(all.resolve().await.unwrap(), ("label".to_string(), 7));
    }

    #[test]
    fn test_soon_all_of_known_triple_is_synchronous() {
        let registry = Registry::new();
        let all = soon_all(&registry, (Eventual::Now(1), Eventual::Now('x'), Eventual::Now(true)));
        assert_eq!(all, Eventual::Now((1, 'x', true)));
    }
}
