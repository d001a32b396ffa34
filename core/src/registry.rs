//! Settlement registry
//!
//! An identity-keyed side table recording what has been observed about deferred
//! values: still pending, fulfilled with a value, or rejected with a reason. The
//! deferred values themselves are never touched.
//!
//! Entries only hold a weak reference to the value they describe. Entries of
//! dropped values are dead: they are never matched again (even if the address
//! is reused) and are swept once the table grows past the sweep threshold.
//!
//! Each [`Store`](crate::store::Store) owns one registry, so independent graphs
//! in one process never share records.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::config::RegistryConfig;
use crate::deferred::{Deferred, DeferredId, Eventual, Payload};
use crate::error::{EngineError, Rejection};

/// What is known about a deferred value
#[derive(Debug, Clone)]
pub enum Settlement<T> {
    Pending,
    Fulfilled(T),
    Rejected(Rejection),
}

impl<T> Settlement<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Settlement::Pending)
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Settlement::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Settlement::Rejected(_))
    }
}

impl<T> From<Result<T, Rejection>> for Settlement<T> {
    fn from(outcome: Result<T, Rejection>) -> Self {
        match outcome {
            Ok(value) => Settlement::Fulfilled(value),
            Err(reason) => Settlement::Rejected(reason),
        }
    }
}

/* ===================== Entries ===================== */

struct Entry {
    alive: Weak<dyn Any + Send + Sync>,
    /// `Result<T, Rejection>` once settled
    record: Option<Box<dyn Any + Send + Sync>>,
    tracked: bool,
}

impl Entry {
    fn new<T: Payload>(deferred: &Deferred<T>) -> Self {
        Self {
            alive: deferred.downgrade(),
            record: None,
            tracked: false,
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.strong_count() > 0
    }
}

struct Table {
    entries: HashMap<DeferredId, Entry>,
    next_sweep: usize,
}

impl Table {
    /// The live entry for `deferred`, replacing a dead one left at the same address
    fn entry<T: Payload>(&mut self, deferred: &Deferred<T>) -> &mut Entry {
        let entry = self
            .entries
            .entry(deferred.id())
            .or_insert_with(|| Entry::new(deferred));
        if !entry.is_alive() {
            *entry = Entry::new(deferred);
        }
        entry
    }

    fn live(&self, id: DeferredId) -> Option<&Entry> {
        self.entries.get(&id).filter(|entry| entry.is_alive())
    }

    fn sweep_if_needed(&mut self, threshold: usize) {
        if self.entries.len() <= self.next_sweep {
            return;
        }
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_alive());
        let after = self.entries.len();
        // Keep sweeps amortized when most entries are still alive
        self.next_sweep = threshold.max(after * 2);
        debug!(before, after, next_sweep = self.next_sweep, "Swept settlement registry");
    }
}

/* ===================== Registry ===================== */

/// Clonable handle to a settlement table
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

struct Inner {
    table: Mutex<Table>,
    sweep_threshold: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_config(&RegistryConfig::default())
    }

    pub fn with_config(config: &RegistryConfig) -> Self {
        let sweep_threshold = config.sweep_threshold.max(1);
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(Table {
                    entries: HashMap::new(),
                    next_sweep: sweep_threshold,
                }),
                sweep_threshold,
            }),
        }
    }

    /// True iff `value` is an asynchronous value
    pub fn is_async_value<T>(&self, value: &Eventual<T>) -> bool {
        value.is_deferred()
    }

    /// The record for an asynchronous value, `None` for a plain one.
    ///
    /// A deferred value never seen before is `Pending`.
    pub fn get_settlement<T: Payload>(&self, value: &Eventual<T>) -> Option<Settlement<T>> {
        value.as_deferred().map(|deferred| self.settlement(deferred))
    }

    pub fn settlement<T: Payload>(&self, deferred: &Deferred<T>) -> Settlement<T> {
        let table = self.inner.table.lock();
        let record = table
            .live(deferred.id())
            .and_then(|entry| entry.record.as_ref())
            .and_then(|record| record.downcast_ref::<Result<T, Rejection>>());
        match record {
            Some(Ok(value)) => Settlement::Fulfilled(value.clone()),
            Some(Err(reason)) => Settlement::Rejected(reason.clone()),
            None => Settlement::Pending,
        }
    }

    /// Store a record for `deferred`. Records never change once settled; later
    /// writes for the same identity are ignored.
    pub fn set_settlement<T: Payload>(&self, deferred: &Deferred<T>, settlement: Settlement<T>) {
        let outcome = match settlement {
            Settlement::Pending => {
                self.inner.table.lock().entry(deferred);
                return;
            }
            Settlement::Fulfilled(value) => Ok(value),
            Settlement::Rejected(reason) => Err(reason),
        };

        let mut table = self.inner.table.lock();
        let entry = table.entry(deferred);
        if entry.record.is_some() {
            trace!(deferred = %deferred.id(), "Settlement already recorded");
            return;
        }
        entry.record = Some(Box::new(outcome));
        table.sweep_if_needed(self.inner.sweep_threshold);
    }

    /// Record an observed settlement. Cancellations are inert and never recorded.
    pub fn record<T: Payload>(&self, deferred: &Deferred<T>, outcome: &Result<T, Rejection>) {
        if let Err(reason) = outcome {
            if reason.is_cancelled() {
                trace!(deferred = %deferred.id(), "Cancelled, not recorded");
                return;
            }
        }
        self.set_settlement(deferred, Settlement::from(outcome.clone()));
    }

    /// True iff `value` is plain, or a deferred value already fulfilled
    pub fn is_known<T: Payload>(&self, value: &Eventual<T>) -> bool {
        match value {
            Eventual::Now(_) => true,
            Eventual::Later(deferred) => self.settlement(deferred).is_fulfilled(),
        }
    }

    /// Unwrap a value for which [`is_known`](Self::is_known) holds
    pub fn fulfilled_value<T: Payload>(&self, value: Eventual<T>) -> Result<T, EngineError> {
        match value {
            Eventual::Now(value) => Ok(value),
            Eventual::Later(deferred) => match self.settlement(&deferred) {
                Settlement::Fulfilled(value) => Ok(value),
                Settlement::Pending | Settlement::Rejected(_) => Err(EngineError::NotFulfilled),
            },
        }
    }

    /// Wait for `deferred` to settle and record the outcome
    pub async fn observe<T: Payload>(&self, deferred: &Deferred<T>) -> Result<T, Rejection> {
        let outcome = deferred.settled().await;
        self.record(deferred, &outcome);
        outcome
    }

    /// Start watching `deferred` so its settlement gets recorded when it happens.
    /// Watching the same identity twice is a no-op. Outside of a runtime nothing
    /// is watched, and a later call from inside one starts the watcher.
    pub fn track<T: Payload>(&self, deferred: &Deferred<T>) {
        let Ok(handle) = Handle::try_current() else {
            debug!(deferred = %deferred.id(), "No runtime, settlement will not be tracked");
            return;
        };
        {
            let mut table = self.inner.table.lock();
            let entry = table.entry(deferred);
            if entry.tracked || entry.record.is_some() {
                return;
            }
            entry.tracked = true;
        }

        let registry = self.clone();
        let deferred = deferred.clone();
        handle.spawn(async move {
            let _ = registry.observe(&deferred).await;
        });
    }

    /// Drive `future` eagerly. The outcome is recorded before the returned value
    /// settles, so whoever wakes up on settlement already finds it known.
    pub fn spawn<T, F>(&self, future: F) -> Deferred<T>
    where
        T: Payload,
        F: Future<Output = Result<T, Rejection>> + Send + 'static,
    {
        let (deferred, settler) = Deferred::channel();
        match Handle::try_current() {
            Ok(handle) => {
                let registry = self.clone();
                let own = deferred.clone();
                handle.spawn(async move {
                    let outcome = future.await;
                    registry.record(&own, &outcome);
                    settler.settle(outcome);
                });
            }
            Err(_) => {
                let outcome = Err(Rejection::from(EngineError::NoRuntime));
                self.record(&deferred, &outcome);
                settler.settle(outcome);
            }
        }
        deferred
    }

    /// An already fulfilled value, known to this registry
    pub fn fulfilled<T: Payload>(&self, value: T) -> Deferred<T> {
        let deferred = Deferred::fulfilled(value.clone());
        self.set_settlement(&deferred, Settlement::Fulfilled(value));
        deferred
    }

    /// An already rejected value, known to this registry
    pub fn rejected<T: Payload>(&self, reason: impl Into<Rejection>) -> Deferred<T> {
        let reason = reason.into();
        let deferred = Deferred::rejected(reason.clone());
        self.set_settlement(&deferred, Settlement::Rejected(reason));
        deferred
    }

    /// Number of entries describing live values
    pub fn len(&self) -> usize {
        let table = self.inner.table.lock();
        table.entries.values().filter(|entry| entry.is_alive()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.len())
            .field("sweep_threshold", &self.inner.sweep_threshold)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::flush;

    #[test]
    fn test_plain_values_have_no_record() {
        let registry = Registry::new();
        let value = Eventual::Now(3);

        assert!(!registry.is_async_value(&value));
        assert!(registry.get_settlement(&value).is_none());
        assert!(registry.is_known(&value));
        assert_eq!(registry.fulfilled_value(value).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unseen_deferred_is_pending() {
        let registry = Registry::new();
        let (deferred, _settler) = Deferred::<i32>::channel();
        let value = Eventual::Later(deferred);

        assert!(registry.is_async_value(&value));
        assert!(registry.get_settlement(&value).unwrap().is_pending());
        assert!(!registry.is_known(&value));
        assert_eq!(
            registry.fulfilled_value(value).unwrap_err(),
            EngineError::NotFulfilled
        );
    }

    #[tokio::test]
    async fn test_settlement_is_monotonic() {
        let registry = Registry::new();
        let (deferred, _settler) = Deferred::channel();

        registry.set_settlement(&deferred, Settlement::Fulfilled(1));
        registry.set_settlement(&deferred, Settlement::Fulfilled(2));
        registry.set_settlement(&deferred, Settlement::Rejected(Rejection::msg("late")));
        registry.set_settlement(&deferred, Settlement::Pending);

        match registry.settlement(&deferred) {
            Settlement::Fulfilled(value) => assert_eq!(value, 1),
            other => panic!("expected fulfilled, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_value_is_not_known() {
        let registry = Registry::new();
        let deferred = registry.rejected::<i32>(Rejection::msg("E"));
        let value = Eventual::Later(deferred);

        assert!(!registry.is_known(&value));
        match registry.get_settlement(&value) {
            Some(Settlement::Rejected(reason)) => assert_eq!(reason.to_string(), "E"),
            other => panic!("expected rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_identity_not_equality_keys_records() {
        let registry = Registry::new();
        let known = registry.fulfilled(7);
        let lookalike = Deferred::fulfilled(7);

        assert!(registry.is_known(&Eventual::Later(known)));
        assert!(!registry.is_known(&Eventual::Later(lookalike)));
    }

    #[tokio::test]
    async fn test_observe_records_outcome() {
        let registry = Registry::new();
        let (deferred, settler) = Deferred::channel();
        settler.resolve("ready".to_string());

        assert_eq!(registry.observe(&deferred).await.unwrap(), "ready");
        assert!(registry.settlement(&deferred).is_fulfilled());
    }

    #[tokio::test]
    async fn test_track_records_once_settled() {
        let registry = Registry::new();
        let (deferred, settler) = Deferred::<i32>::channel();

        registry.track(&deferred);
        registry.track(&deferred);
        assert!(registry.settlement(&deferred).is_pending());

        settler.reject(Rejection::msg("nope"));
        flush().await;

        assert!(registry.settlement(&deferred).is_rejected());
    }

    #[tokio::test]
    async fn test_cancellation_is_never_recorded() {
        let registry = Registry::new();
        let (deferred, settler) = Deferred::<i32>::channel();

        registry.track(&deferred);
        settler.reject(EngineError::Cancelled);
        flush().await;
        assert!(registry.settlement(&deferred).is_pending());

        let reason = registry.observe(&deferred).await.unwrap_err();
        assert!(reason.is_cancelled());
        assert!(registry.settlement(&deferred).is_pending());
    }

    #[test]
    fn test_track_outside_runtime_can_be_retried() {
        let registry = Registry::new();
        let (deferred, settler) = Deferred::channel();

        // No runtime: nothing is watched, and nothing is marked as watched
        registry.track(&deferred);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            registry.track(&deferred);
            settler.resolve(5);
            flush().await;
        });

        assert!(registry.settlement(&deferred).is_fulfilled());
    }

    #[tokio::test]
    async fn test_spawned_outcome_is_known_on_wake_up() {
        let registry = Registry::new();
        let deferred = registry.spawn(async { Ok::<_, Rejection>(42) });

        assert_eq!(deferred.settled().await.unwrap(), 42);
        assert!(registry.is_known(&Eventual::Later(deferred)));
    }

    #[tokio::test]
    async fn test_entries_do_not_keep_values_alive() {
        let registry = Registry::with_config(&RegistryConfig { sweep_threshold: 4 });
        for i in 0..16 {
            let deferred = Deferred::fulfilled(i);
            registry.set_settlement(&deferred, Settlement::Fulfilled(i));
        }
        assert_eq!(registry.len(), 0);

        let kept = registry.fulfilled(99);
        assert_eq!(registry.len(), 1);
        assert!(registry.is_known(&Eventual::Later(kept)));
    }
}
