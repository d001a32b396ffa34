//! Tests for the stale-fallback wrapper

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::*;
use crate::error::Rejection;
use crate::store::Store;
use crate::test_helpers::flush;

#[tokio::test]
async fn test_fallback_until_settled() {
    let store = Store::new();
    let (deferred, settler) = Deferred::channel();
    let source = Atom::deferred(Eventual::Later(deferred));
    let shown = with_fallback(&source, |_| "loading".to_string());

    assert_eq!(store.get(&shown).unwrap(), "loading");

    settler.resolve("done".to_string());
    flush().await;
    assert_eq!(store.get(&shown).unwrap(), "done");
}

#[tokio::test]
async fn test_new_pending_value_shows_previous_value() {
    let store = Store::new();
    let (first, settle_first) = Deferred::channel();
    let source = Atom::deferred(Eventual::Later(first));
    let shown = with_fallback(&source, |ctx| {
        ctx.previous.cloned().unwrap_or_else(|| "loading".to_string())
    });

    assert_eq!(store.get(&shown).unwrap(), "loading");
    settle_first.resolve("first".to_string());
    flush().await;
    assert_eq!(store.get(&shown).unwrap(), "first");

    // Refetch: the stale value stays on screen while the new one is pending
    let (second, settle_second) = Deferred::channel();
    store.set(&source, Eventual::Later(second)).unwrap();
    assert_eq!(store.get(&shown).unwrap(), "first");

    settle_second.resolve("second".to_string());
    flush().await;
    assert_eq!(store.get(&shown).unwrap(), "second");
}

#[tokio::test]
async fn test_one_handler_per_pending_value() {
    let store = Store::new();
    let fallbacks = Arc::new(AtomicUsize::new(0));
    let notified = Arc::new(AtomicUsize::new(0));
    let (deferred, settler) = Deferred::channel();
    let source = Atom::deferred(Eventual::Later(deferred.clone()));

    let shown = {
        let fallbacks = fallbacks.clone();
        with_fallback(&source, move |_| {
            fallbacks.fetch_add(1, Ordering::SeqCst);
            0
        })
    };
    let _subscription = {
        let notified = notified.clone();
        store.subscribe(&shown, move || {
            notified.fetch_add(1, Ordering::SeqCst);
        })
    };

    assert_eq!(store.get(&shown).unwrap(), 0);

    // Writing the same pending value forces a re-evaluation, but no new handler
    store.set(&source, Eventual::Later(deferred)).unwrap();
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(store.get(&shown).unwrap(), 0);
    assert_eq!(store.get(&shown).unwrap(), 0);
    assert_eq!(fallbacks.load(Ordering::SeqCst), 1);

    settler.resolve(5);
    flush().await;

    // Exactly one settlement-triggered invalidation
    assert_eq!(notified.load(Ordering::SeqCst), 2);
    assert_eq!(store.get(&shown).unwrap(), 5);
    assert_eq!(fallbacks.load(Ordering::SeqCst), 1);
}

#[test]
fn test_plain_values_pass_through() {
    let store = Store::new();
    let source = Atom::deferred(Eventual::Now(3));
    let shown = with_fallback(&source, |_| -1);
    let maybe = with_pending(&source);

    assert_eq!(store.get(&shown).unwrap(), 3);
    assert_eq!(store.get(&maybe).unwrap(), Some(3));
}

#[tokio::test]
async fn test_known_value_is_adopted_without_fallback() {
    let store = Store::new();
    let source = Atom::deferred(Eventual::Later(store.registry().fulfilled(8)));
    let shown = with_fallback(&source, |_| -1);

    assert_eq!(store.get(&shown).unwrap(), 8);
}

#[tokio::test]
async fn test_rejection_fails_the_wrapper() {
    let store = Store::new();
    let (deferred, settler) = Deferred::<i32>::channel();
    let source = Atom::deferred(Eventual::Later(deferred));
    let shown = with_fallback(&source, |_| 0);

    assert_eq!(store.get(&shown).unwrap(), 0);

    settler.reject(Rejection::msg("E"));
    flush().await;
    assert_eq!(store.get(&shown).unwrap_err().to_string(), "E");
}

#[tokio::test]
async fn test_previous_value_survives_a_rejection() {
    let store = Store::new();
    let source = Atom::deferred(Eventual::Now("a".to_string()));
    let shown = with_fallback(&source, |ctx| {
        ctx.previous.cloned().unwrap_or_else(|| "none".to_string())
    });
    assert_eq!(store.get(&shown).unwrap(), "a");

    let failed = store.registry().rejected::<String>(Rejection::msg("E"));
    store.set(&source, Eventual::Later(failed)).unwrap();
    assert_eq!(store.get(&shown).unwrap_err().to_string(), "E");

    let (pending, _settler) = Deferred::channel();
    store.set(&source, Eventual::Later(pending)).unwrap();
    assert_eq!(store.get(&shown).unwrap(), "a");
}

#[tokio::test]
async fn test_known_rejection_fails_immediately() {
    let store = Store::new();
    let rejected = store.registry().rejected::<i32>(Rejection::msg("E"));
    let source = Atom::deferred(Eventual::Later(rejected));
    let shown = with_pending(&source);

    assert_eq!(store.get(&shown).unwrap_err().to_string(), "E");
}

#[tokio::test]
async fn test_with_pending_is_none_while_pending() {
    let store = Store::new();
    let (deferred, settler) = Deferred::channel();
    let source = Atom::deferred(Eventual::Later(deferred));
    let maybe = with_pending(&source);

    assert_eq!(store.get(&maybe).unwrap(), None);
    settler.resolve('x');
    flush().await;
    assert_eq!(store.get(&maybe).unwrap(), Some('x'));
}

#[tokio::test]
async fn test_fallback_can_read_other_atoms() {
    let store = Store::new();
    let placeholder = Atom::new("skeleton".to_string());
    let (deferred, _settler) = Deferred::channel();
    let source = Atom::deferred(Eventual::Later(deferred));

    let shown = {
        let placeholder = placeholder.clone();
        with_fallback(&source, move |ctx| {
            ctx.get.get(&placeholder).unwrap_or_default()
        })
    };

    assert_eq!(store.get(&shown).unwrap(), "skeleton");
}

#[test]
fn test_writes_are_forwarded_to_source() {
    let store = Store::new();
    let source = Atom::deferred(Eventual::Now(1));
    let maybe = with_pending(&source);

    store.set(&maybe, Eventual::Now(4)).unwrap();

    assert_eq!(store.get(&source).unwrap(), Eventual::Now(4));
    assert_eq!(store.get(&maybe).unwrap(), Some(4));
}
