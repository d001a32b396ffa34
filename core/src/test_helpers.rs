//! Test helpers
//!
//! Common utilities for driving spawned settlement tasks in tests

/// Let every task woken so far run to its next suspension point.
///
/// Tests run on the current-thread runtime, so yielding repeatedly is enough to
/// let watchers, handlers and retry loops react to a settlement.
pub async fn flush() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
