//! Race an operation against an independent timer
//!
//! Both sides start together and the first to resolve wins. When the timer
//! wins, the operation's future is dropped on the spot, so a late result can
//! never be observed. The caller decides what to do with whatever state the
//! dropped operation was using; the worker discards the session.

use std::future::Future;
use std::time::Duration;

/// Outcome of [`race_with_timeout`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Raced<T> {
    /// The operation resolved first
    Finished(T),
    /// The timer fired first
    TimedOut,
}

/// Run `operation`, giving up after `limit`
pub async fn race_with_timeout<F>(limit: Duration, operation: F) -> Raced<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        output = operation => Raced::Finished(output),
        () = tokio::time::sleep(limit) => Raced::TimedOut,
    }
}
