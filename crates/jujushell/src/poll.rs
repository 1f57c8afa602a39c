//! Bounded polling with a fixed interval.
//!
//! Used wherever the server has to wait for external state to settle: the
//! container address appearing on the bridge and the in-container terminal
//! service answering its status endpoint.

use std::future::Future;
use std::time::Duration;

/// One probe outcome.
pub enum Probe<T, E> {
    /// The awaited state has been reached.
    Ready(T),
    /// Not there yet; sleep and try again.
    NotReady,
    /// Give up immediately.
    Fatal(E),
}

/// Why a poll did not produce a value.
#[derive(Debug, PartialEq, Eq)]
pub enum PollError<E> {
    /// A probe failed in a non-retryable way.
    Fatal(E),
    /// All attempts were used up.
    TimedOut,
}

/// Run `probe` up to `attempts` times, sleeping `interval` between tries.
pub async fn poll<T, E, F, Fut>(
    interval: Duration,
    attempts: usize,
    mut probe: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Probe<T, E>>,
{
    for _ in 0..attempts {
        match probe().await {
            Probe::Ready(value) => return Ok(value),
            Probe::Fatal(err) => return Err(PollError::Fatal(err)),
            Probe::NotReady => tokio::time::sleep(interval).await,
        }
    }
    Err(PollError::TimedOut)
}
