//! Deadline-bounded polling helpers

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::{Error, Result};

/// Result type for polling check functions.
///
/// - `Ok(Some(value))` - Condition met, return the value
/// - `Ok(None)` - Condition not met yet, keep polling
/// - `Err(e)` - retryable errors keep polling, anything else stops immediately
pub type PollResult<T> = Result<Option<T>>;

/// Poll `check_fn` every `interval` until it yields a value or `timeout`
/// elapses.
///
/// The first check runs immediately. A timeout is only reported once the full
/// deadline has passed, and carries `resource` and `condition` so the caller
/// does not have to rebuild the message.
pub async fn wait_with_timeout<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    resource: &str,
    condition: &str,
    mut check_fn: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult<T>>,
{
    let start = Instant::now();

    loop {
        match check_fn().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => trace!(resource, condition, "condition not yet met"),
            Err(e) if e.is_retryable() => {
                trace!(resource, error = %e, "poll check failed, retrying")
            }
            Err(e) => return Err(e),
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(Error::timeout(resource, condition, elapsed));
        }
        tokio::time::sleep(interval.min(timeout - elapsed)).await;
    }
}

/// Poll until `check_fn` returns `Ok(true)`.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    interval: Duration,
    resource: &str,
    condition: &str,
    mut check_fn: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    wait_with_timeout(timeout, interval, resource, condition, || {
        let fut = check_fn();
        async move { fut.await.map(|met| met.then_some(())) }
    })
    .await
}
