//! Bounded retry with exponential backoff and jitter.
//!
//! Used where a remote endpoint is expected to come up shortly, such as the
//! socat listeners a freshly booted VM starts from its first-boot script.
//! Every configuration is bounded; there is no retry-forever mode.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// How often, and how patiently, to retry
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Attempts in total, the first included
    pub max_attempts: u32,
    /// Sleep after the first failure
    pub initial_delay: Duration,
    /// Cap on any single sleep
    pub max_delay: Duration,
    /// Growth factor applied to the delay after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(20),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default backoff, giving up after `n` attempts (at least one)
    pub fn attempts(n: u32) -> Self {
        Self {
            max_attempts: n.max(1),
            ..Self::default()
        }
    }

    /// Settings for probing a listener on a VM that is still booting.
    ///
    /// Allows roughly ten minutes for cloud-init to install and start the
    /// listeners.
    pub fn listener_probe() -> Self {
        Self {
            max_attempts: 70,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 1.5,
        }
    }

    /// Settings for waiting on the bootstrap VM's first-boot installs, which
    /// download docker and the engine tools; roughly thirty minutes.
    pub fn prerequisites_wait() -> Self {
        Self {
            max_attempts: 125,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(15),
            backoff_multiplier: 1.5,
        }
    }

    /// Un-jittered sleeps between attempts; one fewer than `max_attempts`
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        let ceiling = self.max_delay.as_secs_f64();
        std::iter::successors(Some(self.initial_delay.as_secs_f64()), move |secs| {
            Some((secs * self.backoff_multiplier).min(ceiling))
        })
        .map(Duration::from_secs_f64)
        .take(self.max_attempts.saturating_sub(1) as usize)
    }

    /// Total sleep across every attempt, ignoring jitter
    pub fn nominal_budget(&self) -> Duration {
        self.schedule().sum()
    }
}

/// Scale `delay` by a random factor in [0.5, 1.5)
fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

/// Run `operation` until it succeeds or `config.max_attempts` is used up.
///
/// Sleeps follow [`RetryConfig::schedule`] with jitter. The last error is
/// returned unchanged.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    what: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut schedule = config.schedule();
    let mut attempt = 1u32;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let Some(delay) = schedule.next() else {
            error!(what, attempts = attempt, error = %err, "giving up");
            return Err(err);
        };
        let delay = jittered(delay);
        warn!(what, attempt, error = %err, delay_ms = delay.as_millis() as u64, "attempt failed");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
