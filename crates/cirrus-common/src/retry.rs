//! Retry utilities with exponential backoff and jitter
//!
//! Two consumers: conditional writes that lose a version race retry the
//! read-modify-write cycle, and the controller computes requeue delays for
//! consecutive yields with [`backoff_delay`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::Error;

/// Backoff parameters shared by conflict retries and yield requeues
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Spread each delay by 0.5x to 1.5x
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Config for yield requeues: no attempt cap, bounded delay
    pub fn for_yield(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: 0,
            initial_delay,
            max_delay,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

/// Delay before retry number `attempt` (0-based)
///
/// Grows geometrically from `initial_delay` and is capped at `max_delay`.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.min(32) as i32;
    let raw = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(exponent);
    let capped = raw.min(config.max_delay.as_secs_f64());

    let secs = if config.jitter {
        capped * rand::thread_rng().gen_range(0.5..1.5)
    } else {
        capped
    };
    Duration::from_secs_f64(secs)
}

/// Retry an async operation while it fails with a version conflict
///
/// Any other error, including `Yield`, returns immediately. The operation is
/// expected to re-read its input on every attempt.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_conflict() => {
                attempt += 1;
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "conflict persisted after max retries"
                    );
                    return Err(e);
                }

                let delay = backoff_delay(config, attempt - 1);
                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "version conflict, re-reading"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
