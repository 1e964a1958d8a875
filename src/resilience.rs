/// Resilience Module
///
/// Deadline and retry policy shared by the network-facing paths. Two
/// operations need it: DHT announcements, which must survive churn with
/// backoff capped at 60 seconds, and request/response exchanges (chunk
/// transport, DHT RPCs), where an elapsed deadline has to surface as that
/// protocol's own timeout kind rather than a generic error.
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, error};

use crate::error::{MeshError, MeshResult};

/// Backoff policy for retried operations: the delay doubles from
/// `initial_delay` after every failure, up to `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Profile for DHT announcements: patient, backoff capped at 60 seconds
    pub fn announcement() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }

    /// Delay to wait after `failed_attempts` consecutive failures
    pub fn delay_for(&self, failed_attempts: usize) -> Duration {
        let doubled = self
            .initial_delay
            .saturating_mul(1u32 << failed_attempts.min(16));
        doubled.min(self.max_delay)
    }
}

/// Run a fallible future under a deadline, substituting `timeout_error` when
/// the deadline elapses.
///
/// The error type stays the caller's own, so the chunk transport reports
/// `TransportError::Timeout`, the DHT reports `RpcTimeout`, and the shutdown
/// drain reports its policy error, all through one wrapper.
pub async fn with_timeout<F, T, E>(deadline: Duration, timeout_error: E, future: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match timeout(deadline, future).await {
        Ok(result) => result,
        Err(_) => Err(timeout_error),
    }
}

/// Re-run `operation` until it succeeds, is cancelled, or the attempt budget
/// is spent, backing off between attempts per `config`.
///
/// Used by the peer engine's announcement tasks; anything per-peer (a single
/// chunk fetch, a single RPC) retries by moving to the next candidate
/// instead, so it does not come through here.
pub async fn retry_async<F, Fut, T>(
    operation: F,
    config: RetryConfig,
    what: &str,
) -> MeshResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = MeshResult<T>>,
{
    let mut failed = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if failed > 0 {
                    debug!("{} succeeded after {} retries", what, failed);
                }
                return Ok(value);
            }
            // Cancellation is not transient; backing off would only delay it.
            Err(MeshError::Cancelled) => return Err(MeshError::Cancelled),
            Err(e) => {
                failed += 1;
                if failed >= config.max_attempts {
                    error!("{} failed {} times, giving up: {}", what, failed, e);
                    return Err(e);
                }
                let delay = config.delay_for(failed - 1);
                debug!(
                    "{} failed ({}), attempt {}/{} in {:?}",
                    what,
                    e,
                    failed + 1,
                    config.max_attempts,
                    delay
                );
                sleep(delay).await;
            }
        }
    }
}
