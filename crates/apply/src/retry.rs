//! Bounded retry with uniform jitter for one class of transient errors.

use std::time::Duration;

use converge_core::ConvergeConfig;
use rand::Rng;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `max_retries = 3` means at most 4 calls.
    pub max_retries: u32,
    /// Each sleep is drawn uniformly from `0..=max_backoff`.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { max_retries: 3, max_backoff: Duration::from_millis(5000) } }
}

impl RetryPolicy {
    pub fn from_config(cfg: &ConvergeConfig) -> Self {
        Self { max_retries: cfg.conflict_retries, max_backoff: cfg.conflict_backoff_max() }
    }

    pub fn no_backoff(max_retries: u32) -> Self { Self { max_retries, max_backoff: Duration::ZERO } }

    fn jitter(&self) -> Duration {
        let max = self.max_backoff.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

/// Run `operation` until it succeeds, fails with an error `retryable` rejects,
/// or the retry budget is spent. The last error is returned as-is.
pub async fn retry_while<F, Fut, T, E, C>(policy: &RetryPolicy, operation_name: &str, retryable: C, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut retries = 0u32;
    loop {
        match operation().await {
            Ok(v) => return Ok(v),
            Err(e) if retryable(&e) && retries < policy.max_retries => {
                retries += 1;
                let delay = policy.jitter();
                warn!(
                    operation = %operation_name,
                    retry = retries,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
