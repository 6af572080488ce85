//! Bounded escalating backoff for transient chain and network queries
//!
//! Transient failures (RPC hiccups, timeouts) are retried with an
//! exponentially growing, capped delay. Errors that are not retryable
//! per [`ClientError::is_retryable`] abort immediately.

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomize each delay by up to +25% to avoid thundering herds
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
            jitter: true,
        }
    }
}

impl From<&ClientConfig> for BackoffConfig {
    fn from(cfg: &ClientConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.retry_delay_ms),
            max_delay: Duration::from_millis(cfg.retry_delay_max_ms),
            jitter: true,
        }
    }
}

/// Run `op` until it succeeds, the error stops being retryable, or the
/// retry budget is exhausted.
pub async fn retry<F, Fut, T>(
    operation: &str,
    config: &BackoffConfig,
    mut op: F,
) -> ClientResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClientResult<T>>,
{
    let mut delay = config.base_delay;

    for attempt in 0..=config.max_retries {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let sleep_for = apply_jitter(delay, config.jitter);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation,
                    attempt + 1,
                    config.max_retries,
                    sleep_for,
                    e
                );
                tokio::time::sleep(sleep_for).await;
                delay = std::cmp::min(delay * 2, config.max_delay);
            }
            Err(e) => return Err(e),
        }
    }

    Err(ClientError::Timeout {
        operation: operation.to_string(),
    })
}

fn apply_jitter(delay: Duration, jitter: bool) -> Duration {
    if !jitter {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0.0..0.25);
    delay.mul_f64(1.0 + extra)
}
