//! Retry policy with exponential backoff and jitter
//!
//! Only errors the classifier marks retryable are retried. The delay before
//! retry `n` (1-based) is `base × 2^(n-1)`, capped, plus uniform random
//! jitter.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::DownloadConfig;
use crate::error::Error;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

/// Terminal failure after the retry budget or a non-retryable error
#[derive(Debug)]
pub struct RetryFailure {
    pub error: Error,
    /// Retries performed before giving up
    pub retries: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            max_jitter: Duration::from_millis(config.retry_jitter_ms),
        }
    }

    /// Backoff before retry `retry` (1-based) without jitter
    pub fn base_backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Backoff before retry `retry` (1-based) including jitter
    pub fn backoff(&self, retry: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.base_backoff(retry) + jitter
    }

    /// Run `op` until it succeeds, fails fatally, or the budget is spent
    ///
    /// `op` receives the number of retries performed so far. Cancellation
    /// during a backoff ends the loop with [`Error::Cancelled`].
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut on_retry: impl FnMut(u32, &Error),
        mut op: F,
    ) -> std::result::Result<T, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let mut retries = 0u32;
        loop {
            let error = match op(retries).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() || retries >= self.max_retries {
                return Err(RetryFailure { error, retries });
            }

            retries += 1;
            let delay = self.backoff(retries);
            warn!(
                label,
                retry = retries,
                max = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Retryable failure: {}",
                error
            );
            on_retry(retries, &error);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryFailure {
                        error: Error::Cancelled(label.to_string()),
                        retries,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
