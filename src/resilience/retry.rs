//! Bounded retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::logging::structured::LogContext;

use super::cancel::CancelToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_ms: 1_000,
            max_interval_ms: 30_000,
            multiplier: 2.0,
            max_jitter_ms: 1_000,
        }
    }
}

impl RetryConfig {
    pub fn with_attempts(&self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self.clone()
        }
    }

    /// Sleep before the next attempt, after `attempt` (1-based) has failed.
    pub fn backoff(&self, attempt: u32, jitter: Duration) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base_ms = self.initial_interval_ms as f64 * self.multiplier.powi(exponent);
        let max = Duration::from_millis(self.max_interval_ms);
        if !base_ms.is_finite() || base_ms >= max.as_millis() as f64 {
            return max;
        }
        (Duration::from_millis(base_ms as u64) + jitter).min(max)
    }

    fn jitter(&self) -> Duration {
        if self.max_jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=self.max_jitter_ms))
    }
}

/// Retry `op` on any failure except cancellation.
pub async fn retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancelToken,
    ctx: &LogContext,
    op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_when(config, cancel, ctx, |_| true, op).await
}

/// Retry `op` while `should_retry` accepts the error.
///
/// Errors rejected by the predicate are returned as-is. Exhausting the
/// attempts yields [`Error::Permanent`] wrapping the last error.
pub async fn retry_when<T, F, Fut, P>(
    config: &RetryConfig,
    cancel: &CancelToken,
    ctx: &LogContext,
    should_retry: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        attempt += 1;

        let err = match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    log::debug!("{} RETRY_SUCCEEDED attempt={}", ctx, attempt);
                }
                return Ok(value);
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => err,
        };

        if !should_retry(&err) {
            return Err(err);
        }

        if attempt >= max_attempts {
            log::warn!(
                "{} RETRY_EXHAUSTED attempts={} error={}",
                ctx,
                attempt,
                err
            );
            return Err(Error::Permanent {
                attempts: attempt,
                last: Box::new(err),
            });
        }

        let delay = config.backoff(attempt, config.jitter());
        log::debug!(
            "{} RETRY_SCHEDULED attempt={} delay_ms={} error={}",
            ctx,
            attempt,
            delay.as_millis(),
            err
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        }
    }
}
