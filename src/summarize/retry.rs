use crate::error::ProviderError;
use crate::summarize::config::RetryConfig;
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempted<T> {
    Done(T),
    Failed { error: ProviderError, attempts: usize },
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    base: u64,
    factor_ms: u64,
    min_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base: cfg.base.max(2),
            factor_ms: cfg.factor_ms.max(1),
            min_delay: Duration::from_millis(cfg.min_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let min_delay = self.min_delay;
        let max_delay = self.max_delay;
        ExponentialBackoff::from_millis(self.base)
            .factor(self.factor_ms)
            .max_delay(max_delay)
            .map(move |delay| delay.max(min_delay).min(max_delay))
            .take(self.max_attempts.saturating_sub(1))
    }

    /// Runs `operation` until it succeeds, fails with a non-transient error,
    /// or runs out of attempts. Cancellation is observed between attempts; a
    /// call already in flight is awaited.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut delays = self.delays();
        let mut attempts = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Attempted::Cancelled;
            }
            attempts += 1;
            let err = match operation().await {
                Ok(value) => return Attempted::Done(value),
                Err(err) => err,
            };
            if !err.is_transient() {
                debug!(attempts, error = %err, "provider call failed permanently");
                return Attempted::Failed { error: err, attempts };
            }
            let Some(delay) = delays.next() else {
                warn!(attempts, error = %err, "provider retries exhausted");
                return Attempted::Failed { error: err, attempts };
            };
            debug!(attempts, delay_ms = delay.as_millis() as u64, error = %err, "retrying provider call");
            tokio::select! {
                _ = cancel.cancelled() => return Attempted::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
