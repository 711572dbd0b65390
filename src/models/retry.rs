use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AdapterError, AdapterResult, Error, Result};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// Upper bound of the random extra wait, as a fraction of the delay.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

/// Bounded exponential backoff around a provider call.
#[derive(Debug, Clone)]
pub struct Retryer {
    config: RetryConfig,
}

impl Retryer {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry `attempt` (0-based), without jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.config.backoff_factor.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let delay = self.config.initial_delay.as_secs_f64() * factor;
        let capped = delay.min(self.config.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.config.jitter);
        delay + delay.mul_f64(extra)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempts run out. Both the call and the wait race `cancel`.
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AdapterResult<T>>,
    {
        let attempts = self.config.max_retries + 1;
        let mut last_error: Option<AdapterError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.jittered(self.backoff_delay(attempt - 1));
                debug!("Retrying in {:?} (attempt {}/{})", delay, attempt + 1, attempts);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = operation() => result,
            };

            match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("Call succeeded after {} attempts", attempt + 1);
                    }
                    return Ok(value);
                }
                Err(err) if !err.should_retry() => {
                    debug!("Not retrying {} error from '{}'", err.kind, err.provider);
                    return Err(err.into());
                }
                Err(err) => {
                    warn!(
                        "Attempt {}/{} to '{}' failed: {}",
                        attempt + 1,
                        attempts,
                        err.provider,
                        err
                    );
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(source) => Err(Error::RetriesExhausted { attempts, source }),
            None => Err(Error::unknown("retry loop finished without an attempt")),
        }
    }
}

impl Default for Retryer {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
