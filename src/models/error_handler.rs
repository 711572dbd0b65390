use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{AdapterResult, Result};
use crate::models::circuit_breaker::CircuitBreaker;
use crate::models::rate_limiter::RateLimiter;
use crate::models::retry::Retryer;

/// Resilience pipeline for one provider:
/// rate limiter, then circuit breaker, then retry loop, then the call.
///
/// Admission happens first so a saturated caller is throttled without
/// counting against the provider's circuit.
#[derive(Debug, Clone)]
pub struct ErrorHandler {
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retryer: Retryer,
}

impl ErrorHandler {
    pub fn new(limiter: Arc<RateLimiter>, breaker: Arc<CircuitBreaker>, retryer: Retryer) -> Self {
        Self {
            limiter,
            breaker,
            retryer,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AdapterResult<T>>,
    {
        self.limiter.acquire(cancel).await?;
        debug!("Admitted call through '{}'", self.breaker.name());

        self.breaker
            .execute(|| self.retryer.execute(cancel, operation))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AdapterError, Error, ErrorKind};
    use crate::models::circuit_breaker::CircuitBreakerConfig;
    use crate::models::rate_limiter::RateLimiterConfig;
    use crate::models::retry::RetryConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn handler(max_retries: u32, max_failures: u32) -> ErrorHandler {
        ErrorHandler::new(
            Arc::new(RateLimiter::new("test", RateLimiterConfig::default())),
            Arc::new(CircuitBreaker::new(
                "test",
                CircuitBreakerConfig {
                    max_failures,
                    reset_timeout: Duration::from_secs(30),
                },
            )),
            Retryer::new(RetryConfig {
                max_retries,
                initial_delay: Duration::from_millis(100),
                ..RetryConfig::default()
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_resets_breaker() {
        let handler = handler(3, 5);
        let calls = AtomicU32::new(0);

        let result = handler
            .execute(&CancellationToken::new(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(AdapterError::from_status("test", 429, "slow down"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(handler.breaker().failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_call_counts_once_against_breaker() {
        let handler = handler(2, 5);

        let result: Result<()> = handler
            .execute(&CancellationToken::new(), || async {
                Err(AdapterError::from_status("test", 500, "boom"))
            })
            .await;

        assert!(matches!(result, Err(Error::RetriesExhausted { attempts: 3, .. })));
        assert_eq!(handler.breaker().failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_cancellation_never_reaches_breaker() {
        let handler = handler(0, 1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let result: Result<()> = handler
            .execute(&cancel, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(handler.breaker().is_closed());
        assert_eq!(handler.limiter().available(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_short_circuits() {
        let handler = handler(0, 1);
        let _: Result<()> = handler
            .execute(&CancellationToken::new(), || async {
                Err(AdapterError::from_status("test", 502, "bad gateway"))
            })
            .await;

        let calls = AtomicU32::new(0);
        let result: Result<()> = handler
            .execute(&CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), Some(ErrorKind::ServiceUnavailable));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
