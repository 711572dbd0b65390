use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{AdapterError, Error, Result};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub max_failures: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Per-provider circuit breaker. State, counter, failure instant and the
/// half-open trial slot all live under one mutex.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            "Creating circuit breaker '{}' with threshold {} and timeout {:?}",
            name, config.max_failures, config.reset_timeout
        );

        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` if the circuit admits it. Rejections never invoke it.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.admit()?;
        let result = operation().await;

        match &result {
            Ok(_) => {
                self.on_success();
                admission.settle();
            }
            // Dropping the admission hands a trial slot back.
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                self.on_failure(err);
                admission.settle();
            }
        }

        result
    }

    fn admit(&self) -> Result<Admission<'_>> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                debug!("Circuit breaker '{}' is closed, allowing call", self.name);
                Ok(Admission::new(self, false))
            }
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.reset_timeout);
                if elapsed < self.config.reset_timeout {
                    debug!("Circuit breaker '{}' is open, rejecting call", self.name);
                    return Err(self.rejection("circuit breaker is open"));
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                info!("Circuit breaker '{}' transitioning to half-open", self.name);
                Ok(Admission::new(self, true))
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    debug!("Circuit breaker '{}' trial in flight, rejecting call", self.name);
                    return Err(self.rejection("circuit breaker is half-open, trial call in flight"));
                }
                inner.trial_in_flight = true;
                debug!("Circuit breaker '{}' is half-open, allowing single trial call", self.name);
                Ok(Admission::new(self, true))
            }
        }
    }

    fn rejection(&self, message: &str) -> Error {
        AdapterError::service_unavailable(&self.name, message)
            .with_code("CIRCUIT_OPEN")
            .retryable(false)
            .into()
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        let previous = inner.failures;
        inner.failures = 0;
        inner.trial_in_flight = false;

        match inner.state {
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.state = CircuitState::Closed;
                info!("Circuit breaker '{}' recovered, transitioning to closed", self.name);
            }
            CircuitState::Closed => {
                if previous > 0 {
                    debug!("Circuit breaker '{}' reset failure count from {}", self.name, previous);
                }
            }
        }
    }

    fn on_failure(&self, err: &Error) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        inner.last_failure = Some(Instant::now());
        inner.trial_in_flight = false;
        debug!(
            "Circuit breaker '{}' failure count: {}/{} ({})",
            self.name, inner.failures, self.config.max_failures, err
        );

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                warn!("Circuit breaker '{}' re-opened during half-open trial", self.name);
            }
            CircuitState::Closed if inner.failures >= self.config.max_failures => {
                inner.state = CircuitState::Open;
                warn!(
                    "Circuit breaker '{}' opened due to {} consecutive failures",
                    self.name, inner.failures
                );
            }
            _ => {}
        }
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.trial_in_flight {
            inner.trial_in_flight = false;
            debug!("Circuit breaker '{}' released abandoned trial slot", self.name);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failures
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
        info!("Circuit breaker '{}' manually closed and reset", self.name);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failures,
            max_failures: self.config.max_failures,
            reset_timeout: self.config.reset_timeout,
            since_last_failure: inner.last_failure.map(|at| at.elapsed()),
        }
    }
}

/// Releases a half-open trial slot if the admitted call never settled,
/// which happens when the caller drops the future or cancels.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Admission<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.release_trial();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub max_failures: u32,
    pub reset_timeout: Duration,
    pub since_last_failure: Option<Duration>,
}
