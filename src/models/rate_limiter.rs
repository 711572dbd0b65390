use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::error::{AdapterError, Error, Result};

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub capacity: usize,
    pub refill_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_interval: Duration::from_millis(100),
        }
    }
}

/// Token bucket backed by a bounded channel. The channel holds the tokens,
/// so its capacity is the bucket size and it is safe for any number of
/// concurrent acquirers.
///
/// Must be created inside a Tokio runtime: the refill task starts immediately.
pub struct RateLimiter {
    name: String,
    tokens: Mutex<mpsc::Receiver<()>>,
    refill_tx: mpsc::Sender<()>,
    shutdown: CancellationToken,
    refill_task: SyncMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        let name = name.into();
        let capacity = config.capacity.max(1);
        let refill_interval = config.refill_interval.max(Duration::from_millis(1));

        let (tx, rx) = mpsc::channel(capacity);
        for _ in 0..capacity {
            let _ = tx.try_send(());
        }

        let shutdown = CancellationToken::new();
        let refill_task = tokio::spawn(refill_loop(
            name.clone(),
            tx.clone(),
            refill_interval,
            shutdown.clone(),
        ));

        info!(
            "Created rate limiter '{}' with capacity {} refilling every {:?}",
            name, capacity, refill_interval
        );

        Self {
            name,
            tokens: Mutex::new(rx),
            refill_tx: tx,
            shutdown,
            refill_task: SyncMutex::new(Some(refill_task)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for a token. A cancelled wait consumes nothing.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let mut tokens = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            guard = self.tokens.lock() => guard,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Rate limiter '{}' acquire cancelled", self.name);
                Err(Error::Cancelled)
            }
            token = tokens.recv() => match token {
                Some(()) => {
                    trace!("Rate limiter '{}' granted token, {} left", self.name, self.available());
                    Ok(())
                }
                None => Err(self.closed_error()),
            },
        }
    }

    /// Take a token if one is immediately available.
    pub fn try_acquire(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.tokens.try_lock() {
            Ok(mut tokens) => tokens.try_recv().is_ok(),
            Err(_) => false,
        }
    }

    pub fn available(&self) -> usize {
        self.refill_tx.max_capacity() - self.refill_tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.refill_tx.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the refill task. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        if let Some(task) = self.refill_task.lock().take() {
            task.abort();
        }
        info!("Rate limiter '{}' closed", self.name);
    }

    fn closed_error(&self) -> Error {
        AdapterError::service_unavailable(&self.name, "rate limiter is closed")
            .with_code("RATE_LIMITER_CLOSED")
            .into()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("available", &self.available())
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn refill_loop(
    name: String,
    tx: mpsc::Sender<()>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                // Full bucket drops the token.
                let _ = tx.try_send(());
            }
        }
    }
    debug!("Rate limiter '{}' refill task stopped", name);
}
