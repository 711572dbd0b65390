use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Service tag recorded for text generation.
pub const CHAT_SERVICE: &str = "chat";

/// External quota ledger. Only consumption is driven from this crate.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    async fn consume_quota(
        &self,
        user_id: &str,
        amount: u64,
        service: &str,
        model: &str,
        request_id: &str,
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterRecord {
    pub user_id: String,
    pub tokens: u64,
    pub service: String,
    pub model: String,
    pub request_id: String,
}

impl MeterRecord {
    pub fn chat(
        user_id: impl Into<String>,
        tokens: u64,
        model: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            tokens,
            service: CHAT_SERVICE.to_string(),
            model: model.into(),
            request_id: request_id.into(),
        }
    }
}

/// Fire-and-forget metering in front of a ledger.
#[derive(Clone)]
pub struct QuotaMeter {
    ledger: Arc<dyn QuotaLedger>,
    enabled: bool,
}

impl QuotaMeter {
    pub fn new(ledger: Arc<dyn QuotaLedger>, enabled: bool) -> Self {
        Self { ledger, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Spawn the ledger call and return immediately. Ledger failures are
    /// logged and never surface to the caller. Returns `None` when the
    /// record was skipped.
    pub fn record(&self, record: MeterRecord) -> Option<JoinHandle<()>> {
        if !self.enabled {
            debug!("Quota metering disabled, skipping request '{}'", record.request_id);
            return None;
        }
        if record.tokens == 0 {
            debug!("No tokens used by request '{}', skipping quota", record.request_id);
            return None;
        }

        let ledger = self.ledger.clone();
        Some(tokio::spawn(async move {
            let result = ledger
                .consume_quota(
                    &record.user_id,
                    record.tokens,
                    &record.service,
                    &record.model,
                    &record.request_id,
                )
                .await;

            match result {
                Ok(()) => debug!(
                    "Consumed {} tokens for user '{}' (request '{}')",
                    record.tokens, record.user_id, record.request_id
                ),
                Err(e) => error!(
                    user_id = %record.user_id,
                    tokens = record.tokens,
                    service = %record.service,
                    model = %record.model,
                    request_id = %record.request_id,
                    "Failed to consume quota: {}",
                    e
                ),
            }
        }))
    }
}

impl std::fmt::Debug for QuotaMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaMeter").field("enabled", &self.enabled).finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub record: MeterRecord,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LedgerState {
    limits: HashMap<String, u64>,
    consumed: HashMap<String, u64>,
    seen: HashSet<String>,
    entries: Vec<LedgerEntry>,
}

/// Process-local ledger. Consumption is idempotent per request id.
#[derive(Debug, Default)]
pub struct InMemoryQuotaLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryQuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap a user's total consumption.
    pub fn with_limit(self, user_id: impl Into<String>, limit: u64) -> Self {
        self.state.lock().limits.insert(user_id.into(), limit);
        self
    }

    pub fn consumed(&self, user_id: &str) -> u64 {
        self.state.lock().consumed.get(user_id).copied().unwrap_or(0)
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.state.lock().entries.clone()
    }
}

#[async_trait]
impl QuotaLedger for InMemoryQuotaLedger {
    async fn consume_quota(
        &self,
        user_id: &str,
        amount: u64,
        service: &str,
        model: &str,
        request_id: &str,
    ) -> Result<()> {
        let mut state = self.state.lock();

        if state.seen.contains(request_id) {
            debug!("Request '{}' already metered", request_id);
            return Ok(());
        }

        let used = state.consumed.get(user_id).copied().unwrap_or(0);
        if let Some(limit) = state.limits.get(user_id) {
            if used + amount > *limit {
                return Err(Error::quota(format!(
                    "user '{}' would exceed quota ({} + {} > {})",
                    user_id, used, amount, limit
                )));
            }
        }

        state.consumed.insert(user_id.to_string(), used + amount);
        state.seen.insert(request_id.to_string());
        state.entries.push(LedgerEntry {
            record: MeterRecord {
                user_id: user_id.to_string(),
                tokens: amount,
                service: service.to_string(),
                model: model.to_string(),
                request_id: request_id.to_string(),
            },
            recorded_at: Utc::now(),
        });
        Ok(())
    }
}
