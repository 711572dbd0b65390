use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{AdapterError, AdapterResult};
use crate::models::provider::{StreamChunk, TokenUsage};

pub const STREAM_CHANNEL_CAPACITY: usize = 10;

pub type ChunkReceiver = mpsc::Receiver<AdapterResult<StreamChunk>>;

/// Adapter-side half of a stream. It is the only owner of the sender, so the
/// channel closes exactly when the producer is dropped.
#[derive(Debug)]
pub struct StreamProducer {
    tx: mpsc::Sender<AdapterResult<StreamChunk>>,
    cancel: CancellationToken,
    content: String,
    token_count: u32,
}

impl StreamProducer {
    pub fn channel(cancel: CancellationToken) -> (Self, ChunkReceiver) {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let producer = Self {
            tx,
            cancel,
            content: String::new(),
            token_count: 0,
        };
        (producer, rx)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn token_count(&self) -> u32 {
        self.token_count
    }

    /// Emit one increment. Returns `false` once the caller has cancelled or
    /// the consumer has gone away; the producer should stop reading upstream.
    pub async fn push_delta(&mut self, delta: &str) -> bool {
        if delta.is_empty() {
            return !self.is_cancelled();
        }

        self.content.push_str(delta);
        self.token_count += 1;

        let chunk = StreamChunk {
            delta: delta.to_string(),
            content: self.content.clone(),
            token_count: self.token_count,
            is_complete: false,
            finish_reason: None,
            usage: None,
        };
        self.send(Ok(chunk)).await
    }

    /// Emit the single terminal chunk and close the stream.
    pub async fn complete(mut self, finish_reason: Option<String>, usage: Option<TokenUsage>) {
        if let Some(usage) = usage {
            if usage.completion_tokens > 0 {
                self.token_count = usage.completion_tokens;
            }
        }

        let chunk = StreamChunk {
            delta: String::new(),
            content: self.content.clone(),
            token_count: self.token_count,
            is_complete: true,
            finish_reason: Some(finish_reason.unwrap_or_else(|| "stop".to_string())),
            usage,
        };
        self.send(Ok(chunk)).await;
    }

    /// Report an upstream failure and close the stream without completion.
    pub async fn fail(mut self, err: AdapterError) {
        debug!("Stream failed after {} chunks: {}", self.token_count, err);
        self.send(Err(err)).await;
    }

    async fn send(&mut self, item: AdapterResult<StreamChunk>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }
}
