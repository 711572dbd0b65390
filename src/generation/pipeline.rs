use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AdapterError, Error, ErrorKind, Result};
use crate::models::provider::{StreamChunk, TokenUsage};
use crate::models::streaming::ChunkReceiver;
use crate::quota::{MeterRecord, QuotaMeter};

/// Transport that stream chunks are forwarded to.
#[async_trait]
pub trait ChunkSink: Send {
    async fn send_chunk(&mut self, chunk: &StreamChunk) -> Result<()>;

    /// Best effort; the relay ignores failures here.
    async fn send_error(&mut self, _error: &AdapterError) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ChunkSink for mpsc::Sender<StreamChunk> {
    async fn send_chunk(&mut self, chunk: &StreamChunk) -> Result<()> {
        self.send(chunk.clone())
            .await
            .map_err(|_| Error::unknown("stream consumer disconnected"))
    }
}

#[derive(Serialize)]
struct ErrorFrame<'a> {
    provider: &'a str,
    kind: ErrorKind,
    code: &'a str,
    message: &'a str,
}

/// Server-sent-event framing: `message` per increment, `done` for the
/// completion chunk, `error` when the upstream fails.
#[derive(Debug)]
pub struct SseSink<W> {
    writer: W,
}

impl<W> SseSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    async fn write_event(&mut self, event: &str, data: &str) -> Result<()> {
        let frame = format!("event: {}\ndata: {}\n\n", event, data);
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W> ChunkSink for SseSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_chunk(&mut self, chunk: &StreamChunk) -> Result<()> {
        let event = if chunk.is_complete { "done" } else { "message" };
        let data = serde_json::to_string(chunk)?;
        self.write_event(event, &data).await
    }

    async fn send_error(&mut self, error: &AdapterError) -> Result<()> {
        let data = serde_json::to_string(&ErrorFrame {
            provider: &error.provider,
            kind: error.kind,
            code: &error.code,
            message: &error.message,
        })?;
        self.write_event("error", &data).await
    }
}

/// Who a stream is billed to.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub user_id: String,
    pub model: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayOutcome {
    pub content: String,
    pub token_count: u32,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl RelayOutcome {
    /// Tokens billed for the stream: reported usage when present.
    pub fn billable_tokens(&self) -> u32 {
        self.usage.map(|u| u.total_tokens).unwrap_or(self.token_count)
    }
}

/// Forward a stream to `sink` until its completion chunk, then meter it once.
///
/// Any other ending (caller cancellation, sink failure, upstream error, or the
/// channel closing early) returns an error and records nothing. Returning
/// drops `chunks`, which stops the producer.
pub async fn relay_stream<S>(
    mut chunks: ChunkReceiver,
    sink: &mut S,
    cancel: &CancellationToken,
    meter: &QuotaMeter,
    context: &StreamContext,
) -> Result<RelayOutcome>
where
    S: ChunkSink + ?Sized,
{
    let mut outcome = RelayOutcome::default();

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Stream '{}' cancelled by caller", context.request_id);
                return Err(Error::Cancelled);
            }
            item = chunks.recv() => item,
        };

        let chunk = match item {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                warn!("Stream '{}' failed: {}", context.request_id, err);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    sent = sink.send_error(&err) => {
                        if let Err(e) = sent {
                            debug!("Could not forward stream error: {}", e);
                        }
                    }
                }
                return Err(err.into());
            }
            None => {
                // A cancelled producer closes without a completion chunk.
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                warn!("Stream '{}' closed before completion", context.request_id);
                return Err(AdapterError::invalid_response(
                    "stream",
                    "Stream closed before completion",
                )
                .with_code("STREAM_INCOMPLETE")
                .into());
            }
        };

        // A stalled consumer must not outlive the caller.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Stream '{}' cancelled while forwarding", context.request_id);
                return Err(Error::Cancelled);
            }
            sent = sink.send_chunk(&chunk) => sent?,
        }

        outcome.content.push_str(&chunk.delta);
        outcome.token_count = chunk.token_count;

        if chunk.is_complete {
            outcome.content = chunk.content;
            outcome.finish_reason = chunk.finish_reason;
            outcome.usage = chunk.usage;

            meter.record(MeterRecord::chat(
                context.user_id.clone(),
                u64::from(outcome.billable_tokens()),
                context.model.clone(),
                context.request_id.clone(),
            ));
            debug!(
                "Stream '{}' complete with {} tokens",
                context.request_id, outcome.token_count
            );
            return Ok(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::streaming::StreamProducer;
    use crate::quota::InMemoryQuotaLedger;
    use std::sync::Arc;
    use std::time::Duration;

    fn context() -> StreamContext {
        StreamContext {
            user_id: "u1".to_string(),
            model: "gpt-4".to_string(),
            request_id: "req-1".to_string(),
        }
    }

    fn meter() -> (Arc<InMemoryQuotaLedger>, QuotaMeter) {
        let ledger = Arc::new(InMemoryQuotaLedger::new());
        (ledger.clone(), QuotaMeter::new(ledger, true))
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_relay_forwards_and_meters_once() {
        let cancel = CancellationToken::new();
        let (mut producer, rx) = StreamProducer::channel(cancel.clone());
        tokio::spawn(async move {
            for word in ["Once ", "upon ", "a time"] {
                producer.push_delta(word).await;
            }
            producer.complete(Some("stop".to_string()), None).await;
        });

        let (ledger, meter) = meter();
        let (tx, mut forwarded) = mpsc::channel::<StreamChunk>(16);
        let mut sink = tx;
        let outcome = relay_stream(rx, &mut sink, &cancel, &meter, &context()).await.unwrap();
        settle().await;

        assert_eq!(outcome.content, "Once upon a time");
        assert_eq!(outcome.token_count, 3);

        let mut chunks = Vec::new();
        while let Ok(chunk) = forwarded.try_recv() {
            chunks.push(chunk);
        }
        let joined: String = chunks.iter().map(|c| c.delta.as_str()).collect();
        assert_eq!(joined, "Once upon a time");
        assert_eq!(chunks.iter().filter(|c| c.is_complete).count(), 1);
        assert!(chunks.last().unwrap().is_complete);

        assert_eq!(ledger.consumed("u1"), 3);
        assert_eq!(ledger.entries()[0].record.request_id, "req-1");
    }

    #[tokio::test]
    async fn test_reported_usage_is_billed() {
        let cancel = CancellationToken::new();
        let (mut producer, rx) = StreamProducer::channel(cancel.clone());
        tokio::spawn(async move {
            producer.push_delta("hi").await;
            producer.complete(None, Some(TokenUsage::new(7, 2))).await;
        });

        let (ledger, meter) = meter();
        let (mut sink, _rx) = mpsc::channel::<StreamChunk>(16);
        let outcome = relay_stream(rx, &mut sink, &cancel, &meter, &context()).await.unwrap();
        settle().await;

        assert_eq!(outcome.billable_tokens(), 9);
        assert_eq!(ledger.consumed("u1"), 9);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_skips_quota() {
        let cancel = CancellationToken::new();
        let (mut producer, rx) = StreamProducer::channel(cancel.clone());
        let producer_task = tokio::spawn(async move {
            producer.push_delta("partial").await;
            producer.cancellation().cancelled().await;
            let more = producer.push_delta("ignored").await;
            assert!(!more);
        });

        let (ledger, meter) = meter();
        let (mut sink, mut forwarded) = mpsc::channel::<StreamChunk>(16);
        let relay_cancel = cancel.clone();
        let relay = tokio::spawn(async move {
            relay_stream(rx, &mut sink, &relay_cancel, &meter, &context()).await
        });

        let first = forwarded.recv().await.unwrap();
        assert_eq!(first.delta, "partial");
        cancel.cancel();

        let result = relay.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        producer_task.await.unwrap();
        settle().await;

        assert!(forwarded.recv().await.is_none());
        assert!(ledger.entries().is_empty());
    }

    #[tokio::test]
    async fn test_upstream_error_is_forwarded_without_quota() {
        let cancel = CancellationToken::new();
        let (mut producer, rx) = StreamProducer::channel(cancel.clone());
        tokio::spawn(async move {
            producer.push_delta("a").await;
            producer
                .fail(AdapterError::service_unavailable("openai", "overloaded"))
                .await;
        });

        let (ledger, meter) = meter();
        let mut sink = SseSink::new(Vec::new());
        let result = relay_stream(rx, &mut sink, &cancel, &meter, &context()).await;
        settle().await;

        assert_eq!(result.unwrap_err().kind(), Some(ErrorKind::ServiceUnavailable));
        let written = String::from_utf8(sink.into_inner()).unwrap();
        assert!(written.starts_with("event: message\ndata: "));
        assert!(written.contains("event: error\ndata: "));
        assert!(!written.contains("event: done"));
        assert!(ledger.entries().is_empty());
    }

    #[tokio::test]
    async fn test_early_close_is_incomplete() {
        let cancel = CancellationToken::new();
        let (mut producer, rx) = StreamProducer::channel(cancel.clone());
        tokio::spawn(async move {
            producer.push_delta("a").await;
            drop(producer);
        });

        let (ledger, meter) = meter();
        let (mut sink, _rx) = mpsc::channel::<StreamChunk>(16);
        let err = relay_stream(rx, &mut sink, &cancel, &meter, &context()).await.unwrap_err();
        assert_eq!(err.adapter_error().map(|e| e.code.as_str()), Some("STREAM_INCOMPLETE"));
        assert!(ledger.entries().is_empty());
    }

    #[tokio::test]
    async fn test_sse_sink_frames() {
        let mut sink = SseSink::new(Vec::new());
        sink.send_chunk(&StreamChunk {
            delta: "Hi".to_string(),
            content: "Hi".to_string(),
            token_count: 1,
            ..StreamChunk::default()
        })
        .await
        .unwrap();
        sink.send_chunk(&StreamChunk {
            content: "Hi".to_string(),
            token_count: 1,
            is_complete: true,
            finish_reason: Some("stop".to_string()),
            ..StreamChunk::default()
        })
        .await
        .unwrap();

        let written = String::from_utf8(sink.into_inner()).unwrap();
        let frames: Vec<&str> = written.split("\n\n").filter(|f| !f.is_empty()).collect();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].starts_with("event: message\n"));
        assert!(frames[1].starts_with("event: done\n"));
        assert!(frames[1].contains("\"finish_reason\":\"stop\""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_stops_relay() {
        let cancel = CancellationToken::new();
        let (mut producer, rx) = StreamProducer::channel(cancel.clone());
        let producer_task = tokio::spawn(async move {
            loop {
                if !producer.push_delta("x").await {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let (ledger, meter) = meter();
        let (mut sink, forwarded) = mpsc::channel::<StreamChunk>(1);
        drop(forwarded);
        let result = relay_stream(rx, &mut sink, &cancel, &meter, &context()).await;
        assert!(result.is_err());

        producer_task.await.unwrap();
        assert!(ledger.entries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_sink_is_blocked() {
        let cancel = CancellationToken::new();
        let (mut producer, rx) = StreamProducer::channel(cancel.clone());
        tokio::spawn(async move {
            for _ in 0..5 {
                producer.push_delta("x").await;
            }
        });

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let (ledger, meter) = meter();
        let (mut sink, _undrained) = mpsc::channel::<StreamChunk>(1);
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            relay_stream(rx, &mut sink, &cancel, &meter, &context()),
        )
        .await
        .expect("relay should unwind after cancellation");

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(ledger.entries().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_error_frame_is_blocked() {
        struct StalledSink;

        #[async_trait]
        impl ChunkSink for StalledSink {
            async fn send_chunk(&mut self, _chunk: &StreamChunk) -> Result<()> {
                Ok(())
            }

            async fn send_error(&mut self, _error: &AdapterError) -> Result<()> {
                std::future::pending().await
            }
        }

        let cancel = CancellationToken::new();
        let (mut producer, rx) = StreamProducer::channel(cancel.clone());
        tokio::spawn(async move {
            producer
                .fail(AdapterError::service_unavailable("openai", "overloaded"))
                .await;
        });

        let (ledger, meter) = meter();
        let relay_cancel = cancel.clone();
        let relay = tokio::spawn(async move {
            let mut sink = StalledSink;
            relay_stream(rx, &mut sink, &relay_cancel, &meter, &context()).await
        });
        settle().await;
        cancel.cancel();

        let result = relay.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(ledger.entries().is_empty());
    }
}
