use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AdapterError, AdapterResult, Result};
use crate::generation::pipeline::{relay_stream, ChunkSink, RelayOutcome, StreamContext};
use crate::models::manager::AdapterManager;
use crate::models::provider::{GenerationRequest, GenerationResponse, ProviderAdapter};
use crate::models::streaming::ChunkReceiver;
use crate::quota::{MeterRecord, QuotaMeter};

/// Caller identity for one generation call.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub user_id: String,
    pub request_id: String,
}

impl CallContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// Caller-facing generation contract on top of the adapter manager.
#[derive(Clone)]
pub struct GenerationService {
    manager: Arc<AdapterManager>,
    meter: QuotaMeter,
}

impl GenerationService {
    pub fn new(manager: Arc<AdapterManager>, meter: QuotaMeter) -> Self {
        Self { manager, meter }
    }

    pub fn manager(&self) -> &Arc<AdapterManager> {
        &self.manager
    }

    /// Explicit provider, then model match, then the default provider.
    pub fn resolve_adapter(&self, request: &GenerationRequest) -> AdapterResult<Arc<dyn ProviderAdapter>> {
        if let Some(provider) = request.provider.as_deref().filter(|p| !p.is_empty()) {
            return self.manager.get_adapter(provider);
        }

        match self.manager.get_adapter_by_model(&request.model) {
            Ok(adapter) => Ok(adapter),
            Err(e) => {
                debug!("{}; falling back to default provider", e.message);
                self.manager.get_adapter("")
            }
        }
    }

    pub async fn generate_text(
        &self,
        context: &CallContext,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse> {
        request.check(request_label(request))?;
        let adapter = self.resolve_adapter(request)?;
        let handler = self.manager.error_handler(adapter.name());

        info!(
            "Generating text with '{}' model '{}' (request '{}')",
            adapter.name(),
            request.model,
            context.request_id
        );

        let adapter_ref = adapter.as_ref();
        let response = handler
            .execute(cancel, || adapter_ref.generate_text(request))
            .await?;

        self.meter.record(MeterRecord::chat(
            context.user_id.clone(),
            u64::from(response.usage.total_tokens),
            response.model.clone(),
            context.request_id.clone(),
        ));

        Ok(response)
    }

    /// Open a stream. The handshake runs through the resilience pipeline so
    /// a throttled or failing upstream is retried before any chunk is sent.
    pub async fn generate_text_stream(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkReceiver> {
        request.check(request_label(request))?;
        let adapter = self.resolve_adapter(request)?;

        if !adapter.supports_streaming() {
            return Err(AdapterError::not_implemented(
                adapter.name(),
                format!("Provider '{}' does not support streaming", adapter.name()),
            )
            .with_code("STREAMING_UNSUPPORTED")
            .into());
        }

        let handler = self.manager.error_handler(adapter.name());
        info!("Opening stream with '{}' model '{}'", adapter.name(), request.model);

        let adapter_ref = adapter.as_ref();
        let receiver = handler
            .execute(cancel, || adapter_ref.generate_text_stream(request, cancel.clone()))
            .await?;
        Ok(receiver)
    }

    /// Stream into `sink` and meter the result once it completes.
    pub async fn stream_to_sink<S>(
        &self,
        context: &CallContext,
        request: &GenerationRequest,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<RelayOutcome>
    where
        S: ChunkSink + ?Sized,
    {
        let stream_cancel = cancel.child_token();
        let chunks = self.generate_text_stream(request, &stream_cancel).await?;

        let stream_context = StreamContext {
            user_id: context.user_id.clone(),
            model: request.model.clone(),
            request_id: context.request_id.clone(),
        };

        let result = relay_stream(chunks, sink, &stream_cancel, &self.meter, &stream_context).await;
        if result.is_err() {
            stream_cancel.cancel();
        }
        result
    }

    pub async fn health_check(&self) -> HashMap<String, AdapterResult<()>> {
        self.manager.health_check().await
    }

    /// Models per enabled provider.
    pub fn supported_models(&self) -> HashMap<String, Vec<String>> {
        self.manager
            .providers()
            .into_iter()
            .filter(|p| p.enabled)
            .map(|p| (p.name, p.models))
            .collect()
    }
}

fn request_label(request: &GenerationRequest) -> &str {
    request.provider.as_deref().unwrap_or("generation")
}
