use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{AdapterError, AdapterResult, ErrorKind};
use crate::models::client::{self, classify_status};
use crate::models::provider::{
    GenerationRequest, GenerationResponse, MessageRole, ProviderAdapter, ProviderConfig, TokenUsage,
};
use crate::models::sse::SseReader;
use crate::models::streaming::{ChunkReceiver, StreamProducer};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

const DEFAULT_MODELS: &[&str] = &[
    "claude-3-5-sonnet-20241022",
    "claude-3-5-haiku-20241022",
    "claude-3-opus-20240229",
    "claude-3-sonnet-20240229",
    "claude-3-haiku-20240307",
];

pub struct AnthropicAdapter {
    name: String,
    client: Client,
    api_key: String,
    base_url: String,
    models: Vec<String>,
}

impl AnthropicAdapter {
    pub fn new(config: &ProviderConfig) -> AdapterResult<Self> {
        let client = client::build_client(&config.name, config.timeout())?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        info!("Creating Anthropic adapter '{}' at {}", config.name, base_url);

        Ok(Self {
            name: config.name.clone(),
            client,
            api_key: config.credentials.api_key.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            models: config.models_or(DEFAULT_MODELS),
        })
    }

    /// System turns move into the top-level `system` field.
    fn build_request(&self, request: &GenerationRequest, stream: bool) -> AnthropicRequest {
        let (system, conversation) = request.split_system();
        let messages = conversation
            .into_iter()
            .map(|message| AnthropicMessage {
                role: match message.role {
                    MessageRole::Assistant => "assistant",
                    _ => "user",
                }
                .to_string(),
                content: message.content,
            })
            .collect();

        AnthropicRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system,
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: if request.stop.is_empty() {
                None
            } else {
                Some(request.stop.clone())
            },
            stream,
        }
    }

    async fn post(&self, body: &AnthropicRequest) -> AdapterResult<Response> {
        debug!(
            "Making Anthropic API request to '{}': model={}, stream={}",
            self.name, body.model, body.stream
        );

        let request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body);

        client::send(&self.name, request, |status, text| self.classify_error(status, text)).await
    }

    fn classify_error(&self, status: u16, body: &str) -> AdapterError {
        let mut err = match status {
            // Anthropic reports overload with a non-standard status.
            529 => AdapterError::from_status(&self.name, 503, body)
                .with_status(529)
                .with_code("HTTP_529"),
            _ => classify_status(&self.name, status, body),
        };

        if let Ok(envelope) = serde_json::from_str::<AnthropicErrorEnvelope>(body) {
            err.message = envelope.error.message;
            if let Some(error_type) = envelope.error.error_type {
                err.code = error_type;
            }
        }
        err
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_text(&self, request: &GenerationRequest) -> AdapterResult<GenerationResponse> {
        request.check(&self.name)?;
        let body = self.build_request(request, false);
        let response = self.post(&body).await?;
        let response: AnthropicResponse = client::read_json(&self.name, response).await?;

        let text: String = response
            .content
            .iter()
            .filter(|block| block.content_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        debug!("Received successful response from '{}': id={}", self.name, response.id);

        Ok(GenerationResponse::new(response.id, response.model, text)
            .with_usage(TokenUsage::new(response.usage.input_tokens, response.usage.output_tokens))
            .with_finish_reason(response.stop_reason.unwrap_or_else(|| "end_turn".to_string())))
    }

    async fn generate_text_stream(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> AdapterResult<ChunkReceiver> {
        request.check(&self.name)?;
        let body = self.build_request(request, true);
        let response = self.post(&body).await?;

        let (producer, rx) = StreamProducer::channel(cancel);
        let reader = SseReader::new(self.name.clone(), response);
        tokio::spawn(pump_stream(self.name.clone(), reader, producer));
        Ok(rx)
    }

    async fn health_check(&self) -> AdapterResult<()> {
        let model = self
            .models
            .iter()
            .find(|m| m.contains("haiku"))
            .or_else(|| self.models.first())
            .cloned()
            .unwrap_or_else(|| "claude-3-haiku-20240307".to_string());

        let probe = GenerationRequest::new(model).with_prompt("Hello").with_max_tokens(10);
        let body = self.build_request(&probe, false);
        self.post(&body).await.map(|_| ())
    }

    fn supported_models(&self) -> Vec<String> {
        self.models.clone()
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

async fn pump_stream(provider: String, mut reader: SseReader, mut producer: StreamProducer) {
    let cancel = producer.cancellation().clone();
    let mut input_tokens = 0;
    let mut output_tokens = 0;
    let mut stop_reason = None;

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Stream from '{}' cancelled by caller", provider);
                return;
            }
            event = reader.next_event() => event,
        };

        let event = match event {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(err) => return producer.fail(err).await,
        };

        let frame: StreamEvent = match serde_json::from_str(&event.data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Skipping unparseable event from '{}': {}", provider, e);
                continue;
            }
        };

        match frame {
            StreamEvent::MessageStart { message } => {
                input_tokens = message.usage.input_tokens;
                output_tokens = message.usage.output_tokens;
            }
            StreamEvent::ContentBlockDelta { delta } => {
                if let Some(text) = delta.text {
                    if !producer.push_delta(&text).await {
                        return;
                    }
                }
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    stop_reason = Some(reason);
                }
                if let Some(usage) = usage {
                    output_tokens = usage.output_tokens;
                }
            }
            StreamEvent::MessageStop => {
                let usage = TokenUsage::new(input_tokens, output_tokens);
                return producer
                    .complete(Some(stop_reason.unwrap_or_else(|| "end_turn".to_string())), Some(usage))
                    .await;
            }
            StreamEvent::Error { error } => {
                let kind = match error.error_type.as_deref() {
                    Some("overloaded_error") | Some("api_error") => ErrorKind::ServiceUnavailable,
                    Some("rate_limit_error") => ErrorKind::RateLimit,
                    _ => ErrorKind::Unknown,
                };
                let err = AdapterError::new(&provider, kind, error.message)
                    .with_code(error.error_type.unwrap_or_else(|| "stream_error".to_string()))
                    .retryable(kind != ErrorKind::Unknown);
                return producer.fail(err).await;
            }
            StreamEvent::Other => {}
        }
    }

    producer
        .fail(AdapterError::invalid_response(&provider, "Stream ended before message_stop").with_code("STREAM_TRUNCATED"))
        .await;
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<AnthropicContent>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorEnvelope {
    error: AnthropicError,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(rename = "type")]
    error_type: Option<String>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart { message: StreamMessage },
    ContentBlockDelta { delta: TextDelta },
    MessageDelta {
        delta: MessageDeltaBody,
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Error { error: AnthropicError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct TextDelta {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}
