use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{AdapterError, AdapterResult, ErrorKind};
use crate::models::client::{self, classify_status};
use crate::models::provider::{
    GenerationRequest, GenerationResponse, Message, ProviderAdapter, ProviderConfig, TokenUsage,
};
use crate::models::sse::SseReader;
use crate::models::streaming::{ChunkReceiver, StreamProducer};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const DEFAULT_MODELS: &[&str] = &["gpt-4", "gpt-4-turbo", "gpt-4o", "gpt-4o-mini", "gpt-3.5-turbo"];

pub struct OpenAIAdapter {
    name: String,
    client: Client,
    api_key: String,
    base_url: String,
    models: Vec<String>,
}

impl OpenAIAdapter {
    pub fn new(config: &ProviderConfig) -> AdapterResult<Self> {
        let client = client::build_client(&config.name, config.timeout())?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        info!("Creating OpenAI adapter '{}' at {}", config.name, base_url);

        Ok(Self {
            name: config.name.clone(),
            client,
            api_key: config.credentials.api_key.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            models: config.models_or(DEFAULT_MODELS),
        })
    }

    fn create_headers(&self) -> AdapterResult<HeaderMap> {
        let mut headers = HeaderMap::new();

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.api_key)).map_err(|e| {
            AdapterError::new(&self.name, ErrorKind::Authentication, format!("Invalid API key format: {}", e))
        })?;
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(headers)
    }

    fn convert_messages(messages: &[Message]) -> Vec<OpenAIMessage> {
        messages
            .iter()
            .map(|msg| OpenAIMessage {
                role: msg.role.as_str().to_string(),
                content: msg.content.clone(),
            })
            .collect()
    }

    fn build_request(&self, request: &GenerationRequest, stream: bool) -> OpenAIRequest {
        OpenAIRequest {
            model: request.model.clone(),
            messages: Self::convert_messages(&request.conversation()),
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens,
            stop: if request.stop.is_empty() {
                None
            } else {
                Some(request.stop.clone())
            },
            stream,
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
        }
    }

    async fn post(&self, body: &OpenAIRequest) -> AdapterResult<Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = self
            .client
            .post(&url)
            .headers(self.create_headers()?)
            .json(body);

        debug!(
            "Sending request to '{}': model={}, messages={}, stream={}",
            self.name,
            body.model,
            body.messages.len(),
            body.stream
        );

        client::send(&self.name, request, |status, text| self.classify_error(status, text)).await
    }

    /// API error types take precedence over the bare status.
    fn classify_error(&self, status: u16, body: &str) -> AdapterError {
        let api_error = serde_json::from_str::<OpenAIErrorEnvelope>(body)
            .ok()
            .map(|envelope| envelope.error);

        let Some(api_error) = api_error else {
            return classify_status(&self.name, status, body);
        };

        let (kind, retryable) = match api_error.error_type.as_deref().unwrap_or_default() {
            "insufficient_quota" => (ErrorKind::RateLimit, false),
            "invalid_request_error" => (ErrorKind::InvalidRequest, false),
            "authentication_error" => (ErrorKind::Authentication, false),
            "rate_limit_exceeded" => (ErrorKind::RateLimit, true),
            "server_error" => (ErrorKind::ServiceUnavailable, true),
            _ => {
                let fallback = classify_status(&self.name, status, body);
                (fallback.kind, fallback.retryable)
            }
        };

        let code = api_error
            .code
            .or(api_error.error_type)
            .unwrap_or_else(|| format!("HTTP_{}", status));

        AdapterError::new(&self.name, kind, api_error.message)
            .with_code(code)
            .with_status(status)
            .retryable(retryable)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAIAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_text(&self, request: &GenerationRequest) -> AdapterResult<GenerationResponse> {
        request.check(&self.name)?;
        let body = self.build_request(request, false);
        let response = self.post(&body).await?;
        let response: OpenAIResponse = client::read_json(&self.name, response).await?;

        let choice = response.choices.into_iter().next().ok_or_else(|| {
            AdapterError::invalid_response(&self.name, "No choices in response").with_code("EMPTY_CHOICES")
        })?;

        let usage = response
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        debug!("Received response from '{}': id={}", self.name, response.id);

        Ok(GenerationResponse::new(response.id, response.model, choice.message.content.unwrap_or_default())
            .with_usage(usage)
            .with_finish_reason(choice.finish_reason.unwrap_or_else(|| "stop".to_string())))
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
            .find(|m| m.as_str() == "gpt-3.5-turbo")
            .or_else(|| self.models.first())
            .cloned()
            .unwrap_or_else(|| "gpt-3.5-turbo".to_string());

        let probe = GenerationRequest::new(model).with_prompt("ping").with_max_tokens(1);
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
    let mut finish_reason = None;
    let mut usage = None;

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

        if event.data == "[DONE]" {
            return producer.complete(finish_reason, usage).await;
        }

        let frame: OpenAIStreamResponse = match serde_json::from_str(&event.data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Skipping unparseable frame from '{}': {}", provider, e);
                continue;
            }
        };

        if let Some(u) = frame.usage {
            usage = Some(TokenUsage::new(u.prompt_tokens, u.completion_tokens));
        }

        for choice in frame.choices {
            if let Some(reason) = choice.finish_reason {
                finish_reason = Some(reason);
            }
            if let Some(content) = choice.delta.content {
                if !producer.push_delta(&content).await {
                    return;
                }
            }
        }
    }

    if finish_reason.is_some() {
        producer.complete(finish_reason, usage).await;
    } else {
        producer
            .fail(
                AdapterError::invalid_response(&provider, "Stream ended before completion")
                    .with_code("STREAM_TRUNCATED"),
            )
            .await;
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorEnvelope {
    error: OpenAIError,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    #[serde(default)]
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamDelta {
    content: Option<String>,
}
