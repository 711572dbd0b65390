use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AdapterError, AdapterResult};
use crate::models::client::{self, classify_status};
use crate::models::provider::{
    GenerationRequest, GenerationResponse, MessageRole, ProviderAdapter, ProviderConfig, TokenUsage,
};
use crate::models::sse::SseReader;
use crate::models::streaming::{ChunkReceiver, StreamProducer};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const DEFAULT_MODELS: &[&str] = &["gemini-1.5-pro", "gemini-1.5-flash", "gemini-1.0-pro"];

const HARM_CATEGORIES: &[&str] = &[
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];
const DEFAULT_THRESHOLD: &str = "BLOCK_MEDIUM_AND_ABOVE";

pub struct GeminiAdapter {
    name: String,
    client: Client,
    api_key: String,
    base_url: String,
    models: Vec<String>,
}

impl GeminiAdapter {
    pub fn new(config: &ProviderConfig) -> AdapterResult<Self> {
        let client = client::build_client(&config.name, config.timeout())?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        info!("Creating Gemini adapter '{}' at {}", config.name, base_url);

        Ok(Self {
            name: config.name.clone(),
            client,
            api_key: config.credentials.api_key.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            models: config.models_or(DEFAULT_MODELS),
        })
    }

    fn default_safety_settings() -> Vec<GeminiSafetySetting> {
        HARM_CATEGORIES
            .iter()
            .map(|category| GeminiSafetySetting {
                category: category.to_string(),
                threshold: DEFAULT_THRESHOLD.to_string(),
            })
            .collect()
    }

    fn build_request(&self, request: &GenerationRequest) -> GeminiRequest {
        let (system, conversation) = request.split_system();

        let contents = conversation
            .into_iter()
            .map(|message| GeminiContent {
                role: Some(
                    match message.role {
                        MessageRole::Assistant => "model",
                        _ => "user",
                    }
                    .to_string(),
                ),
                parts: vec![GeminiPart {
                    text: Some(message.content),
                }],
            })
            .collect();

        GeminiRequest {
            contents,
            system_instruction: system.map(|text| GeminiContent {
                role: None,
                parts: vec![GeminiPart { text: Some(text) }],
            }),
            generation_config: GeminiGenerationConfig {
                temperature: request.temperature,
                top_p: request.top_p,
                top_k: None,
                max_output_tokens: request.max_tokens,
                stop_sequences: if request.stop.is_empty() {
                    None
                } else {
                    Some(request.stop.clone())
                },
            },
            safety_settings: Self::default_safety_settings(),
        }
    }

    async fn post(&self, model: &str, body: &GeminiRequest, stream: bool) -> AdapterResult<Response> {
        let method = if stream { "streamGenerateContent" } else { "generateContent" };
        let url = format!("{}/v1beta/models/{}:{}", self.base_url, model, method);

        debug!("Sending request to '{}': model={}, stream={}", self.name, model, stream);

        let mut request = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(body);
        if stream {
            request = request.query(&[("alt", "sse")]);
        }

        client::send(&self.name, request, |status, text| self.classify_error(status, text)).await
    }

    fn classify_error(&self, status: u16, body: &str) -> AdapterError {
        let mut err = classify_status(&self.name, status, body);
        if let Ok(envelope) = serde_json::from_str::<GeminiErrorEnvelope>(body) {
            err.message = envelope.error.message;
            if let Some(code) = envelope.error.status {
                err.code = code;
            }
        }
        err
    }

    fn blocked(&self, reason: &str) -> AdapterError {
        warn!("'{}' blocked the prompt: {}", self.name, reason);
        AdapterError::invalid_request(&self.name, format!("Prompt blocked by safety filter: {}", reason))
            .with_code("PROMPT_BLOCKED")
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_text(&self, request: &GenerationRequest) -> AdapterResult<GenerationResponse> {
        request.check(&self.name)?;
        let body = self.build_request(request);
        let response = self.post(&request.model, &body, false).await?;
        let response: GeminiResponse = client::read_json(&self.name, response).await?;

        if let Some(reason) = response
            .prompt_feedback
            .as_ref()
            .and_then(|feedback| feedback.block_reason.as_deref())
        {
            return Err(self.blocked(reason));
        }

        let candidate = response.candidates.into_iter().next().ok_or_else(|| {
            AdapterError::invalid_response(&self.name, "No candidates in response").with_code("EMPTY_CANDIDATES")
        })?;

        let text = candidate.text();
        let usage = response
            .usage_metadata
            .map(|u| TokenUsage::new(u.prompt_token_count, u.candidates_token_count))
            .unwrap_or_default();

        Ok(GenerationResponse::new(String::new(), request.model.clone(), text)
            .with_usage(usage)
            .with_finish_reason(candidate.finish_reason.unwrap_or_else(|| "STOP".to_string())))
    }

    async fn generate_text_stream(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> AdapterResult<ChunkReceiver> {
        request.check(&self.name)?;
        let body = self.build_request(request);
        let response = self.post(&request.model, &body, true).await?;

        let (producer, rx) = StreamProducer::channel(cancel);
        let reader = SseReader::new(self.name.clone(), response);
        tokio::spawn(pump_stream(self.name.clone(), reader, producer));
        Ok(rx)
    }

    async fn health_check(&self) -> AdapterResult<()> {
        let model = self
            .models
            .iter()
            .find(|m| m.contains("flash"))
            .or_else(|| self.models.first())
            .cloned()
            .unwrap_or_else(|| "gemini-1.5-flash".to_string());

        let probe = GenerationRequest::new(model.clone()).with_prompt("Hello").with_max_tokens(10);
        let body = self.build_request(&probe);
        self.post(&model, &body, false).await.map(|_| ())
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
    let mut finish_reason: Option<String> = None;
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

        let frame: GeminiResponse = match serde_json::from_str(&event.data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Skipping unparseable frame from '{}': {}", provider, e);
                continue;
            }
        };

        if let Some(reason) = frame
            .prompt_feedback
            .as_ref()
            .and_then(|feedback| feedback.block_reason.clone())
        {
            let err = AdapterError::invalid_request(&provider, format!("Prompt blocked by safety filter: {}", reason))
                .with_code("PROMPT_BLOCKED");
            return producer.fail(err).await;
        }

        if let Some(u) = frame.usage_metadata {
            usage = Some(TokenUsage::new(u.prompt_token_count, u.candidates_token_count));
        }

        for candidate in frame.candidates {
            let text = candidate.text();
            if !producer.push_delta(&text).await {
                return;
            }
            if candidate.finish_reason.is_some() {
                finish_reason = candidate.finish_reason;
            }
        }
    }

    // The body simply ends; a finish reason marks a clean end.
    if finish_reason.is_some() {
        producer.complete(finish_reason, usage).await;
    } else {
        producer
            .fail(AdapterError::invalid_response(&provider, "Stream ended before completion").with_code("STREAM_TRUNCATED"))
            .await;
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    generation_config: GeminiGenerationConfig,
    safety_settings: Vec<GeminiSafetySetting>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct GeminiSafetySetting {
    category: String,
    threshold: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

impl GeminiCandidate {
    fn text(&self) -> String {
        self.content
            .iter()
            .flat_map(|content| content.parts.iter())
            .filter_map(|part| part.text.as_deref())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorEnvelope {
    error: GeminiError,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    #[serde(default)]
    message: String,
    status: Option<String>,
}
