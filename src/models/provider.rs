use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use validator::Validate;

use crate::error::{AdapterError, AdapterResult};
use crate::models::streaming::ChunkReceiver;

/// Uniform contract over one upstream text-generation provider.
///
/// Every failure crossing this boundary is an [`AdapterError`]. Synchronous
/// calls are cancelled by dropping the returned future; streaming calls take
/// a [`CancellationToken`] because the producer runs on its own task.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn generate_text(&self, request: &GenerationRequest) -> AdapterResult<GenerationResponse>;

    /// Performs the HTTP handshake before returning, so a rejected stream
    /// surfaces here rather than as the first item on the channel.
    async fn generate_text_stream(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> AdapterResult<ChunkReceiver>;

    async fn health_check(&self) -> AdapterResult<()>;

    fn supported_models(&self) -> Vec<String>;

    fn supports_streaming(&self) -> bool;

    fn supports_model(&self, model: &str) -> bool {
        self.supported_models().iter().any(|m| m == model)
    }
}

#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Credentials {
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &redact(&self.api_key))
            .field("secret_key", &self.secret_key.as_deref().map(redact))
            .finish()
    }
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() {
        "<empty>"
    } else {
        "<redacted>"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub name: String,
    /// Wire protocol; the name is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Lower is preferred.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub credentials: Credentials,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_seconds() -> u64 {
    60
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: None,
            priority: 0,
            enabled: true,
            credentials: Credentials {
                api_key: api_key.into(),
                secret_key: None,
            },
            base_url: None,
            models: Vec::new(),
            timeout_seconds: default_timeout_seconds(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn with_secret_key(mut self, secret_key: impl Into<String>) -> Self {
        self.credentials.secret_key = Some(secret_key.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or(&self.name)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }

    /// Configured models, or the adapter's built-in list when none are set.
    pub fn models_or(&self, defaults: &[&str]) -> Vec<String> {
        if self.models.is_empty() {
            defaults.iter().map(|m| m.to_string()).collect()
        } else {
            self.models.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct GenerationRequest {
    #[validate(length(min = 1, max = 128))]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[validate(range(min = 1, max = 200000))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[validate(range(min = 0.0, max = 2.0))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[validate(range(min = 0.0, max = 1.0))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub stream: bool,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Field-range checks plus "there must be something to generate from".
    pub fn check(&self, provider: &str) -> AdapterResult<()> {
        self.validate()
            .map_err(|e| AdapterError::invalid_request(provider, format!("Invalid request: {}", e)))?;

        let has_prompt = self.prompt.as_deref().is_some_and(|p| !p.trim().is_empty());
        if !has_prompt && self.messages.is_empty() {
            return Err(AdapterError::invalid_request(
                provider,
                "Request must carry a prompt or at least one message",
            ));
        }
        Ok(())
    }

    /// Messages followed by the prompt as a trailing user turn.
    pub fn conversation(&self) -> Vec<Message> {
        let mut messages = self.messages.clone();
        if let Some(prompt) = self.prompt.as_deref().filter(|p| !p.is_empty()) {
            messages.push(Message::user(prompt));
        }
        messages
    }

    /// System turns joined, plus the remaining conversation.
    pub fn split_system(&self) -> (Option<String>, Vec<Message>) {
        let mut system = Vec::new();
        let mut rest = Vec::new();
        for message in self.conversation() {
            match message.role {
                MessageRole::System => system.push(message.content),
                _ => rest.push(message),
            }
        }
        let system = if system.is_empty() {
            None
        } else {
            Some(system.join("\n"))
        };
        (system, rest)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub id: String,
    pub text: String,
    pub usage: TokenUsage,
    pub model: String,
    pub finish_reason: String,
    pub created_at: DateTime<Utc>,
}

impl GenerationResponse {
    pub fn new(id: impl Into<String>, model: impl Into<String>, text: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            id: if id.is_empty() { Uuid::new_v4().to_string() } else { id },
            text: text.into(),
            usage: TokenUsage::default(),
            model: model.into(),
            finish_reason: "stop".to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_finish_reason(mut self, finish_reason: impl Into<String>) -> Self {
        self.finish_reason = finish_reason.into();
        self
    }
}

/// One streamed increment. `content` is everything produced so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamChunk {
    pub delta: String,
    pub content: String,
    pub token_count: u32,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}
