use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AdapterError, AdapterResult, ErrorKind};
use crate::models::client::{self, classify_status};
use crate::models::provider::{
    GenerationRequest, GenerationResponse, MessageRole, ProviderAdapter, ProviderConfig, TokenUsage,
};
use crate::models::streaming::ChunkReceiver;

pub const DEFAULT_BASE_URL: &str = "https://aip.baidubce.com";

const CHAT_PATH: &str = "/rpc/2.0/ai_custom/v1/wenxinworkshop/chat";
const DEFAULT_ENDPOINT: &str = "completions";
/// Refresh this long before the server-side expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const MODEL_ENDPOINTS: &[(&str, &str)] = &[
    ("ernie-4.0-8k", "completions_pro"),
    ("ernie-4.0-8k-preview", "ernie-4.0-8k-preview"),
    ("ernie-3.5-8k", "completions"),
    ("ernie-3.5-8k-0205", "ernie-3.5-8k-0205"),
    ("ernie-turbo-8k", "eb-instant"),
    ("ernie-speed-8k", "ernie_speed"),
    ("ernie-lite-8k", "ernie-lite-8k"),
    ("ernie-tiny-8k", "ernie-tiny-8k"),
];

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    refresh_at: Instant,
}

/// Baidu Wenxin (ERNIE). Calls carry a short-lived access token obtained by
/// exchanging the API key and secret key; errors arrive in the body even on
/// HTTP 200.
pub struct WenxinAdapter {
    name: String,
    client: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
    models: Vec<String>,
    token: Mutex<Option<AccessToken>>,
}

impl WenxinAdapter {
    pub fn new(config: &ProviderConfig) -> AdapterResult<Self> {
        let secret_key = config.credentials.secret_key.clone().ok_or_else(|| {
            AdapterError::new(&config.name, ErrorKind::Authentication, "Wenxin requires a secret_key")
                .with_code("MISSING_SECRET_KEY")
        })?;
        let client = client::build_client(&config.name, config.timeout())?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        info!("Creating Wenxin adapter '{}' at {}", config.name, base_url);

        let default_models: Vec<&str> = MODEL_ENDPOINTS.iter().map(|(model, _)| *model).collect();

        Ok(Self {
            name: config.name.clone(),
            client,
            api_key: config.credentials.api_key.clone(),
            secret_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            models: config.models_or(&default_models),
            token: Mutex::new(None),
        })
    }

    pub fn endpoint_for(model: &str) -> String {
        let endpoint = MODEL_ENDPOINTS
            .iter()
            .find(|(name, _)| *name == model)
            .map(|(_, endpoint)| *endpoint)
            .unwrap_or(DEFAULT_ENDPOINT);
        format!("{}/{}", CHAT_PATH, endpoint)
    }

    /// Cached token, or a fresh one. The mutex serialises refreshes so
    /// concurrent callers share one exchange.
    async fn access_token(&self) -> AdapterResult<String> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
            debug!("Access token for '{}' is about to expire, refreshing", self.name);
        }

        let token = self.exchange_token().await?;
        let value = token.value.clone();
        *guard = Some(token);
        Ok(value)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn exchange_token(&self) -> AdapterResult<AccessToken> {
        let url = format!("{}/oauth/2.0/token", self.base_url);
        let request = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .query(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.api_key.as_str()),
                ("client_secret", self.secret_key.as_str()),
            ]);

        let response = client::send(&self.name, request, |status, body| {
            let mut err = classify_status(&self.name, status, body);
            if let Ok(body) = serde_json::from_str::<TokenResponse>(body) {
                if let Some(description) = body.error_description {
                    err.message = format!("Failed to obtain access token: {}", description);
                }
            }
            err
        })
        .await?;
        let body: TokenResponse = client::read_json(&self.name, response).await?;

        if let Some(error) = body.error {
            return Err(AdapterError::new(
                &self.name,
                ErrorKind::Authentication,
                format!(
                    "Failed to obtain access token: {}",
                    body.error_description.unwrap_or(error.clone())
                ),
            )
            .with_code(error));
        }

        let value = body.access_token.filter(|t| !t.is_empty()).ok_or_else(|| {
            AdapterError::invalid_response(&self.name, "Token response carried no access_token")
                .with_code("EMPTY_ACCESS_TOKEN")
        })?;

        let lifetime = Duration::from_secs(body.expires_in.unwrap_or(0));
        let refresh_at = Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN);
        info!("Obtained access token for '{}' valid for {:?}", self.name, lifetime);

        Ok(AccessToken { value, refresh_at })
    }

    fn build_request(request: &GenerationRequest) -> WenxinRequest {
        let (system, conversation) = request.split_system();
        WenxinRequest {
            messages: conversation
                .into_iter()
                .map(|message| WenxinMessage {
                    role: match message.role {
                        MessageRole::Assistant => "assistant",
                        _ => "user",
                    }
                    .to_string(),
                    content: message.content,
                })
                .collect(),
            temperature: request.temperature,
            top_p: request.top_p,
            system,
            stop: if request.stop.is_empty() {
                None
            } else {
                Some(request.stop.clone())
            },
            max_output_tokens: request.max_tokens,
            stream: false,
        }
    }

    async fn call(&self, model: &str, body: &WenxinRequest) -> AdapterResult<WenxinResponse> {
        let token = self.access_token().await?;
        let url = format!("{}{}", self.base_url, Self::endpoint_for(model));
        debug!("Sending request to '{}': model={}", self.name, model);

        let request = self
            .client
            .post(&url)
            .query(&[("access_token", token.as_str())])
            .json(body);
        let response = client::send(&self.name, request, |status, text| self.classify_http(status, text)).await?;
        let response: WenxinResponse = client::read_json(&self.name, response).await?;

        match response.error_code {
            Some(code) if code != 0 => Err(self.classify_body_error(code, response.error_msg.unwrap_or_default())),
            _ => Ok(response),
        }
    }

    /// One transparent retry when the token was rejected mid-life.
    async fn call_with_token_refresh(&self, model: &str, body: &WenxinRequest) -> AdapterResult<WenxinResponse> {
        match self.call(model, body).await {
            Err(err) if is_token_error(&err) => {
                warn!("Access token for '{}' rejected ({}), refreshing", self.name, err.code);
                self.invalidate_token().await;
                self.call(model, body).await
            }
            other => other,
        }
    }

    fn classify_http(&self, status: u16, body: &str) -> AdapterError {
        match serde_json::from_str::<WenxinResponse>(body) {
            Ok(WenxinResponse {
                error_code: Some(code),
                error_msg,
                ..
            }) if code != 0 => AdapterError {
                status: Some(status),
                ..self.classify_body_error(code, error_msg.unwrap_or_default())
            },
            _ => classify_status(&self.name, status, body),
        }
    }

    fn classify_body_error(&self, code: i64, message: String) -> AdapterError {
        let (kind, retryable) = match code {
            110 | 111 => (ErrorKind::Authentication, false),
            4 | 18 | 336501 | 336502 => (ErrorKind::RateLimit, true),
            17 | 19 => (ErrorKind::RateLimit, false),
            2 | 336100 => (ErrorKind::ServiceUnavailable, true),
            6 => (ErrorKind::Permission, false),
            336001..=336007 => (ErrorKind::InvalidRequest, false),
            _ => (ErrorKind::Unknown, false),
        };
        let message = if message.is_empty() {
            format!("Error code: {}", code)
        } else {
            message
        };

        AdapterError::new(&self.name, kind, message)
            .with_code(format!("WENXIN_{}", code))
            .retryable(retryable)
    }

    fn finish_reason(response: &WenxinResponse) -> &'static str {
        match (response.is_end, response.is_truncated) {
            (_, true) => "length",
            (true, false) => "stop",
            _ => "unknown",
        }
    }
}

fn is_token_error(err: &AdapterError) -> bool {
    err.code == "WENXIN_110" || err.code == "WENXIN_111"
}

#[async_trait]
impl ProviderAdapter for WenxinAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_text(&self, request: &GenerationRequest) -> AdapterResult<GenerationResponse> {
        request.check(&self.name)?;
        let body = Self::build_request(request);
        let response = self.call_with_token_refresh(&request.model, &body).await?;

        let finish_reason = Self::finish_reason(&response);
        let usage = response
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(GenerationResponse::new(response.id, request.model.clone(), response.result)
            .with_usage(usage)
            .with_finish_reason(finish_reason))
    }

    async fn generate_text_stream(
        &self,
        _request: &GenerationRequest,
        _cancel: CancellationToken,
    ) -> AdapterResult<ChunkReceiver> {
        Err(AdapterError::not_implemented(&self.name, "Wenxin adapter does not support streaming")
            .with_code("STREAMING_UNSUPPORTED"))
    }

    async fn health_check(&self) -> AdapterResult<()> {
        let probe = GenerationRequest::new("ernie-lite-8k").with_prompt("Hello").with_max_tokens(10);
        let body = Self::build_request(&probe);
        self.call_with_token_refresh(&probe.model, &body).await.map(|_| ())
    }

    fn supported_models(&self) -> Vec<String> {
        self.models.clone()
    }

    fn supports_streaming(&self) -> bool {
        false
    }
}

#[derive(Debug, Serialize)]
struct WenxinRequest {
    messages: Vec<WenxinMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WenxinMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct WenxinResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    result: String,
    #[serde(default)]
    is_end: bool,
    #[serde(default)]
    is_truncated: bool,
    usage: Option<WenxinUsage>,
    error_code: Option<i64>,
    error_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WenxinUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
    error_description: Option<String>,
}
