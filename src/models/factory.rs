use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::error::{AdapterError, AdapterResult, ErrorKind};
use crate::models::anthropic::AnthropicAdapter;
use crate::models::gemini::GeminiAdapter;
use crate::models::openai::OpenAIAdapter;
use crate::models::provider::{ProviderAdapter, ProviderConfig};
use crate::models::wenxin::WenxinAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
    Gemini,
    Wenxin,
}

impl ProviderKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind.to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAI),
            "anthropic" | "claude" => Some(Self::Anthropic),
            "gemini" | "google" => Some(Self::Gemini),
            "wenxin" | "ernie" | "baidu" => Some(Self::Wenxin),
            _ => None,
        }
    }
}

/// Build the adapter a provider record describes.
pub fn create_adapter(config: &ProviderConfig) -> AdapterResult<Arc<dyn ProviderAdapter>> {
    let kind = ProviderKind::parse(config.kind()).ok_or_else(|| {
        AdapterError::invalid_request(&config.name, format!("Unknown provider kind '{}'", config.kind()))
            .with_code("UNKNOWN_PROVIDER_KIND")
    })?;

    if config.credentials.api_key.trim().is_empty() {
        return Err(
            AdapterError::new(&config.name, ErrorKind::Authentication, "API key is not configured")
                .with_code("MISSING_API_KEY"),
        );
    }

    if let Some(base_url) = &config.base_url {
        Url::parse(base_url).map_err(|e| {
            AdapterError::invalid_request(&config.name, format!("Invalid base_url '{}': {}", base_url, e))
                .with_code("INVALID_BASE_URL")
        })?;
    }

    debug!("Building {:?} adapter for provider '{}'", kind, config.name);

    let adapter: Arc<dyn ProviderAdapter> = match kind {
        ProviderKind::OpenAI => Arc::new(OpenAIAdapter::new(config)?),
        ProviderKind::Anthropic => Arc::new(AnthropicAdapter::new(config)?),
        ProviderKind::Gemini => Arc::new(GeminiAdapter::new(config)?),
        ProviderKind::Wenxin => Arc::new(WenxinAdapter::new(config)?),
    };
    Ok(adapter)
}
