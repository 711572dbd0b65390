pub mod provider;
pub mod streaming;
pub mod sse;
pub(crate) mod client;
pub mod openai;
pub mod anthropic;
pub mod gemini;
pub mod wenxin;
pub mod factory;
pub mod rate_limiter;
pub mod circuit_breaker;
pub mod retry;
pub mod error_handler;
pub mod manager;

pub use provider::{
    Credentials, GenerationRequest, GenerationResponse, Message, MessageRole, ProviderAdapter,
    ProviderConfig, StreamChunk, TokenUsage,
};
pub use streaming::{ChunkReceiver, StreamProducer, STREAM_CHANNEL_CAPACITY};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::{RetryConfig, Retryer};
pub use error_handler::ErrorHandler;
pub use factory::{create_adapter, ProviderKind};
pub use manager::{AdapterManager, ProviderInfo, RateLimitScope, ResilienceSettings};
pub use openai::OpenAIAdapter;
pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use wenxin::WenxinAdapter;
