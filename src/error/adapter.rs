use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    Authentication,
    Permission,
    RateLimit,
    Timeout,
    NetworkError,
    ServiceUnavailable,
    InvalidResponse,
    NotImplemented,
    Unknown,
}

impl ErrorKind {
    /// Kinds the resilience pipeline may retry. The error's own `retryable`
    /// flag must also be set.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::Timeout
                | ErrorKind::NetworkError
                | ErrorKind::ServiceUnavailable
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Permission => "permission",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::NotImplemented => "not_implemented",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized failure of an upstream provider call. Nothing provider-native
/// leaves an adapter in any other shape.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("[{provider}] {kind}: {message}")]
pub struct AdapterError {
    pub provider: String,
    pub kind: ErrorKind,
    pub message: String,
    pub code: String,
    pub status: Option<u16>,
    pub retryable: bool,
}

impl AdapterError {
    pub fn new(provider: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            kind,
            message: message.into(),
            code: kind.as_str().to_uppercase(),
            status: None,
            retryable: false,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn invalid_request(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ErrorKind::InvalidRequest, message)
    }

    pub fn invalid_response(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ErrorKind::InvalidResponse, message)
    }

    pub fn not_implemented(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ErrorKind::NotImplemented, message)
    }

    pub fn service_unavailable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ErrorKind::ServiceUnavailable, message)
    }

    /// Classify an HTTP failure status returned by a provider.
    pub fn from_status(provider: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        let (kind, retryable) = match status {
            400 | 404 | 413 | 422 => (ErrorKind::InvalidRequest, false),
            401 => (ErrorKind::Authentication, false),
            403 => (ErrorKind::Permission, false),
            408 | 504 => (ErrorKind::Timeout, true),
            429 => (ErrorKind::RateLimit, true),
            500 | 502 | 503 => (ErrorKind::ServiceUnavailable, true),
            _ => (ErrorKind::Unknown, false),
        };

        Self::new(provider, kind, message)
            .with_code(format!("HTTP_{}", status))
            .with_status(status)
            .retryable(retryable)
    }

    /// Classify a transport-level failure (no usable HTTP response).
    pub fn from_transport(provider: impl Into<String>, err: &reqwest::Error) -> Self {
        let provider = provider.into();
        if err.is_timeout() {
            Self::new(provider, ErrorKind::Timeout, format!("Request timed out: {}", err))
                .with_code("REQUEST_TIMEOUT")
                .retryable(true)
        } else if err.is_decode() || err.is_body() {
            Self::new(provider, ErrorKind::InvalidResponse, format!("Failed to read response: {}", err))
                .with_code("RESPONSE_READ_ERROR")
        } else if err.is_builder() {
            Self::new(provider, ErrorKind::InvalidRequest, format!("Failed to build request: {}", err))
                .with_code("REQUEST_BUILD_ERROR")
        } else {
            Self::new(provider, ErrorKind::NetworkError, format!("HTTP request failed: {}", err))
                .with_code("REQUEST_SEND_ERROR")
                .retryable(true)
        }
    }

    /// Whether the retry loop may attempt the call again.
    pub fn should_retry(&self) -> bool {
        self.retryable && self.kind.is_transient()
    }
}
