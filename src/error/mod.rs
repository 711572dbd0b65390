mod adapter;

pub use adapter::{AdapterError, AdapterResult, ErrorKind};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("{source} (after {attempts} attempts)")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: AdapterError,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Quota ledger error: {0}")]
    Quota(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(config::ConfigError::Message(msg.into()))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn quota(msg: impl Into<String>) -> Self {
        Error::Quota(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Error::Unknown(msg.into())
    }

    /// The provider error behind this failure, if any.
    pub fn adapter_error(&self) -> Option<&AdapterError> {
        match self {
            Error::Adapter(err) => Some(err),
            Error::RetriesExhausted { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.adapter_error().map(|err| err.kind)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
