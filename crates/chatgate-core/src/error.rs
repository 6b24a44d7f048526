//! Error taxonomy. Each concern gets its own enum so callers can decide
//! what is fatal: provider errors end a stream, retrieval and persistence
//! errors are logged and swallowed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider response could not be decoded: {0}")]
    Decode(String),
    #[error("provider reported an error: {0}")]
    Upstream(String),
    #[error("provider timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("socket error: {0}")]
    Socket(String),
}

impl ProviderError {
    /// Errors after which the research adapter may retry through its chat endpoint.
    pub fn allows_fallback(&self) -> bool {
        match self {
            ProviderError::Timeout(_) => true,
            ProviderError::Status { status, .. } => *status == 500,
            ProviderError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Decode(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("search request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("search service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("search response could not be decoded: {0}")]
    Decode(String),
    #[error("search collaborator not configured: {0}")]
    NotConfigured(&'static str),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("history store: {0}")]
    Sled(#[from] sled::Error),
    #[error("history record encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors surfaced to HTTP callers of the non-streaming endpoints.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
