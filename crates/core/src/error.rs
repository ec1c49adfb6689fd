use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("validation failed for {label}: token count {token_count} exceeds limit {max_tokens}")]
    TokenLimitExceeded {
        label: String,
        token_count: usize,
        max_tokens: usize,
    },

    #[error("embedding generation failed after {attempts} attempts: {details}")]
    Generation { attempts: u32, details: String },

    #[error("batch {index} failed: {source}")]
    Batch {
        index: usize,
        #[source]
        source: Box<EmbeddingError>,
    },

    #[error("embedding count mismatch. expected: {expected}, got: {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("embedding dimension {actual} differs from established dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid embedding config: {0}")]
    InvalidConfig(String),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("search request failed: {0}")]
    Request(String),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("operation {operation} timed out after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    #[error("failed to format results: {0}")]
    Format(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SearchError {
    pub(crate) fn backend(backend: &str, details: impl Into<String>) -> Self {
        SearchError::BackendResponse {
            backend: backend.to_string(),
            details: details.into(),
        }
    }
}

pub type Result<T, E = SearchError> = std::result::Result<T, E>;
