use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("no extractable text in {0}")]
    NoText(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("{backend} is throttling requests: {details}")]
    Throttled { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("search request failed: {0}")]
    Request(String),

    #[error("schema conflict on index {index}: {details}")]
    SchemaConflict { index: String, details: String },
}

impl SearchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Throttled { .. } => true,
            Self::Http(error) => error.is_timeout() || error.is_connect(),
            _ => false,
        }
    }
}

/// Outcome classification for a failed call to an embedding or generation provider.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("provider rejected the request: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }

    pub fn from_http(error: &reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() || error.is_request() {
            Self::Transient(error.to_string())
        } else if error.is_decode() {
            Self::Transient(format!("malformed response body: {error}"))
        } else {
            Self::Fatal(error.to_string())
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum RagError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("could not extract {}: {source}", path.display())]
    Extraction {
        path: PathBuf,
        #[source]
        source: IngestError,
    },

    #[error("embedding unavailable after {attempts} attempt(s): {source}")]
    EmbeddingUnavailable {
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("index write failed for {} chunk(s): {reason}", failed_ids.len())]
    IndexWrite {
        failed_ids: Vec<String>,
        reason: String,
    },

    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(#[source] SearchError),

    #[error("answer generation unavailable after {attempts} attempt(s): {source}")]
    GenerationUnavailable {
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}
