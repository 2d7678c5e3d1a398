use thiserror::Error;

/// Failure reported by an external capability (embedding, generation,
/// classification, reranking, storage).
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("lexical index error: {0}")]
    Lexical(#[from] tantivy::TantivyError),

    #[error("{stage} timed out after {millis}ms")]
    Timeout { stage: &'static str, millis: u64 },

    #[error("capability unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("embedding failed: {0}")]
    Embedding(#[source] CapabilityError),

    #[error("content store failed: {0}")]
    Store(#[source] CapabilityError),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("query is empty")]
    EmptyQuery,

    #[error("unknown audience mode {0:?}: expected \"internal\" or \"customer\"")]
    InvalidMode(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("query embedding failed: {0}")]
    Embedding(#[source] CapabilityError),

    #[error("content store failed: {0}")]
    Store(#[source] CapabilityError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
