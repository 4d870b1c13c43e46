use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("unsupported document type: {0}")]
    Unsupported(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("model stream ended before the completion marker")]
    Truncated,

    #[error("model request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persisted index at {path} is corrupt: {details}")]
    Corrupt { path: String, details: String },

    #[error("persisted index is incompatible: {0}")]
    Incompatible(String),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("embedding failed: {0}")]
    Embedding(#[from] ModelError),

    #[error("ingestion failed: {0}")]
    Ingest(#[from] IngestError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf write error: {0}")]
    Pdf(String),
}

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field} url {value:?}: {source}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid retrieval setting: {0}")]
    Retrieval(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("model call failed: {0}")]
    Model(#[from] ModelError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("invalid turn: {0}")]
    InvalidTurn(String),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
