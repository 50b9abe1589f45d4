use crate::models::FailureCategory;
use thiserror::Error;

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

    #[error("store not available yet: {0}")]
    NotReady(String),

    #[error("version conflict on {0}")]
    Conflict(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid search input: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding backend unavailable: {0}")]
    Unavailable(String),

    #[error("malformed embedding: {0}")]
    Malformed(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("index write failed: {0}")]
    IndexWrite(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("document already exists: {0}")]
    AlreadyExists(String),

    #[error("another operation is in flight for {0}")]
    Busy(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl IngestError {
    /// Failure category recorded on the document when this error ends an ingestion.
    pub fn category(&self) -> Option<FailureCategory> {
        match self {
            Self::Extraction(_) | Self::Http(_) => Some(FailureCategory::ExtractionFailed),
            Self::Embedding(_) => Some(FailureCategory::EmbeddingFailed),
            Self::IndexWrite(_) => Some(FailureCategory::IndexWriteFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("document has no text to extract metadata from")]
    EmptyInput,

    #[error("metadata request failed: {0}")]
    Request(String),

    #[error("unparseable metadata response: {0}")]
    Unparseable(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("{contract_name}: cannot move {track} from {from} to {to}")]
    InvalidTransition {
        contract_name: String,
        track: &'static str,
        from: String,
        to: String,
    },

    #[error("{contract_name}: {details}")]
    Rejected {
        contract_name: String,
        details: String,
    },

    #[error("gave up on {0} after repeated concurrent updates")]
    Contention(String),

    #[error("index error: {0}")]
    Index(#[from] SearchError),
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("invalid identifier: {0}")]
    Validation(String),

    #[error("deletion of {contract_name} incomplete: {details}")]
    PartialDelete {
        contract_name: String,
        details: String,
    },

    #[error("clear-all requires the confirmation phrase")]
    Unconfirmed,

    #[error("writers still in flight: {0}")]
    Busy(String),

    #[error("status update failed: {0}")]
    Status(#[from] StatusError),

    #[error("index error: {0}")]
    Index(#[from] SearchError),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
