pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod highlight;
pub mod ingest;
pub mod lifecycle;
pub mod metadata;
pub mod models;
pub mod orchestrator;
pub mod retry;
pub mod status;
pub mod stores;
pub mod traits;

pub use chunking::{bounded_document_text, clean_page_text, normalize_whitespace};
pub use config::{
    DegradationPolicy, IndexerConfig, Normalization, PageAggregation, RankingConfig, RetryPolicy,
    ServiceConfig,
};
pub use embeddings::{CharacterNgramEmbedder, Embedder, HttpEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{EmbeddingError, IngestError, LifecycleError, MetadataError, SearchError, StatusError};
pub use extractor::{FallbackPdfExtractor, LopdfExtractor, OcrEndpointConfig, PageText, PdfExtractor};
pub use ingest::{discover_pdf_files, ContractLocks, ExclusiveGuard, PageIndexer};
pub use lifecycle::{canonical_contract_name, ClearAllConfirmation, ClearAllReport, DocumentLifecycle};
pub use metadata::{CustomerCategoryLookup, LlmMetadataExtractor, MetadataExtractor, RawMetadata};
pub use models::{
    ContractMetadata, ContractResult, DeleteResult, DocumentRecord, DocumentStatus, DocumentSummary,
    FailureCategory, IngestAck, MetadataResult, MetadataStatus, PageRecord, SearchFilters,
    SearchMode, SearchQuery, SearchResult, StatusReport,
};
pub use orchestrator::HybridSearchEngine;
pub use stores::{ElasticsearchStore, InMemoryIndex};
pub use status::StatusTracker;
pub use traits::{ContractIndex, DocumentStore, KeywordIndex, PageStore, VectorIndex};
