use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Parsing,
    Vectorizing,
    MetadataExtracting,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Parsing => "parsing",
            Self::Vectorizing => "vectorizing",
            Self::MetadataExtracting => "metadata_extracting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MetadataStatus {
    #[default]
    NotExtracted,
    Extracting,
    Extracted,
    Failed,
    Empty,
}

impl MetadataStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotExtracted => "not_extracted",
            Self::Extracting => "extracting",
            Self::Extracted => "extracted",
            Self::Failed => "failed",
            Self::Empty => "empty",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    ExtractionFailed,
    EmbeddingFailed,
    IndexWriteFailed,
    Stale,
    DeletionIncomplete,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExtractionFailed => "extraction_failed",
            Self::EmbeddingFailed => "embedding_failed",
            Self::IndexWriteFailed => "index_write_failed",
            Self::Stale => "stale",
            Self::DeletionIncomplete => "deletion_incomplete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureInfo {
    pub category: FailureCategory,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl FailureInfo {
    pub fn new(category: FailureCategory, detail: impl Into<String>) -> Self {
        Self {
            category,
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}

/// Structured fields pulled out of a contract by the metadata extractor.
///
/// Every field is independently nullable; `signing_date` is an ISO 8601 date string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContractMetadata {
    pub customer_name: Option<String>,
    pub our_entity: Option<String>,
    pub contract_type: Option<String>,
    pub contract_amount: Option<f64>,
    pub signing_date: Option<String>,
    pub project_description: Option<String>,
    pub positions: Option<String>,
    pub personnel_list: Option<String>,
    pub category_primary: Option<String>,
    pub category_secondary: Option<String>,
    pub extracted_at: Option<DateTime<Utc>>,
}

impl ContractMetadata {
    pub const TEXT_FIELDS: [&'static str; 8] = [
        "customer_name",
        "our_entity",
        "contract_type",
        "project_description",
        "positions",
        "personnel_list",
        "category_primary",
        "category_secondary",
    ];

    /// String-valued fields that take part in metadata matching, in a fixed order.
    pub fn text_fields(&self) -> Vec<(&'static str, &str)> {
        let values = [
            self.customer_name.as_deref(),
            self.our_entity.as_deref(),
            self.contract_type.as_deref(),
            self.project_description.as_deref(),
            self.positions.as_deref(),
            self.personnel_list.as_deref(),
            self.category_primary.as_deref(),
            self.category_secondary.as_deref(),
        ];

        Self::TEXT_FIELDS
            .iter()
            .zip(values)
            .filter_map(|(name, value)| value.map(|value| (*name, value)))
            .collect()
    }

    /// Relative weight of a metadata field in metadata matching.
    pub fn field_boost(field: &str) -> f64 {
        match field {
            "customer_name" | "our_entity" => 1.0,
            "project_description" => 0.8,
            "contract_type" => 0.7,
            "positions" | "personnel_list" => 0.6,
            _ => 0.5,
        }
    }

    pub fn signing_date_value(&self) -> Option<NaiveDate> {
        self.signing_date
            .as_deref()
            .and_then(|value| NaiveDate::parse_from_str(value, "%Y-%m-%d").ok())
    }

    /// True when the extractor produced nothing usable.
    pub fn is_empty(&self) -> bool {
        self.text_fields().is_empty()
            && self.contract_amount.is_none()
            && self.signing_date.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    pub contract_name: String,
    pub file_name: String,
    pub upload_id: String,
    pub checksum: String,
    pub status: DocumentStatus,
    pub total_pages: u32,
    pub processed_pages: u32,
    pub metadata: Option<ContractMetadata>,
    pub metadata_status: MetadataStatus,
    pub metadata_error: Option<String>,
    pub error: Option<FailureInfo>,
    pub uploaded_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub file_size: u64,
}

impl DocumentRecord {
    pub fn new_pending(
        contract_name: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
        checksum: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            contract_name: contract_name.into(),
            file_name: file_name.into(),
            upload_id: uuid::Uuid::new_v4().simple().to_string(),
            checksum: checksum.into(),
            status: DocumentStatus::Pending,
            total_pages: 0,
            processed_pages: 0,
            metadata: None,
            metadata_status: MetadataStatus::NotExtracted,
            metadata_error: None,
            error: None,
            uploaded_at: now,
            updated_at: now,
            file_size,
        }
    }

    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            contract_name: self.contract_name.clone(),
            file_name: self.file_name.clone(),
            status: self.status,
            uploaded_at: self.uploaded_at,
            total_pages: self.total_pages,
            processed_pages: self.processed_pages,
            metadata_status: self.metadata_status,
            error: self.error.clone(),
        }
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            contract_name: self.contract_name.clone(),
            status: self.status,
            total_pages: self.total_pages,
            processed_pages: self.processed_pages,
            metadata_status: self.metadata_status,
            error: self.error.clone(),
        }
    }
}

/// Optimistic concurrency token attached to a stored document record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DocVersion {
    pub seq_no: i64,
    pub primary_term: i64,
}

#[derive(Debug, Clone)]
pub struct VersionedDocument {
    pub record: DocumentRecord,
    pub version: DocVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageRecord {
    pub contract_name: String,
    pub page_id: u32,
    pub text: String,
    pub embedding: Vec<f32>,
    pub char_count: usize,
}

impl PageRecord {
    pub fn new(contract_name: impl Into<String>, page_id: u32, text: String, embedding: Vec<f32>) -> Self {
        let char_count = text.chars().count();
        Self {
            contract_name: contract_name.into(),
            page_id,
            text,
            embedding,
            char_count,
        }
    }

    pub fn record_id(&self) -> String {
        page_record_id(&self.contract_name, self.page_id)
    }
}

pub fn page_record_id(contract_name: &str, page_id: u32) -> String {
    format!("{contract_name}#{page_id}")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Keyword,
    Vector,
    Metadata,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Vector => "vector",
            Self::Metadata => "metadata",
        }
    }
}

/// A page-level hit from one score stream, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageCandidate {
    pub contract_name: String,
    pub page_id: u32,
    pub text: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataCandidate {
    pub contract_name: String,
    pub score: f64,
}

/// Inclusive range filters over extracted metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SearchFilters {
    pub amount_min: Option<f64>,
    pub amount_max: Option<f64>,
    pub date_start: Option<NaiveDate>,
    pub date_end: Option<NaiveDate>,
}

impl SearchFilters {
    pub fn is_active(&self) -> bool {
        self.amount_min.is_some()
            || self.amount_max.is_some()
            || self.date_start.is_some()
            || self.date_end.is_some()
    }

    pub fn amount_active(&self) -> bool {
        self.amount_min.is_some() || self.amount_max.is_some()
    }

    pub fn date_active(&self) -> bool {
        self.date_start.is_some() || self.date_end.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    pub top_k: usize,
    pub filters: SearchFilters,
    pub explain: bool,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            top_k,
            filters: SearchFilters::default(),
            explain: false,
        }
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Lower-cased whitespace-separated terms, deduplicated in order.
    pub fn terms(&self) -> Vec<String> {
        let mut terms: Vec<String> = Vec::new();
        for token in self.text.split_whitespace() {
            let token = token.to_lowercase();
            if !terms.contains(&token) {
                terms.push(token);
            }
        }
        terms
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HighlightSpan {
    pub start: usize,
    pub end: usize,
    pub term: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldHighlight {
    pub field: String,
    pub term: String,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkHit {
    pub page_id: u32,
    pub score: f64,
    pub lexical_score: f64,
    pub vector_score: f64,
    pub text: String,
    pub highlights: Vec<HighlightSpan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractResult {
    pub contract_name: String,
    pub score: f64,
    pub content_score: f64,
    pub metadata_score: Option<f64>,
    pub metadata_info: Option<ContractMetadata>,
    pub metadata_highlights: Vec<FieldHighlight>,
    pub chunks: Vec<ChunkHit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub query: String,
    pub mode_weights: Vec<(String, f64)>,
    pub degraded: Vec<SearchMode>,
    pub contracts: Vec<ContractResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestAck {
    pub contract_name: String,
    pub status: DocumentStatus,
    pub total_pages: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    pub contract_name: String,
    pub status: DocumentStatus,
    pub total_pages: u32,
    pub processed_pages: u32,
    pub metadata_status: MetadataStatus,
    pub error: Option<FailureInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataResult {
    pub contract_name: String,
    pub metadata_status: MetadataStatus,
    pub metadata: Option<ContractMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteResult {
    pub contract_name: String,
    pub deleted: bool,
    pub pages_deleted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentSummary {
    pub contract_name: String,
    pub file_name: String,
    pub status: DocumentStatus,
    pub uploaded_at: DateTime<Utc>,
    pub total_pages: u32,
    pub processed_pages: u32,
    pub metadata_status: MetadataStatus,
    pub error: Option<FailureInfo>,
}
