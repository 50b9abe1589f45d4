use crate::models::{
    DocVersion, DocumentRecord, MetadataCandidate, PageCandidate, PageRecord, VersionedDocument,
};
use crate::SearchError;
use async_trait::async_trait;

/// Document-level records: one per contract, holding status and metadata.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fails with [`SearchError::Conflict`] when a record with the same name exists.
    async fn create_document(&self, record: &DocumentRecord) -> Result<DocVersion, SearchError>;

    async fn get_document(&self, contract_name: &str) -> Result<Option<VersionedDocument>, SearchError>;

    async fn get_documents(&self, contract_names: &[String]) -> Result<Vec<DocumentRecord>, SearchError>;

    async fn list_documents(&self) -> Result<Vec<DocumentRecord>, SearchError>;

    /// Compare-and-set: replaces the record only if it is still at `expected`.
    async fn replace_document(
        &self,
        record: &DocumentRecord,
        expected: DocVersion,
    ) -> Result<DocVersion, SearchError>;

    async fn delete_document(&self, contract_name: &str) -> Result<bool, SearchError>;

    async fn clear_documents(&self) -> Result<u64, SearchError>;
}

/// Page-level records keyed by `(contract_name, page_id)`.
#[async_trait]
pub trait PageStore: Send + Sync {
    async fn write_page(&self, page: &PageRecord) -> Result<(), SearchError>;

    /// Pages of one contract ordered by `page_id`.
    async fn list_pages(&self, contract_name: &str) -> Result<Vec<PageRecord>, SearchError>;

    async fn delete_pages(&self, contract_name: &str) -> Result<u64, SearchError>;

    async fn clear_pages(&self) -> Result<u64, SearchError>;
}

#[async_trait]
pub trait KeywordIndex: Send + Sync {
    async fn search_pages_keyword(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<PageCandidate>, SearchError>;

    /// Same scoring as [`KeywordIndex::search_pages_keyword`], restricted to one contract.
    async fn search_contract_pages_keyword(
        &self,
        contract_name: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<PageCandidate>, SearchError>;

    async fn search_metadata(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MetadataCandidate>, SearchError>;
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn search_pages_vector(
        &self,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<PageCandidate>, SearchError>;

    async fn search_contract_pages_vector(
        &self,
        contract_name: &str,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<PageCandidate>, SearchError>;
}

/// Everything the pipeline, lifecycle manager and search engine need from one backend.
pub trait ContractIndex: DocumentStore + PageStore + KeywordIndex + VectorIndex {}

impl<T> ContractIndex for T where T: DocumentStore + PageStore + KeywordIndex + VectorIndex {}
