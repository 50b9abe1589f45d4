//! Test double over [`InMemoryIndex`]: records status history and fails selected calls on demand.

use super::InMemoryIndex;
use crate::models::{
    DocVersion, DocumentRecord, DocumentStatus, MetadataCandidate, MetadataStatus, PageCandidate, PageRecord,
    VersionedDocument,
};
use crate::traits::{DocumentStore, KeywordIndex, PageStore, VectorIndex};
use crate::SearchError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct InstrumentedIndex {
    pub inner: InMemoryIndex,
    /// `(status, processed_pages)` after every successful document write.
    pub history: Mutex<Vec<(DocumentStatus, u32)>>,
    pub fail_keyword: AtomicBool,
    pub fail_vector: AtomicBool,
    pub fail_metadata: AtomicBool,
    pub fail_page_deletes: AtomicBool,
    pub fail_page_writes: AtomicBool,
    /// Page writes that fail before writes start succeeding again.
    pub transient_page_write_failures: AtomicU32,
    /// Metadata-track writes rejected with a conflict, counted down per attempt.
    pub metadata_write_conflicts: AtomicU32,
}

impl InstrumentedIndex {
    pub fn statuses(&self) -> Vec<(DocumentStatus, u32)> {
        self.history.lock().unwrap().clone()
    }

    fn record(&self, record: &DocumentRecord) {
        self.history
            .lock()
            .unwrap()
            .push((record.status, record.processed_pages));
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn check(flag: &AtomicBool, backend: &str) -> Result<(), SearchError> {
        if flag.load(Ordering::SeqCst) {
            Err(SearchError::NotReady(format!("{backend} unavailable")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentStore for InstrumentedIndex {
    async fn create_document(&self, record: &DocumentRecord) -> Result<DocVersion, SearchError> {
        let version = self.inner.create_document(record).await?;
        self.record(record);
        Ok(version)
    }

    async fn get_document(&self, name: &str) -> Result<Option<VersionedDocument>, SearchError> {
        self.inner.get_document(name).await
    }

    async fn get_documents(&self, names: &[String]) -> Result<Vec<DocumentRecord>, SearchError> {
        self.inner.get_documents(names).await
    }

    async fn list_documents(&self) -> Result<Vec<DocumentRecord>, SearchError> {
        self.inner.list_documents().await
    }

    async fn replace_document(
        &self,
        record: &DocumentRecord,
        expected: DocVersion,
    ) -> Result<DocVersion, SearchError> {
        if record.metadata_status != MetadataStatus::Extracting && Self::take(&self.metadata_write_conflicts) {
            return Err(SearchError::Conflict(record.contract_name.clone()));
        }
        let version = self.inner.replace_document(record, expected).await?;
        self.record(record);
        Ok(version)
    }

    async fn delete_document(&self, name: &str) -> Result<bool, SearchError> {
        self.inner.delete_document(name).await
    }

    async fn clear_documents(&self) -> Result<u64, SearchError> {
        self.inner.clear_documents().await
    }
}

#[async_trait]
impl PageStore for InstrumentedIndex {
    async fn write_page(&self, page: &PageRecord) -> Result<(), SearchError> {
        Self::check(&self.fail_page_writes, "page store")?;
        if Self::take(&self.transient_page_write_failures) {
            return Err(SearchError::NotReady("page store warming up".to_string()));
        }
        self.inner.write_page(page).await
    }

    async fn list_pages(&self, name: &str) -> Result<Vec<PageRecord>, SearchError> {
        self.inner.list_pages(name).await
    }

    async fn delete_pages(&self, name: &str) -> Result<u64, SearchError> {
        Self::check(&self.fail_page_deletes, "page store")?;
        self.inner.delete_pages(name).await
    }

    async fn clear_pages(&self) -> Result<u64, SearchError> {
        self.inner.clear_pages().await
    }
}

#[async_trait]
impl KeywordIndex for InstrumentedIndex {
    async fn search_pages_keyword(&self, query: &str, limit: usize) -> Result<Vec<PageCandidate>, SearchError> {
        Self::check(&self.fail_keyword, "keyword index")?;
        self.inner.search_pages_keyword(query, limit).await
    }

    async fn search_contract_pages_keyword(
        &self,
        name: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<PageCandidate>, SearchError> {
        Self::check(&self.fail_keyword, "keyword index")?;
        self.inner.search_contract_pages_keyword(name, query, limit).await
    }

    async fn search_metadata(&self, query: &str, limit: usize) -> Result<Vec<MetadataCandidate>, SearchError> {
        Self::check(&self.fail_metadata, "metadata index")?;
        self.inner.search_metadata(query, limit).await
    }
}

#[async_trait]
impl VectorIndex for InstrumentedIndex {
    async fn search_pages_vector(&self, vector: &[f32], limit: usize) -> Result<Vec<PageCandidate>, SearchError> {
        Self::check(&self.fail_vector, "vector index")?;
        self.inner.search_pages_vector(vector, limit).await
    }

    async fn search_contract_pages_vector(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<PageCandidate>, SearchError> {
        Self::check(&self.fail_vector, "vector index")?;
        self.inner.search_contract_pages_vector(name, vector, limit).await
    }
}
