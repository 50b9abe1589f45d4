use crate::chunking::bounded_document_text;
use crate::config::IndexerConfig;
use crate::embeddings::{validate_embedding, Embedder};
use crate::error::{EmbeddingError, IngestError, MetadataError, StatusError};
use crate::extractor::{looks_like_pdf, PageText, PdfExtractor};
use crate::lifecycle::{base_file_name, canonical_contract_name};
use crate::metadata::{normalize_text, CustomerCategoryLookup, MetadataExtractor, RawMetadata};
use crate::models::{
    ContractMetadata, DocumentRecord, DocumentStatus, FailureCategory, FailureInfo, IngestAck,
    MetadataResult, MetadataStatus, PageRecord, StatusReport,
};
use crate::retry::retry_with_backoff;
use crate::status::StatusTracker;
use crate::traits::ContractIndex;
use crate::SearchError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// One writer per contract name. Ingestion and metadata extraction `try_acquire`,
/// deletion waits in `acquire`, `clear_all` takes every name at once.
#[derive(Clone, Default)]
pub struct ContractLocks {
    slots: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    exclusive: Arc<AtomicBool>,
}

/// Held while the whole index is being reset. New writers are refused until it drops.
pub struct ExclusiveGuard {
    exclusive: Arc<AtomicBool>,
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        self.exclusive.store(false, Ordering::SeqCst);
    }
}

impl ContractLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(
        slots: &mut HashMap<String, Arc<AsyncMutex<()>>>,
        contract_name: &str,
    ) -> Arc<AsyncMutex<()>> {
        slots.retain(|name, slot| name == contract_name || Arc::strong_count(slot) > 1);
        slots
            .entry(contract_name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub fn try_acquire(&self, contract_name: &str) -> Option<OwnedMutexGuard<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if self.exclusive.load(Ordering::SeqCst) {
            return None;
        }
        Self::slot(&mut slots, contract_name).try_lock_owned().ok()
    }

    pub async fn acquire(&self, contract_name: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Self::slot(&mut slots, contract_name)
        };
        slot.lock_owned().await
    }

    /// Succeeds only when no contract has a writer in flight. The check and the claim
    /// happen under the same lock as `try_acquire`.
    pub fn try_acquire_all(&self) -> Option<ExclusiveGuard> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.values().any(|slot| slot.try_lock().is_err()) {
            return None;
        }
        if self.exclusive.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(ExclusiveGuard {
            exclusive: self.exclusive.clone(),
        })
    }
}

/// Settles the metadata track as failed when extraction is dropped before it finishes.
struct MetadataClaim {
    status: StatusTracker,
    contract_name: String,
    claimed_at: DateTime<Utc>,
    armed: bool,
}

impl MetadataClaim {
    fn new(status: StatusTracker, contract_name: &str, claimed_at: DateTime<Utc>) -> Self {
        Self {
            status,
            contract_name: contract_name.to_string(),
            claimed_at,
            armed: true,
        }
    }

    fn release(mut self) {
        self.armed = false;
    }
}

impl Drop for MetadataClaim {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(contract_name = %self.contract_name, "metadata claim dropped outside a runtime");
            return;
        };

        let status = self.status.clone();
        let contract_name = std::mem::take(&mut self.contract_name);
        let claimed_at = self.claimed_at;
        runtime.spawn(async move {
            let settled = status
                .abandon_metadata(&contract_name, "metadata extraction was interrupted", Some(claimed_at))
                .await;
            if let Err(error) = settled {
                error!(contract_name = %contract_name, error = %error, "could not settle interrupted metadata extraction");
            }
        });
    }
}

fn status_failure(error: StatusError) -> IngestError {
    match error {
        StatusError::NotFound(name) => IngestError::NotFound(name),
        rejected @ (StatusError::InvalidTransition { .. } | StatusError::Rejected { .. }) => {
            IngestError::Validation(rejected.to_string())
        }
        other => IngestError::IndexWrite(other.to_string()),
    }
}

/// Turns uploaded PDFs into page records and drives the document status track.
#[derive(Clone)]
pub struct PageIndexer {
    index: Arc<dyn ContractIndex>,
    status: StatusTracker,
    embedder: Arc<dyn Embedder>,
    extractor: Arc<dyn PdfExtractor>,
    metadata: Option<Arc<dyn MetadataExtractor>>,
    categories: Option<Arc<CustomerCategoryLookup>>,
    config: IndexerConfig,
    locks: ContractLocks,
}

impl PageIndexer {
    pub fn new<I>(
        index: Arc<I>,
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn PdfExtractor>,
        config: IndexerConfig,
    ) -> Self
    where
        I: ContractIndex + 'static,
    {
        let status = StatusTracker::new(index.clone(), config.status_update_attempts);
        Self {
            index,
            status,
            embedder,
            extractor,
            metadata: None,
            categories: None,
            config,
            locks: ContractLocks::new(),
        }
    }

    pub fn with_metadata_extractor(mut self, extractor: Arc<dyn MetadataExtractor>) -> Self {
        self.metadata = Some(extractor);
        self
    }

    pub fn with_category_lookup(mut self, lookup: Arc<CustomerCategoryLookup>) -> Self {
        self.categories = Some(lookup);
        self
    }

    /// Shares the writer locks with a lifecycle manager over the same index.
    pub fn with_locks(mut self, locks: ContractLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn locks(&self) -> ContractLocks {
        self.locks.clone()
    }

    /// Accepts an upload and returns as soon as the pending record exists.
    /// Progress is observable through the document status.
    pub async fn ingest(&self, file_name: &str, bytes: Vec<u8>) -> Result<IngestAck, IngestError> {
        let (contract_name, guard) = self.accept(file_name, &bytes).await?;

        let indexer = self.clone();
        let name = contract_name.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(error) = indexer.run(&name, bytes).await {
                debug!(contract_name = %name, error = %error, "background ingestion ended in failure");
            }
        });

        Ok(IngestAck {
            contract_name,
            status: DocumentStatus::Pending,
            total_pages: 0,
        })
    }

    /// Runs the whole pipeline in the caller's task and reports the final state.
    pub async fn ingest_and_wait(&self, file_name: &str, bytes: Vec<u8>) -> Result<StatusReport, IngestError> {
        let (contract_name, _guard) = self.accept(file_name, &bytes).await?;
        let _ = self.run(&contract_name, bytes).await;
        let record = self.status.current(&contract_name).await.map_err(status_failure)?;
        Ok(record.status_report())
    }

    /// Re-runs metadata extraction for an indexed document. Last write wins.
    pub async fn extract_metadata(&self, identifier: &str) -> Result<MetadataResult, IngestError> {
        let contract_name =
            canonical_contract_name(identifier).map_err(|error| IngestError::Validation(error.to_string()))?;
        if self.metadata.is_none() {
            return Err(IngestError::Validation("no metadata extractor configured".to_string()));
        }

        let _guard = self
            .locks
            .try_acquire(&contract_name)
            .ok_or_else(|| IngestError::Busy(contract_name.clone()))?;

        let pages: Vec<PageText> = self
            .index
            .list_pages(&contract_name)
            .await
            .map_err(|error| IngestError::IndexWrite(error.to_string()))?
            .into_iter()
            .map(|page| PageText {
                number: page.page_id,
                text: page.text,
            })
            .collect();

        self.run_metadata(&contract_name, &pages).await
    }

    /// Stores hand-edited metadata for an indexed document. Fields are normalized like
    /// extractor output; explicit categories win over the customer lookup.
    pub async fn save_metadata(
        &self,
        identifier: &str,
        edited: ContractMetadata,
    ) -> Result<MetadataResult, IngestError> {
        let contract_name =
            canonical_contract_name(identifier).map_err(|error| IngestError::Validation(error.to_string()))?;

        let _guard = self
            .locks
            .try_acquire(&contract_name)
            .ok_or_else(|| IngestError::Busy(contract_name.clone()))?;

        let raw = RawMetadata::from_edited(&edited).map_err(|error| IngestError::Validation(error.to_string()))?;
        let mut metadata = raw.normalize();
        if let Some(categories) = &self.categories {
            categories.apply(&mut metadata);
        }
        let explicit = |value: &Option<String>| {
            value
                .as_deref()
                .and_then(|text| normalize_text(&Value::String(text.to_string())))
        };
        if let Some(primary) = explicit(&edited.category_primary) {
            metadata.category_primary = Some(primary);
        }
        if let Some(secondary) = explicit(&edited.category_secondary) {
            metadata.category_secondary = Some(secondary);
        }

        let metadata = (!metadata.is_empty()).then_some(metadata);
        let record = self
            .status
            .store_metadata(&contract_name, metadata)
            .await
            .map_err(status_failure)?;

        Ok(MetadataResult {
            contract_name: record.contract_name,
            metadata_status: record.metadata_status,
            metadata: record.metadata,
        })
    }

    async fn accept(
        &self,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<(String, OwnedMutexGuard<()>), IngestError> {
        let contract_name =
            canonical_contract_name(file_name).map_err(|error| IngestError::Validation(error.to_string()))?;
        if !looks_like_pdf(bytes) {
            return Err(IngestError::Validation(format!("{file_name} is not a PDF")));
        }

        let guard = self
            .locks
            .try_acquire(&contract_name)
            .ok_or_else(|| IngestError::Busy(contract_name.clone()))?;

        let record = DocumentRecord::new_pending(
            contract_name.clone(),
            base_file_name(file_name),
            bytes.len() as u64,
            digest_bytes(bytes),
        );
        self.create_pending(&record).await?;

        info!(contract_name = %contract_name, upload_id = %record.upload_id, bytes = bytes.len(), "upload accepted");
        Ok((contract_name, guard))
    }

    async fn create_pending(&self, record: &DocumentRecord) -> Result<(), IngestError> {
        let name = &record.contract_name;
        match self.index.create_document(record).await {
            Ok(_) => return Ok(()),
            Err(SearchError::Conflict(_)) => {}
            Err(error) => return Err(IngestError::IndexWrite(error.to_string())),
        }

        let existing = self
            .index
            .get_document(name)
            .await
            .map_err(|error| IngestError::IndexWrite(error.to_string()))?;
        if let Some(existing) = existing {
            if existing.record.status != DocumentStatus::Failed {
                return Err(IngestError::AlreadyExists(name.clone()));
            }

            info!(contract_name = %name, "replacing failed upload");
            self.index
                .delete_pages(name)
                .await
                .map_err(|error| IngestError::IndexWrite(error.to_string()))?;
            self.index
                .delete_document(name)
                .await
                .map_err(|error| IngestError::IndexWrite(error.to_string()))?;
        }

        match self.index.create_document(record).await {
            Ok(_) => Ok(()),
            Err(SearchError::Conflict(_)) => Err(IngestError::AlreadyExists(name.clone())),
            Err(error) => Err(IngestError::IndexWrite(error.to_string())),
        }
    }

    async fn run(&self, contract_name: &str, bytes: Vec<u8>) -> Result<(), IngestError> {
        match self.process(contract_name, bytes).await {
            Ok(()) => Ok(()),
            Err(failure) => {
                self.record_failure(contract_name, &failure).await;
                Err(failure)
            }
        }
    }

    async fn process(&self, contract_name: &str, bytes: Vec<u8>) -> Result<(), IngestError> {
        self.status
            .advance(contract_name, DocumentStatus::Parsing)
            .await
            .map_err(status_failure)?;

        let extractor = self.extractor.clone();
        let name = contract_name.to_string();
        let pages = tokio::task::spawn_blocking(move || extractor.extract_pages(&name, &bytes))
            .await
            .map_err(|error| IngestError::Extraction(format!("extraction task failed: {error}")))??;
        if pages.iter().all(|page| page.text.trim().is_empty()) {
            return Err(IngestError::Extraction(format!(
                "no extractable text in {} page(s)",
                pages.len()
            )));
        }

        let total_pages = pages.len() as u32;
        self.status
            .advance_with(contract_name, DocumentStatus::Vectorizing, |record| {
                record.total_pages = total_pages;
                record.processed_pages = 0;
            })
            .await
            .map_err(status_failure)?;

        for (written, page) in pages.iter().enumerate() {
            self.index_page(contract_name, page).await?;
            self.status
                .advance_progress(contract_name, written as u32 + 1)
                .await
                .map_err(status_failure)?;
        }

        if self.config.extract_metadata_on_ingest && self.metadata.is_some() {
            self.status
                .advance(contract_name, DocumentStatus::MetadataExtracting)
                .await
                .map_err(status_failure)?;
            if let Err(error) = self.run_metadata(contract_name, &pages).await {
                warn!(contract_name, error = %error, "metadata extraction during ingest failed");
            }
        }

        self.status
            .advance(contract_name, DocumentStatus::Completed)
            .await
            .map_err(status_failure)?;
        info!(contract_name, total_pages, "document indexed");
        Ok(())
    }

    async fn index_page(&self, contract_name: &str, page: &PageText) -> Result<(), IngestError> {
        let dimensions = self.embedder.dimensions();
        let text = page.text.as_str();

        let embedding = retry_with_backoff(&self.config.retry, "embed_page", |_| async move {
            let vector = self.embedder.embed(text).await?;
            validate_embedding(&vector, dimensions)?;
            Ok::<_, EmbeddingError>(vector)
        })
        .await
        .map_err(|error| IngestError::Embedding(format!("page {}: {error}", page.number)))?;

        let record = PageRecord::new(contract_name, page.number, page.text.clone(), embedding);
        retry_with_backoff(&self.config.retry, "write_page", |_| self.index.write_page(&record))
            .await
            .map_err(|error| IngestError::IndexWrite(format!("page {}: {error}", page.number)))?;

        debug!(contract_name, page_id = page.number, chars = record.char_count, "page written");
        Ok(())
    }

    /// Removes partial pages and moves the document to `failed`.
    async fn record_failure(&self, contract_name: &str, failure: &IngestError) {
        let category = failure.category().unwrap_or(FailureCategory::IndexWriteFailed);

        let cleanup = retry_with_backoff(&self.config.retry, "delete_partial_pages", |_| {
            self.index.delete_pages(contract_name)
        })
        .await;
        let detail = match cleanup {
            Ok(removed) => {
                debug!(contract_name, removed, "partial pages removed");
                failure.to_string()
            }
            Err(cleanup_error) => {
                error!(contract_name, error = %cleanup_error, "partial pages could not be removed");
                format!("{failure}; cleanup of partial pages failed: {cleanup_error}")
            }
        };

        let info = FailureInfo::new(category, detail);
        let outcome = self
            .status
            .advance_with(contract_name, DocumentStatus::Failed, |record| {
                record.error = Some(info.clone());
                record.processed_pages = 0;
            })
            .await;

        match outcome {
            Ok(_) => warn!(contract_name, reason = category.as_str(), error = %failure, "ingestion failed"),
            Err(status_error) => {
                error!(contract_name, error = %status_error, "could not record ingestion failure")
            }
        }
    }

    async fn run_metadata(&self, contract_name: &str, pages: &[PageText]) -> Result<MetadataResult, IngestError> {
        let Some(extractor) = self.metadata.as_ref() else {
            return Err(IngestError::Validation("no metadata extractor configured".to_string()));
        };

        let claimed = self
            .status
            .begin_metadata(contract_name, self.config.stale_after)
            .await
            .map_err(status_failure)?;
        let claim = MetadataClaim::new(self.status.clone(), contract_name, claimed.updated_at);

        let text = bounded_document_text(pages, self.config.metadata_char_budget);
        let (outcome, metadata, detail) = match extractor.extract(&text).await {
            Ok(raw) => {
                let mut metadata = raw.normalize();
                if metadata.is_empty() {
                    (MetadataStatus::Empty, None, None)
                } else {
                    if let Some(categories) = &self.categories {
                        categories.apply(&mut metadata);
                    }
                    (MetadataStatus::Extracted, Some(metadata), None)
                }
            }
            Err(MetadataError::EmptyInput) => (MetadataStatus::Empty, None, None),
            Err(error) => {
                warn!(contract_name, error = %error, "metadata extraction failed");
                (MetadataStatus::Failed, None, Some(error.to_string()))
            }
        };

        let finished = self
            .status
            .finish_metadata(contract_name, outcome, metadata, detail)
            .await;
        claim.release();

        let record = match finished {
            Ok(record) => record,
            Err(failure) => {
                let detail = format!("metadata result could not be stored: {failure}");
                if let Err(error) = self.status.abandon_metadata(contract_name, &detail, None).await {
                    error!(contract_name, error = %error, "metadata track left in extracting");
                }
                return Err(status_failure(failure));
            }
        };

        Ok(MetadataResult {
            contract_name: record.contract_name,
            metadata_status: record.metadata_status,
            metadata: record.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::metadata::RawMetadata;
    use crate::stores::testing::InstrumentedIndex;
    use crate::stores::InMemoryIndex;
    use crate::traits::{DocumentStore, KeywordIndex, PageStore};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::fs::{self, File};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::tempdir;

    const PDF: &[u8] = b"%PDF-1.4\n%fake body";

    struct FakeExtractor {
        pages: Vec<&'static str>,
    }

    impl PdfExtractor for FakeExtractor {
        fn extract_pages(&self, _name: &str, _bytes: &[u8]) -> Result<Vec<PageText>, IngestError> {
            Ok(self
                .pages
                .iter()
                .enumerate()
                .map(|(index, text)| PageText {
                    number: index as u32 + 1,
                    text: text.to_string(),
                })
                .collect())
        }
    }

    /// Fails every page whose text contains "poison".
    struct PoisonedEmbedder(CharacterNgramEmbedder);

    #[async_trait]
    impl Embedder for PoisonedEmbedder {
        fn dimensions(&self) -> usize {
            self.0.dimensions
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if text.contains("poison") {
                return Err(EmbeddingError::Unavailable("model offline".to_string()));
            }
            self.0.embed(text).await
        }
    }

    struct StaticMetadata(Result<Value, &'static str>);

    #[async_trait]
    impl MetadataExtractor for StaticMetadata {
        async fn extract(&self, _text: &str) -> Result<RawMetadata, MetadataError> {
            match &self.0 {
                Ok(value) => RawMetadata::from_value(value.clone()),
                Err(message) => Err(MetadataError::Request(message.to_string())),
            }
        }
    }

    struct UnreadableExtractor;

    impl PdfExtractor for UnreadableExtractor {
        fn extract_pages(&self, name: &str, _bytes: &[u8]) -> Result<Vec<PageText>, IngestError> {
            Err(IngestError::Extraction(format!("{name} is encrypted")))
        }
    }

    /// Never answers.
    struct StalledMetadata;

    #[async_trait]
    impl MetadataExtractor for StalledMetadata {
        async fn extract(&self, _text: &str) -> Result<RawMetadata, MetadataError> {
            std::future::pending().await
        }
    }

    fn config() -> IndexerConfig {
        IndexerConfig {
            retry: RetryPolicy::no_delay(1),
            ..IndexerConfig::default()
        }
    }

    fn indexer_over<I: ContractIndex + 'static>(index: Arc<I>, pages: Vec<&'static str>) -> PageIndexer {
        PageIndexer::new(
            index,
            Arc::new(PoisonedEmbedder(CharacterNgramEmbedder { dimensions: 16 })),
            Arc::new(FakeExtractor { pages }),
            config(),
        )
    }

    #[test]
    fn discover_pdf_files_is_recursive() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.pdf")).and_then(|mut file| file.write_all(PDF))?;
        File::create(nested.join("b.PDF")).and_then(|mut file| file.write_all(PDF))?;
        File::create(base.join("notes.txt")).and_then(|mut file| file.write_all(b"skip"))?;

        let files = discover_pdf_files(base);
        assert_eq!(files.len(), 2);
        Ok(())
    }

    #[test]
    fn digest_is_reproducible() {
        assert_eq!(digest_bytes(b"abc"), digest_bytes(b"abc"));
        assert_ne!(digest_bytes(b"abc"), digest_bytes(b"abd"));
    }

    #[tokio::test]
    async fn three_page_document_walks_the_status_track() {
        let index = Arc::new(InstrumentedIndex::default());
        let indexer = indexer_over(index.clone(), vec!["alpha", "bravo", "charlie"]);

        let report = indexer.ingest_and_wait("uploads/X.pdf", PDF.to_vec()).await.unwrap();
        assert_eq!(report.contract_name, "X");
        assert_eq!(report.status, DocumentStatus::Completed);
        assert_eq!(report.total_pages, 3);
        assert_eq!(report.processed_pages, 3);

        use DocumentStatus::*;
        assert_eq!(
            index.statuses(),
            vec![
                (Pending, 0),
                (Parsing, 0),
                (Vectorizing, 0),
                (Vectorizing, 1),
                (Vectorizing, 2),
                (Vectorizing, 3),
                (Completed, 3),
            ]
        );

        let ids: Vec<u32> = index
            .list_pages("X")
            .await
            .unwrap()
            .iter()
            .map(|page| page.page_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let stored = index.get_document("X").await.unwrap().unwrap().record;
        assert_eq!(stored.file_name, "X.pdf");
        assert_eq!(stored.file_size, PDF.len() as u64);
    }

    #[tokio::test]
    async fn failing_page_leaves_no_pages_behind() {
        let index = Arc::new(InMemoryIndex::new());
        let indexer = indexer_over(index.clone(), vec!["one", "two", "poison", "four"]);

        let report = indexer.ingest_and_wait("broken.pdf", PDF.to_vec()).await.unwrap();
        assert_eq!(report.status, DocumentStatus::Failed);
        assert_eq!(report.processed_pages, 0);
        let failure = report.error.unwrap();
        assert_eq!(failure.category, FailureCategory::EmbeddingFailed);
        assert!(failure.detail.contains("page 3"));

        assert!(index.list_pages("broken").await.unwrap().is_empty());
        assert!(index.search_pages_keyword("one", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_pdf_bytes_are_rejected_before_any_record_exists() {
        let index = Arc::new(InMemoryIndex::new());
        let indexer = indexer_over(index.clone(), vec!["text"]);

        let result = indexer.ingest("notes.pdf", b"plain text".to_vec()).await;
        assert!(matches!(result, Err(IngestError::Validation(_))));
        assert!(index.list_documents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reupload_policy_depends_on_prior_outcome() {
        let index = Arc::new(InMemoryIndex::new());
        let good = indexer_over(index.clone(), vec!["fine"]);
        good.ingest_and_wait("a.pdf", PDF.to_vec()).await.unwrap();

        let again = good.ingest_and_wait("a.PDF", PDF.to_vec()).await;
        assert!(matches!(again, Err(IngestError::AlreadyExists(_))));

        let bad = indexer_over(index.clone(), vec!["poison"]);
        let failed = bad.ingest_and_wait("b.pdf", PDF.to_vec()).await.unwrap();
        assert_eq!(failed.status, DocumentStatus::Failed);

        let retried = good.ingest_and_wait("b.pdf", PDF.to_vec()).await.unwrap();
        assert_eq!(retried.status, DocumentStatus::Completed);
        assert!(retried.error.is_none());
        assert_eq!(index.list_documents().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn exclusive_reset_blocks_new_writers_until_released() {
        let index = Arc::new(InMemoryIndex::new());
        let indexer = indexer_over(index, vec!["page"]);
        let locks = indexer.locks();

        let writer = locks.try_acquire("a").unwrap();
        assert!(locks.try_acquire_all().is_none());
        drop(writer);

        let reset = locks.try_acquire_all().unwrap();
        assert!(locks.try_acquire_all().is_none());
        assert!(locks.try_acquire("a").is_none());
        let result = indexer.ingest("b.pdf", PDF.to_vec()).await;
        assert!(matches!(result, Err(IngestError::Busy(_))));

        drop(reset);
        assert!(locks.try_acquire("a").is_some());
    }

    #[tokio::test]
    async fn concurrent_upload_of_same_name_is_busy() {
        let index = Arc::new(InMemoryIndex::new());
        let indexer = indexer_over(index, vec!["page"]);

        let _held = indexer.locks().try_acquire("a").unwrap();
        let result = indexer.ingest("a.pdf", PDF.to_vec()).await;
        assert!(matches!(result, Err(IngestError::Busy(_))));
    }

    #[tokio::test]
    async fn background_ingest_acknowledges_pending_then_completes() {
        let index = Arc::new(InMemoryIndex::new());
        let indexer = indexer_over(index.clone(), vec!["one", "two"]);

        let ack = indexer.ingest("async.pdf", PDF.to_vec()).await.unwrap();
        assert_eq!(ack.status, DocumentStatus::Pending);
        assert_eq!(ack.total_pages, 0);

        let mut status = DocumentStatus::Pending;
        for _ in 0..200 {
            status = index.get_document("async").await.unwrap().unwrap().record.status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, DocumentStatus::Completed);
    }

    #[tokio::test]
    async fn metadata_outcomes_never_touch_document_status() {
        let index = Arc::new(InMemoryIndex::new());
        let base = indexer_over(index.clone(), vec!["Party A: Acme Bank", "amount 2000"]);
        base.ingest_and_wait("deal.pdf", PDF.to_vec()).await.unwrap();

        let extracted = base
            .clone()
            .with_metadata_extractor(Arc::new(StaticMetadata(Ok(json!({
                "party_a": "Acme Bank",
                "contract_amount": "2,000"
            })))))
            .extract_metadata("deal.pdf")
            .await
            .unwrap();
        assert_eq!(extracted.metadata_status, MetadataStatus::Extracted);
        assert_eq!(extracted.metadata.unwrap().contract_amount, Some(2000.0));

        let failed = base
            .clone()
            .with_metadata_extractor(Arc::new(StaticMetadata(Err("timeout"))))
            .extract_metadata("deal")
            .await
            .unwrap();
        assert_eq!(failed.metadata_status, MetadataStatus::Failed);

        let record = index.get_document("deal").await.unwrap().unwrap().record;
        assert_eq!(record.status, DocumentStatus::Completed);
        assert!(record.metadata.is_some());

        let empty = base
            .clone()
            .with_metadata_extractor(Arc::new(StaticMetadata(Ok(json!({ "party_a": null })))))
            .extract_metadata("deal")
            .await
            .unwrap();
        assert_eq!(empty.metadata_status, MetadataStatus::Empty);
        assert!(empty.metadata.is_none());
    }

    #[tokio::test]
    async fn metadata_on_ingest_passes_through_extracting() {
        let index = Arc::new(InstrumentedIndex::default());
        let indexer = PageIndexer::new(
            index.clone(),
            Arc::new(CharacterNgramEmbedder { dimensions: 16 }),
            Arc::new(FakeExtractor { pages: vec!["text"] }),
            IndexerConfig {
                extract_metadata_on_ingest: true,
                ..config()
            },
        )
        .with_metadata_extractor(Arc::new(StaticMetadata(Err("llm down"))));

        let report = indexer.ingest_and_wait("m.pdf", PDF.to_vec()).await.unwrap();
        assert_eq!(report.status, DocumentStatus::Completed);
        assert_eq!(report.metadata_status, MetadataStatus::Failed);

        assert!(index
            .statuses()
            .iter()
            .any(|(status, _)| *status == DocumentStatus::MetadataExtracting));
    }

    #[tokio::test]
    async fn metadata_requires_an_indexed_document() {
        let index = Arc::new(InMemoryIndex::new());
        let indexer = indexer_over(index, vec!["x"])
            .with_metadata_extractor(Arc::new(StaticMetadata(Ok(json!({})))));

        let missing = indexer.extract_metadata("ghost.pdf").await;
        assert!(matches!(missing, Err(IngestError::NotFound(_))));
    }

    #[tokio::test]
    async fn documents_without_text_fail_extraction() {
        let index = Arc::new(InMemoryIndex::new());

        let no_pages = indexer_over(index.clone(), vec![]);
        let report = no_pages.ingest_and_wait("hollow.pdf", PDF.to_vec()).await.unwrap();
        assert_eq!(report.status, DocumentStatus::Failed);
        assert_eq!(report.error.unwrap().category, FailureCategory::ExtractionFailed);

        let blank = indexer_over(index.clone(), vec!["  ", "\n"]);
        let report = blank.ingest_and_wait("scanned.pdf", PDF.to_vec()).await.unwrap();
        assert_eq!(report.status, DocumentStatus::Failed);
        assert_eq!(report.error.unwrap().category, FailureCategory::ExtractionFailed);
        assert!(index.list_pages("scanned").await.unwrap().is_empty());

        let unreadable = PageIndexer::new(
            index.clone(),
            Arc::new(CharacterNgramEmbedder { dimensions: 16 }),
            Arc::new(UnreadableExtractor),
            config(),
        );
        let report = unreadable.ingest_and_wait("locked.pdf", PDF.to_vec()).await.unwrap();
        assert_eq!(report.status, DocumentStatus::Failed);
        let failure = report.error.unwrap();
        assert_eq!(failure.category, FailureCategory::ExtractionFailed);
        assert!(failure.detail.contains("encrypted"));
    }

    #[tokio::test]
    async fn persistent_page_write_failure_is_an_index_write_failure() {
        let index = Arc::new(InstrumentedIndex::default());
        index.fail_page_writes.store(true, Ordering::SeqCst);
        let indexer = indexer_over(index.clone(), vec!["one", "two"]);

        let report = indexer.ingest_and_wait("w.pdf", PDF.to_vec()).await.unwrap();
        assert_eq!(report.status, DocumentStatus::Failed);
        assert_eq!(report.processed_pages, 0);
        let failure = report.error.unwrap();
        assert_eq!(failure.category, FailureCategory::IndexWriteFailed);
        assert!(failure.detail.contains("page 1"));
        assert!(index.list_pages("w").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_page_write_failure_is_retried() {
        let index = Arc::new(InstrumentedIndex::default());
        index.transient_page_write_failures.store(1, Ordering::SeqCst);
        let indexer = indexer_over(index.clone(), vec!["one", "two"]);

        let report = indexer.ingest_and_wait("flaky.pdf", PDF.to_vec()).await.unwrap();
        assert_eq!(report.status, DocumentStatus::Completed);
        assert_eq!(report.processed_pages, 2);
        assert!(report.error.is_none());
        assert_eq!(index.list_pages("flaky").await.unwrap().len(), 2);
        assert!(!index
            .statuses()
            .iter()
            .any(|(status, _)| *status == DocumentStatus::Failed));
    }

    #[tokio::test]
    async fn interrupted_metadata_extraction_is_settled_and_can_rerun() {
        let index = Arc::new(InMemoryIndex::new());
        let base = indexer_over(index.clone(), vec!["Party A: Acme Bank"]);
        base.ingest_and_wait("deal.pdf", PDF.to_vec()).await.unwrap();

        let stalled = base.clone().with_metadata_extractor(Arc::new(StalledMetadata));
        let timed_out =
            tokio::time::timeout(Duration::from_millis(50), stalled.extract_metadata("deal")).await;
        assert!(timed_out.is_err());

        let mut record = index.get_document("deal").await.unwrap().unwrap().record;
        for _ in 0..100 {
            if record.metadata_status != MetadataStatus::Extracting {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            record = index.get_document("deal").await.unwrap().unwrap().record;
        }
        assert_eq!(record.metadata_status, MetadataStatus::Failed);
        assert_eq!(record.status, DocumentStatus::Completed);
        assert!(record.metadata_error.unwrap().contains("interrupted"));

        let rerun = base
            .with_metadata_extractor(Arc::new(StaticMetadata(Ok(json!({ "party_a": "Acme Bank" })))))
            .extract_metadata("deal")
            .await
            .unwrap();
        assert_eq!(rerun.metadata_status, MetadataStatus::Extracted);
    }

    #[tokio::test]
    async fn unstorable_metadata_result_settles_the_track_as_failed() {
        let index = Arc::new(InstrumentedIndex::default());
        let base = indexer_over(index.clone(), vec!["Party A: Acme Bank"]);
        base.ingest_and_wait("deal.pdf", PDF.to_vec()).await.unwrap();

        let indexer = base
            .with_metadata_extractor(Arc::new(StaticMetadata(Ok(json!({ "party_a": "Acme Bank" })))));
        index
            .metadata_write_conflicts
            .store(config().status_update_attempts, Ordering::SeqCst);

        let result = indexer.extract_metadata("deal").await;
        assert!(matches!(result, Err(IngestError::IndexWrite(_))));

        let record = index.get_document("deal").await.unwrap().unwrap().record;
        assert_eq!(record.metadata_status, MetadataStatus::Failed);
        assert!(record.metadata_error.unwrap().contains("could not be stored"));

        let retried = indexer.extract_metadata("deal").await.unwrap();
        assert_eq!(retried.metadata_status, MetadataStatus::Extracted);
    }

    #[tokio::test]
    async fn saved_metadata_is_normalized_and_marked_extracted() {
        let index = Arc::new(InMemoryIndex::new());
        let indexer = indexer_over(index.clone(), vec!["service agreement"]);
        indexer.ingest_and_wait("deal.pdf", PDF.to_vec()).await.unwrap();

        let edited = ContractMetadata {
            customer_name: Some("  Acme Bank ".to_string()),
            contract_type: Some("N/A".to_string()),
            contract_amount: Some(1500.0),
            signing_date: Some("2023/05/01".to_string()),
            category_primary: Some("Finance".to_string()),
            ..ContractMetadata::default()
        };
        let saved = indexer.save_metadata("uploads/deal.pdf", edited).await.unwrap();
        assert_eq!(saved.contract_name, "deal");
        assert_eq!(saved.metadata_status, MetadataStatus::Extracted);

        let metadata = saved.metadata.unwrap();
        assert_eq!(metadata.customer_name.as_deref(), Some("Acme Bank"));
        assert_eq!(metadata.contract_type, None);
        assert_eq!(metadata.contract_amount, Some(1500.0));
        assert_eq!(metadata.signing_date.as_deref(), Some("2023-05-01"));
        assert_eq!(metadata.category_primary.as_deref(), Some("Finance"));
        assert!(metadata.extracted_at.is_some());

        let record = index.get_document("deal").await.unwrap().unwrap().record;
        assert_eq!(record.status, DocumentStatus::Completed);
        assert_eq!(record.metadata_status, MetadataStatus::Extracted);
        assert!(record.metadata_error.is_none());

        let cleared = indexer.save_metadata("deal", ContractMetadata::default()).await.unwrap();
        assert_eq!(cleared.metadata_status, MetadataStatus::Empty);
        assert!(cleared.metadata.is_none());
    }

    #[tokio::test]
    async fn saving_metadata_needs_an_idle_existing_document() {
        let index = Arc::new(InMemoryIndex::new());
        let indexer = indexer_over(index.clone(), vec!["text"]);
        indexer.ingest_and_wait("deal.pdf", PDF.to_vec()).await.unwrap();

        let missing = indexer.save_metadata("ghost", ContractMetadata::default()).await;
        assert!(matches!(missing, Err(IngestError::NotFound(_))));

        let _held = indexer.locks().try_acquire("deal").unwrap();
        let busy = indexer.save_metadata("deal", ContractMetadata::default()).await;
        assert!(matches!(busy, Err(IngestError::Busy(_))));
    }
}
