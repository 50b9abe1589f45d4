//! In-memory index used by tests and single-process setups.
//!
//! Documents and pages live in `RwLock`-guarded maps. Lexical scoring is term-frequency
//! based, vector scoring is brute-force cosine similarity. Every stored document carries
//! a sequence number that serves as its compare-and-set version.

use crate::highlight::{lexical_score, metadata_score};
use crate::models::{
    DocVersion, DocumentRecord, MetadataCandidate, PageCandidate, PageRecord, VersionedDocument,
};
use crate::traits::{DocumentStore, KeywordIndex, PageStore, VectorIndex};
use crate::SearchError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{PoisonError, RwLock};

const PRIMARY_TERM: i64 = 1;

struct StoredDocument {
    record: DocumentRecord,
    seq_no: i64,
}

pub struct InMemoryIndex {
    documents: RwLock<HashMap<String, StoredDocument>>,
    pages: RwLock<BTreeMap<(String, u32), PageRecord>>,
    next_seq_no: AtomicI64,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            pages: RwLock::new(BTreeMap::new()),
            next_seq_no: AtomicI64::new(1),
        }
    }

    fn bump(&self) -> i64 {
        self.next_seq_no.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn version(seq_no: i64) -> DocVersion {
    DocVersion {
        seq_no,
        primary_term: PRIMARY_TERM,
    }
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

fn query_terms(query: &str) -> Vec<String> {
    crate::models::SearchQuery::new(query, 1).terms()
}

fn rank_pages(mut candidates: Vec<PageCandidate>, limit: usize) -> Vec<PageCandidate> {
    candidates.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.contract_name.cmp(&right.contract_name))
            .then_with(|| left.page_id.cmp(&right.page_id))
    });
    candidates.truncate(limit);
    candidates
}

#[async_trait]
impl DocumentStore for InMemoryIndex {
    async fn create_document(&self, record: &DocumentRecord) -> Result<DocVersion, SearchError> {
        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        if documents.contains_key(&record.contract_name) {
            return Err(SearchError::Conflict(record.contract_name.clone()));
        }
        let seq_no = self.bump();
        documents.insert(
            record.contract_name.clone(),
            StoredDocument {
                record: record.clone(),
                seq_no,
            },
        );
        Ok(version(seq_no))
    }

    async fn get_document(&self, contract_name: &str) -> Result<Option<VersionedDocument>, SearchError> {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        Ok(documents.get(contract_name).map(|stored| VersionedDocument {
            record: stored.record.clone(),
            version: version(stored.seq_no),
        }))
    }

    async fn get_documents(&self, contract_names: &[String]) -> Result<Vec<DocumentRecord>, SearchError> {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        Ok(contract_names
            .iter()
            .filter_map(|name| documents.get(name).map(|stored| stored.record.clone()))
            .collect())
    }

    async fn list_documents(&self) -> Result<Vec<DocumentRecord>, SearchError> {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        Ok(documents.values().map(|stored| stored.record.clone()).collect())
    }

    async fn replace_document(
        &self,
        record: &DocumentRecord,
        expected: DocVersion,
    ) -> Result<DocVersion, SearchError> {
        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        let stored = documents
            .get_mut(&record.contract_name)
            .ok_or_else(|| SearchError::NotFound(record.contract_name.clone()))?;

        if version(stored.seq_no) != expected {
            return Err(SearchError::Conflict(record.contract_name.clone()));
        }

        stored.record = record.clone();
        stored.seq_no = self.bump();
        Ok(version(stored.seq_no))
    }

    async fn delete_document(&self, contract_name: &str) -> Result<bool, SearchError> {
        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        Ok(documents.remove(contract_name).is_some())
    }

    async fn clear_documents(&self) -> Result<u64, SearchError> {
        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        let removed = documents.len() as u64;
        documents.clear();
        Ok(removed)
    }
}

#[async_trait]
impl PageStore for InMemoryIndex {
    async fn write_page(&self, page: &PageRecord) -> Result<(), SearchError> {
        let mut pages = self.pages.write().unwrap_or_else(PoisonError::into_inner);
        pages.insert((page.contract_name.clone(), page.page_id), page.clone());
        Ok(())
    }

    async fn list_pages(&self, contract_name: &str) -> Result<Vec<PageRecord>, SearchError> {
        let pages = self.pages.read().unwrap_or_else(PoisonError::into_inner);
        Ok(pages
            .range((contract_name.to_string(), 0)..=(contract_name.to_string(), u32::MAX))
            .map(|(_, page)| page.clone())
            .collect())
    }

    async fn delete_pages(&self, contract_name: &str) -> Result<u64, SearchError> {
        let mut pages = self.pages.write().unwrap_or_else(PoisonError::into_inner);
        let before = pages.len();
        pages.retain(|(name, _), _| name != contract_name);
        Ok((before - pages.len()) as u64)
    }

    async fn clear_pages(&self) -> Result<u64, SearchError> {
        let mut pages = self.pages.write().unwrap_or_else(PoisonError::into_inner);
        let removed = pages.len() as u64;
        pages.clear();
        Ok(removed)
    }
}

impl InMemoryIndex {
    fn keyword_pages(&self, contract_name: Option<&str>, query: &str, limit: usize) -> Vec<PageCandidate> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Vec::new();
        }

        let pages = self.pages.read().unwrap_or_else(PoisonError::into_inner);
        let candidates = pages
            .values()
            .filter(|page| contract_name.map_or(true, |name| page.contract_name == name))
            .filter_map(|page| {
                let score = lexical_score(&page.text, &terms);
                (score > 0.0).then(|| PageCandidate {
                    contract_name: page.contract_name.clone(),
                    page_id: page.page_id,
                    text: page.text.clone(),
                    score,
                })
            })
            .collect();

        rank_pages(candidates, limit)
    }

    fn vector_pages(&self, contract_name: Option<&str>, query_vector: &[f32], limit: usize) -> Vec<PageCandidate> {
        let pages = self.pages.read().unwrap_or_else(PoisonError::into_inner);
        let candidates = pages
            .values()
            .filter(|page| contract_name.map_or(true, |name| page.contract_name == name))
            .map(|page| PageCandidate {
                contract_name: page.contract_name.clone(),
                page_id: page.page_id,
                text: page.text.clone(),
                score: cosine_similarity(query_vector, &page.embedding) as f64,
            })
            .collect();

        rank_pages(candidates, limit)
    }
}

#[async_trait]
impl KeywordIndex for InMemoryIndex {
    async fn search_pages_keyword(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<PageCandidate>, SearchError> {
        Ok(self.keyword_pages(None, query, limit))
    }

    async fn search_contract_pages_keyword(
        &self,
        contract_name: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<PageCandidate>, SearchError> {
        Ok(self.keyword_pages(Some(contract_name), query, limit))
    }

    async fn search_metadata(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MetadataCandidate>, SearchError> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        let mut candidates: Vec<MetadataCandidate> = documents
            .values()
            .filter_map(|stored| {
                let metadata = stored.record.metadata.as_ref()?;
                let score = metadata_score(metadata, &terms);
                (score > 0.0).then(|| MetadataCandidate {
                    contract_name: stored.record.contract_name.clone(),
                    score,
                })
            })
            .collect();

        candidates.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.contract_name.cmp(&right.contract_name))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn search_pages_vector(
        &self,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<PageCandidate>, SearchError> {
        Ok(self.vector_pages(None, query_vector, limit))
    }

    async fn search_contract_pages_vector(
        &self,
        contract_name: &str,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<PageCandidate>, SearchError> {
        Ok(self.vector_pages(Some(contract_name), query_vector, limit))
    }
}
