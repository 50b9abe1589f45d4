use crate::config::{DegradationPolicy, Normalization, PageAggregation, RankingConfig};
use crate::embeddings::Embedder;
use crate::highlight::{find_term_spans, metadata_highlights};
use crate::models::{
    ChunkHit, ContractMetadata, ContractResult, DocumentRecord, DocumentStatus, MetadataCandidate,
    PageCandidate, SearchFilters, SearchMode, SearchQuery, SearchResult,
};
use crate::traits::ContractIndex;
use crate::SearchError;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Ranks whole contracts by blending lexical, vector and metadata evidence.
pub struct HybridSearchEngine {
    index: Arc<dyn ContractIndex>,
    embedder: Arc<dyn Embedder>,
    config: RankingConfig,
}

struct Candidates {
    keyword: Vec<PageCandidate>,
    vector: Vec<PageCandidate>,
    metadata: Vec<MetadataCandidate>,
    /// Completed contracts that pass the filters, by name.
    records: BTreeMap<String, DocumentRecord>,
    degraded: Vec<SearchMode>,
    /// No stream has more hits beyond this round's limit.
    exhausted: bool,
}

#[derive(Debug, Default)]
struct PageScore {
    text: String,
    lexical: f64,
    vector: f64,
}

impl HybridSearchEngine {
    pub fn new<I>(index: Arc<I>, embedder: Arc<dyn Embedder>, config: RankingConfig) -> Self
    where
        I: ContractIndex + 'static,
    {
        Self {
            index,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    pub fn validate(&self, query: &SearchQuery) -> Result<(), SearchError> {
        if query.top_k == 0 || query.top_k > self.config.max_top_k {
            return Err(SearchError::Validation(format!(
                "top_k must be between 1 and {}, got {}",
                self.config.max_top_k, query.top_k
            )));
        }

        let filters = &query.filters;
        for amount in [filters.amount_min, filters.amount_max].into_iter().flatten() {
            if !amount.is_finite() {
                return Err(SearchError::Validation("amount bounds must be finite".to_string()));
            }
        }
        if let (Some(min), Some(max)) = (filters.amount_min, filters.amount_max) {
            if min > max {
                return Err(SearchError::Validation(format!(
                    "amount_min {min} is greater than amount_max {max}"
                )));
            }
        }
        if let (Some(start), Some(end)) = (filters.date_start, filters.date_end) {
            if start > end {
                return Err(SearchError::Validation(format!(
                    "date_start {start} is after date_end {end}"
                )));
            }
        }
        Ok(())
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResult, SearchError> {
        self.validate(query)?;

        let terms = query.terms();
        let (contracts, degraded) = if terms.is_empty() {
            (self.list_eligible(query, &terms).await?, Vec::new())
        } else {
            self.rank_matches(query, &terms).await?
        };

        if query.explain {
            for contract in &contracts {
                debug!(
                    contract_name = %contract.contract_name,
                    score = contract.score,
                    content = contract.content_score,
                    metadata = contract.metadata_score.unwrap_or_default(),
                    pages = contract.chunks.len(),
                    "ranked contract"
                );
            }
        }

        let mode_weights = if query.explain {
            vec![
                ("lexical".to_string(), self.config.lexical_weight),
                ("vector".to_string(), self.config.vector_weight),
                ("content".to_string(), self.config.content_weight),
                ("metadata".to_string(), self.config.metadata_weight),
            ]
        } else {
            Vec::new()
        };

        Ok(SearchResult {
            query: query.text.clone(),
            mode_weights,
            degraded,
            contracts,
        })
    }

    /// Filters-only search: every completed contract passing the filters, score 0.
    async fn list_eligible(&self, query: &SearchQuery, terms: &[String]) -> Result<Vec<ContractResult>, SearchError> {
        let mut contracts: Vec<ContractResult> = self
            .index
            .list_documents()
            .await?
            .iter()
            .filter(|record| is_eligible(record, &query.filters))
            .map(|record| self.rank_contract(record, &BTreeMap::new(), &HashMap::new(), terms))
            .collect();
        sort_contracts(&mut contracts);
        contracts.truncate(query.top_k);
        Ok(contracts)
    }

    async fn rank_matches(
        &self,
        query: &SearchQuery,
        terms: &[String],
    ) -> Result<(Vec<ContractResult>, Vec<SearchMode>), SearchError> {
        let query_vector = self
            .embedder
            .embed(&query.text)
            .await
            .map_err(|error| format!("query embedding failed: {error}"));

        let mut limit = self.config.candidate_pool.max(query.top_k);
        let Candidates {
            mut keyword,
            mut vector,
            metadata,
            records,
            mut degraded,
            ..
        } = loop {
            let candidates = self.retrieve(query, &query_vector, limit).await?;
            let ceiling = self.config.max_candidate_pool.max(query.top_k);
            if candidates.records.len() >= query.top_k || candidates.exhausted || limit >= ceiling {
                break candidates;
            }
            debug!(
                limit,
                eligible = candidates.records.len(),
                "widening candidate pool"
            );
            limit = limit.saturating_mul(2).min(ceiling);
        };

        let metadata_scores = self.metadata_scores(metadata);

        let pages = self.merge_pages(keyword.clone(), vector.clone());
        let mut ranked: Vec<ContractResult> = records
            .values()
            .map(|record| self.rank_contract(record, &pages, &metadata_scores, terms))
            .collect();
        sort_contracts(&mut ranked);
        ranked.truncate(query.top_k);

        let selected: Vec<&DocumentRecord> = ranked
            .iter()
            .filter_map(|contract| records.get(&contract.contract_name))
            .collect();
        self.complete_pages(query, &query_vector, &selected, &mut keyword, &mut vector, &mut degraded)
            .await?;

        let pages = self.merge_pages(keyword, vector);
        let mut contracts: Vec<ContractResult> = selected
            .into_iter()
            .map(|record| self.rank_contract(record, &pages, &metadata_scores, terms))
            .collect();
        sort_contracts(&mut contracts);

        Ok((contracts, degraded))
    }

    /// One round of the three streams at `limit` hits each, reduced to eligible contracts.
    async fn retrieve(
        &self,
        query: &SearchQuery,
        query_vector: &Result<Vec<f32>, String>,
        limit: usize,
    ) -> Result<Candidates, SearchError> {
        let keyword = self.index.search_pages_keyword(&query.text, limit);
        let vector = async {
            match query_vector {
                Ok(query_vector) => self.index.search_pages_vector(query_vector, limit).await,
                Err(details) => Err(SearchError::Request(details.clone())),
            }
        };
        let metadata = self.index.search_metadata(&query.text, limit);

        let (keyword, vector, metadata) = tokio::join!(keyword, vector, metadata);

        let mut degraded = Vec::new();
        let mut keyword = self.settle(SearchMode::Keyword, keyword, &mut degraded)?;
        let vector = self.settle(SearchMode::Vector, vector, &mut degraded)?;
        let mut metadata = self.settle(SearchMode::Metadata, metadata, &mut degraded)?;
        if degraded.len() == 3 {
            return Err(SearchError::NotReady("every search stream failed".to_string()));
        }

        let threshold = self.config.vector_min_similarity;
        let exhausted = keyword.len() < limit
            && metadata.len() < limit
            && (vector.len() < limit || vector.iter().any(|hit| hit.score < threshold));
        let mut vector: Vec<PageCandidate> = vector
            .into_iter()
            .filter(|hit| hit.score >= threshold)
            .collect();

        let mut names: Vec<String> = keyword
            .iter()
            .chain(vector.iter())
            .map(|hit| hit.contract_name.clone())
            .chain(metadata.iter().map(|hit| hit.contract_name.clone()))
            .collect();
        names.sort();
        names.dedup();

        let records: BTreeMap<String, DocumentRecord> = self
            .index
            .get_documents(&names)
            .await?
            .into_iter()
            .filter(|record| is_eligible(record, &query.filters))
            .map(|record| (record.contract_name.clone(), record))
            .collect();

        keyword.retain(|hit| records.contains_key(&hit.contract_name));
        vector.retain(|hit| records.contains_key(&hit.contract_name));
        metadata.retain(|hit| records.contains_key(&hit.contract_name));

        Ok(Candidates {
            keyword,
            vector,
            metadata,
            records,
            degraded,
            exhausted,
        })
    }

    /// Adds every matching page of the selected contracts that the global pool cut off.
    async fn complete_pages(
        &self,
        query: &SearchQuery,
        query_vector: &Result<Vec<f32>, String>,
        selected: &[&DocumentRecord],
        keyword: &mut Vec<PageCandidate>,
        vector: &mut Vec<PageCandidate>,
        degraded: &mut Vec<SearchMode>,
    ) -> Result<(), SearchError> {
        let threshold = self.config.vector_min_similarity;

        for record in selected {
            let name = record.contract_name.as_str();
            let limit = (record.total_pages as usize).max(1);

            if !degraded.contains(&SearchMode::Keyword) {
                let hits = self
                    .index
                    .search_contract_pages_keyword(name, &query.text, limit)
                    .await;
                let hits = self.settle(SearchMode::Keyword, hits, degraded)?;
                absorb(keyword, hits);
            }

            if !degraded.contains(&SearchMode::Vector) {
                if let Ok(query_vector) = query_vector {
                    let hits = self
                        .index
                        .search_contract_pages_vector(name, query_vector, limit)
                        .await;
                    let hits: Vec<PageCandidate> = self
                        .settle(SearchMode::Vector, hits, degraded)?
                        .into_iter()
                        .filter(|hit| hit.score >= threshold)
                        .collect();
                    absorb(vector, hits);
                }
            }
        }
        Ok(())
    }

    fn metadata_scores(&self, metadata: Vec<MetadataCandidate>) -> HashMap<String, f64> {
        let normalized = normalize_scores(
            &metadata.iter().map(|hit| hit.score).collect::<Vec<_>>(),
            self.config.normalization,
        );
        metadata
            .into_iter()
            .zip(normalized)
            .map(|(hit, score)| (hit.contract_name, score))
            .collect()
    }

    fn settle<T>(
        &self,
        mode: SearchMode,
        outcome: Result<Vec<T>, SearchError>,
        degraded: &mut Vec<SearchMode>,
    ) -> Result<Vec<T>, SearchError> {
        match outcome {
            Ok(hits) => Ok(hits),
            Err(error) => match self.config.degradation {
                DegradationPolicy::FailFast => Err(error),
                DegradationPolicy::BestEffort => {
                    warn!(mode = mode.as_str(), error = %error, "search stream unavailable, ranking without it");
                    if !degraded.contains(&mode) {
                        degraded.push(mode);
                    }
                    Ok(Vec::new())
                }
            },
        }
    }

    /// Page-level matches keyed by `(contract_name, page_id)`, each stream normalized on its own.
    fn merge_pages(
        &self,
        keyword: Vec<PageCandidate>,
        vector: Vec<PageCandidate>,
    ) -> BTreeMap<(String, u32), PageScore> {
        let mut pages: BTreeMap<(String, u32), PageScore> = BTreeMap::new();

        let lexical = normalize_scores(
            &keyword.iter().map(|hit| hit.score).collect::<Vec<_>>(),
            self.config.normalization,
        );
        for (hit, score) in keyword.into_iter().zip(lexical) {
            let entry = pages.entry((hit.contract_name, hit.page_id)).or_default();
            entry.text = hit.text;
            entry.lexical = score;
        }

        let similarity = normalize_scores(
            &vector.iter().map(|hit| hit.score).collect::<Vec<_>>(),
            self.config.normalization,
        );
        for (hit, score) in vector.into_iter().zip(similarity) {
            let entry = pages.entry((hit.contract_name, hit.page_id)).or_default();
            if entry.text.is_empty() {
                entry.text = hit.text;
            }
            entry.vector = score;
        }

        pages
    }

    fn rank_contract(
        &self,
        record: &DocumentRecord,
        pages: &BTreeMap<(String, u32), PageScore>,
        metadata_scores: &HashMap<String, f64>,
        terms: &[String],
    ) -> ContractResult {
        let range = (record.contract_name.clone(), 0)..=(record.contract_name.clone(), u32::MAX);
        let mut chunks: Vec<ChunkHit> = pages
            .range(range)
            .map(|((_, page_id), page)| ChunkHit {
                page_id: *page_id,
                score: self.config.lexical_weight * page.lexical + self.config.vector_weight * page.vector,
                lexical_score: page.lexical,
                vector_score: page.vector,
                highlights: find_term_spans(&page.text, terms),
                text: page.text.clone(),
            })
            .collect();
        chunks.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.page_id.cmp(&right.page_id))
        });

        let page_scores: Vec<f64> = chunks.iter().map(|chunk| chunk.score).collect();
        let content_score = aggregate(&page_scores, self.config.page_aggregation);
        let metadata_score = metadata_scores.get(&record.contract_name).copied();
        let score = self.config.content_weight * content_score
            + self.config.metadata_weight * metadata_score.unwrap_or(0.0);

        let highlights = record
            .metadata
            .as_ref()
            .map(|metadata| metadata_highlights(metadata, terms))
            .unwrap_or_default();

        ContractResult {
            contract_name: record.contract_name.clone(),
            score,
            content_score,
            metadata_score,
            metadata_info: record.metadata.clone(),
            metadata_highlights: highlights,
            chunks,
        }
    }
}

fn is_eligible(record: &DocumentRecord, filters: &SearchFilters) -> bool {
    record.status == DocumentStatus::Completed && passes_filters(record.metadata.as_ref(), filters)
}

fn sort_contracts(contracts: &mut [ContractResult]) {
    contracts.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.contract_name.cmp(&right.contract_name))
    });
}

fn absorb(pool: &mut Vec<PageCandidate>, hits: Vec<PageCandidate>) {
    for hit in hits {
        let known = pool
            .iter()
            .any(|seen| seen.contract_name == hit.contract_name && seen.page_id == hit.page_id);
        if !known {
            pool.push(hit);
        }
    }
}

/// Maps one stream's raw scores onto `[0, 1]`, keeping the input order.
///
/// Min-max maps the best hit to 1 and the worst to 0; a stream whose scores are all
/// equal maps every hit to 1. Reciprocal rank gives `(k + 1) / (k + rank)`.
pub fn normalize_scores(scores: &[f64], normalization: Normalization) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }

    match normalization {
        Normalization::MinMax => {
            let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
            let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let spread = max - min;
            scores
                .iter()
                .map(|score| {
                    if spread <= f64::EPSILON {
                        1.0
                    } else {
                        (score - min) / spread
                    }
                })
                .collect()
        }
        Normalization::ReciprocalRank { k } => {
            let mut order: Vec<usize> = (0..scores.len()).collect();
            order.sort_by(|left, right| scores[*right].total_cmp(&scores[*left]).then(left.cmp(right)));

            let mut normalized = vec![0.0; scores.len()];
            for (rank, position) in order.into_iter().enumerate() {
                normalized[position] = (k + 1.0) / (k + rank as f64 + 1.0);
            }
            normalized
        }
    }
}

/// Contract content score from its page scores, sorted best first.
fn aggregate(sorted_scores: &[f64], aggregation: PageAggregation) -> f64 {
    match aggregation {
        PageAggregation::Max => sorted_scores.first().copied().unwrap_or(0.0),
        PageAggregation::TopMean { n } => {
            let top = &sorted_scores[..sorted_scores.len().min(n.max(1))];
            if top.is_empty() {
                0.0
            } else {
                top.iter().sum::<f64>() / top.len() as f64
            }
        }
    }
}

/// Inclusive range check. A missing value fails any active filter on its field.
pub fn passes_filters(metadata: Option<&ContractMetadata>, filters: &SearchFilters) -> bool {
    if filters.amount_active() {
        let Some(amount) = metadata.and_then(|metadata| metadata.contract_amount) else {
            return false;
        };
        if filters.amount_min.is_some_and(|min| amount < min)
            || filters.amount_max.is_some_and(|max| amount > max)
        {
            return false;
        }
    }

    if filters.date_active() {
        let Some(date) = metadata.and_then(ContractMetadata::signing_date_value) else {
            return false;
        };
        if filters.date_start.is_some_and(|start| date < start)
            || filters.date_end.is_some_and(|end| date > end)
        {
            return false;
        }
    }

    true
}
