use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::time::Duration;

/// Bounded exponential backoff for transient embedder, index and LLM failures.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial_backoff: Duration,
    pub multiplier: f64,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(200),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn no_delay(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        if !factor.is_finite()
            || self.initial_backoff.as_secs_f64() * factor >= self.max_backoff.as_secs_f64()
        {
            return self.max_backoff;
        }
        self.initial_backoff.mul_f64(factor)
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexerConfig {
    pub retry: RetryPolicy,
    /// Character budget of the text handed to the metadata extractor.
    pub metadata_char_budget: usize,
    pub extract_metadata_on_ingest: bool,
    /// Non-terminal documents untouched for longer than this are reported as stale.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub stale_after: Duration,
    /// Compare-and-set attempts before a status update gives up on contention.
    pub status_update_attempts: u32,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            metadata_char_budget: 12_000,
            extract_metadata_on_ingest: false,
            stale_after: Duration::from_secs(30 * 60),
            status_update_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Normalization {
    MinMax,
    ReciprocalRank { k: f64 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageAggregation {
    Max,
    TopMean { n: usize },
}

/// What the search engine does when one score stream's backend query fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DegradationPolicy {
    BestEffort,
    FailFast,
}

/// Weights and knobs of the hybrid ranking function.
///
/// `page = lexical_weight * lexical + vector_weight * vector` and
/// `contract = content_weight * aggregate(pages) + metadata_weight * metadata`,
/// each stream normalized independently before weighting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RankingConfig {
    pub lexical_weight: f64,
    pub vector_weight: f64,
    pub content_weight: f64,
    pub metadata_weight: f64,
    pub normalization: Normalization,
    pub page_aggregation: PageAggregation,
    /// Candidates requested from each stream before merging.
    pub candidate_pool: usize,
    /// Upper bound the pool may be widened to while fewer than `top_k` eligible
    /// contracts have been found.
    pub max_candidate_pool: usize,
    /// Raw cosine similarity a page needs to count as a vector match.
    pub vector_min_similarity: f64,
    pub degradation: DegradationPolicy,
    pub max_top_k: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            lexical_weight: 0.5,
            vector_weight: 0.5,
            content_weight: 0.7,
            metadata_weight: 0.3,
            normalization: Normalization::MinMax,
            page_aggregation: PageAggregation::Max,
            candidate_pool: 100,
            max_candidate_pool: 10_000,
            vector_min_similarity: 0.6,
            degradation: DegradationPolicy::BestEffort,
            max_top_k: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ServiceConfig {
    pub indexer: IndexerConfig,
    pub ranking: RankingConfig,
}
