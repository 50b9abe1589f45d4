//! Elasticsearch backend over two indices: `{prefix}_documents` (one record per
//! contract, `_id` = contract name) and `{prefix}_pages` (`_id` = `{contract}#{page}`).

use crate::models::{
    page_record_id, ContractMetadata, DocVersion, DocumentRecord, MetadataCandidate, PageCandidate,
    PageRecord, VersionedDocument,
};
use crate::traits::{DocumentStore, KeywordIndex, PageStore, VectorIndex};
use crate::SearchError;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

const BACKEND: &str = "elasticsearch";
const MAX_LISTED: usize = 10_000;

pub struct ElasticsearchStore {
    client: Arc<Client>,
    endpoint: String,
    documents_index: String,
    pages_index: String,
    dimensions: usize,
}

impl ElasticsearchStore {
    pub fn new(endpoint: impl Into<String>, index_prefix: &str, dimensions: usize) -> Self {
        Self {
            client: Arc::new(Client::new()),
            endpoint: endpoint.into(),
            documents_index: format!("{index_prefix}_documents"),
            pages_index: format!("{index_prefix}_pages"),
            dimensions,
        }
    }

    pub fn documents_index(&self) -> &str {
        &self.documents_index
    }

    pub fn pages_index(&self) -> &str {
        &self.pages_index
    }

    fn url(&self, segments: &[&str]) -> Result<Url, SearchError> {
        let mut url = Url::parse(&self.endpoint)?;
        url.path_segments_mut()
            .map_err(|_| SearchError::Request(format!("{} cannot be a base url", self.endpoint)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn url_with(&self, segments: &[&str], params: &[(&str, &str)]) -> Result<Url, SearchError> {
        let mut url = self.url(segments)?;
        url.query_pairs_mut().extend_pairs(params);
        Ok(url)
    }

    /// Creates both indices with their mappings when they do not exist yet.
    pub async fn ensure_indices(&self) -> Result<(), SearchError> {
        self.ensure_index(&self.documents_index, document_mappings()).await?;
        self.ensure_index(&self.pages_index, page_mappings(self.dimensions)).await
    }

    async fn ensure_index(&self, index: &str, body: Value) -> Result<(), SearchError> {
        let response = self.client.head(self.url(&[index])?).send().await?;

        if response.status() == StatusCode::OK {
            debug!(index, "index already present");
            return Ok(());
        }

        if response.status() != StatusCode::NOT_FOUND {
            return Err(SearchError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("checking {index}: {}", response.status()),
            });
        }

        let response = self.client.put(self.url(&[index])?).json(&body).send().await?;
        expect_success(response, "index setup").await?;
        info!(index, "index created");
        Ok(())
    }

    async fn search(&self, index: &str, body: &Value) -> Result<Value, SearchError> {
        let response = self
            .client
            .post(self.url(&[index, "_search"])?)
            .json(body)
            .send()
            .await?;
        expect_success(response, "search").await
    }

    async fn delete_by_query(&self, index: &str, query: Value) -> Result<u64, SearchError> {
        let url = self.url_with(
            &[index, "_delete_by_query"],
            &[("refresh", "true"), ("conflicts", "proceed")],
        )?;
        let response = self
            .client
            .post(url)
            .json(&json!({ "query": query }))
            .send()
            .await?;
        deleted_count(&expect_success(response, "delete by query").await?)
    }
}

async fn expect_success(response: Response, context: &str) -> Result<Value, SearchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let details = response.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND && details.contains("index_not_found_exception") {
        return Err(SearchError::NotReady(format!("{context}: index missing, run init first")));
    }
    Err(SearchError::BackendResponse {
        backend: BACKEND.to_string(),
        details: format!("{context}: {status} {details}"),
    })
}

fn text_with_keyword() -> Value {
    json!({ "type": "text", "fields": { "keyword": { "type": "keyword", "ignore_above": 256 } } })
}

pub fn document_mappings() -> Value {
    json!({
        "settings": { "number_of_shards": 1, "number_of_replicas": 0 },
        "mappings": {
            "properties": {
                "contract_name": { "type": "keyword" },
                "file_name": { "type": "keyword" },
                "upload_id": { "type": "keyword" },
                "checksum": { "type": "keyword" },
                "status": { "type": "keyword" },
                "total_pages": { "type": "integer" },
                "processed_pages": { "type": "integer" },
                "metadata_status": { "type": "keyword" },
                "metadata_error": { "type": "text", "index": false },
                "error": {
                    "properties": {
                        "category": { "type": "keyword" },
                        "detail": { "type": "text", "index": false },
                        "at": { "type": "date" }
                    }
                },
                "uploaded_at": { "type": "date" },
                "updated_at": { "type": "date" },
                "file_size": { "type": "long" },
                "metadata": {
                    "properties": {
                        "customer_name": text_with_keyword(),
                        "our_entity": text_with_keyword(),
                        "contract_type": text_with_keyword(),
                        "contract_amount": { "type": "double" },
                        "signing_date": { "type": "date", "format": "yyyy-MM-dd" },
                        "project_description": { "type": "text" },
                        "positions": { "type": "text" },
                        "personnel_list": { "type": "text" },
                        "category_primary": text_with_keyword(),
                        "category_secondary": text_with_keyword(),
                        "extracted_at": { "type": "date" }
                    }
                }
            }
        }
    })
}

pub fn page_mappings(dimensions: usize) -> Value {
    json!({
        "settings": {
            "number_of_shards": 1,
            "number_of_replicas": 0,
            "analysis": {
                "tokenizer": {
                    "ngram_tokenizer": {
                        "type": "ngram",
                        "min_gram": 2,
                        "max_gram": 3,
                        "token_chars": ["letter", "digit"]
                    }
                },
                "analyzer": {
                    "ngram_analyzer": { "type": "custom", "tokenizer": "ngram_tokenizer" }
                }
            }
        },
        "mappings": {
            "properties": {
                "contract_name": { "type": "keyword" },
                "page_id": { "type": "integer" },
                "text": {
                    "type": "text",
                    "fields": {
                        "ngram": { "type": "text", "analyzer": "ngram_analyzer", "search_analyzer": "standard" }
                    }
                },
                "embedding": {
                    "type": "dense_vector",
                    "dims": dimensions,
                    "index": true,
                    "similarity": "cosine"
                },
                "char_count": { "type": "integer" }
            }
        }
    })
}

/// `metadata.<field>^<boost>` for every string metadata field.
pub fn metadata_query_fields() -> Vec<String> {
    ContractMetadata::TEXT_FIELDS
        .iter()
        .map(|field| format!("metadata.{field}^{}", ContractMetadata::field_boost(field)))
        .collect()
}

fn page_scope(contract_name: Option<&str>) -> Value {
    match contract_name {
        Some(name) => json!({ "term": { "contract_name": name } }),
        None => json!({ "match_all": {} }),
    }
}

/// Full-text page query, optionally restricted to one contract. The restriction is a
/// filter clause so scores stay comparable with the unrestricted query.
pub fn keyword_query(query: &str, contract_name: Option<&str>, limit: usize) -> Value {
    json!({
        "size": limit,
        "_source": { "excludes": ["embedding"] },
        "query": {
            "bool": {
                "must": {
                    "multi_match": {
                        "query": query,
                        "fields": ["text", "text.ngram"]
                    }
                },
                "filter": page_scope(contract_name)
            }
        }
    })
}

/// Script-score query. Elasticsearch scores must be non-negative, hence the `+ 1.0`
/// that [`parse_page_hits`] callers subtract again.
pub fn vector_query(query_vector: &[f32], contract_name: Option<&str>, limit: usize) -> Value {
    json!({
        "size": limit,
        "_source": { "excludes": ["embedding"] },
        "query": {
            "script_score": {
                "query": page_scope(contract_name),
                "script": {
                    "source": "cosineSimilarity(params.query_vector, 'embedding') + 1.0",
                    "params": { "query_vector": query_vector }
                }
            }
        }
    })
}

fn hits(response: &Value) -> Vec<Value> {
    response
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

pub fn parse_page_hits(response: &Value, score_offset: f64) -> Vec<PageCandidate> {
    hits(response)
        .into_iter()
        .filter_map(|raw| {
            let source = raw.get("_source")?;
            Some(PageCandidate {
                contract_name: source.get("contract_name")?.as_str()?.to_string(),
                page_id: u32::try_from(source.get("page_id")?.as_u64()?).ok()?,
                text: source
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                score: raw.get("_score").and_then(Value::as_f64).unwrap_or(0.0) - score_offset,
            })
        })
        .collect()
}

pub fn parse_versioned(raw: &Value) -> Result<VersionedDocument, SearchError> {
    let source = raw
        .get("_source")
        .cloned()
        .ok_or_else(|| SearchError::BackendResponse {
            backend: BACKEND.to_string(),
            details: "document hit without _source".to_string(),
        })?;
    let record: DocumentRecord = serde_json::from_value(source)?;
    Ok(VersionedDocument {
        record,
        version: parse_version(raw)?,
    })
}

fn parse_version(raw: &Value) -> Result<DocVersion, SearchError> {
    let seq_no = raw.get("_seq_no").and_then(Value::as_i64);
    let primary_term = raw.get("_primary_term").and_then(Value::as_i64);
    match (seq_no, primary_term) {
        (Some(seq_no), Some(primary_term)) => Ok(DocVersion { seq_no, primary_term }),
        _ => Err(SearchError::BackendResponse {
            backend: BACKEND.to_string(),
            details: "response carried no _seq_no/_primary_term".to_string(),
        }),
    }
}

/// `deleted` from a delete-by-query response; reported `failures` are an error.
pub fn deleted_count(response: &Value) -> Result<u64, SearchError> {
    let failures = response
        .get("failures")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    if failures > 0 {
        return Err(SearchError::BackendResponse {
            backend: BACKEND.to_string(),
            details: format!("delete by query reported {failures} failures"),
        });
    }
    Ok(response.get("deleted").and_then(Value::as_u64).unwrap_or(0))
}

#[async_trait]
impl DocumentStore for ElasticsearchStore {
    async fn create_document(&self, record: &DocumentRecord) -> Result<DocVersion, SearchError> {
        let url = self.url_with(
            &[&self.documents_index, "_create", &record.contract_name],
            &[("refresh", "wait_for")],
        )?;
        let response = self.client.put(url).json(record).send().await?;
        if response.status() == StatusCode::CONFLICT {
            return Err(SearchError::Conflict(record.contract_name.clone()));
        }
        parse_version(&expect_success(response, "create document").await?)
    }

    async fn get_document(&self, contract_name: &str) -> Result<Option<VersionedDocument>, SearchError> {
        let url = self.url(&[&self.documents_index, "_doc", contract_name])?;
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let raw = expect_success(response, "get document").await?;
        if raw.get("found").and_then(Value::as_bool) == Some(false) {
            return Ok(None);
        }
        parse_versioned(&raw).map(Some)
    }

    async fn get_documents(&self, contract_names: &[String]) -> Result<Vec<DocumentRecord>, SearchError> {
        if contract_names.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(self.url(&[&self.documents_index, "_mget"])?)
            .json(&json!({ "ids": contract_names }))
            .send()
            .await?;
        let body = expect_success(response, "get documents").await?;

        body.get("docs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
            .iter()
            .filter(|raw| raw.get("found").and_then(Value::as_bool) == Some(true))
            .map(|raw| parse_versioned(raw).map(|stored| stored.record))
            .collect()
    }

    async fn list_documents(&self) -> Result<Vec<DocumentRecord>, SearchError> {
        let body = json!({
            "size": MAX_LISTED,
            "query": { "match_all": {} },
            "sort": [{ "uploaded_at": "desc" }]
        });
        let response = self.search(&self.documents_index, &body).await?;
        hits(&response)
            .into_iter()
            .map(|raw| {
                let source = raw.get("_source").cloned().unwrap_or(Value::Null);
                serde_json::from_value(source).map_err(SearchError::from)
            })
            .collect()
    }

    async fn replace_document(
        &self,
        record: &DocumentRecord,
        expected: DocVersion,
    ) -> Result<DocVersion, SearchError> {
        let seq_no = expected.seq_no.to_string();
        let primary_term = expected.primary_term.to_string();
        let url = self.url_with(
            &[&self.documents_index, "_doc", &record.contract_name],
            &[
                ("if_seq_no", seq_no.as_str()),
                ("if_primary_term", primary_term.as_str()),
                ("refresh", "wait_for"),
            ],
        )?;

        let response = self.client.put(url).json(record).send().await?;
        if response.status() == StatusCode::CONFLICT {
            return Err(SearchError::Conflict(record.contract_name.clone()));
        }
        parse_version(&expect_success(response, "replace document").await?)
    }

    async fn delete_document(&self, contract_name: &str) -> Result<bool, SearchError> {
        let url = self.url_with(
            &[&self.documents_index, "_doc", contract_name],
            &[("refresh", "true")],
        )?;
        let response = self.client.delete(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let body = expect_success(response, "delete document").await?;
        Ok(body.get("result").and_then(Value::as_str) == Some("deleted"))
    }

    async fn clear_documents(&self) -> Result<u64, SearchError> {
        self.delete_by_query(&self.documents_index, json!({ "match_all": {} }))
            .await
    }
}

#[async_trait]
impl PageStore for ElasticsearchStore {
    async fn write_page(&self, page: &PageRecord) -> Result<(), SearchError> {
        let id = page_record_id(&page.contract_name, page.page_id);
        let url = self.url_with(&[&self.pages_index, "_doc", &id], &[("refresh", "wait_for")])?;
        let response = self.client.put(url).json(page).send().await?;
        expect_success(response, "write page").await?;
        Ok(())
    }

    async fn list_pages(&self, contract_name: &str) -> Result<Vec<PageRecord>, SearchError> {
        let body = json!({
            "size": MAX_LISTED,
            "query": { "term": { "contract_name": contract_name } },
            "sort": [{ "page_id": "asc" }]
        });
        let response = self.search(&self.pages_index, &body).await?;
        hits(&response)
            .into_iter()
            .map(|raw| {
                let source = raw.get("_source").cloned().unwrap_or(Value::Null);
                serde_json::from_value(source).map_err(SearchError::from)
            })
            .collect()
    }

    async fn delete_pages(&self, contract_name: &str) -> Result<u64, SearchError> {
        self.delete_by_query(
            &self.pages_index,
            json!({ "term": { "contract_name": contract_name } }),
        )
        .await
    }

    async fn clear_pages(&self) -> Result<u64, SearchError> {
        self.delete_by_query(&self.pages_index, json!({ "match_all": {} }))
            .await
    }
}

#[async_trait]
impl KeywordIndex for ElasticsearchStore {
    async fn search_pages_keyword(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<PageCandidate>, SearchError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .search(&self.pages_index, &keyword_query(query, None, limit))
            .await?;
        Ok(parse_page_hits(&response, 0.0))
    }

    async fn search_contract_pages_keyword(
        &self,
        contract_name: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<PageCandidate>, SearchError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .search(&self.pages_index, &keyword_query(query, Some(contract_name), limit))
            .await?;
        Ok(parse_page_hits(&response, 0.0))
    }

    async fn search_metadata(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MetadataCandidate>, SearchError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let body = json!({
            "size": limit,
            "_source": ["contract_name"],
            "query": {
                "multi_match": {
                    "query": query,
                    "fields": metadata_query_fields()
                }
            }
        });
        let response = self.search(&self.documents_index, &body).await?;

        Ok(hits(&response)
            .into_iter()
            .filter_map(|raw| {
                Some(MetadataCandidate {
                    contract_name: raw.pointer("/_source/contract_name")?.as_str()?.to_string(),
                    score: raw.get("_score").and_then(Value::as_f64).unwrap_or(0.0),
                })
            })
            .collect())
    }
}

#[async_trait]
impl VectorIndex for ElasticsearchStore {
    async fn search_pages_vector(
        &self,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<PageCandidate>, SearchError> {
        let response = self
            .search(&self.pages_index, &vector_query(query_vector, None, limit))
            .await?;
        Ok(parse_page_hits(&response, 1.0))
    }

    async fn search_contract_pages_vector(
        &self,
        contract_name: &str,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<PageCandidate>, SearchError> {
        let response = self
            .search(
                &self.pages_index,
                &vector_query(query_vector, Some(contract_name), limit),
            )
            .await?;
        Ok(parse_page_hits(&response, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentStatus;

    #[test]
    fn urls_encode_contract_names() {
        let store = ElasticsearchStore::new("http://localhost:9200/", "contracts", 384);
        let url = store
            .url(&[store.pages_index(), "_doc", &page_record_id("合同 A", 2)])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:9200/contracts_pages/_doc/%E5%90%88%E5%90%8C%20A%232"
        );
        assert_eq!(store.documents_index(), "contracts_documents");
    }

    #[test]
    fn page_mapping_carries_vector_dimensions() {
        let mapping = page_mappings(768);
        assert_eq!(
            mapping.pointer("/mappings/properties/embedding/dims"),
            Some(&json!(768))
        );
        assert_eq!(
            document_mappings().pointer("/mappings/properties/metadata/properties/contract_amount/type"),
            Some(&json!("double"))
        );
    }

    #[test]
    fn metadata_fields_carry_boosts() {
        let fields = metadata_query_fields();
        assert!(fields.contains(&"metadata.customer_name^1".to_string()));
        assert!(fields.contains(&"metadata.project_description^0.8".to_string()));
        assert_eq!(fields.len(), ContractMetadata::TEXT_FIELDS.len());
    }

    #[test]
    fn contract_scoped_queries_filter_on_the_name() {
        let scoped = keyword_query("pump", Some("合同"), 120);
        assert_eq!(
            scoped.pointer("/query/bool/filter/term/contract_name"),
            Some(&json!("合同"))
        );
        assert_eq!(scoped.get("size"), Some(&json!(120)));

        let global = vector_query(&[0.5, 0.5], None, 10);
        assert!(global.pointer("/query/script_score/query/match_all").is_some());
        let vector = vector_query(&[0.5, 0.5], Some("A"), 10);
        assert_eq!(
            vector.pointer("/query/script_score/query/term/contract_name"),
            Some(&json!("A"))
        );
    }

    #[test]
    fn vector_hits_are_shifted_back_to_cosine() {
        let response = json!({
            "hits": { "hits": [
                { "_score": 1.75, "_source": { "contract_name": "A", "page_id": 3, "text": "pump" } },
                { "_score": 1.0, "_source": { "page_id": 1 } }
            ] }
        });
        let hits = parse_page_hits(&response, 1.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].page_id, 3);
        assert!((hits[0].score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn versioned_documents_round_trip_through_source() {
        let record = DocumentRecord::new_pending("A", "A.pdf", 10, "sum");
        let raw = json!({
            "_seq_no": 7,
            "_primary_term": 2,
            "found": true,
            "_source": serde_json::to_value(&record).unwrap()
        });
        let stored = parse_versioned(&raw).unwrap();
        assert_eq!(stored.version, DocVersion { seq_no: 7, primary_term: 2 });
        assert_eq!(stored.record.status, DocumentStatus::Pending);
    }

    #[test]
    fn delete_by_query_failures_are_errors() {
        assert_eq!(deleted_count(&json!({ "deleted": 4, "failures": [] })).unwrap(), 4);
        assert!(deleted_count(&json!({ "deleted": 1, "failures": [{ "cause": "x" }] })).is_err());
    }
}
