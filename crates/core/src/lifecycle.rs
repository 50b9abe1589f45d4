//! Identifier canonicalization and the read/delete/reset side of the document lifecycle.

use crate::config::{IndexerConfig, RetryPolicy};
use crate::error::LifecycleError;
use crate::ingest::ContractLocks;
use crate::models::{
    DeleteResult, DocumentRecord, DocumentSummary, FailureCategory, FailureInfo, MetadataStatus,
    PageRecord, StatusReport,
};
use crate::retry::retry_with_backoff;
use crate::status::StatusTracker;
use crate::traits::ContractIndex;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Last path component of an identifier, accepting both `/` and `\` separators.
pub fn base_file_name(identifier: &str) -> &str {
    let trimmed = identifier.trim();
    trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed)
}

/// Maps a bare stem, a file name or a path onto the canonical contract name.
///
/// `"a"`, `"a.pdf"`, `"A/b/a.PDF"` and `"C:\\docs\\a.pdf"` all name contract `a`.
pub fn canonical_contract_name(identifier: &str) -> Result<String, LifecycleError> {
    let base = base_file_name(identifier);
    let split = base.len().saturating_sub(4);
    let stem = match base.get(split..) {
        Some(extension) if extension.eq_ignore_ascii_case(".pdf") => &base[..split],
        _ => base,
    };

    let name = stem.trim();
    if name.is_empty() {
        return Err(LifecycleError::Validation(format!(
            "no contract name in {identifier:?}"
        )));
    }
    Ok(name.to_string())
}

/// Proof that the operator typed the reset phrase.
#[derive(Debug, Clone)]
pub struct ClearAllConfirmation(());

impl ClearAllConfirmation {
    pub const PHRASE: &'static str = "delete every contract";

    pub fn parse(phrase: &str) -> Result<Self, LifecycleError> {
        if phrase.trim() == Self::PHRASE {
            Ok(Self(()))
        } else {
            Err(LifecycleError::Unconfirmed)
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClearAllReport {
    pub documents_deleted: u64,
    pub pages_deleted: u64,
}

pub struct DocumentLifecycle {
    index: Arc<dyn ContractIndex>,
    status: StatusTracker,
    locks: ContractLocks,
    retry: RetryPolicy,
}

impl DocumentLifecycle {
    pub fn new<I>(index: Arc<I>, locks: ContractLocks, config: &IndexerConfig) -> Self
    where
        I: ContractIndex + 'static,
    {
        let status = StatusTracker::new(index.clone(), config.status_update_attempts);
        Self {
            index,
            status,
            locks,
            retry: config.retry.clone(),
        }
    }

    async fn require(&self, contract_name: &str) -> Result<DocumentRecord, LifecycleError> {
        self.index
            .get_document(contract_name)
            .await?
            .map(|stored| stored.record)
            .ok_or_else(|| LifecycleError::NotFound(contract_name.to_string()))
    }

    pub async fn get_status(&self, identifier: &str) -> Result<StatusReport, LifecycleError> {
        let contract_name = canonical_contract_name(identifier)?;
        Ok(self.require(&contract_name).await?.status_report())
    }

    pub async fn get_document(&self, identifier: &str) -> Result<DocumentRecord, LifecycleError> {
        let contract_name = canonical_contract_name(identifier)?;
        self.require(&contract_name).await
    }

    /// Page records of one contract, ordered by page id.
    pub async fn get_pages(&self, identifier: &str) -> Result<Vec<PageRecord>, LifecycleError> {
        let contract_name = canonical_contract_name(identifier)?;
        self.require(&contract_name).await?;
        Ok(self.index.list_pages(&contract_name).await?)
    }

    /// All documents, newest upload first.
    pub async fn list(&self) -> Result<Vec<DocumentSummary>, LifecycleError> {
        let mut records = self.index.list_documents().await?;
        records.sort_by(|left, right| {
            right
                .uploaded_at
                .cmp(&left.uploaded_at)
                .then_with(|| left.contract_name.cmp(&right.contract_name))
        });
        Ok(records.iter().map(DocumentRecord::summary).collect())
    }

    /// Deletes the pages, then the record. Waits for an in-flight writer on the same name.
    ///
    /// When the pages cannot be removed the record is kept, marked failed with
    /// `deletion_incomplete`, and the call reports [`LifecycleError::PartialDelete`].
    pub async fn delete(&self, identifier: &str) -> Result<DeleteResult, LifecycleError> {
        let contract_name = canonical_contract_name(identifier)?;
        let _guard = self.locks.acquire(&contract_name).await;
        self.require(&contract_name).await?;

        let pages = retry_with_backoff(&self.retry, "delete_pages", |_| {
            self.index.delete_pages(&contract_name)
        })
        .await;
        let pages_deleted = match pages {
            Ok(count) => count,
            Err(failure) => return Err(self.partial_delete(&contract_name, failure.to_string()).await),
        };

        let removed = retry_with_backoff(&self.retry, "delete_document", |_| {
            self.index.delete_document(&contract_name)
        })
        .await;
        match removed {
            Ok(deleted) => {
                info!(contract_name = %contract_name, pages_deleted, "document deleted");
                Ok(DeleteResult {
                    contract_name,
                    deleted,
                    pages_deleted,
                })
            }
            Err(failure) => Err(self
                .partial_delete(&contract_name, format!("pages removed, record kept: {failure}"))
                .await),
        }
    }

    async fn partial_delete(&self, contract_name: &str, details: String) -> LifecycleError {
        let info = FailureInfo::new(FailureCategory::DeletionIncomplete, details.clone());
        if let Err(status_error) = self.status.force_fail(contract_name, info).await {
            error!(contract_name, error = %status_error, "could not mark partially deleted document");
        }
        warn!(contract_name, details = %details, "deletion incomplete, retry the delete");
        LifecycleError::PartialDelete {
            contract_name: contract_name.to_string(),
            details,
        }
    }

    /// Removes every document and page. Refuses while any writer is in flight and
    /// keeps new writers out until it returns.
    pub async fn clear_all(&self, _confirmation: &ClearAllConfirmation) -> Result<ClearAllReport, LifecycleError> {
        let Some(_gate) = self.locks.try_acquire_all() else {
            return Err(LifecycleError::Busy("ingestion in progress".to_string()));
        };

        let pages_deleted = self.index.clear_pages().await?;
        let documents_deleted = self.index.clear_documents().await?;
        warn!(documents_deleted, pages_deleted, "index cleared");

        Ok(ClearAllReport {
            documents_deleted,
            pages_deleted,
        })
    }

    /// Documents untouched for longer than `max_age` that are still non-terminal or
    /// whose metadata track is still `extracting`.
    pub async fn find_stale(&self, max_age: Duration) -> Result<Vec<DocumentSummary>, LifecycleError> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|error| LifecycleError::Validation(format!("max age out of range: {error}")))?;
        let cutoff = Utc::now() - max_age;

        let mut stale: Vec<DocumentSummary> = self
            .index
            .list_documents()
            .await?
            .iter()
            .filter(|record| record.updated_at < cutoff)
            .filter(|record| {
                !record.status.is_terminal() || record.metadata_status == MetadataStatus::Extracting
            })
            .map(DocumentRecord::summary)
            .collect();
        stale.sort_by(|left, right| left.contract_name.cmp(&right.contract_name));
        Ok(stale)
    }

    /// Marks stale documents failed with reason `stale`. A completed document stuck in
    /// metadata extraction keeps its status and only has the metadata track failed.
    /// Skips names with a live writer.
    pub async fn fail_stale(&self, max_age: Duration) -> Result<Vec<String>, LifecycleError> {
        let mut failed = Vec::new();
        for summary in self.find_stale(max_age).await? {
            let Some(_guard) = self.locks.try_acquire(&summary.contract_name) else {
                continue;
            };

            if summary.status.is_terminal() {
                let detail = format!("metadata extraction made no progress for over {}s", max_age.as_secs());
                if self
                    .status
                    .abandon_metadata(&summary.contract_name, &detail, None)
                    .await?
                    .is_some()
                {
                    failed.push(summary.contract_name);
                }
                continue;
            }

            let detail = format!(
                "no progress for over {}s while {}",
                max_age.as_secs(),
                summary.status.as_str()
            );
            self.status
                .force_fail(&summary.contract_name, FailureInfo::new(FailureCategory::Stale, detail))
                .await?;
            failed.push(summary.contract_name);
        }
        Ok(failed)
    }
}
