//! Document status state machines and their compare-and-set persistence.
//!
//! Two independent tracks live on every [`DocumentRecord`]:
//!
//! - ingestion: `pending -> parsing -> vectorizing -> [metadata_extracting ->] completed`,
//!   with `failed` reachable from every non-terminal state;
//! - metadata: any settled state `-> extracting -> extracted | failed | empty`.
//!
//! Every change is a read, a validated mutation and a versioned write. A concurrent
//! writer makes the write fail with a conflict, and the change is re-validated against
//! the fresh record.

use crate::error::StatusError;
use crate::models::{
    ContractMetadata, DocumentRecord, DocumentStatus, FailureInfo, MetadataStatus,
};
use crate::traits::DocumentStore;
use crate::SearchError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

impl DocumentStatus {
    pub fn can_advance_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Pending, Parsing) => true,
            (Parsing, Vectorizing) => true,
            (Vectorizing, MetadataExtracting | Completed) => true,
            (MetadataExtracting, Completed) => true,
            _ => false,
        }
    }
}

impl MetadataStatus {
    pub fn can_advance_to(&self, next: MetadataStatus) -> bool {
        use MetadataStatus::*;
        match (self, next) {
            (Extracting, Extracted | Failed | Empty) => true,
            (NotExtracted | Extracted | Failed | Empty, Extracting) => true,
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct StatusTracker {
    store: Arc<dyn DocumentStore>,
    attempts: u32,
}

impl StatusTracker {
    pub fn new(store: Arc<dyn DocumentStore>, attempts: u32) -> Self {
        Self {
            store,
            attempts: attempts.max(1),
        }
    }

    pub async fn current(&self, contract_name: &str) -> Result<DocumentRecord, StatusError> {
        self.store
            .get_document(contract_name)
            .await?
            .map(|stored| stored.record)
            .ok_or_else(|| StatusError::NotFound(contract_name.to_string()))
    }

    /// Applies `apply` to the latest record and writes it back with compare-and-set.
    pub async fn update<F>(&self, contract_name: &str, mut apply: F) -> Result<DocumentRecord, StatusError>
    where
        F: FnMut(&mut DocumentRecord) -> Result<(), StatusError> + Send,
    {
        for attempt in 0..self.attempts {
            let stored = self
                .store
                .get_document(contract_name)
                .await?
                .ok_or_else(|| StatusError::NotFound(contract_name.to_string()))?;

            let mut next = stored.record.clone();
            apply(&mut next)?;
            next.updated_at = Utc::now();

            match self.store.replace_document(&next, stored.version).await {
                Ok(_) => return Ok(next),
                Err(SearchError::Conflict(_)) => {
                    debug!(contract_name, attempt, "status write lost a race, re-reading");
                }
                Err(SearchError::NotFound(_)) => {
                    return Err(StatusError::NotFound(contract_name.to_string()))
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(StatusError::Contention(contract_name.to_string()))
    }

    pub async fn advance(&self, contract_name: &str, to: DocumentStatus) -> Result<DocumentRecord, StatusError> {
        self.advance_with(contract_name, to, |_| {}).await
    }

    /// Moves the ingestion track to `to`, applying `extra` in the same write.
    pub async fn advance_with<F>(
        &self,
        contract_name: &str,
        to: DocumentStatus,
        mut extra: F,
    ) -> Result<DocumentRecord, StatusError>
    where
        F: FnMut(&mut DocumentRecord) + Send,
    {
        let record = self
            .update(contract_name, |record| {
                check_document_transition(record, to)?;
                record.status = to;
                extra(record);
                Ok(())
            })
            .await?;

        info!(contract_name, status = to.as_str(), "document status changed");
        Ok(record)
    }

    /// Records `processed` durably written pages. Never decreases, never exceeds the total.
    pub async fn advance_progress(&self, contract_name: &str, processed: u32) -> Result<DocumentRecord, StatusError> {
        self.update(contract_name, |record| {
            if record.status != DocumentStatus::Vectorizing {
                return Err(StatusError::Rejected {
                    contract_name: record.contract_name.clone(),
                    details: format!("progress reported while {}", record.status.as_str()),
                });
            }
            if processed <= record.processed_pages || processed > record.total_pages {
                return Err(StatusError::Rejected {
                    contract_name: record.contract_name.clone(),
                    details: format!(
                        "progress {processed} invalid after {} of {}",
                        record.processed_pages, record.total_pages
                    ),
                });
            }
            record.processed_pages = processed;
            Ok(())
        })
        .await
    }

    pub async fn fail(&self, contract_name: &str, failure: FailureInfo) -> Result<DocumentRecord, StatusError> {
        self.advance_with(contract_name, DocumentStatus::Failed, |record| {
            record.error = Some(failure.clone());
        })
        .await
    }

    /// Operator override: marks the document failed whatever its current state.
    pub async fn force_fail(&self, contract_name: &str, failure: FailureInfo) -> Result<DocumentRecord, StatusError> {
        let record = self
            .update(contract_name, |record| {
                record.status = DocumentStatus::Failed;
                record.error = Some(failure.clone());
                if record.metadata_status == MetadataStatus::Extracting {
                    record.metadata_status = MetadataStatus::Failed;
                    record.metadata_error = Some(failure.detail.clone());
                }
                Ok(())
            })
            .await?;

        info!(
            contract_name,
            reason = failure.category.as_str(),
            "document forced into failed state"
        );
        Ok(record)
    }

    /// Claims the metadata track once the document text is fully indexed. An `extracting`
    /// claim untouched for longer than `reclaim_after` belongs to an extraction that never
    /// finished and is taken over.
    pub async fn begin_metadata(
        &self,
        contract_name: &str,
        reclaim_after: Duration,
    ) -> Result<DocumentRecord, StatusError> {
        self.update(contract_name, |record| {
            let text_ready = matches!(
                record.status,
                DocumentStatus::Completed | DocumentStatus::MetadataExtracting
            );
            if !text_ready || record.total_pages == 0 {
                return Err(StatusError::Rejected {
                    contract_name: record.contract_name.clone(),
                    details: format!("document is {}, text not available", record.status.as_str()),
                });
            }
            if record.metadata_status == MetadataStatus::Extracting && untouched_for(record, reclaim_after) {
                warn!(
                    contract_name = %record.contract_name,
                    since = %record.updated_at,
                    "taking over abandoned metadata extraction"
                );
            } else {
                check_metadata_transition(record, MetadataStatus::Extracting)?;
            }
            record.metadata_status = MetadataStatus::Extracting;
            Ok(())
        })
        .await
    }

    /// Settles an `extracting` metadata track as failed. With `claimed_at`, only the claim
    /// written at that instant is settled; a newer write means someone else owns the track.
    /// Returns `None` when there was nothing to settle.
    pub async fn abandon_metadata(
        &self,
        contract_name: &str,
        detail: &str,
        claimed_at: Option<DateTime<Utc>>,
    ) -> Result<Option<DocumentRecord>, StatusError> {
        let outcome = self
            .update(contract_name, |record| {
                let owned = claimed_at.map_or(true, |at| at == record.updated_at);
                if record.metadata_status != MetadataStatus::Extracting || !owned {
                    return Err(StatusError::Rejected {
                        contract_name: record.contract_name.clone(),
                        details: "metadata track already settled".to_string(),
                    });
                }
                record.metadata_status = MetadataStatus::Failed;
                record.metadata_error = Some(detail.to_string());
                Ok(())
            })
            .await;

        match outcome {
            Ok(record) => {
                warn!(contract_name, detail, "metadata extraction abandoned");
                Ok(Some(record))
            }
            Err(StatusError::Rejected { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Writes operator-supplied metadata. `None` records an empty result.
    pub async fn store_metadata(
        &self,
        contract_name: &str,
        metadata: Option<ContractMetadata>,
    ) -> Result<DocumentRecord, StatusError> {
        let record = self
            .update(contract_name, |record| {
                if record.metadata_status == MetadataStatus::Extracting {
                    return Err(StatusError::Rejected {
                        contract_name: record.contract_name.clone(),
                        details: "metadata extraction in progress".to_string(),
                    });
                }
                record.metadata_status = if metadata.is_some() {
                    MetadataStatus::Extracted
                } else {
                    MetadataStatus::Empty
                };
                record.metadata = metadata.clone();
                record.metadata_error = None;
                Ok(())
            })
            .await?;

        info!(
            contract_name,
            metadata_status = record.metadata_status.as_str(),
            "metadata saved"
        );
        Ok(record)
    }

    pub async fn finish_metadata(
        &self,
        contract_name: &str,
        outcome: MetadataStatus,
        metadata: Option<ContractMetadata>,
        error: Option<String>,
    ) -> Result<DocumentRecord, StatusError> {
        let record = self
            .update(contract_name, |record| {
                check_metadata_transition(record, outcome)?;
                record.metadata_status = outcome;
                record.metadata_error = error.clone();
                match outcome {
                    MetadataStatus::Extracted => record.metadata = metadata.clone(),
                    MetadataStatus::Empty => record.metadata = None,
                    _ => {}
                }
                Ok(())
            })
            .await?;

        info!(
            contract_name,
            metadata_status = outcome.as_str(),
            "metadata status changed"
        );
        Ok(record)
    }
}

fn check_document_transition(record: &DocumentRecord, to: DocumentStatus) -> Result<(), StatusError> {
    if record.status.can_advance_to(to) {
        Ok(())
    } else {
        Err(StatusError::InvalidTransition {
            contract_name: record.contract_name.clone(),
            track: "status",
            from: record.status.as_str().to_string(),
            to: to.as_str().to_string(),
        })
    }
}

/// True when the record has not been written for longer than `age`.
pub fn untouched_for(record: &DocumentRecord, age: Duration) -> bool {
    match chrono::Duration::from_std(age) {
        Ok(age) => Utc::now().signed_duration_since(record.updated_at) > age,
        Err(_) => false,
    }
}

fn check_metadata_transition(record: &DocumentRecord, to: MetadataStatus) -> Result<(), StatusError> {
    if record.metadata_status.can_advance_to(to) {
        Ok(())
    } else {
        Err(StatusError::InvalidTransition {
            contract_name: record.contract_name.clone(),
            track: "metadata_status",
            from: record.metadata_status.as_str().to_string(),
            to: to.as_str().to_string(),
        })
    }
}
