//! Staging area between change detection and production.
//!
//! Transformed records are loaded per batch, updated as the external platform
//! answers, and finally promoted into the production tables in one
//! transaction. Sub-items reference their master by `parent_staging_id`.
//!
//! Production constraints enforced at promotion by every backend:
//! - unique master business key
//! - a sub-item's parent master must exist
//! - sub-item `size_label` is non-empty
//! - sub-item `quantity >= 0`
//! - unique `(parent, size_label)`

mod db;
mod memory;

pub use db::DbStagingStore;
pub use memory::{MemoryStagingStore, ProductionItem, ProductionSubitem};

use crate::batch::Batch;
use crate::error::Result;
use crate::record::BusinessKey;
use crate::sync::{ErrorCategory, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Workflow state of a staging row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    ExternalSuccess,
    ExternalFailed,
    Promoted,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::ExternalSuccess => "EXTERNAL_SUCCESS",
            SyncStatus::ExternalFailed => "EXTERNAL_FAILED",
            SyncStatus::Promoted => "PROMOTED",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = crate::error::SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(SyncStatus::Pending),
            "EXTERNAL_SUCCESS" => Ok(SyncStatus::ExternalSuccess),
            "EXTERNAL_FAILED" => Ok(SyncStatus::ExternalFailed),
            "PROMOTED" => Ok(SyncStatus::Promoted),
            _ => Err(crate::error::SyncError::Staging(format!(
                "Invalid sync status: {}",
                s
            ))),
        }
    }
}

/// Sync bookkeeping shared by masters and sub-items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub external_id: Option<String>,
    pub status: SyncStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub error_category: Option<ErrorCategory>,
}

impl SyncState {
    pub fn pending(external_id: Option<String>) -> Self {
        Self {
            external_id,
            status: SyncStatus::Pending,
            retry_count: 0,
            last_error: None,
            error_category: None,
        }
    }

    /// Apply a push outcome. Returns false when nothing changed.
    pub(crate) fn apply(&mut self, result: &SyncResult) -> bool {
        if self.status == SyncStatus::Promoted || self.status == result.status {
            return false;
        }
        self.status = result.status;
        if result.external_id.is_some() {
            self.external_id = result.external_id.clone();
        }
        self.retry_count = result.retry_count;
        self.last_error = result.last_error.clone();
        self.error_category = result.error_category;
        true
    }
}

/// Master staging row: one order line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingRecord {
    pub staging_id: Uuid,
    pub batch_id: Uuid,
    pub key: BusinessKey,
    pub item_name: String,
    pub raw_payload: serde_json::Value,
    pub sync: SyncState,
    pub created_at: DateTime<Utc>,
}

/// Sub-item staging row: one size quantity of a master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingSubitem {
    pub staging_id: Uuid,
    pub batch_id: Uuid,
    pub parent_staging_id: Uuid,
    pub size_label: String,
    pub quantity: i64,
    pub raw_payload: serde_json::Value,
    pub sync: SyncState,
    pub created_at: DateTime<Utc>,
}

/// A master with its sub-items, as produced by the transformer.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedItem {
    pub master: StagingRecord,
    pub subitems: Vec<StagingSubitem>,
}

/// Staging rows of one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchRows {
    pub masters: Vec<StagingRecord>,
    pub subitems: Vec<StagingSubitem>,
}

impl BatchRows {
    pub fn len(&self) -> usize {
        self.masters.len() + self.subitems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masters.is_empty() && self.subitems.is_empty()
    }

    pub fn master(&self, staging_id: Uuid) -> Option<&StagingRecord> {
        self.masters.iter().find(|m| m.staging_id == staging_id)
    }

    /// Sub-items of one master.
    pub fn children_of(&self, parent_staging_id: Uuid) -> impl Iterator<Item = &StagingSubitem> {
        self.subitems
            .iter()
            .filter(move |s| s.parent_staging_id == parent_staging_id)
    }
}

/// Outcome of a promotion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionStats {
    pub masters_inserted: usize,
    pub masters_updated: usize,
    pub subitems_promoted: usize,
}

impl PromotionStats {
    pub fn masters(&self) -> usize {
        self.masters_inserted + self.masters_updated
    }
}

/// Staging persistence and promotion.
///
/// # Thread Safety
///
/// Implementations are shared across concurrently running batches. Every
/// operation touches only the rows of the batch it names.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Initialize staging and production tables. Idempotent.
    async fn init_schema(&self) -> Result<()>;

    /// Insert all rows of a batch, or none.
    ///
    /// External ids are copied onto the new rows, so changed records become
    /// updates on the platform. Production wins; otherwise the latest
    /// EXTERNAL_SUCCESS row of an unpromoted batch supplies the id. A size
    /// present in production but missing from the record is staged as a
    /// zero-quantity sub-item.
    async fn load(&self, batch: &Batch, items: &[StagedItem]) -> Result<()>;

    /// Record a push outcome. Re-applying the same status is a no-op.
    async fn mark_synced(&self, result: &SyncResult) -> Result<()>;

    /// Move every EXTERNAL_SUCCESS row of a batch into production in one
    /// transaction. A constraint violation rolls back the whole batch.
    async fn promote(&self, batch_id: Uuid) -> Result<PromotionStats>;

    async fn rows(&self, batch_id: Uuid) -> Result<BatchRows>;

    /// EXTERNAL_FAILED rows of a batch, kept for operator review.
    async fn failed_rows(&self, batch_id: Uuid) -> Result<BatchRows>;

    /// Delete PROMOTED rows of a batch. Returns the number removed.
    async fn purge_promoted(&self, batch_id: Uuid) -> Result<usize>;

    fn backend_type(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: SyncStatus, external_id: Option<&str>) -> SyncResult {
        SyncResult {
            staging_id: Uuid::nil(),
            external_id: external_id.map(str::to_string),
            status,
            error_category: None,
            retry_count: 1,
            last_error: None,
        }
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut state = SyncState::pending(None);
        assert!(state.apply(&result(SyncStatus::ExternalSuccess, Some("901"))));
        assert!(!state.apply(&result(SyncStatus::ExternalSuccess, Some("901"))));
        assert_eq!(state.external_id.as_deref(), Some("901"));
        assert_eq!(state.retry_count, 1);
    }

    #[test]
    fn test_promoted_rows_ignore_late_results() {
        let mut state = SyncState::pending(Some("901".into()));
        state.status = SyncStatus::Promoted;
        assert!(!state.apply(&result(SyncStatus::ExternalFailed, None)));
        assert_eq!(state.status, SyncStatus::Promoted);
    }

    #[test]
    fn test_update_keeps_existing_external_id() {
        let mut state = SyncState::pending(Some("77".into()));
        state.apply(&result(SyncStatus::ExternalSuccess, None));
        assert_eq!(state.external_id.as_deref(), Some("77"));
    }
}
