//! Customer-scoped batches and their lifecycle.
//!
//! ```text
//! STARTED -> STAGING_LOADED -> ITEMS_CREATED -> SUBITEMS_CREATED -> PROMOTED -> COMPLETED
//!    \______________\________________\_________________\______________\-----> FAILED
//! ```
//!
//! A [`Batch`] only changes through [`Batch::advance`] and [`Batch::fail`];
//! once COMPLETED or FAILED it is immutable.

mod log;
mod orchestrator;

pub use log::{BatchLog, DbBatchLog, MemoryBatchLog};
pub use orchestrator::{BatchOrchestrator, BatchWork};

use crate::error::{Result, SyncError};
use crate::sync::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// What a batch carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchType {
    /// Master items only.
    Orders,
    /// Sub-items only.
    Subitems,
    /// Masters and their sub-items.
    FullBatch,
}

impl BatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchType::Orders => "ORDERS",
            BatchType::Subitems => "SUBITEMS",
            BatchType::FullBatch => "FULL_BATCH",
        }
    }
}

impl fmt::Display for BatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ORDERS" => Ok(BatchType::Orders),
            "SUBITEMS" => Ok(BatchType::Subitems),
            "FULL_BATCH" => Ok(BatchType::FullBatch),
            _ => Err(SyncError::Config(format!("Invalid batch type: {}", s))),
        }
    }
}

/// Lifecycle state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Started,
    StagingLoaded,
    ItemsCreated,
    SubitemsCreated,
    Promoted,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Started => "STARTED",
            BatchStatus::StagingLoaded => "STAGING_LOADED",
            BatchStatus::ItemsCreated => "ITEMS_CREATED",
            BatchStatus::SubitemsCreated => "SUBITEMS_CREATED",
            BatchStatus::Promoted => "PROMOTED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }

    /// The single forward successor, if any.
    pub fn next(&self) -> Option<BatchStatus> {
        match self {
            BatchStatus::Started => Some(BatchStatus::StagingLoaded),
            BatchStatus::StagingLoaded => Some(BatchStatus::ItemsCreated),
            BatchStatus::ItemsCreated => Some(BatchStatus::SubitemsCreated),
            BatchStatus::SubitemsCreated => Some(BatchStatus::Promoted),
            BatchStatus::Promoted => Some(BatchStatus::Completed),
            BatchStatus::Completed | BatchStatus::Failed => None,
        }
    }

    /// Whether the lifecycle allows moving from `self` to `to`.
    pub fn can_transition_to(&self, to: BatchStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == BatchStatus::Failed || self.next() == Some(to)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "STARTED" => Ok(BatchStatus::Started),
            "STAGING_LOADED" => Ok(BatchStatus::StagingLoaded),
            "ITEMS_CREATED" => Ok(BatchStatus::ItemsCreated),
            "SUBITEMS_CREATED" => Ok(BatchStatus::SubitemsCreated),
            "PROMOTED" => Ok(BatchStatus::Promoted),
            "COMPLETED" => Ok(BatchStatus::Completed),
            "FAILED" => Ok(BatchStatus::Failed),
            _ => Err(SyncError::Config(format!("Invalid batch status: {}", s))),
        }
    }
}

/// One record-level failure inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    /// Business key of the record, rendered.
    pub key: String,
    /// Phase the failure happened in (`transform`, `items`, `subitems`).
    pub phase: String,
    pub category: Option<ErrorCategory>,
    pub message: String,
}

/// Unit of work grouping all changes for one customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: Uuid,
    pub customer_name: String,
    pub batch_type: BatchType,
    pub status: BatchStatus,
    pub total_records: i64,
    pub successful_records: i64,
    pub failed_records: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub staging_loaded_at: Option<DateTime<Utc>>,
    pub items_created_at: Option<DateTime<Utc>>,
    pub subitems_created_at: Option<DateTime<Utc>>,
    pub promoted_at: Option<DateTime<Utc>>,
    pub error_summary: Option<String>,
    #[serde(default)]
    pub failures: Vec<BatchFailure>,
}

impl Batch {
    /// Open a new batch in STARTED.
    pub fn start(customer_name: impl Into<String>, batch_type: BatchType, total_records: usize) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            customer_name: customer_name.into(),
            batch_type,
            status: BatchStatus::Started,
            total_records: total_records as i64,
            successful_records: 0,
            failed_records: 0,
            start_time: Utc::now(),
            end_time: None,
            staging_loaded_at: None,
            items_created_at: None,
            subitems_created_at: None,
            promoted_at: None,
            error_summary: None,
            failures: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, to: BatchStatus) -> Result<DateTime<Utc>> {
        if !self.status.can_transition_to(to) {
            return Err(SyncError::InvalidTransition {
                batch_id: self.batch_id,
                from: self.status,
                to,
            });
        }
        let now = Utc::now();
        self.status = to;
        if to.is_terminal() {
            self.end_time = Some(now);
        }
        Ok(now)
    }

    /// Move to the next phase, stamping its timestamp.
    pub fn advance(&mut self, to: BatchStatus) -> Result<()> {
        if to == BatchStatus::Failed {
            return self.fail("failed without summary");
        }
        let at = self.transition(to)?;
        match to {
            BatchStatus::StagingLoaded => self.staging_loaded_at = Some(at),
            BatchStatus::ItemsCreated => self.items_created_at = Some(at),
            BatchStatus::SubitemsCreated => self.subitems_created_at = Some(at),
            BatchStatus::Promoted => self.promoted_at = Some(at),
            _ => {}
        }
        Ok(())
    }

    /// Move to FAILED. Counters are kept.
    pub fn fail(&mut self, summary: impl Into<String>) -> Result<()> {
        self.transition(BatchStatus::Failed)?;
        self.error_summary = Some(summary.into());
        Ok(())
    }

    /// Replace the success/failure counters. Rejected once terminal.
    pub fn set_counts(&mut self, successful: usize, failed: usize) -> Result<()> {
        if self.is_terminal() {
            return Err(SyncError::InvalidTransition {
                batch_id: self.batch_id,
                from: self.status,
                to: self.status,
            });
        }
        self.successful_records = successful as i64;
        self.failed_records = failed as i64;
        Ok(())
    }

    pub fn record_failure(&mut self, failure: BatchFailure) {
        if !self.is_terminal() {
            self.failures.push(failure);
        }
    }

    /// Wall-clock duration, up to now for a running batch.
    pub fn duration_secs(&self) -> f64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds() as f64 / 1000.0
    }
}
