//! Drives one customer batch through its phases.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{Batch, BatchFailure, BatchLog, BatchStatus, BatchType};
use crate::detect::DetectionResult;
use crate::error::{Result, SyncError};
use crate::record::BusinessKey;
use crate::snapshot::SnapshotStore;
use crate::staging::{BatchRows, StagingStore};
use crate::sync::{ErrorCategory, PushRow, SyncClient, SyncResult};
use crate::transform::{master_push, subitem_push, Transformer};

/// One customer's share of a detection result.
#[derive(Clone)]
pub struct BatchWork {
    pub customer: String,
    pub detection: Arc<DetectionResult>,
}

/// Runs batches against shared stores and a shared sync client.
pub struct BatchOrchestrator {
    staging: Arc<dyn StagingStore>,
    snapshots: Arc<dyn SnapshotStore>,
    log: Arc<dyn BatchLog>,
    client: Arc<SyncClient>,
    transformer: Transformer,
}

impl BatchOrchestrator {
    pub fn new(
        staging: Arc<dyn StagingStore>,
        snapshots: Arc<dyn SnapshotStore>,
        log: Arc<dyn BatchLog>,
        client: Arc<SyncClient>,
        transformer: Transformer,
    ) -> Self {
        Self {
            staging,
            snapshots,
            log,
            client,
            transformer,
        }
    }

    /// Run a batch to COMPLETED or FAILED and return its final record.
    ///
    /// Record-level failures are counted and listed on the batch. Staging,
    /// promotion and snapshot errors, connectivity loss and cancellation fail
    /// the batch; the customer's snapshot slice is then left as it was.
    pub async fn run_batch(&self, work: BatchWork, cancel: &CancellationToken) -> Batch {
        let total = work.detection.pending_for(&work.customer).len();
        let mut batch = Batch::start(work.customer.clone(), BatchType::FullBatch, total);
        info!(
            "Batch {} started for {} ({} records)",
            batch.batch_id, batch.customer_name, total
        );

        if let Err(e) = self.drive(&mut batch, &work, cancel).await {
            let summary = match e {
                SyncError::Cancelled => "cancelled".to_string(),
                ref other => other.to_string(),
            };
            error!(
                "Batch {} for {} failed in {}: {}",
                batch.batch_id, batch.customer_name, batch.status, summary
            );
            if let Err(e) = batch.fail(summary) {
                warn!("Batch {} already terminal: {}", batch.batch_id, e);
            }
            if let Err(e) = self.log.record(&batch).await {
                warn!("Could not record failed batch {}: {}", batch.batch_id, e);
            }
        }
        batch
    }

    async fn advance(&self, batch: &mut Batch, to: BatchStatus) -> Result<()> {
        batch.advance(to)?;
        self.log.record(batch).await?;
        info!("Batch {} for {} -> {}", batch.batch_id, batch.customer_name, to);
        Ok(())
    }

    fn checkpoint(cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn drive(
        &self,
        batch: &mut Batch,
        work: &BatchWork,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.log.record(batch).await?;
        Self::checkpoint(cancel)?;
        let detection = &work.detection;

        // Transform. Invalid records are counted and never staged.
        let mut items = Vec::new();
        let mut rejected = 0;
        for (change, record) in detection.pending_for(&work.customer) {
            match self.transformer.stage(batch.batch_id, &change.key, record) {
                Ok(item) => items.push(item),
                Err(e) => {
                    warn!("Batch {}: {}", batch.batch_id, e);
                    rejected += 1;
                    batch.record_failure(BatchFailure {
                        key: change.key.to_string(),
                        phase: "transform".into(),
                        category: Some(ErrorCategory::Validation),
                        message: e.to_string(),
                    });
                }
            }
        }
        batch.set_counts(0, rejected)?;

        self.staging.load(batch, &items).await?;
        self.advance(batch, BatchStatus::StagingLoaded).await?;
        Self::checkpoint(cancel)?;

        // Staged rows carry the external ids copied from production.
        let rows = self.staging.rows(batch.batch_id).await?;

        let master_rows: Vec<PushRow> = rows.masters.iter().map(master_push).collect();
        let master_results = self.client.push(master_rows, cancel).await?;
        let mut master_ok: HashMap<Uuid, String> = HashMap::new();
        for result in &master_results {
            self.staging.mark_synced(result).await?;
            let Some(master) = rows.master(result.staging_id) else {
                continue;
            };
            match (&result.external_id, result.is_success()) {
                (Some(id), true) => {
                    master_ok.insert(master.staging_id, id.clone());
                }
                _ => Self::record_push_failure(batch, master.key.to_string(), "items", result),
            }
        }
        self.advance(batch, BatchStatus::ItemsCreated).await?;
        Self::checkpoint(cancel)?;

        let sub_results = self.push_subitems(batch, &rows, &master_ok, cancel).await?;
        let sub_failed: BTreeSet<Uuid> = sub_results
            .iter()
            .filter(|r| !r.is_success())
            .filter_map(|r| {
                rows.subitems
                    .iter()
                    .find(|s| s.staging_id == r.staging_id)
                    .map(|s| s.parent_staging_id)
            })
            .collect();

        // A record synced when its master and all of its sub-items did.
        let synced: BTreeSet<BusinessKey> = rows
            .masters
            .iter()
            .filter(|m| master_ok.contains_key(&m.staging_id) && !sub_failed.contains(&m.staging_id))
            .map(|m| m.key.clone())
            .collect();
        let successful = synced.len();
        batch.set_counts(successful, total_of(batch) - successful)?;
        self.advance(batch, BatchStatus::SubitemsCreated).await?;
        Self::checkpoint(cancel)?;

        let stats = self.staging.promote(batch.batch_id).await?;
        info!(
            "Batch {} promoted {} items ({} new) and {} sub-items",
            batch.batch_id,
            stats.masters(),
            stats.masters_inserted,
            stats.subitems_promoted
        );
        self.advance(batch, BatchStatus::Promoted).await?;

        let slice = detection.slice_for(&work.customer, &synced);
        let snapshot = self
            .snapshots
            .commit_slice(&detection.scope, &work.customer, detection.base_version, slice)
            .await?;
        info!(
            "Batch {}: snapshot {} now at version {}",
            batch.batch_id, snapshot.scope, snapshot.version
        );
        self.advance(batch, BatchStatus::Completed).await?;

        info!(
            "Batch {} for {} completed: {} succeeded, {} failed in {:.1}s",
            batch.batch_id,
            batch.customer_name,
            batch.successful_records,
            batch.failed_records,
            batch.duration_secs()
        );
        Ok(())
    }

    /// Push sub-items of successful masters; the rest fail as `parent_failed`.
    async fn push_subitems(
        &self,
        batch: &mut Batch,
        rows: &BatchRows,
        master_ok: &HashMap<Uuid, String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SyncResult>> {
        let mut results = Vec::with_capacity(rows.subitems.len());
        let mut push = Vec::new();
        for sub in &rows.subitems {
            match master_ok.get(&sub.parent_staging_id) {
                Some(parent_id) => push.push(subitem_push(sub, parent_id)),
                None => results.push(SyncResult::failed(
                    sub.staging_id,
                    ErrorCategory::ParentFailed,
                    0,
                    "parent item was not created",
                )),
            }
        }
        results.extend(self.client.push(push, cancel).await?);

        for result in &results {
            self.staging.mark_synced(result).await?;
            if result.is_success() || result.error_category == Some(ErrorCategory::ParentFailed) {
                continue;
            }
            let key = rows
                .subitems
                .iter()
                .find(|s| s.staging_id == result.staging_id)
                .and_then(|s| {
                    rows.master(s.parent_staging_id)
                        .map(|m| format!("{}|{}", m.key, s.size_label))
                })
                .unwrap_or_else(|| result.staging_id.to_string());
            Self::record_push_failure(batch, key, "subitems", result);
        }
        Ok(results)
    }

    fn record_push_failure(batch: &mut Batch, key: String, phase: &str, result: &SyncResult) {
        warn!(
            "Batch {}: {} failed in {} ({}): {}",
            batch.batch_id,
            key,
            phase,
            result
                .error_category
                .map(|c| c.as_str())
                .unwrap_or("unknown"),
            result.last_error.as_deref().unwrap_or("")
        );
        batch.record_failure(BatchFailure {
            key,
            phase: phase.into(),
            category: result.error_category,
            message: result.last_error.clone().unwrap_or_default(),
        });
    }
}

fn total_of(batch: &Batch) -> usize {
    batch.total_records.max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::MemoryBatchLog;
    use crate::detect::ChangeDetector;
    use crate::hasher::Hasher;
    use crate::record::SourceRecord;
    use crate::snapshot::{MemorySnapshotStore, Snapshot, SnapshotScope};
    use crate::staging::{MemoryStagingStore, SyncStatus};
    use crate::sync::{ItemOutcome, Mutation, Platform, PlatformError, RateLimiter, RetryPolicy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Rejects items whose name mentions a rejected order.
    struct Picky {
        next_id: AtomicUsize,
        reject_order: &'static str,
    }

    #[async_trait]
    impl Platform for Picky {
        async fn execute(
            &self,
            mutations: &[Mutation],
        ) -> std::result::Result<Vec<ItemOutcome>, PlatformError> {
            Ok(mutations
                .iter()
                .map(|m| match m {
                    Mutation::CreateItem { name, .. } if name.starts_with(self.reject_order) => {
                        ItemOutcome::Rejected {
                            category: ErrorCategory::Validation,
                            message: "bad column value".into(),
                        }
                    }
                    _ => ItemOutcome::Created {
                        external_id: self.next_id.fetch_add(1, Ordering::SeqCst).to_string(),
                    },
                })
                .collect())
        }

        fn max_items_per_call(&self) -> usize {
            10
        }

        async fn ping(&self) -> std::result::Result<(), PlatformError> {
            Ok(())
        }
    }

    fn row(order: &str, sizes: i64) -> SourceRecord {
        SourceRecord::new()
            .with("customer", "ACME")
            .with("order_number", order)
            .with("style", "TEE")
            .with("color", "RED")
            .with("po_number", "PO-1")
            .with("size_s", sizes)
            .with("size_m", sizes + 1)
    }

    struct Harness {
        staging: Arc<MemoryStagingStore>,
        snapshots: Arc<MemorySnapshotStore>,
        log: Arc<MemoryBatchLog>,
        orchestrator: BatchOrchestrator,
    }

    fn harness(reject_order: &'static str) -> Harness {
        let staging = Arc::new(MemoryStagingStore::new());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let log = Arc::new(MemoryBatchLog::new());
        let client = Arc::new(SyncClient::new(
            Arc::new(Picky {
                next_id: AtomicUsize::new(1000),
                reject_order,
            }),
            Arc::new(RateLimiter::new(2, Duration::ZERO)),
            RetryPolicy::default(),
            10,
        ));
        let orchestrator = BatchOrchestrator::new(
            staging.clone(),
            snapshots.clone(),
            log.clone(),
            client,
            Transformer::new(Hasher::default(), "size_"),
        );
        Harness {
            staging,
            snapshots,
            log,
            orchestrator,
        }
    }

    fn detect(rows: &[SourceRecord]) -> Arc<DetectionResult> {
        let prior = Snapshot::empty(SnapshotScope::new("orders", None));
        Arc::new(ChangeDetector::default().detect(rows, &prior).unwrap())
    }

    #[tokio::test]
    async fn test_rejected_master_fails_its_subitems() {
        let h = harness("SO-2");
        let detection = detect(&[row("SO-1", 2), row("SO-2", 3)]);
        let batch = h
            .orchestrator
            .run_batch(
                BatchWork {
                    customer: "ACME".into(),
                    detection: detection.clone(),
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!((batch.successful_records, batch.failed_records), (1, 1));
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].phase, "items");

        let failed = h.staging.failed_rows(batch.batch_id).await.unwrap();
        assert_eq!(failed.masters.len(), 1);
        assert_eq!(failed.subitems.len(), 2);
        assert!(failed
            .subitems
            .iter()
            .all(|s| s.sync.error_category == Some(ErrorCategory::ParentFailed)
                && s.sync.status == SyncStatus::ExternalFailed));

        let (items, subitems) = h.staging.production().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(subitems.len(), 2);

        // Only the synced key enters the baseline.
        let current = h.snapshots.current(&detection.scope).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current.version, 1);

        let logged = h.log.get(batch.batch_id).await.unwrap().unwrap();
        assert_eq!(logged.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancelled_batch_fails_without_touching_snapshot() {
        let h = harness("none");
        let detection = detect(&[row("SO-1", 1)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let batch = h
            .orchestrator
            .run_batch(
                BatchWork {
                    customer: "ACME".into(),
                    detection: detection.clone(),
                },
                &cancel,
            )
            .await;

        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.error_summary.as_deref(), Some("cancelled"));
        let current = h.snapshots.current(&detection.scope).await.unwrap();
        assert!(current.is_empty());
        let logged = h.log.get(batch.batch_id).await.unwrap().unwrap();
        assert_eq!(logged.status, BatchStatus::Failed);
    }

    #[tokio::test]
    async fn test_invalid_record_counts_as_failed() {
        let h = harness("none");
        let detection = detect(&[row("SO-1", 1), row("SO-2", 1).with("size_l", -4_i64)]);
        let batch = h
            .orchestrator
            .run_batch(
                BatchWork {
                    customer: "ACME".into(),
                    detection,
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!((batch.successful_records, batch.failed_records), (1, 1));
        assert_eq!(batch.failures[0].phase, "transform");
    }
}
