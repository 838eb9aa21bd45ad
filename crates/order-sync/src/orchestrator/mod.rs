//! Run orchestrator - detection, customer batches and archiving.

use crate::archive::{ArchiveEntry, Archiver};
use crate::batch::{Batch, BatchLog, BatchOrchestrator, BatchStatus, BatchWork, DbBatchLog};
use crate::config::Config;
use crate::db;
use crate::detect::{ChangeDetector, DetectionResult, DetectionSummary};
use crate::error::{Result, SyncError};
use crate::record::SourceRecord;
use crate::snapshot::{DbSnapshotStore, SnapshotScope, SnapshotStore};
use crate::source::{PgSourceReader, SourceReader};
use crate::staging::{BatchRows, DbStagingStore, StagingStore};
use crate::sync::{HttpPlatform, Platform, SyncClient};
use crate::transform::Transformer;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Storage and platform backends used by a run.
pub struct Backends {
    pub source: Arc<dyn SourceReader>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub staging: Arc<dyn StagingStore>,
    pub log: Arc<dyn BatchLog>,
    pub platform: Arc<dyn Platform>,
}

/// Per-run overrides of the configured scope.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Restrict the run to one customer. Falls back to `sync.customer_filter`.
    pub customer_filter: Option<String>,
    /// Detect and report only; nothing is staged, pushed or committed.
    pub dry_run: bool,
    /// Archive the scanned rowset after the batches finish.
    pub archive: bool,
}

/// Final state of one customer batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub customer: String,
    pub status: String,
    pub total_records: i64,
    pub successful_records: i64,
    pub failed_records: i64,
    pub duration_seconds: f64,
    pub error_summary: Option<String>,
}

impl From<&Batch> for BatchSummary {
    fn from(batch: &Batch) -> Self {
        Self {
            batch_id: batch.batch_id.to_string(),
            customer: batch.customer_name.clone(),
            status: batch.status.to_string(),
            total_records: batch.total_records,
            successful_records: batch.successful_records,
            failed_records: batch.failed_records,
            duration_seconds: batch.duration_secs(),
            error_summary: batch.error_summary.clone(),
        }
    }
}

/// Result of a synchronization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Unique run identifier.
    pub run_id: String,

    /// `completed`, `failed`, `cancelled` or `dry_run`.
    pub status: String,

    /// Source table and customer filter, e.g. `orders[ACME]`.
    pub scope: String,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,

    /// Detection counters.
    pub detection: DetectionSummary,

    pub batches_total: usize,
    pub batches_completed: usize,
    pub batches_failed: usize,

    /// Customers with changes whose batch never started (cancellation).
    pub customers_skipped: Vec<String>,

    pub records_successful: i64,
    pub records_failed: i64,

    pub batches: Vec<BatchSummary>,

    /// Archive written by this run, if any.
    pub archive: Option<ArchiveEntry>,

    /// Archive failure. Never fails the run.
    pub archive_error: Option<String>,
}

impl RunResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn is_success(&self) -> bool {
        self.status == "completed" || self.status == "dry_run"
    }
}

/// Connectivity of the run's dependencies.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub database_connected: bool,
    pub database_latency_ms: u64,
    pub database_error: Option<String>,
    pub platform_connected: bool,
    pub platform_latency_ms: u64,
    pub platform_error: Option<String>,
    pub healthy: bool,
}

/// Synchronization run coordinator.
pub struct Orchestrator {
    config: Config,
    pool: Option<Pool>,
    source: Arc<dyn SourceReader>,
    snapshots: Arc<dyn SnapshotStore>,
    batches: Arc<BatchOrchestrator>,
    log: Arc<dyn BatchLog>,
    staging: Arc<dyn StagingStore>,
    platform: Arc<dyn Platform>,
    detector: ChangeDetector,
    archiver: Archiver,
}

impl Orchestrator {
    /// Connect to PostgreSQL and the platform using the configuration.
    pub async fn connect(config: Config) -> Result<Self> {
        let pool = db::connect(&config.database).await?;
        let state_schema = config.database.state_schema.as_str();

        let backends = Backends {
            source: Arc::new(PgSourceReader::new(
                pool.clone(),
                config.source.schema.clone(),
                config.source.table.clone(),
                &config.source.key_columns,
            )),
            snapshots: Arc::new(DbSnapshotStore::new(pool.clone(), state_schema)),
            staging: Arc::new(DbStagingStore::new(
                pool.clone(),
                state_schema,
                &config.database.production_schema,
            )),
            log: Arc::new(DbBatchLog::new(pool.clone(), state_schema)),
            platform: Arc::new(HttpPlatform::new(&config.platform)?),
        };

        let mut orchestrator = Self::with_backends(config, backends);
        orchestrator.pool = Some(pool);
        Ok(orchestrator)
    }

    /// Build from explicit backends.
    pub fn with_backends(config: Config, backends: Backends) -> Self {
        let hasher = config.hasher();
        let client = Arc::new(SyncClient::new(
            backends.platform.clone(),
            Arc::new(config.sync.rate_limiter()),
            config.sync.retry_policy(),
            config.sync.batch_size,
        ));
        let batches = Arc::new(BatchOrchestrator::new(
            backends.staging.clone(),
            backends.snapshots.clone(),
            backends.log.clone(),
            client,
            Transformer::new(hasher.clone(), config.source.size_column_prefix.clone()),
        ));
        let archiver = Archiver::from_config(&config.archive, backends.source.table_name());

        Self {
            pool: None,
            source: backends.source,
            snapshots: backends.snapshots,
            batches,
            log: backends.log,
            staging: backends.staging,
            platform: backends.platform,
            detector: ChangeDetector::new(hasher),
            archiver,
            config,
        }
    }

    /// Replace the archiver (tests point it at a temporary directory).
    pub fn with_archiver(mut self, archiver: Archiver) -> Self {
        self.archiver = archiver;
        self
    }

    pub fn archiver(&self) -> &Archiver {
        &self.archiver
    }

    /// Most recent batches first, optionally for one customer.
    pub async fn list_batches(&self, customer: Option<&str>, limit: usize) -> Result<Vec<Batch>> {
        let customer = customer.map(|c| c.trim().to_uppercase());
        self.log.list(customer.as_deref(), limit).await
    }

    /// EXTERNAL_FAILED staging rows of a batch.
    pub async fn failed_rows(&self, batch_id: Uuid) -> Result<BatchRows> {
        self.staging.failed_rows(batch_id).await
    }

    /// Delete the promoted staging rows of a finished batch.
    pub async fn purge_staging(&self, batch_id: Uuid) -> Result<usize> {
        let batch = self
            .log
            .get(batch_id)
            .await?
            .ok_or_else(|| SyncError::Staging(format!("unknown batch {}", batch_id)))?;
        if !batch.status.is_terminal() {
            return Err(SyncError::Staging(format!(
                "batch {} is still {}; purge it once it finishes",
                batch_id, batch.status
            )));
        }
        let removed = self.staging.purge_promoted(batch_id).await?;
        info!("Purged {} promoted staging rows of batch {}", removed, batch_id);
        Ok(removed)
    }

    /// Create the state tables. Idempotent.
    pub async fn init_schema(&self) -> Result<()> {
        self.snapshots.init_schema().await?;
        self.staging.init_schema().await?;
        self.log.init_schema().await?;
        info!(
            "Initialized {} snapshot store, {} staging store",
            self.snapshots.backend_type(),
            self.staging.backend_type()
        );
        Ok(())
    }

    fn scope(&self, customer_filter: Option<&str>) -> SnapshotScope {
        let filter = customer_filter.or(self.config.sync.customer_filter.as_deref());
        SnapshotScope::new(self.source.table_name(), filter)
    }

    /// Filtered and unfiltered snapshots of one table would track the same
    /// keys twice; refuse to mix them.
    async fn check_scope_collision(&self, scope: &SnapshotScope) -> Result<()> {
        let existing = self.snapshots.scopes(&scope.source_table).await?;
        let clash = existing
            .iter()
            .find(|other| other.customer_filter.is_some() != scope.customer_filter.is_some());
        if let Some(other) = clash {
            return Err(SyncError::Config(format!(
                "scope {} overlaps existing snapshot scope {}; keys would be tracked by both",
                scope, other
            )));
        }
        Ok(())
    }

    async fn scan(&self, scope: &SnapshotScope) -> Result<(Vec<SourceRecord>, DetectionResult)> {
        self.check_scope_collision(scope).await?;
        let rows = self.source.read(scope.customer_filter.as_deref()).await?;
        let prior = self.snapshots.current(scope).await?;
        let detection = self.detector.detect(&rows, &prior)?;
        Ok((rows, detection))
    }

    /// Detect changes without syncing anything.
    pub async fn detect(&self, customer_filter: Option<&str>) -> Result<DetectionResult> {
        let scope = self.scope(customer_filter);
        let (_, detection) = self.scan(&scope).await?;
        Ok(detection)
    }

    /// Run detection, then one batch per customer with changes.
    pub async fn run(&self, options: RunOptions, cancel: CancellationToken) -> Result<RunResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let scope = self.scope(options.customer_filter.as_deref());
        info!(
            "Starting run {} for {} (config {})",
            run_id,
            scope,
            &self.config.hash()[..12]
        );

        // Phase 1: detection completes before any batch touches staging.
        info!("Phase 1: Detecting changes");
        let (rows, detection) = self.scan(&scope).await?;
        let summary = detection.summary.clone();
        info!(
            "{}: {} new, {} changed, {} unchanged, {} deleted, {} unmappable, {} duplicate keys",
            scope,
            summary.new,
            summary.changed,
            summary.unchanged,
            summary.deleted,
            summary.unmappable,
            summary.duplicate_keys
        );

        let customers = detection.customers_with_changes();
        if options.dry_run {
            info!("Dry run: {} customers with changes, nothing synced", customers.len());
            return Ok(self.finish(run_id, "dry_run", &scope, started_at, summary, Vec::new(), Vec::new(), None, None));
        }

        // Phase 2: customer batches.
        info!("Phase 2: Running {} customer batches", customers.len());
        let (batches, skipped) = self.run_batches(Arc::new(detection), customers, &cancel).await;

        // Phase 3: archive. Failures are reported, never fatal.
        let (archive, archive_error) = if options.archive && self.config.archive.enabled && !cancel.is_cancelled() {
            info!("Phase 3: Archiving {} source rows", rows.len());
            match self.archive_rows(rows, scope.customer_filter.clone()).await {
                Ok(entry) => (Some(entry), None),
                Err(e) => {
                    warn!("Archive step failed: {}", e);
                    (None, Some(e.to_string()))
                }
            }
        } else {
            (None, None)
        };

        let failed = batches.iter().any(|b| b.status != BatchStatus::Completed.to_string());
        let status = if cancel.is_cancelled() {
            "cancelled"
        } else if failed {
            "failed"
        } else {
            "completed"
        };
        let result = self.finish(run_id, status, &scope, started_at, summary, batches, skipped, archive, archive_error);

        info!(
            "Run {}: {}/{} batches completed, {} records synced, {} failed in {:.1}s",
            result.status,
            result.batches_completed,
            result.batches_total,
            result.records_successful,
            result.records_failed,
            result.duration_seconds
        );
        Ok(result)
    }

    async fn run_batches(
        &self,
        detection: Arc<DetectionResult>,
        customers: Vec<String>,
        cancel: &CancellationToken,
    ) -> (Vec<BatchSummary>, Vec<String>) {
        let semaphore = Arc::new(Semaphore::new(self.config.sync.max_concurrent_batches.max(1)));
        let mut handles = Vec::new();
        let mut skipped = Vec::new();

        let mut pending = customers.into_iter();
        for customer in pending.by_ref() {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    skipped.push(customer);
                    break;
                }
            };
            if cancel.is_cancelled() {
                info!("Cancellation requested, not starting further batches");
                skipped.push(customer);
                break;
            }

            let work = BatchWork {
                customer: customer.clone(),
                detection: detection.clone(),
            };
            let batches = self.batches.clone();
            let token = cancel.clone();
            let handle = tokio::spawn(async move {
                let batch = batches.run_batch(work, &token).await;
                drop(permit);
                batch
            });
            handles.push((customer, handle));
        }
        skipped.extend(pending);

        let mut summaries = Vec::with_capacity(handles.len());
        for (customer, handle) in handles {
            match handle.await {
                Ok(batch) => summaries.push(BatchSummary::from(&batch)),
                Err(e) => {
                    error!("{}: batch task panicked - {}", customer, e);
                    summaries.push(BatchSummary {
                        batch_id: String::new(),
                        customer,
                        status: BatchStatus::Failed.to_string(),
                        total_records: 0,
                        successful_records: 0,
                        failed_records: 0,
                        duration_seconds: 0.0,
                        error_summary: Some(format!("Task panicked: {}", e)),
                    });
                }
            }
        }
        (summaries, skipped)
    }

    async fn archive_rows(&self, rows: Vec<SourceRecord>, customer_filter: Option<String>) -> Result<ArchiveEntry> {
        let archiver = self.archiver.clone();
        tokio::task::spawn_blocking(move || archiver.archive(&rows, customer_filter.as_deref()))
            .await
            .map_err(|e| SyncError::Archive(format!("archive task failed: {}", e)))?
    }

    /// Read the source and archive it, outside of a run.
    pub async fn archive(&self, customer_filter: Option<&str>) -> Result<ArchiveEntry> {
        let scope = self.scope(customer_filter);
        let rows = self.source.read(scope.customer_filter.as_deref()).await?;
        self.archive_rows(rows, scope.customer_filter.clone()).await
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        run_id: String,
        status: &str,
        scope: &SnapshotScope,
        started_at: DateTime<Utc>,
        detection: DetectionSummary,
        batches: Vec<BatchSummary>,
        customers_skipped: Vec<String>,
        archive: Option<ArchiveEntry>,
        archive_error: Option<String>,
    ) -> RunResult {
        let completed_at = Utc::now();
        let completed = BatchStatus::Completed.to_string();
        let batches_completed = batches.iter().filter(|b| b.status == completed).count();
        RunResult {
            run_id,
            status: status.to_string(),
            scope: scope.to_string(),
            started_at,
            completed_at,
            duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
            detection,
            batches_total: batches.len(),
            batches_completed,
            batches_failed: batches.len() - batches_completed,
            customers_skipped,
            records_successful: batches.iter().map(|b| b.successful_records).sum(),
            records_failed: batches.iter().map(|b| b.failed_records).sum(),
            batches,
            archive,
            archive_error,
        }
    }

    /// Check database and platform connectivity.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let (database_connected, database_latency_ms, database_error) = match &self.pool {
            Some(pool) => {
                let start = Instant::now();
                let outcome = async {
                    let client = pool.get().await?;
                    client.simple_query("SELECT 1").await?;
                    Ok::<_, SyncError>(())
                }
                .await;
                let elapsed = start.elapsed().as_millis() as u64;
                match outcome {
                    Ok(()) => (true, elapsed, None),
                    Err(e) => (false, elapsed, Some(e.to_string())),
                }
            }
            None => (true, 0, None),
        };

        let start = Instant::now();
        let ping = self.platform.ping().await;
        let platform_latency_ms = start.elapsed().as_millis() as u64;
        let (platform_connected, platform_error) = match ping {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };

        Ok(HealthCheckResult {
            database_connected,
            database_latency_ms,
            database_error,
            platform_connected,
            platform_latency_ms,
            platform_error,
            healthy: database_connected && platform_connected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::MemoryBatchLog;
    use crate::snapshot::MemorySnapshotStore;
    use crate::source::MemorySource;
    use crate::staging::MemoryStagingStore;
    use crate::sync::{ItemOutcome, Mutation, PlatformError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Echo {
        next_id: AtomicU64,
    }

    #[async_trait]
    impl Platform for Echo {
        async fn execute(
            &self,
            mutations: &[Mutation],
        ) -> std::result::Result<Vec<ItemOutcome>, PlatformError> {
            Ok(mutations
                .iter()
                .map(|m| match m.target_id() {
                    Some(id) => ItemOutcome::Created {
                        external_id: id.to_string(),
                    },
                    None => ItemOutcome::Created {
                        external_id: self.next_id.fetch_add(1, Ordering::SeqCst).to_string(),
                    },
                })
                .collect())
        }

        fn max_items_per_call(&self) -> usize {
            50
        }

        async fn ping(&self) -> std::result::Result<(), PlatformError> {
            Ok(())
        }
    }

    fn config() -> Config {
        Config::from_yaml(
            r#"
database:
  host: localhost
  database: orders
  user: sync
  ssl_mode: disable
platform:
  api_token: token
  board_id: "1"
"#,
        )
        .unwrap()
    }

    fn row(customer: &str, order: &str, qty: i64) -> SourceRecord {
        SourceRecord::new()
            .with("customer", customer)
            .with("order_number", order)
            .with("style", "TEE")
            .with("color", "RED")
            .with("po_number", "PO-1")
            .with("size_m", qty)
    }

    fn orchestrator(rows: Vec<SourceRecord>) -> (Orchestrator, Arc<MemorySource>, Arc<MemorySnapshotStore>) {
        let source = Arc::new(MemorySource::new("orders", rows));
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let backends = Backends {
            source: source.clone(),
            snapshots: snapshots.clone(),
            staging: Arc::new(MemoryStagingStore::new()),
            log: Arc::new(MemoryBatchLog::new()),
            platform: Arc::new(Echo {
                next_id: AtomicU64::new(1000),
            }),
        };
        (Orchestrator::with_backends(config(), backends), source, snapshots)
    }

    #[tokio::test]
    async fn test_dry_run_commits_nothing() {
        let (orch, _, snapshots) = orchestrator(vec![row("ACME", "1", 2), row("GLOBEX", "2", 1)]);
        let options = RunOptions {
            dry_run: true,
            ..Default::default()
        };
        let result = orch.run(options, CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, "dry_run");
        assert_eq!(result.detection.new, 2);
        assert_eq!(result.batches_total, 0);
        let current = snapshots.current(&SnapshotScope::new("orders", None)).await.unwrap();
        assert!(current.is_empty());
    }

    #[tokio::test]
    async fn test_one_batch_per_customer() {
        let (orch, _, _) = orchestrator(vec![
            row("ACME", "1", 2),
            row("ACME", "2", 3),
            row("GLOBEX", "3", 1),
        ]);
        let result = orch.run(RunOptions::default(), CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, "completed");
        assert_eq!(result.batches_total, 2);
        assert_eq!(result.batches_completed, 2);
        assert_eq!(result.records_successful, 3);
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_deleted_only_customer_drops_keys() {
        let (orch, source, snapshots) = orchestrator(vec![row("ACME", "1", 2), row("GLOBEX", "2", 1)]);
        orch.run(RunOptions::default(), CancellationToken::new()).await.unwrap();

        source.set_rows(vec![row("ACME", "1", 2)]).unwrap();
        let result = orch.run(RunOptions::default(), CancellationToken::new()).await.unwrap();
        assert_eq!(result.detection.deleted, 1);
        assert_eq!(result.batches_completed, 1);

        let current = snapshots.current(&SnapshotScope::new("orders", None)).await.unwrap();
        assert_eq!(current.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_no_batches() {
        let (orch, _, _) = orchestrator(vec![row("ACME", "1", 2)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = orch.run(RunOptions::default(), cancel).await.unwrap();

        assert_eq!(result.status, "cancelled");
        assert_eq!(result.batches_total, 0);
        assert_eq!(result.customers_skipped, vec!["ACME".to_string()]);
    }

    #[tokio::test]
    async fn test_mixing_filtered_and_unfiltered_scopes_is_refused() {
        let (orch, _, _) = orchestrator(vec![row("ACME", "1", 2)]);
        orch.run(RunOptions::default(), CancellationToken::new()).await.unwrap();

        let options = RunOptions {
            customer_filter: Some("acme".into()),
            ..Default::default()
        };
        let err = orch.run(options, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[tokio::test]
    async fn test_archive_failure_does_not_fail_run() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _, _) = orchestrator(vec![row("ACME", "1", 2)]);
        let orch = orch.with_archiver(Archiver::new(
            crate::archive::FsArchiveStore::new(dir.path()),
            "orders",
            90,
        ));
        let options = RunOptions {
            archive: true,
            ..Default::default()
        };

        let first = orch.run(options.clone(), CancellationToken::new()).await.unwrap();
        assert!(first.archive.is_some());

        // Same day and scope: the archive slot is taken.
        let second = orch.run(options, CancellationToken::new()).await.unwrap();
        assert_eq!(second.status, "completed");
        assert!(second.archive.is_none());
        assert!(second.archive_error.is_some());
    }

    #[tokio::test]
    async fn test_batch_review_operations() {
        let (orch, _, _) = orchestrator(vec![row("ACME", "1", 2), row("GLOBEX", "2", 1)]);
        orch.run(RunOptions::default(), CancellationToken::new()).await.unwrap();

        assert_eq!(orch.list_batches(None, 10).await.unwrap().len(), 2);
        let acme = orch.list_batches(Some(" acme"), 10).await.unwrap();
        assert_eq!(acme.len(), 1);
        assert_eq!(acme[0].customer_name, "ACME");

        let batch_id = acme[0].batch_id;
        assert!(orch.failed_rows(batch_id).await.unwrap().is_empty());
        assert_eq!(orch.purge_staging(batch_id).await.unwrap(), 2);
        assert_eq!(orch.purge_staging(batch_id).await.unwrap(), 0);

        let err = orch.purge_staging(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SyncError::Staging(_)));
    }

    #[tokio::test]
    async fn test_health_check_without_database() {
        let (orch, _, _) = orchestrator(vec![]);
        let health = orch.health_check().await.unwrap();
        assert!(health.healthy);
    }
}
