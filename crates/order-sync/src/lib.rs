//! # order-sync
//!
//! Change detection and batch synchronization of order data into an external
//! work-tracking platform.
//!
//! A run scans the source table, fingerprints every order line and diffs the
//! scan against the last committed snapshot. Each customer with changes gets
//! its own batch:
//!
//! - **Staging** of master items and per-size sub-items, tagged by batch
//! - **Push** to the platform through a shared rate limiter with retry
//! - **Promotion** of synced rows into the production tables in one transaction
//! - **Snapshot commit** of the customer's slice, so failed keys are retried
//!   on the next run
//!
//! Full rowsets can be archived as checksummed Parquet files.
//!
//! ## Example
//!
//! ```rust,no_run
//! use order_sync::{Config, Orchestrator, RunOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> order_sync::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::connect(config).await?;
//!     orchestrator.init_schema().await?;
//!     let result = orchestrator
//!         .run(RunOptions::default(), CancellationToken::new())
//!         .await?;
//!     println!("{} of {} batches completed", result.batches_completed, result.batches_total);
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod batch;
pub mod config;
pub mod db;
pub mod detect;
pub mod error;
pub mod hasher;
pub mod orchestrator;
pub mod record;
pub mod snapshot;
pub mod source;
pub mod staging;
pub mod sync;
pub mod transform;

// Re-exports for convenient access
pub use archive::{ArchiveEntry, Archiver, FsArchiveStore, ValidationResult};
pub use batch::{Batch, BatchLog, BatchOrchestrator, BatchStatus, BatchType};
pub use config::{ArchiveConfig, Config, DatabaseConfig, PlatformConfig, SourceConfig, SyncConfig};
pub use detect::{ChangeDetector, ChangeKind, ChangeRecord, DetectionResult, DetectionSummary};
pub use error::{Result, SyncError};
pub use hasher::{ContentHash, Fingerprint, Hasher};
pub use orchestrator::{Backends, HealthCheckResult, Orchestrator, RunOptions, RunResult};
pub use record::{BusinessKey, KeyColumns, SourceRecord, Value};
pub use snapshot::{Snapshot, SnapshotScope, SnapshotStore};
pub use source::{MemorySource, SourceReader};
pub use staging::{BatchRows, StagingStore, SyncStatus};
pub use sync::{RateLimiter, RetryPolicy, SyncClient, SyncResult};
