//! order-sync CLI - change detection and batch sync of order data.

use clap::{Parser, Subcommand};
use order_sync::{Archiver, ChangeKind, Config, Orchestrator, RunOptions, SyncError};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code when the run finished but at least one batch failed.
const EXIT_BATCH_FAILED: u8 = 8;

#[derive(Parser)]
#[command(name = "order-sync")]
#[command(about = "Change detection and batch synchronization of order data")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect changes and sync them, one batch per customer
    Run {
        /// Only sync this customer
        #[arg(long)]
        customer: Option<String>,

        /// Override items per platform call
        #[arg(long)]
        batch_size: Option<usize>,

        /// Override attempts per record
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Dry run: detect and report without syncing
        #[arg(long)]
        dry_run: bool,

        /// Archive the scanned rows after the batches finish
        #[arg(long)]
        archive: bool,
    },

    /// Show what a run would sync
    Detect {
        /// Only scan this customer
        #[arg(long)]
        customer: Option<String>,

        /// List every change, not just the counts
        #[arg(long)]
        changes: bool,
    },

    /// Archive the current source rows
    Archive {
        /// Only archive this customer
        #[arg(long)]
        customer: Option<String>,
    },

    /// List stored archives
    ListArchives,

    /// Check archive blobs against their checksums
    ValidateArchives {
        /// Check a single archive
        #[arg(long)]
        id: Option<uuid::Uuid>,
    },

    /// Delete archives past retention
    CleanupArchives {
        /// Keep archives newer than this many days [default: archive.retention_days]
        #[arg(long)]
        keep_days: Option<u32>,

        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Decode an archive back to JSON rows
    RestoreArchive {
        /// Archive to restore
        #[arg(long)]
        id: uuid::Uuid,

        /// Write rows to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List recent batches
    ListBatches {
        /// Only list this customer's batches
        #[arg(long)]
        customer: Option<String>,

        /// Maximum number of batches to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show the rows of a batch the platform rejected
    FailedRows {
        /// Batch to inspect
        #[arg(long)]
        batch_id: uuid::Uuid,
    },

    /// Delete the promoted staging rows of a finished batch
    PurgeStaging {
        /// Batch to purge
        #[arg(long)]
        batch_id: uuid::Uuid,
    },

    /// Create the state and production tables
    InitSchema,

    /// Test database and platform connectivity
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, SyncError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            customer,
            batch_size,
            max_attempts,
            dry_run,
            archive,
        } => {
            if let Some(size) = batch_size {
                config.sync.batch_size = size;
            }
            if let Some(attempts) = max_attempts {
                config.sync.max_attempts = attempts;
            }
            config.validate()?;

            let cancel = setup_signal_handler();
            let orchestrator = Orchestrator::connect(config).await?;
            let options = RunOptions {
                customer_filter: customer,
                dry_run,
                archive,
            };
            let result = orchestrator.run(options, cancel).await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                let status_msg = if dry_run { "Dry run completed!" } else { "Run finished!" };
                println!("\n{}", status_msg);
                println!("  Run ID: {}", result.run_id);
                println!("  Scope: {}", result.scope);
                println!("  Status: {}", result.status);
                println!("  Duration: {:.2}s", result.duration_seconds);
                println!(
                    "  Changes: {} new, {} changed, {} deleted, {} unchanged",
                    result.detection.new,
                    result.detection.changed,
                    result.detection.deleted,
                    result.detection.unchanged
                );
                println!(
                    "  Batches: {}/{} completed",
                    result.batches_completed, result.batches_total
                );
                println!(
                    "  Records: {} synced, {} failed",
                    result.records_successful, result.records_failed
                );
                for batch in result.batches.iter().filter(|b| b.error_summary.is_some()) {
                    println!(
                        "  Failed batch {} ({}): {}",
                        batch.batch_id,
                        batch.customer,
                        batch.error_summary.as_deref().unwrap_or_default()
                    );
                }
                if let Some(ref entry) = result.archive {
                    println!("  Archive: {} ({})", entry.archive_id, entry.blob_location);
                }
                if let Some(ref err) = result.archive_error {
                    println!("  Archive failed: {}", err);
                }
            }

            return Ok(match result.status.as_str() {
                "cancelled" => ExitCode::from(SyncError::Cancelled.exit_code()),
                "failed" => ExitCode::from(EXIT_BATCH_FAILED),
                _ => ExitCode::SUCCESS,
            });
        }

        Commands::Detect { customer, changes } => {
            let orchestrator = Orchestrator::connect(config).await?;
            let detection = orchestrator.detect(customer.as_deref()).await?;

            if cli.output_json {
                let listed = if changes {
                    serde_json::to_value(&detection.changes)?
                } else {
                    serde_json::Value::Null
                };
                let body = serde_json::json!({
                    "scope": detection.scope.to_string(),
                    "base_version": detection.base_version,
                    "summary": detection.summary,
                    "changes": listed,
                });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                let s = &detection.summary;
                println!("Detection for {} (baseline v{}):", detection.scope, detection.base_version);
                println!("  Source rows: {}", s.source_rows);
                println!("  New: {}", s.new);
                println!("  Changed: {}", s.changed);
                println!("  Deleted: {}", s.deleted);
                println!("  Unchanged: {}", s.unchanged);
                println!("  Unmappable: {}", s.unmappable);
                println!("  Duplicate keys: {}", s.duplicate_keys);
                println!("  Customers to sync: {:?}", detection.customers_with_changes());
                if changes {
                    for change in detection.changes.iter().filter(|c| c.kind != ChangeKind::Unchanged) {
                        println!("  {:<9} {}", change.kind.to_string(), change.key);
                    }
                }
            }
        }

        Commands::Archive { customer } => {
            let orchestrator = Orchestrator::connect(config).await?;
            let entry = orchestrator.archive(customer.as_deref()).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&entry)?);
            } else {
                println!("Archive created:");
                println!("  ID: {}", entry.archive_id);
                println!("  Location: {}", entry.blob_location);
                println!("  Records: {}", entry.records_count);
                println!(
                    "  Size: {} bytes ({} uncompressed, ratio {:.2})",
                    entry.compressed_size, entry.uncompressed_size, entry.compression_ratio
                );
                println!("  Retained until: {}", entry.retention_until.format("%Y-%m-%d"));
            }
        }

        Commands::ListArchives => {
            let entries = archiver(&config).list()?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                println!("{} archives", entries.len());
                for entry in &entries {
                    println!(
                        "  {} {} {} [{}] {} rows",
                        entry.archive_id,
                        entry.snapshot_date,
                        entry.source_table,
                        entry.customer_filter.as_deref().unwrap_or("*"),
                        entry.records_count
                    );
                }
            }
        }

        Commands::ValidateArchives { id } => {
            let results = archiver(&config).validate(id)?;
            let invalid = results.iter().filter(|r| !r.is_valid).count();

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                println!("Validated {} archives:", results.len());
                for result in &results {
                    let status = if result.is_valid { "✓ Valid" } else { "✗ Invalid" };
                    println!("  {} {} ({})", status, result.archive_id, result.blob_location);
                    for err in &result.errors {
                        println!("      {}", err);
                    }
                }
            }

            if invalid > 0 {
                return Err(SyncError::Archive(format!(
                    "{} of {} archives failed validation",
                    invalid,
                    results.len()
                )));
            }
        }

        Commands::CleanupArchives { keep_days, dry_run } => {
            let keep_days = keep_days.unwrap_or(config.archive.retention_days);
            let removed = archiver(&config).cleanup(keep_days, dry_run)?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&removed)?);
            } else {
                let verb = if dry_run { "Would delete" } else { "Deleted" };
                println!("{} {} archives older than {} days", verb, removed.len(), keep_days);
                for entry in &removed {
                    println!("  {} {}", entry.archive_id, entry.blob_location);
                }
            }
        }

        Commands::RestoreArchive { id, output } => {
            let records = archiver(&config).restore(id)?;
            let body = serde_json::to_string_pretty(&records)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, body)?;
                    println!("Restored {} rows to {:?}", records.len(), path);
                }
                None => println!("{}", body),
            }
        }

        Commands::ListBatches { customer, limit } => {
            let orchestrator = Orchestrator::connect(config).await?;
            let batches = orchestrator.list_batches(customer.as_deref(), limit).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&batches)?);
            } else {
                println!("{} batches", batches.len());
                for batch in &batches {
                    println!(
                        "  {} {} {:<16} {}/{} ok, {} failed  {}",
                        batch.batch_id,
                        batch.start_time.format("%Y-%m-%d %H:%M:%S"),
                        batch.status.to_string(),
                        batch.successful_records,
                        batch.total_records,
                        batch.failed_records,
                        batch.customer_name
                    );
                    if let Some(ref summary) = batch.error_summary {
                        println!("      {}", summary);
                    }
                }
            }
        }

        Commands::FailedRows { batch_id } => {
            let orchestrator = Orchestrator::connect(config).await?;
            let rows = orchestrator.failed_rows(batch_id).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                println!(
                    "Batch {}: {} failed items, {} failed sub-items",
                    batch_id,
                    rows.masters.len(),
                    rows.subitems.len()
                );
                for master in &rows.masters {
                    println!(
                        "  {} [{}] {}",
                        master.key,
                        master.sync.error_category.map(|c| c.to_string()).unwrap_or_default(),
                        master.sync.last_error.as_deref().unwrap_or_default()
                    );
                }
                for sub in &rows.subitems {
                    let parent = rows
                        .master(sub.parent_staging_id)
                        .map(|m| m.key.to_string())
                        .unwrap_or_else(|| sub.parent_staging_id.to_string());
                    println!(
                        "  {} size {} [{}] {}",
                        parent,
                        sub.size_label,
                        sub.sync.error_category.map(|c| c.to_string()).unwrap_or_default(),
                        sub.sync.last_error.as_deref().unwrap_or_default()
                    );
                }
            }
        }

        Commands::PurgeStaging { batch_id } => {
            let orchestrator = Orchestrator::connect(config).await?;
            let removed = orchestrator.purge_staging(batch_id).await?;

            if cli.output_json {
                let body = serde_json::json!({ "batch_id": batch_id, "rows_removed": removed });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                println!("Purged {} promoted staging rows of batch {}", removed, batch_id);
            }
        }

        Commands::InitSchema => {
            let orchestrator = Orchestrator::connect(config).await?;
            orchestrator.init_schema().await?;
            println!("Schema initialized");
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::connect(config).await?;
            let result = orchestrator.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Database (PostgreSQL): {} ({}ms)",
                    if result.database_connected { "OK" } else { "FAILED" },
                    result.database_latency_ms
                );
                if let Some(ref err) = result.database_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Platform API: {} ({}ms)",
                    if result.platform_connected { "OK" } else { "FAILED" },
                    result.platform_latency_ms
                );
                if let Some(ref err) = result.platform_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(SyncError::Connectivity("Health check failed".to_string()));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn archiver(config: &Config) -> Archiver {
    Archiver::from_config(&config.archive, config.source.table.clone())
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so --output-json stays parseable.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT or SIGTERM.
///
/// Running batches drain their in-flight requests and finish as FAILED;
/// batches not yet started are skipped.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Finishing in-flight requests...", name);
                    token.cancel();
                });
            }
            Err(e) => warn!("Could not install {} handler: {}", name, e),
        }
    }

    cancel_token
}

#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Finishing in-flight requests...");
            token.cancel();
        }
    });

    cancel_token
}
