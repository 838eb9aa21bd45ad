//! Error types for the synchronization library.

use crate::batch::BatchStatus;
use thiserror::Error;
use tokio_postgres::error::SqlState;
use uuid::Uuid;

/// Main error type for synchronization operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration error (invalid YAML, missing fields, scope collisions, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or query error
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Malformed or unmappable record
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Constraint violation while promoting a batch into production
    #[error("Integrity violation in batch {batch_id}: {message}")]
    Integrity { batch_id: Uuid, message: String },

    /// Batch phase change not allowed by the lifecycle
    #[error("Batch {batch_id} cannot move from {from} to {to}")]
    InvalidTransition {
        batch_id: Uuid,
        from: BatchStatus,
        to: BatchStatus,
    },

    /// A customer's snapshot slice moved on since detection read it
    #[error("Snapshot conflict for {scope} customer {customer}: expected base version {expected}, slice already at {found}")]
    SnapshotConflict {
        scope: String,
        customer: String,
        expected: i64,
        found: i64,
    },

    /// Snapshot store error (corrupt fingerprints, unusable store)
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Staging store error (unknown rows, partial loads)
    #[error("Staging error: {0}")]
    Staging(String),

    /// Batch log error
    #[error("Batch log error: {0}")]
    BatchLog(String),

    /// Source table read error
    #[error("Source error: {0}")]
    Source(String),

    /// Every request in a push failed to reach the external platform
    #[error("Lost connectivity to the external platform: {0}")]
    Connectivity(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Archive store or archive validation error
    #[error("Archive error: {0}")]
    Archive(String),

    /// An archive already exists for the same snapshot date, scope and table
    #[error("Archive already exists for {source_table} on {snapshot_date} (filter: {customer_filter})")]
    ArchiveExists {
        snapshot_date: chrono::NaiveDate,
        customer_filter: String,
        source_table: String,
    },

    /// Parquet encoding/decoding error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Arrow record batch error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled (SIGINT, etc.)
    #[error("Run cancelled")]
    Cancelled,
}

impl SyncError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        SyncError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create an Integrity error for a batch
    pub fn integrity(batch_id: Uuid, message: impl Into<String>) -> Self {
        SyncError::Integrity {
            batch_id,
            message: message.into(),
        }
    }

    /// Whether retrying the operation that produced this error may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Database(e) => {
                e.is_closed()
                    || matches!(
                        e.code(),
                        Some(code) if *code == SqlState::T_R_DEADLOCK_DETECTED
                            || *code == SqlState::T_R_SERIALIZATION_FAILURE
                    )
            }
            SyncError::Pool { .. } | SyncError::Connectivity(_) => true,
            SyncError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Whether this is a deadlock reported by PostgreSQL.
    pub fn is_deadlock(&self) -> bool {
        matches!(
            self,
            SyncError::Database(e) if e.code() == Some(&SqlState::T_R_DEADLOCK_DETECTED)
        )
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Config(_) | SyncError::Yaml(_) => 1,
            SyncError::Database(_) | SyncError::Pool { .. } => 2,
            SyncError::Validation(_)
            | SyncError::Integrity { .. }
            | SyncError::InvalidTransition { .. }
            | SyncError::SnapshotConflict { .. }
            | SyncError::Snapshot(_)
            | SyncError::Staging(_)
            | SyncError::BatchLog(_)
            | SyncError::Source(_) => 3,
            SyncError::Connectivity(_) | SyncError::Http(_) => 4,
            SyncError::Archive(_)
            | SyncError::ArchiveExists { .. }
            | SyncError::Parquet(_)
            | SyncError::Arrow(_) => 5,
            SyncError::Json(_) => 6,
            SyncError::Io(_) => 7,
            SyncError::Cancelled => 130,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

impl From<deadpool_postgres::PoolError> for SyncError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        SyncError::pool(e.to_string(), "acquiring PostgreSQL connection")
    }
}

/// Result type alias for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(SyncError::Config("x".into()).exit_code(), 1);
        assert_eq!(SyncError::Cancelled.exit_code(), 130);
        assert_eq!(
            SyncError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone")).exit_code(),
            7
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::Connectivity("down".into()).is_transient());
        assert!(SyncError::pool("exhausted", "test").is_transient());
        assert!(!SyncError::Validation("bad row".into()).is_transient());
        assert!(!SyncError::integrity(Uuid::nil(), "fk").is_transient());
    }

    #[test]
    fn test_format_detailed_includes_message() {
        let err = SyncError::Staging("unknown staging row".into());
        assert!(err.format_detailed().contains("unknown staging row"));
    }
}
