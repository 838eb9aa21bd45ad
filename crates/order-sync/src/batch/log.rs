//! Durable audit log of batch records.
//!
//! Every phase transition is written through [`BatchLog::record`], which
//! upserts the whole batch row. Batches are never deleted.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_postgres::types::Json;
use tokio_postgres::Row;
use uuid::Uuid;

use super::{Batch, BatchFailure};
use crate::db::quote_ident;
use crate::error::{Result, SyncError};

/// Persistence for batch records.
#[async_trait]
pub trait BatchLog: Send + Sync {
    /// Initialize storage. Idempotent.
    async fn init_schema(&self) -> Result<()>;

    /// Insert or update a batch record.
    async fn record(&self, batch: &Batch) -> Result<()>;

    async fn get(&self, batch_id: Uuid) -> Result<Option<Batch>>;

    /// Most recent batches first, optionally for one customer.
    async fn list(&self, customer: Option<&str>, limit: usize) -> Result<Vec<Batch>>;
}

/// In-process batch log.
#[derive(Default)]
pub struct MemoryBatchLog {
    batches: Mutex<HashMap<Uuid, Batch>>,
}

impl MemoryBatchLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchLog for MemoryBatchLog {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn record(&self, batch: &Batch) -> Result<()> {
        let mut batches = self
            .batches
            .lock()
            .map_err(|_| SyncError::BatchLog("batch log lock poisoned".into()))?;
        batches.insert(batch.batch_id, batch.clone());
        Ok(())
    }

    async fn get(&self, batch_id: Uuid) -> Result<Option<Batch>> {
        let batches = self
            .batches
            .lock()
            .map_err(|_| SyncError::BatchLog("batch log lock poisoned".into()))?;
        Ok(batches.get(&batch_id).cloned())
    }

    async fn list(&self, customer: Option<&str>, limit: usize) -> Result<Vec<Batch>> {
        let batches = self
            .batches
            .lock()
            .map_err(|_| SyncError::BatchLog("batch log lock poisoned".into()))?;
        let mut out: Vec<Batch> = batches
            .values()
            .filter(|b| customer.map_or(true, |c| b.customer_name == c))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        out.truncate(limit);
        Ok(out)
    }
}

/// Batch log stored in the `batches` table.
pub struct DbBatchLog {
    pool: Pool,
    schema: String,
}

impl DbBatchLog {
    pub fn new(pool: Pool, schema: &str) -> Self {
        Self {
            pool,
            schema: quote_ident(schema),
        }
    }

    const COLUMNS: &'static str = "batch_id, customer_name, batch_type, status, total_records, \
         successful_records, failed_records, start_time, end_time, staging_loaded_at, \
         items_created_at, subitems_created_at, promoted_at, error_summary, failures";

    fn from_row(row: &Row) -> Result<Batch> {
        let batch_type: String = row.get(2);
        let status: String = row.get(3);
        let failures: Json<Vec<BatchFailure>> = row.get(14);
        Ok(Batch {
            batch_id: row.get(0),
            customer_name: row.get(1),
            batch_type: batch_type.parse()?,
            status: status.parse()?,
            total_records: row.get(4),
            successful_records: row.get(5),
            failed_records: row.get(6),
            start_time: row.get(7),
            end_time: row.get(8),
            staging_loaded_at: row.get(9),
            items_created_at: row.get(10),
            subitems_created_at: row.get(11),
            promoted_at: row.get(12),
            error_summary: row.get(13),
            failures: failures.0,
        })
    }
}

#[async_trait]
impl BatchLog for DbBatchLog {
    async fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get().await?;

        conn.execute(
            &format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.batches (
                    batch_id UUID PRIMARY KEY,
                    customer_name TEXT NOT NULL,
                    batch_type TEXT NOT NULL CHECK (batch_type IN ('ORDERS', 'SUBITEMS', 'FULL_BATCH')),
                    status TEXT NOT NULL CHECK (status IN ('STARTED', 'STAGING_LOADED', 'ITEMS_CREATED',
                        'SUBITEMS_CREATED', 'PROMOTED', 'COMPLETED', 'FAILED')),
                    total_records BIGINT NOT NULL DEFAULT 0,
                    successful_records BIGINT NOT NULL DEFAULT 0,
                    failed_records BIGINT NOT NULL DEFAULT 0,
                    start_time TIMESTAMPTZ NOT NULL,
                    end_time TIMESTAMPTZ,
                    staging_loaded_at TIMESTAMPTZ,
                    items_created_at TIMESTAMPTZ,
                    subitems_created_at TIMESTAMPTZ,
                    promoted_at TIMESTAMPTZ,
                    error_summary TEXT,
                    failures JSONB NOT NULL DEFAULT '[]'::jsonb,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_batches_customer
                    ON {}.batches(customer_name, start_time DESC)",
                self.schema
            ),
            &[],
        )
        .await?;

        Ok(())
    }

    async fn record(&self, batch: &Batch) -> Result<()> {
        let conn = self.pool.get().await?;

        // Terminal rows are never rewritten.
        conn.execute(
            &format!(
                "INSERT INTO {0}.batches ({1}, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW())
                 ON CONFLICT (batch_id) DO UPDATE SET
                    status = EXCLUDED.status,
                    total_records = EXCLUDED.total_records,
                    successful_records = EXCLUDED.successful_records,
                    failed_records = EXCLUDED.failed_records,
                    end_time = EXCLUDED.end_time,
                    staging_loaded_at = EXCLUDED.staging_loaded_at,
                    items_created_at = EXCLUDED.items_created_at,
                    subitems_created_at = EXCLUDED.subitems_created_at,
                    promoted_at = EXCLUDED.promoted_at,
                    error_summary = EXCLUDED.error_summary,
                    failures = EXCLUDED.failures,
                    updated_at = NOW()
                 WHERE {0}.batches.status NOT IN ('COMPLETED', 'FAILED')",
                self.schema,
                Self::COLUMNS
            ),
            &[
                &batch.batch_id,
                &batch.customer_name,
                &batch.batch_type.as_str(),
                &batch.status.as_str(),
                &batch.total_records,
                &batch.successful_records,
                &batch.failed_records,
                &batch.start_time,
                &batch.end_time,
                &batch.staging_loaded_at,
                &batch.items_created_at,
                &batch.subitems_created_at,
                &batch.promoted_at,
                &batch.error_summary,
                &Json(&batch.failures),
            ],
        )
        .await?;

        Ok(())
    }

    async fn get(&self, batch_id: Uuid) -> Result<Option<Batch>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM {}.batches WHERE batch_id = $1",
                    Self::COLUMNS,
                    self.schema
                ),
                &[&batch_id],
            )
            .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list(&self, customer: Option<&str>, limit: usize) -> Result<Vec<Batch>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM {}.batches
                     WHERE $1::text IS NULL OR customer_name = $1
                     ORDER BY start_time DESC
                     LIMIT $2",
                    Self::COLUMNS,
                    self.schema
                ),
                &[&customer, &(limit as i64)],
            )
            .await?;
        rows.iter().map(Self::from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchStatus, BatchType};

    #[tokio::test]
    async fn test_memory_log_tracks_transitions() {
        let log = MemoryBatchLog::new();
        let mut batch = Batch::start("ACME", BatchType::FullBatch, 4);
        log.record(&batch).await.unwrap();
        batch.advance(BatchStatus::StagingLoaded).unwrap();
        log.record(&batch).await.unwrap();

        let stored = log.get(batch.batch_id).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::StagingLoaded);
        assert_eq!(log.list(Some("ACME"), 10).await.unwrap().len(), 1);
        assert!(log.list(Some("GLOBEX"), 10).await.unwrap().is_empty());
    }
}
