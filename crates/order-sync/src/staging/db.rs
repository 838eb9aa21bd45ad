//! PostgreSQL staging store.
//!
//! Staging tables live in the sync schema, production tables in the
//! configured production schema:
//! - `staging_items` / `staging_subitems`: workflow rows per batch
//! - `order_items` / `order_subitems`: production master and dependent table
//!
//! Promotion is set-based inside one transaction. Any SQLSTATE class 23
//! (integrity constraint) or 21 (cardinality) error rolls back the batch and
//! surfaces as [`SyncError::Integrity`].

use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::Json;
use tokio_postgres::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    BatchRows, PromotionStats, StagedItem, StagingRecord, StagingStore, StagingSubitem,
    SyncState, SyncStatus,
};
use crate::batch::Batch;
use crate::db::quote_ident;
use crate::error::{Result, SyncError};
use crate::record::BusinessKey;
use crate::sync::{ErrorCategory, SyncResult, QUANTITY_FIELD};

/// Staging store backed by PostgreSQL.
pub struct DbStagingStore {
    pool: Pool,
    schema: String,
    production_schema: String,
}

impl DbStagingStore {
    /// Schema names are quoted here; every statement interpolates them as is.
    pub fn new(pool: Pool, schema: &str, production_schema: &str) -> Self {
        Self {
            pool,
            schema: quote_ident(schema),
            production_schema: quote_ident(production_schema),
        }
    }

    const MASTER_COLUMNS: &'static str = "staging_id, batch_id, customer, order_number, style, color, \
         po_number, item_name, raw_payload, external_id, status, retry_count, last_error, \
         error_category, created_at";

    const SUBITEM_COLUMNS: &'static str = "staging_id, batch_id, parent_staging_id, size_label, \
         quantity, raw_payload, external_id, status, retry_count, last_error, error_category, \
         created_at";

    fn sync_state(row: &Row, first: usize) -> Result<SyncState> {
        let status: String = row.get(first + 1);
        let category: Option<String> = row.get(first + 4);
        Ok(SyncState {
            external_id: row.get(first),
            status: status.parse()?,
            retry_count: row.get(first + 2),
            last_error: row.get(first + 3),
            error_category: category.map(|c| ErrorCategory::from_code(&c)),
        })
    }

    fn master_from_row(row: &Row) -> Result<StagingRecord> {
        let payload: Json<serde_json::Value> = row.get(8);
        Ok(StagingRecord {
            staging_id: row.get(0),
            batch_id: row.get(1),
            key: BusinessKey::new(
                row.get::<_, String>(2),
                row.get::<_, String>(3),
                row.get::<_, String>(4),
                row.get::<_, String>(5),
                row.get::<_, String>(6),
            ),
            item_name: row.get(7),
            raw_payload: payload.0,
            sync: Self::sync_state(row, 9)?,
            created_at: row.get(14),
        })
    }

    fn subitem_from_row(row: &Row) -> Result<StagingSubitem> {
        let payload: Json<serde_json::Value> = row.get(5);
        Ok(StagingSubitem {
            staging_id: row.get(0),
            batch_id: row.get(1),
            parent_staging_id: row.get(2),
            size_label: row.get(3),
            quantity: row.get(4),
            raw_payload: payload.0,
            sync: Self::sync_state(row, 6)?,
            created_at: row.get(11),
        })
    }

    async fn select_rows(&self, batch_id: Uuid, only: Option<SyncStatus>) -> Result<BatchRows> {
        let conn = self.pool.get().await?;
        let status = only.map(|s| s.as_str());

        let masters = conn
            .query(
                &format!(
                    "SELECT {} FROM {}.staging_items
                     WHERE batch_id = $1 AND ($2::text IS NULL OR status = $2)
                     ORDER BY customer, order_number, style, color, po_number",
                    Self::MASTER_COLUMNS,
                    self.schema
                ),
                &[&batch_id, &status],
            )
            .await?;
        let subitems = conn
            .query(
                &format!(
                    "SELECT {} FROM {}.staging_subitems
                     WHERE batch_id = $1 AND ($2::text IS NULL OR status = $2)
                     ORDER BY parent_staging_id, size_label",
                    Self::SUBITEM_COLUMNS,
                    self.schema
                ),
                &[&batch_id, &status],
            )
            .await?;

        Ok(BatchRows {
            masters: masters
                .iter()
                .map(Self::master_from_row)
                .collect::<Result<_>>()?,
            subitems: subitems
                .iter()
                .map(Self::subitem_from_row)
                .collect::<Result<_>>()?,
        })
    }

    async fn load_once(&self, batch: &Batch, items: &[StagedItem]) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        let insert_master = tx
            .prepare(&format!(
                "INSERT INTO {}.staging_items ({})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
                self.schema,
                Self::MASTER_COLUMNS
            ))
            .await?;
        let insert_subitem = tx
            .prepare(&format!(
                "INSERT INTO {}.staging_subitems ({})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                self.schema,
                Self::SUBITEM_COLUMNS
            ))
            .await?;

        for item in items {
            let m = &item.master;
            if m.batch_id != batch.batch_id {
                return Err(SyncError::Staging(format!(
                    "staging row {} belongs to batch {}, not {}",
                    m.staging_id, m.batch_id, batch.batch_id
                )));
            }
            tx.execute(
                &insert_master,
                &[
                    &m.staging_id,
                    &m.batch_id,
                    &m.key.customer,
                    &m.key.order_number,
                    &m.key.style,
                    &m.key.color,
                    &m.key.po_number,
                    &m.item_name,
                    &Json(&m.raw_payload),
                    &m.sync.external_id,
                    &m.sync.status.as_str(),
                    &m.sync.retry_count,
                    &m.sync.last_error,
                    &m.sync.error_category.map(|c| c.as_str()),
                    &m.created_at,
                ],
            )
            .await?;

            for s in &item.subitems {
                if s.parent_staging_id != m.staging_id || s.batch_id != batch.batch_id {
                    return Err(SyncError::Staging(format!(
                        "sub-item {} is not linked to master {}",
                        s.staging_id, m.staging_id
                    )));
                }
                tx.execute(
                    &insert_subitem,
                    &[
                        &s.staging_id,
                        &s.batch_id,
                        &s.parent_staging_id,
                        &s.size_label,
                        &s.quantity,
                        &Json(&s.raw_payload),
                        &s.sync.external_id,
                        &s.sync.status.as_str(),
                        &s.sync.retry_count,
                        &s.sync.last_error,
                        &s.sync.error_category.map(|c| c.as_str()),
                        &s.created_at,
                    ],
                )
                .await?;
            }
        }

        // Sizes that disappeared from a record go to zero.
        let zeroed = tx
            .execute(
                &format!(
                    "INSERT INTO {0}.staging_subitems ({2})
                     SELECT gen_random_uuid(), m.batch_id, m.staging_id, ps.size_label, 0,
                            jsonb_build_object('size_label', ps.size_label, $2::text, 0),
                            ps.external_id, 'PENDING', 0, NULL, NULL, m.created_at
                     FROM {0}.staging_items m
                     JOIN {1}.order_items p
                       ON (p.customer, p.order_number, p.style, p.color, p.po_number)
                        = (m.customer, m.order_number, m.style, m.color, m.po_number)
                     JOIN {1}.order_subitems ps ON ps.parent_item_id = p.item_id
                     WHERE m.batch_id = $1 AND ps.quantity <> 0
                       AND NOT EXISTS (SELECT 1 FROM {0}.staging_subitems s
                                       WHERE s.parent_staging_id = m.staging_id
                                         AND s.size_label = ps.size_label)",
                    self.schema,
                    self.production_schema,
                    Self::SUBITEM_COLUMNS
                ),
                &[&batch.batch_id, &QUANTITY_FIELD],
            )
            .await?;
        if zeroed > 0 {
            debug!("batch {}: zeroing {} dropped sizes", batch.batch_id, zeroed);
        }

        // Known external ids turn creates into updates.
        tx.execute(
            &format!(
                "UPDATE {0}.staging_items s SET external_id = p.external_id
                 FROM {1}.order_items p
                 WHERE s.batch_id = $1 AND s.external_id IS NULL AND p.external_id IS NOT NULL
                   AND (p.customer, p.order_number, p.style, p.color, p.po_number)
                     = (s.customer, s.order_number, s.style, s.color, s.po_number)",
                self.schema, self.production_schema
            ),
            &[&batch.batch_id],
        )
        .await?;
        tx.execute(
            &format!(
                "UPDATE {0}.staging_subitems s SET external_id = ps.external_id
                 FROM {0}.staging_items m, {1}.order_items p, {1}.order_subitems ps
                 WHERE s.batch_id = $1 AND s.external_id IS NULL
                   AND m.staging_id = s.parent_staging_id
                   AND (p.customer, p.order_number, p.style, p.color, p.po_number)
                     = (m.customer, m.order_number, m.style, m.color, m.po_number)
                   AND ps.parent_item_id = p.item_id AND ps.size_label = s.size_label
                   AND ps.external_id IS NOT NULL",
                self.schema, self.production_schema
            ),
            &[&batch.batch_id],
        )
        .await?;

        // Rows synced by a batch that failed before promotion still own
        // their platform items.
        tx.execute(
            &format!(
                "UPDATE {0}.staging_items s SET external_id = prev.external_id
                 FROM (
                    SELECT DISTINCT ON (customer, order_number, style, color, po_number)
                           customer, order_number, style, color, po_number, external_id
                    FROM {0}.staging_items
                    WHERE batch_id <> $1 AND status = 'EXTERNAL_SUCCESS' AND external_id IS NOT NULL
                    ORDER BY customer, order_number, style, color, po_number, created_at DESC
                 ) prev
                 WHERE s.batch_id = $1 AND s.external_id IS NULL
                   AND (prev.customer, prev.order_number, prev.style, prev.color, prev.po_number)
                     = (s.customer, s.order_number, s.style, s.color, s.po_number)",
                self.schema
            ),
            &[&batch.batch_id],
        )
        .await?;
        tx.execute(
            &format!(
                "UPDATE {0}.staging_subitems s SET external_id = prev.external_id
                 FROM {0}.staging_items m, (
                    SELECT DISTINCT ON (pm.customer, pm.order_number, pm.style, pm.color, pm.po_number, ps.size_label)
                           pm.customer, pm.order_number, pm.style, pm.color, pm.po_number,
                           ps.size_label, ps.external_id
                    FROM {0}.staging_subitems ps
                    JOIN {0}.staging_items pm ON pm.staging_id = ps.parent_staging_id
                    WHERE ps.batch_id <> $1 AND ps.status = 'EXTERNAL_SUCCESS'
                      AND ps.external_id IS NOT NULL
                    ORDER BY pm.customer, pm.order_number, pm.style, pm.color, pm.po_number,
                             ps.size_label, ps.created_at DESC
                 ) prev
                 WHERE s.batch_id = $1 AND s.external_id IS NULL
                   AND m.staging_id = s.parent_staging_id
                   AND (prev.customer, prev.order_number, prev.style, prev.color, prev.po_number, prev.size_label)
                     = (m.customer, m.order_number, m.style, m.color, m.po_number, s.size_label)",
                self.schema
            ),
            &[&batch.batch_id],
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn is_integrity_violation(e: &tokio_postgres::Error) -> bool {
    e.code().is_some_and(|code| {
        let class = &code.code()[..2];
        class == "23" || *code == SqlState::CARDINALITY_VIOLATION
    })
}

#[async_trait]
impl StagingStore for DbStagingStore {
    async fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get().await?;

        for schema in [&self.schema, &self.production_schema] {
            conn.execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema), &[])
                .await?;
        }

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.staging_items (
                    staging_id UUID PRIMARY KEY,
                    batch_id UUID NOT NULL,
                    customer TEXT NOT NULL,
                    order_number TEXT NOT NULL,
                    style TEXT NOT NULL,
                    color TEXT NOT NULL,
                    po_number TEXT NOT NULL,
                    item_name TEXT NOT NULL,
                    raw_payload JSONB NOT NULL,
                    external_id TEXT,
                    status TEXT NOT NULL CHECK (status IN ('PENDING', 'EXTERNAL_SUCCESS', 'EXTERNAL_FAILED', 'PROMOTED')),
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    error_category TEXT,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_staging_items_batch
                    ON {}.staging_items(batch_id, status)",
                self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {0}.staging_subitems (
                    staging_id UUID PRIMARY KEY,
                    batch_id UUID NOT NULL,
                    parent_staging_id UUID NOT NULL REFERENCES {0}.staging_items(staging_id) ON DELETE CASCADE,
                    size_label TEXT NOT NULL,
                    quantity BIGINT NOT NULL,
                    raw_payload JSONB NOT NULL,
                    external_id TEXT,
                    status TEXT NOT NULL CHECK (status IN ('PENDING', 'EXTERNAL_SUCCESS', 'EXTERNAL_FAILED', 'PROMOTED')),
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    error_category TEXT,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_staging_subitems_parent
                    ON {}.staging_subitems(parent_staging_id)",
                self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.order_items (
                    item_id BIGSERIAL PRIMARY KEY,
                    customer TEXT NOT NULL,
                    order_number TEXT NOT NULL,
                    style TEXT NOT NULL,
                    color TEXT NOT NULL,
                    po_number TEXT NOT NULL,
                    item_name TEXT NOT NULL,
                    external_id TEXT,
                    payload JSONB NOT NULL,
                    batch_id UUID NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    UNIQUE (customer, order_number, style, color, po_number)
                )",
                self.production_schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {0}.order_subitems (
                    subitem_id BIGSERIAL PRIMARY KEY,
                    parent_item_id BIGINT NOT NULL REFERENCES {0}.order_items(item_id),
                    size_label TEXT NOT NULL CHECK (size_label <> ''),
                    quantity BIGINT NOT NULL CHECK (quantity >= 0),
                    external_id TEXT,
                    batch_id UUID NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    UNIQUE (parent_item_id, size_label)
                )",
                self.production_schema
            ),
            &[],
        )
        .await?;

        Ok(())
    }

    async fn load(&self, batch: &Batch, items: &[StagedItem]) -> Result<()> {
        match self.load_once(batch, items).await {
            Err(e) if e.is_deadlock() => {
                warn!("batch {}: deadlock while loading staging, retrying once", batch.batch_id);
                self.load_once(batch, items).await?;
            }
            other => other?,
        }
        debug!(
            "batch {}: loaded {} masters into staging",
            batch.batch_id,
            items.len()
        );
        Ok(())
    }

    async fn mark_synced(&self, result: &SyncResult) -> Result<()> {
        let conn = self.pool.get().await?;
        let params: [&(dyn tokio_postgres::types::ToSql + Sync); 6] = [
            &result.staging_id,
            &result.external_id,
            &result.status.as_str(),
            &result.retry_count,
            &result.last_error,
            &result.error_category.map(|c| c.as_str()),
        ];

        let mut touched = 0;
        let mut found = false;
        for table in ["staging_items", "staging_subitems"] {
            let row = conn
                .query_opt(
                    &format!(
                        "WITH target AS (
                            SELECT staging_id, status FROM {0}.{1} WHERE staging_id = $1
                         ), updated AS (
                            UPDATE {0}.{1} SET
                                external_id = COALESCE($2, external_id),
                                status = $3,
                                retry_count = $4,
                                last_error = $5,
                                error_category = $6,
                                updated_at = NOW()
                            WHERE staging_id = $1 AND status NOT IN ($3, 'PROMOTED')
                            RETURNING 1
                         )
                         SELECT (SELECT COUNT(*) FROM target), (SELECT COUNT(*) FROM updated)",
                        self.schema, table
                    ),
                    &params,
                )
                .await?;
            if let Some(row) = row {
                let exists: i64 = row.get(0);
                let updated: i64 = row.get(1);
                if exists > 0 {
                    found = true;
                    touched += updated;
                    break;
                }
            }
        }

        if !found {
            return Err(SyncError::Staging(format!(
                "unknown staging row {}",
                result.staging_id
            )));
        }
        if touched == 0 {
            debug!("staging row {} already {}", result.staging_id, result.status);
        }
        Ok(())
    }

    async fn promote(&self, batch_id: Uuid) -> Result<PromotionStats> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        let integrity = |e: tokio_postgres::Error| {
            if is_integrity_violation(&e) {
                let detail = e
                    .as_db_error()
                    .map(|d| d.message().to_string())
                    .unwrap_or_else(|| e.to_string());
                SyncError::integrity(batch_id, detail)
            } else {
                SyncError::Database(e)
            }
        };

        let masters = tx
            .query(
                &format!(
                    "INSERT INTO {1}.order_items
                        (customer, order_number, style, color, po_number, item_name, external_id, payload, batch_id, updated_at)
                     SELECT customer, order_number, style, color, po_number, item_name, external_id, raw_payload, batch_id, NOW()
                     FROM {0}.staging_items
                     WHERE batch_id = $1 AND status = 'EXTERNAL_SUCCESS'
                     ON CONFLICT (customer, order_number, style, color, po_number) DO UPDATE SET
                        item_name = EXCLUDED.item_name,
                        external_id = EXCLUDED.external_id,
                        payload = EXCLUDED.payload,
                        batch_id = EXCLUDED.batch_id,
                        updated_at = NOW()
                     RETURNING (xmax = 0)",
                    self.schema, self.production_schema
                ),
                &[&batch_id],
            )
            .await
            .map_err(integrity)?;

        let mut stats = PromotionStats::default();
        for row in &masters {
            let inserted: bool = row.get(0);
            if inserted {
                stats.masters_inserted += 1;
            } else {
                stats.masters_updated += 1;
            }
        }

        // A sub-item whose master is missing from production yields a NULL
        // parent and fails the NOT NULL constraint.
        stats.subitems_promoted = tx
            .execute(
                &format!(
                    "INSERT INTO {1}.order_subitems
                        (parent_item_id, size_label, quantity, external_id, batch_id, updated_at)
                     SELECT p.item_id, s.size_label, s.quantity, s.external_id, s.batch_id, NOW()
                     FROM {0}.staging_subitems s
                     JOIN {0}.staging_items m ON m.staging_id = s.parent_staging_id
                     LEFT JOIN {1}.order_items p
                       ON (p.customer, p.order_number, p.style, p.color, p.po_number)
                        = (m.customer, m.order_number, m.style, m.color, m.po_number)
                     WHERE s.batch_id = $1 AND s.status = 'EXTERNAL_SUCCESS'
                     ON CONFLICT (parent_item_id, size_label) DO UPDATE SET
                        quantity = EXCLUDED.quantity,
                        external_id = EXCLUDED.external_id,
                        batch_id = EXCLUDED.batch_id,
                        updated_at = NOW()",
                    self.schema, self.production_schema
                ),
                &[&batch_id],
            )
            .await
            .map_err(integrity)? as usize;

        for table in ["staging_items", "staging_subitems"] {
            tx.execute(
                &format!(
                    "UPDATE {}.{} SET status = 'PROMOTED', updated_at = NOW()
                     WHERE batch_id = $1 AND status = 'EXTERNAL_SUCCESS'",
                    self.schema, table
                ),
                &[&batch_id],
            )
            .await?;
        }

        tx.commit().await.map_err(integrity)?;

        info!(
            "batch {}: promoted {} masters ({} new, {} updated) and {} sub-items",
            batch_id,
            stats.masters(),
            stats.masters_inserted,
            stats.masters_updated,
            stats.subitems_promoted
        );
        Ok(stats)
    }

    async fn rows(&self, batch_id: Uuid) -> Result<BatchRows> {
        self.select_rows(batch_id, None).await
    }

    async fn failed_rows(&self, batch_id: Uuid) -> Result<BatchRows> {
        self.select_rows(batch_id, Some(SyncStatus::ExternalFailed))
            .await
    }

    async fn purge_promoted(&self, batch_id: Uuid) -> Result<usize> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        let subitems = tx
            .execute(
                &format!(
                    "DELETE FROM {}.staging_subitems WHERE batch_id = $1 AND status = 'PROMOTED'",
                    self.schema
                ),
                &[&batch_id],
            )
            .await?;
        // Masters with remaining children stay for their review.
        let masters = tx
            .execute(
                &format!(
                    "DELETE FROM {0}.staging_items m
                     WHERE m.batch_id = $1 AND m.status = 'PROMOTED'
                       AND NOT EXISTS (SELECT 1 FROM {0}.staging_subitems s
                                       WHERE s.parent_staging_id = m.staging_id)",
                    self.schema
                ),
                &[&batch_id],
            )
            .await?;

        tx.commit().await?;
        Ok((subitems + masters) as usize)
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
