//! PostgreSQL snapshot store.
//!
//! Snapshots live in the `order_sync` schema:
//! - `snapshots`: one row per snapshot, at most one `is_current` per scope
//! - `snapshot_fingerprints`: the key/hash pairs of each snapshot
//! - `slice_versions`: the snapshot version that last committed each customer
//!
//! A slice commit runs in one transaction under a scope-level advisory lock:
//! the successor snapshot is written in full, the predecessor is deleted and
//! the successor flagged current before commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use std::collections::BTreeMap;
use tokio_postgres::GenericClient;
use tracing::debug;
use uuid::Uuid;

use super::{check_slice_version, Snapshot, SnapshotScope, SnapshotStore, ALL_CUSTOMERS};
use crate::db::quote_ident;
use crate::error::{Result, SyncError};
use crate::hasher::{ContentHash, Fingerprint};
use crate::record::BusinessKey;

/// Snapshot store backed by PostgreSQL.
pub struct DbSnapshotStore {
    pool: Pool,
    schema: String,
}

impl DbSnapshotStore {
    pub fn new(pool: Pool, schema: &str) -> Self {
        Self {
            pool,
            schema: quote_ident(schema),
        }
    }

    async fn current_header<C: GenericClient + Sync>(
        &self,
        client: &C,
        scope: &SnapshotScope,
    ) -> Result<Option<(Uuid, i64, DateTime<Utc>)>> {
        let row = client
            .query_opt(
                &format!(
                    "SELECT snapshot_id, version, created_at
                     FROM {}.snapshots
                     WHERE source_table = $1 AND customer_filter = $2 AND is_current",
                    self.schema
                ),
                &[&scope.source_table, &scope.filter_key()],
            )
            .await?;
        Ok(row.map(|r| (r.get(0), r.get(1), r.get(2))))
    }

    async fn load_fingerprints<C: GenericClient + Sync>(
        &self,
        client: &C,
        snapshot_id: Uuid,
    ) -> Result<BTreeMap<BusinessKey, Fingerprint>> {
        let rows = client
            .query(
                &format!(
                    "SELECT customer, order_number, style, color, po_number, row_hash, computed_at
                     FROM {}.snapshot_fingerprints
                     WHERE snapshot_id = $1",
                    self.schema
                ),
                &[&snapshot_id],
            )
            .await?;

        let mut fingerprints = BTreeMap::new();
        for row in rows {
            let key = BusinessKey::new(
                row.get::<_, String>(0),
                row.get::<_, String>(1),
                row.get::<_, String>(2),
                row.get::<_, String>(3),
                row.get::<_, String>(4),
            );
            let hash_hex: String = row.get(5);
            let hash: ContentHash = hash_hex.parse().map_err(|e: String| {
                SyncError::Snapshot(format!("corrupt fingerprint for {}: {}", key, e))
            })?;
            fingerprints.insert(
                key.clone(),
                Fingerprint {
                    key,
                    hash,
                    computed_at: row.get(6),
                },
            );
        }
        Ok(fingerprints)
    }
}

#[async_trait]
impl SnapshotStore for DbSnapshotStore {
    async fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get().await?;

        conn.execute(
            &format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.snapshots (
                    snapshot_id UUID PRIMARY KEY,
                    source_table TEXT NOT NULL,
                    customer_filter TEXT NOT NULL,
                    version BIGINT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    is_current BOOLEAN NOT NULL DEFAULT FALSE
                )",
                self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_snapshots_current
                    ON {}.snapshots(source_table, customer_filter)
                    WHERE is_current",
                self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.snapshot_fingerprints (
                    snapshot_id UUID NOT NULL REFERENCES {}.snapshots(snapshot_id) ON DELETE CASCADE,
                    customer TEXT NOT NULL,
                    order_number TEXT NOT NULL,
                    style TEXT NOT NULL,
                    color TEXT NOT NULL,
                    po_number TEXT NOT NULL,
                    row_hash CHAR(64) NOT NULL,
                    computed_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (snapshot_id, customer, order_number, style, color, po_number)
                )",
                self.schema, self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.slice_versions (
                    source_table TEXT NOT NULL,
                    customer_filter TEXT NOT NULL,
                    customer TEXT NOT NULL,
                    version BIGINT NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (source_table, customer_filter, customer)
                )",
                self.schema
            ),
            &[],
        )
        .await?;

        Ok(())
    }

    async fn current(&self, scope: &SnapshotScope) -> Result<Snapshot> {
        let conn = self.pool.get().await?;

        let Some((snapshot_id, version, created_at)) =
            self.current_header(&**conn, scope).await?
        else {
            return Ok(Snapshot::empty(scope.clone()));
        };

        Ok(Snapshot {
            snapshot_id,
            scope: scope.clone(),
            version,
            created_at,
            fingerprints: self.load_fingerprints(&**conn, snapshot_id).await?,
        })
    }

    async fn commit_slice(
        &self,
        scope: &SnapshotScope,
        customer: &str,
        base_version: i64,
        slice: Vec<Fingerprint>,
    ) -> Result<Snapshot> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        tx.execute(
            "SELECT pg_advisory_xact_lock(hashtext($1))",
            &[&format!("order_sync:{}", scope)],
        )
        .await?;

        let slice_version: i64 = tx
            .query_opt(
                &format!(
                    "SELECT version FROM {}.slice_versions
                     WHERE source_table = $1 AND customer_filter = $2 AND customer = $3",
                    self.schema
                ),
                &[&scope.source_table, &scope.filter_key(), &customer],
            )
            .await?
            .map(|r| r.get(0))
            .unwrap_or(0);
        check_slice_version(scope, customer, base_version, slice_version)?;

        let previous = self.current_header(&*tx, scope).await?;
        let next_id = Uuid::new_v4();
        let next_version = previous.map(|(_, v, _)| v + 1).unwrap_or(1);

        let created_at: DateTime<Utc> = tx
            .query_one(
                &format!(
                    "INSERT INTO {}.snapshots (snapshot_id, source_table, customer_filter, version, is_current)
                     VALUES ($1, $2, $3, $4, FALSE)
                     RETURNING created_at",
                    self.schema
                ),
                &[&next_id, &scope.source_table, &scope.filter_key(), &next_version],
            )
            .await?
            .get(0);

        if let Some((previous_id, _, _)) = previous {
            tx.execute(
                &format!(
                    "INSERT INTO {0}.snapshot_fingerprints
                        (snapshot_id, customer, order_number, style, color, po_number, row_hash, computed_at)
                     SELECT $1, customer, order_number, style, color, po_number, row_hash, computed_at
                     FROM {0}.snapshot_fingerprints
                     WHERE snapshot_id = $2 AND customer <> $3",
                    self.schema
                ),
                &[&next_id, &previous_id, &customer],
            )
            .await?;
        }

        if !slice.is_empty() {
            let mut customers = Vec::with_capacity(slice.len());
            let mut orders = Vec::with_capacity(slice.len());
            let mut styles = Vec::with_capacity(slice.len());
            let mut colors = Vec::with_capacity(slice.len());
            let mut pos = Vec::with_capacity(slice.len());
            let mut hashes = Vec::with_capacity(slice.len());
            let mut computed = Vec::with_capacity(slice.len());
            for fp in &slice {
                customers.push(fp.key.customer.clone());
                orders.push(fp.key.order_number.clone());
                styles.push(fp.key.style.clone());
                colors.push(fp.key.color.clone());
                pos.push(fp.key.po_number.clone());
                hashes.push(fp.hash.to_hex());
                computed.push(fp.computed_at);
            }

            tx.execute(
                &format!(
                    "INSERT INTO {}.snapshot_fingerprints
                        (snapshot_id, customer, order_number, style, color, po_number, row_hash, computed_at)
                     SELECT $1, * FROM UNNEST($2::text[], $3::text[], $4::text[], $5::text[],
                                              $6::text[], $7::text[], $8::timestamptz[])",
                    self.schema
                ),
                &[
                    &next_id, &customers, &orders, &styles, &colors, &pos, &hashes, &computed,
                ],
            )
            .await?;
        }

        if let Some((previous_id, _, _)) = previous {
            tx.execute(
                &format!("DELETE FROM {}.snapshots WHERE snapshot_id = $1", self.schema),
                &[&previous_id],
            )
            .await?;
        }

        tx.execute(
            &format!(
                "UPDATE {}.snapshots SET is_current = TRUE WHERE snapshot_id = $1",
                self.schema
            ),
            &[&next_id],
        )
        .await?;

        tx.execute(
            &format!(
                "INSERT INTO {}.slice_versions (source_table, customer_filter, customer, version)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (source_table, customer_filter, customer) DO UPDATE SET
                    version = EXCLUDED.version,
                    updated_at = NOW()",
                self.schema
            ),
            &[&scope.source_table, &scope.filter_key(), &customer, &next_version],
        )
        .await?;

        let fingerprints = self.load_fingerprints(&*tx, next_id).await?;

        tx.commit().await?;

        debug!(
            "{}: committed slice for {} as version {} ({} keys)",
            scope,
            customer,
            next_version,
            fingerprints.len()
        );

        Ok(Snapshot {
            snapshot_id: next_id,
            scope: scope.clone(),
            version: next_version,
            created_at,
            fingerprints,
        })
    }

    async fn scopes(&self, source_table: &str) -> Result<Vec<SnapshotScope>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT customer_filter FROM {}.snapshots
                     WHERE source_table = $1 AND is_current
                     ORDER BY customer_filter",
                    self.schema
                ),
                &[&source_table],
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let filter: String = row.get(0);
                let filter = (filter != ALL_CUSTOMERS).then_some(filter);
                SnapshotScope::new(source_table, filter.as_deref())
            })
            .collect())
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
