//! In-process staging store with in-memory production tables.
//!
//! Promotion applies a batch to a copy of the production tables, checks every
//! constraint and swaps the copy in only when all of them hold.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    BatchRows, PromotionStats, StagedItem, StagingRecord, StagingStore, StagingSubitem,
    SyncState, SyncStatus,
};
use crate::batch::Batch;
use crate::error::{Result, SyncError};
use crate::record::BusinessKey;
use crate::sync::{SyncResult, QUANTITY_FIELD};

/// A row of `order_items`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductionItem {
    pub item_id: i64,
    pub key: BusinessKey,
    pub item_name: String,
    pub external_id: Option<String>,
    pub payload: serde_json::Value,
    pub batch_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

/// A row of `order_subitems`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductionSubitem {
    pub parent_item_id: i64,
    pub size_label: String,
    pub quantity: i64,
    pub external_id: Option<String>,
    pub batch_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct Production {
    items: BTreeMap<BusinessKey, ProductionItem>,
    subitems: BTreeMap<(i64, String), ProductionSubitem>,
    next_item_id: i64,
}

#[derive(Default)]
struct State {
    masters: Vec<StagingRecord>,
    subitems: Vec<StagingSubitem>,
    production: Production,
}

/// Staging store backed by process memory.
#[derive(Default)]
pub struct MemoryStagingStore {
    state: Mutex<State>,
}

impl MemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| SyncError::Staging("staging lock poisoned".into()))
    }

    /// Snapshot of the production tables, masters sorted by key.
    pub fn production(&self) -> Result<(Vec<ProductionItem>, Vec<ProductionSubitem>)> {
        let state = self.lock()?;
        Ok((
            state.production.items.values().cloned().collect(),
            state.production.subitems.values().cloned().collect(),
        ))
    }
}

fn batch_rows(state: &State, batch_id: Uuid, only: Option<SyncStatus>) -> BatchRows {
    let keep = |b: Uuid, s: SyncStatus| b == batch_id && only.map_or(true, |o| o == s);
    BatchRows {
        masters: state
            .masters
            .iter()
            .filter(|m| keep(m.batch_id, m.sync.status))
            .cloned()
            .collect(),
        subitems: state
            .subitems
            .iter()
            .filter(|s| keep(s.batch_id, s.sync.status))
            .cloned()
            .collect(),
    }
}

/// Platform id of the latest synced but never promoted master for `key`.
fn unpromoted_master_id(state: &State, key: &BusinessKey) -> Option<String> {
    state
        .masters
        .iter()
        .rev()
        .find(|m| &m.key == key && m.sync.status == SyncStatus::ExternalSuccess)
        .and_then(|m| m.sync.external_id.clone())
}

fn unpromoted_subitem_id(state: &State, key: &BusinessKey, size_label: &str) -> Option<String> {
    state
        .subitems
        .iter()
        .rev()
        .filter(|s| s.size_label == size_label && s.sync.status == SyncStatus::ExternalSuccess)
        .find(|s| {
            state
                .masters
                .iter()
                .any(|m| m.staging_id == s.parent_staging_id && &m.key == key)
        })
        .and_then(|s| s.sync.external_id.clone())
}

fn zeroed_subitem(master: &StagingRecord, existing: &ProductionSubitem) -> StagingSubitem {
    StagingSubitem {
        staging_id: Uuid::new_v4(),
        batch_id: master.batch_id,
        parent_staging_id: master.staging_id,
        size_label: existing.size_label.clone(),
        quantity: 0,
        raw_payload: serde_json::json!({ "size_label": existing.size_label, QUANTITY_FIELD: 0 }),
        sync: SyncState::pending(existing.external_id.clone()),
        created_at: master.created_at,
    }
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn load(&self, batch: &Batch, items: &[StagedItem]) -> Result<()> {
        let mut state = self.lock()?;

        // Validate everything before touching state so a bad row loads nothing.
        for item in items {
            if item.master.batch_id != batch.batch_id {
                return Err(SyncError::Staging(format!(
                    "staging row {} belongs to batch {}, not {}",
                    item.master.staging_id, item.master.batch_id, batch.batch_id
                )));
            }
            for sub in &item.subitems {
                if sub.parent_staging_id != item.master.staging_id || sub.batch_id != batch.batch_id {
                    return Err(SyncError::Staging(format!(
                        "sub-item {} is not linked to master {}",
                        sub.staging_id, item.master.staging_id
                    )));
                }
            }
        }

        let mut loaded = 0;
        for item in items {
            let mut master = item.master.clone();
            let existing = state.production.items.get(&master.key).cloned();
            if master.sync.external_id.is_none() {
                master.sync.external_id = existing
                    .as_ref()
                    .and_then(|p| p.external_id.clone())
                    .or_else(|| unpromoted_master_id(&state, &master.key));
            }

            let mut subitems: Vec<StagingSubitem> = item.subitems.clone();
            if let Some(p) = &existing {
                // Sizes that disappeared from the record go to zero.
                let dropped: Vec<ProductionSubitem> = state
                    .production
                    .subitems
                    .values()
                    .filter(|ps| {
                        ps.parent_item_id == p.item_id
                            && ps.quantity != 0
                            && !subitems.iter().any(|s| s.size_label == ps.size_label)
                    })
                    .cloned()
                    .collect();
                for ps in dropped {
                    subitems.push(zeroed_subitem(&master, &ps));
                }
            }

            for mut sub in subitems {
                if sub.sync.external_id.is_none() {
                    sub.sync.external_id = existing
                        .as_ref()
                        .and_then(|p| {
                            state
                                .production
                                .subitems
                                .get(&(p.item_id, sub.size_label.clone()))
                                .and_then(|s| s.external_id.clone())
                        })
                        .or_else(|| unpromoted_subitem_id(&state, &master.key, &sub.size_label));
                }
                state.subitems.push(sub);
                loaded += 1;
            }
            state.masters.push(master);
            loaded += 1;
        }

        debug!("batch {}: loaded {} staging rows", batch.batch_id, loaded);
        Ok(())
    }

    async fn mark_synced(&self, result: &SyncResult) -> Result<()> {
        let mut state = self.lock()?;

        if let Some(m) = state
            .masters
            .iter_mut()
            .find(|m| m.staging_id == result.staging_id)
        {
            m.sync.apply(result);
            return Ok(());
        }
        if let Some(s) = state
            .subitems
            .iter_mut()
            .find(|s| s.staging_id == result.staging_id)
        {
            s.sync.apply(result);
            return Ok(());
        }

        Err(SyncError::Staging(format!(
            "unknown staging row {}",
            result.staging_id
        )))
    }

    async fn promote(&self, batch_id: Uuid) -> Result<PromotionStats> {
        let mut state = self.lock()?;
        let mut production = state.production.clone();
        let mut stats = PromotionStats::default();
        let now = Utc::now();

        let masters: Vec<&StagingRecord> = state
            .masters
            .iter()
            .filter(|m| m.batch_id == batch_id && m.sync.status == SyncStatus::ExternalSuccess)
            .collect();

        let mut seen_keys = HashMap::new();
        let mut item_ids = HashMap::new();
        for m in &masters {
            if let Some(other) = seen_keys.insert(m.key.clone(), m.staging_id) {
                return Err(SyncError::integrity(
                    batch_id,
                    format!(
                        "duplicate business key {} (staging rows {} and {})",
                        m.key, other, m.staging_id
                    ),
                ));
            }

            let item_id = match production.items.get_mut(&m.key) {
                Some(existing) => {
                    existing.item_name = m.item_name.clone();
                    existing.external_id = m.sync.external_id.clone();
                    existing.payload = m.raw_payload.clone();
                    existing.batch_id = batch_id;
                    existing.updated_at = now;
                    stats.masters_updated += 1;
                    existing.item_id
                }
                None => {
                    production.next_item_id += 1;
                    let item_id = production.next_item_id;
                    production.items.insert(
                        m.key.clone(),
                        ProductionItem {
                            item_id,
                            key: m.key.clone(),
                            item_name: m.item_name.clone(),
                            external_id: m.sync.external_id.clone(),
                            payload: m.raw_payload.clone(),
                            batch_id,
                            updated_at: now,
                        },
                    );
                    stats.masters_inserted += 1;
                    item_id
                }
            };
            item_ids.insert(m.staging_id, item_id);
        }

        let mut seen_sizes = HashMap::new();
        for s in state
            .subitems
            .iter()
            .filter(|s| s.batch_id == batch_id && s.sync.status == SyncStatus::ExternalSuccess)
        {
            // The parent is either promoted in this batch or already in production.
            let parent_id = item_ids.get(&s.parent_staging_id).copied().or_else(|| {
                state
                    .masters
                    .iter()
                    .find(|m| m.staging_id == s.parent_staging_id)
                    .and_then(|m| production.items.get(&m.key))
                    .map(|p| p.item_id)
            });
            let Some(parent_id) = parent_id else {
                return Err(SyncError::integrity(
                    batch_id,
                    format!("sub-item {} has no parent in production", s.staging_id),
                ));
            };
            if s.size_label.trim().is_empty() {
                return Err(SyncError::integrity(
                    batch_id,
                    format!("sub-item {} has an empty size label", s.staging_id),
                ));
            }
            if s.quantity < 0 {
                return Err(SyncError::integrity(
                    batch_id,
                    format!(
                        "sub-item {} has negative quantity {}",
                        s.staging_id, s.quantity
                    ),
                ));
            }
            let slot = (parent_id, s.size_label.clone());
            if seen_sizes.insert(slot.clone(), s.staging_id).is_some() {
                return Err(SyncError::integrity(
                    batch_id,
                    format!(
                        "duplicate size label '{}' for item {}",
                        s.size_label, parent_id
                    ),
                ));
            }

            production.subitems.insert(
                slot,
                ProductionSubitem {
                    parent_item_id: parent_id,
                    size_label: s.size_label.clone(),
                    quantity: s.quantity,
                    external_id: s.sync.external_id.clone(),
                    batch_id,
                    updated_at: now,
                },
            );
            stats.subitems_promoted += 1;
        }

        // Every constraint held: swap production and flag the rows.
        state.production = production;
        for m in state.masters.iter_mut().filter(|m| {
            m.batch_id == batch_id && m.sync.status == SyncStatus::ExternalSuccess
        }) {
            m.sync.status = SyncStatus::Promoted;
        }
        for s in state.subitems.iter_mut().filter(|s| {
            s.batch_id == batch_id && s.sync.status == SyncStatus::ExternalSuccess
        }) {
            s.sync.status = SyncStatus::Promoted;
        }

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
        Ok(batch_rows(&*self.lock()?, batch_id, None))
    }

    async fn failed_rows(&self, batch_id: Uuid) -> Result<BatchRows> {
        Ok(batch_rows(
            &*self.lock()?,
            batch_id,
            Some(SyncStatus::ExternalFailed),
        ))
    }

    async fn purge_promoted(&self, batch_id: Uuid) -> Result<usize> {
        let mut state = self.lock()?;
        let before = state.masters.len() + state.subitems.len();
        let promoted = |b: Uuid, s: SyncStatus| b == batch_id && s == SyncStatus::Promoted;
        state
            .subitems
            .retain(|s| !promoted(s.batch_id, s.sync.status));
        // Masters with remaining children stay for their review.
        let State {
            masters, subitems, ..
        } = &mut *state;
        masters.retain(|m| {
            !promoted(m.batch_id, m.sync.status)
                || subitems.iter().any(|s| s.parent_staging_id == m.staging_id)
        });
        Ok(before - state.masters.len() - state.subitems.len())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
