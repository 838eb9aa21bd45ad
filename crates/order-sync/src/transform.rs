//! Source record to staging rows, and staging rows to platform mutations.
//!
//! A source row becomes one master item plus one sub-item per non-zero
//! size column (`size_s`, `size_m`, ... with the default prefix).

use chrono::Utc;
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::hasher::Hasher;
use crate::record::{BusinessKey, SourceRecord};
use crate::staging::{StagedItem, StagingRecord, StagingSubitem, SyncState};
use crate::sync::{Mutation, PushRow, QUANTITY_FIELD};

/// Shapes source records into staging rows.
#[derive(Debug, Clone)]
pub struct Transformer {
    hasher: Hasher,
    size_prefix: String,
}

impl Transformer {
    pub fn new(hasher: Hasher, size_prefix: impl Into<String>) -> Self {
        Self {
            hasher,
            size_prefix: size_prefix.into().to_ascii_lowercase(),
        }
    }

    /// Item name shown on the platform.
    pub fn item_name(key: &BusinessKey) -> String {
        format!("{} / {} / {}", key.order_number, key.style, key.color)
    }

    fn size_label<'a>(&self, column: &'a str) -> Option<&'a str> {
        let lower = column.to_ascii_lowercase();
        if lower.starts_with(&self.size_prefix) {
            Some(&column[self.size_prefix.len()..])
        } else {
            None
        }
    }

    /// Build the staging rows for one record of a batch.
    ///
    /// Negative or non-numeric quantities and blank size labels are
    /// validation errors; the record is then not staged at all.
    pub fn stage(&self, batch_id: Uuid, key: &BusinessKey, record: &SourceRecord) -> Result<StagedItem> {
        let now = Utc::now();
        let master_id = Uuid::new_v4();
        let mut payload = Map::new();
        let mut subitems = Vec::new();

        for (column, value) in record.columns() {
            if self.hasher.is_volatile(column) {
                continue;
            }
            let Some(label) = self.size_label(column) else {
                payload.insert(column.clone(), value.to_json());
                continue;
            };

            let label = label.trim().to_ascii_uppercase();
            if label.is_empty() {
                return Err(SyncError::Validation(format!(
                    "{}: size column '{}' has no label",
                    key, column
                )));
            }
            let quantity = value.as_quantity().map_err(|raw| {
                SyncError::Validation(format!("{}: {} is not a quantity: {}", key, column, raw))
            })?;
            match quantity {
                None | Some(0) => {}
                Some(q) if q < 0 => {
                    return Err(SyncError::Validation(format!(
                        "{}: {} has negative quantity {}",
                        key, column, q
                    )));
                }
                Some(q) => subitems.push(StagingSubitem {
                    staging_id: Uuid::new_v4(),
                    batch_id,
                    parent_staging_id: master_id,
                    raw_payload: serde_json::json!({ "size_label": label, QUANTITY_FIELD: q }),
                    size_label: label,
                    quantity: q,
                    sync: SyncState::pending(None),
                    created_at: now,
                }),
            }
        }

        Ok(StagedItem {
            master: StagingRecord {
                staging_id: master_id,
                batch_id,
                key: key.clone(),
                item_name: Self::item_name(key),
                raw_payload: Json::Object(payload),
                sync: SyncState::pending(None),
                created_at: now,
            },
            subitems,
        })
    }
}

fn columns_of(payload: &Json) -> BTreeMap<String, Json> {
    match payload {
        Json::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => BTreeMap::new(),
    }
}

/// Mutation for a master row: update when it already exists on the platform.
pub fn master_push(row: &StagingRecord) -> PushRow {
    let columns = columns_of(&row.raw_payload);
    let mutation = match &row.sync.external_id {
        Some(external_id) => Mutation::UpdateItem {
            external_id: external_id.clone(),
            columns,
        },
        None => Mutation::CreateItem {
            name: row.item_name.clone(),
            columns,
        },
    };
    PushRow {
        staging_id: row.staging_id,
        mutation,
    }
}

/// Mutation for a sub-item whose master is known on the platform.
pub fn subitem_push(row: &StagingSubitem, parent_external_id: &str) -> PushRow {
    let columns = BTreeMap::from([(QUANTITY_FIELD.to_string(), Json::from(row.quantity))]);
    let mutation = match &row.sync.external_id {
        Some(external_id) => Mutation::UpdateSubitem {
            external_id: external_id.clone(),
            columns,
        },
        None => Mutation::CreateSubitem {
            parent_external_id: parent_external_id.to_string(),
            name: row.size_label.clone(),
            columns,
        },
    };
    PushRow {
        staging_id: row.staging_id,
        mutation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{KeyColumns, Value};

    fn transformer() -> Transformer {
        Transformer::new(Hasher::default(), "size_")
    }

    fn key() -> BusinessKey {
        BusinessKey::new("ACME", "SO-1", "TEE", "RED", "PO-9")
    }

    fn record() -> SourceRecord {
        SourceRecord::new()
            .with("customer", "ACME")
            .with("order_number", "SO-1")
            .with("style", "TEE")
            .with("color", "RED")
            .with("po_number", "PO-9")
            .with("ship_date", "2024-05-01")
            .with("updated_at", "2024-04-01T00:00:00")
            .with("size_s", 4_i64)
            .with("Size_M", "10")
            .with("size_xl", 0_i64)
            .with("size_xxl", Value::Null)
    }

    #[test]
    fn test_stage_builds_master_and_subitems() {
        let batch_id = Uuid::new_v4();
        let staged = transformer().stage(batch_id, &key(), &record()).unwrap();

        assert_eq!(staged.master.item_name, "SO-1 / TEE / RED");
        assert_eq!(staged.master.raw_payload["ship_date"], "2024-05-01");
        assert!(staged.master.raw_payload.get("updated_at").is_none());
        assert!(staged.master.raw_payload.get("size_s").is_none());

        let labels: Vec<(&str, i64)> = staged
            .subitems
            .iter()
            .map(|s| (s.size_label.as_str(), s.quantity))
            .collect();
        assert_eq!(labels, vec![("M", 10), ("S", 4)]);
        assert!(staged
            .subitems
            .iter()
            .all(|s| s.parent_staging_id == staged.master.staging_id && s.batch_id == batch_id));
    }

    #[test]
    fn test_negative_quantity_is_a_validation_error() {
        let rec = record().with("size_l", -2_i64);
        let err = transformer().stage(Uuid::new_v4(), &key(), &rec).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let rec = record().with("size_l", "lots");
        assert!(transformer().stage(Uuid::new_v4(), &key(), &rec).is_err());
    }

    #[test]
    fn test_push_rows_choose_create_or_update() {
        let staged = transformer()
            .stage(Uuid::new_v4(), &key(), &record())
            .unwrap();
        assert!(matches!(
            master_push(&staged.master).mutation,
            Mutation::CreateItem { .. }
        ));

        let mut master = staged.master.clone();
        master.sync.external_id = Some("501".into());
        assert_eq!(master_push(&master).mutation.target_id(), Some("501"));

        let sub = &staged.subitems[0];
        match subitem_push(sub, "501").mutation {
            Mutation::CreateSubitem {
                parent_external_id,
                columns,
                ..
            } => {
                assert_eq!(parent_external_id, "501");
                assert_eq!(columns[QUANTITY_FIELD], Json::from(10));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_extra_volatile_columns_are_dropped() {
        let hasher = Hasher::new(KeyColumns::default(), vec!["ship_date".to_string()]);
        let staged = Transformer::new(hasher, "size_")
            .stage(Uuid::new_v4(), &key(), &record())
            .unwrap();
        assert!(staged.master.raw_payload.get("ship_date").is_none());
        assert_eq!(staged.master.raw_payload["customer"], "ACME");
    }
}
