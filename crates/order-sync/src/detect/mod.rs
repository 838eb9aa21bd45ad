//! Fingerprint diffing against the prior snapshot.
//!
//! Every business key in the union of the current scan and the prior
//! snapshot is classified exactly once:
//!
//! | current | prior | hashes    | kind        |
//! |---------|-------|-----------|-------------|
//! | yes     | no    |           | `New`       |
//! | no      | yes   |           | `Deleted`   |
//! | yes     | yes   | differ    | `Changed`   |
//! | yes     | yes   | equal     | `Unchanged` |
//!
//! Rows whose key has a NULL or blank component are excluded and counted as
//! unmappable. Keys that appear more than once in one scan are ambiguous:
//! their rows are excluded and their prior fingerprint carries forward.

use crate::error::{Result, SyncError};
use crate::hasher::{ContentHash, Fingerprint, Hasher};
use crate::record::{BusinessKey, SourceRecord};
use crate::snapshot::{Snapshot, SnapshotScope};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Classification of one business key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    New,
    Changed,
    Unchanged,
    Deleted,
}

impl ChangeKind {
    /// Whether records of this kind are carried into staging.
    pub fn needs_sync(&self) -> bool {
        matches!(self, ChangeKind::New | ChangeKind::Changed)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::New => "NEW",
            ChangeKind::Changed => "CHANGED",
            ChangeKind::Unchanged => "UNCHANGED",
            ChangeKind::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// Classification result for one business key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub key: BusinessKey,
    pub kind: ChangeKind,
    pub previous_hash: Option<ContentHash>,
    pub current_hash: Option<ContentHash>,
}

/// A source row excluded because its business key could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmappableRecord {
    /// Position of the row in the scan.
    pub row_index: usize,
    /// Key columns that were NULL or blank.
    pub missing: Vec<String>,
}

/// Counters from one detection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionSummary {
    pub source_rows: usize,
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub unmappable: usize,
    pub duplicate_keys: usize,
}

impl DetectionSummary {
    /// Keys that need staging and a push.
    pub fn pending(&self) -> usize {
        self.new + self.changed
    }

    /// Whether the scan differs from the prior snapshot at all.
    pub fn has_changes(&self) -> bool {
        self.new + self.changed + self.deleted > 0
    }
}

/// Output of [`ChangeDetector::detect`].
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub scope: SnapshotScope,
    /// Version of the snapshot the scan was compared against.
    pub base_version: i64,
    /// One entry per key, sorted by key.
    pub changes: Vec<ChangeRecord>,
    /// Candidate successor snapshot if every change syncs.
    pub new_snapshot: Snapshot,
    /// Source rows of mappable, non-duplicate keys.
    pub records: BTreeMap<BusinessKey, SourceRecord>,
    pub unmappable: Vec<UnmappableRecord>,
    pub duplicate_keys: Vec<BusinessKey>,
    pub summary: DetectionSummary,
    prior: BTreeMap<BusinessKey, Fingerprint>,
    current: BTreeMap<BusinessKey, Fingerprint>,
}

impl DetectionResult {
    /// Changes of one kind.
    pub fn of_kind(&self, kind: ChangeKind) -> impl Iterator<Item = &ChangeRecord> {
        self.changes.iter().filter(move |c| c.kind == kind)
    }

    /// Customers with at least one NEW, CHANGED or DELETED key, sorted.
    pub fn customers_with_changes(&self) -> Vec<String> {
        self.changes
            .iter()
            .filter(|c| c.kind != ChangeKind::Unchanged)
            .map(|c| c.key.customer.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// NEW and CHANGED records of one customer, with their source rows.
    pub fn pending_for(&self, customer: &str) -> Vec<(&ChangeRecord, &SourceRecord)> {
        self.changes
            .iter()
            .filter(|c| c.kind.needs_sync() && c.key.customer == customer)
            .filter_map(|c| self.records.get(&c.key).map(|r| (c, r)))
            .collect()
    }

    /// Snapshot slice to commit for a customer once its batch completes.
    ///
    /// Keys in `synced` take their current fingerprint. NEW or CHANGED keys
    /// that did not sync keep their prior fingerprint (or stay absent), so the
    /// next run detects them again. DELETED keys are dropped.
    pub fn slice_for(&self, customer: &str, synced: &BTreeSet<BusinessKey>) -> Vec<Fingerprint> {
        let mut slice = Vec::new();
        for (key, fp) in self.new_snapshot.customer_slice(customer) {
            let pending = self
                .changes
                .binary_search_by(|c| c.key.cmp(&key))
                .ok()
                .map(|i| self.changes[i].kind.needs_sync())
                .unwrap_or(false);

            if !pending || synced.contains(&key) {
                slice.push(fp);
            } else if let Some(prior) = self.prior.get(&key) {
                slice.push(prior.clone());
            }
        }
        slice
    }

    /// Current fingerprint of a scanned key.
    pub fn current_fingerprint(&self, key: &BusinessKey) -> Option<&Fingerprint> {
        self.current.get(key)
    }
}

/// Classifies source rows against a prior snapshot.
#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    hasher: Hasher,
}

impl ChangeDetector {
    pub fn new(hasher: Hasher) -> Self {
        Self { hasher }
    }

    pub fn hasher(&self) -> &Hasher {
        &self.hasher
    }

    /// Diff a scan against the prior snapshot of the same scope.
    ///
    /// The customer filter is taken from the snapshot's scope. A row whose
    /// customer lies outside that filter is a configuration error. The prior
    /// snapshot is never modified.
    pub fn detect(&self, rows: &[SourceRecord], prior: &Snapshot) -> Result<DetectionResult> {
        let scope = prior.scope.clone();
        let mut summary = DetectionSummary {
            source_rows: rows.len(),
            ..Default::default()
        };

        // Fingerprint every row, grouping by key to spot duplicates.
        let mut scanned: BTreeMap<BusinessKey, Vec<(Fingerprint, &SourceRecord)>> = BTreeMap::new();
        let mut unmappable = Vec::new();
        for (row_index, row) in rows.iter().enumerate() {
            let fp = match self.hasher.fingerprint(row) {
                Ok(fp) => fp,
                Err(missing) => {
                    warn!(
                        "{}: row {} has no usable business key (missing {})",
                        scope,
                        row_index,
                        missing.join(", ")
                    );
                    unmappable.push(UnmappableRecord { row_index, missing });
                    continue;
                }
            };

            if !scope.contains(&fp.key) {
                return Err(SyncError::Config(format!(
                    "row {} belongs to customer '{}' but the run is filtered to '{}'",
                    row_index,
                    fp.key.customer,
                    scope.filter_key()
                )));
            }

            scanned.entry(fp.key.clone()).or_default().push((fp, row));
        }
        summary.unmappable = unmappable.len();

        let mut current = BTreeMap::new();
        let mut records = BTreeMap::new();
        let mut duplicate_keys = Vec::new();
        for (key, mut entries) in scanned {
            if entries.len() > 1 {
                warn!(
                    "{}: business key {} appears {} times; excluded from this run",
                    scope,
                    key,
                    entries.len()
                );
                duplicate_keys.push(key);
                continue;
            }
            if let Some((fp, row)) = entries.pop() {
                records.insert(key.clone(), row.clone());
                current.insert(key, fp);
            }
        }
        summary.duplicate_keys = duplicate_keys.len();

        let prior_in_scope: BTreeMap<BusinessKey, Fingerprint> = prior
            .fingerprints
            .iter()
            .filter(|(k, _)| scope.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        // Out-of-scope and ambiguous keys carry forward untouched.
        let mut next: BTreeMap<BusinessKey, Fingerprint> = prior
            .fingerprints
            .iter()
            .filter(|(k, _)| !scope.contains(k) || duplicate_keys.binary_search(k).is_ok())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let union: BTreeSet<&BusinessKey> = current
            .keys()
            .chain(
                prior_in_scope
                    .keys()
                    .filter(|k| duplicate_keys.binary_search(k).is_err()),
            )
            .collect();

        let mut changes = Vec::with_capacity(union.len());
        for key in union {
            let now = current.get(key);
            let before = prior_in_scope.get(key);
            let kind = match (now, before) {
                (Some(_), None) => ChangeKind::New,
                (None, Some(_)) => ChangeKind::Deleted,
                (Some(n), Some(b)) if n.hash != b.hash => ChangeKind::Changed,
                (Some(_), Some(_)) => ChangeKind::Unchanged,
                (None, None) => continue,
            };

            match kind {
                ChangeKind::New => summary.new += 1,
                ChangeKind::Changed => summary.changed += 1,
                ChangeKind::Unchanged => summary.unchanged += 1,
                ChangeKind::Deleted => summary.deleted += 1,
            }

            match (kind, now, before) {
                (ChangeKind::Unchanged, _, Some(b)) => {
                    next.insert(key.clone(), b.clone());
                }
                (ChangeKind::New | ChangeKind::Changed, Some(n), _) => {
                    next.insert(key.clone(), n.clone());
                }
                _ => {}
            }

            changes.push(ChangeRecord {
                key: key.clone(),
                kind,
                previous_hash: before.map(|b| b.hash),
                current_hash: now.map(|n| n.hash),
            });
        }

        info!(
            "{}: {} rows -> {} new, {} changed, {} unchanged, {} deleted, {} unmappable, {} duplicate keys",
            scope,
            summary.source_rows,
            summary.new,
            summary.changed,
            summary.unchanged,
            summary.deleted,
            summary.unmappable,
            summary.duplicate_keys
        );
        debug!("{}: compared against snapshot version {}", scope, prior.version);

        let new_snapshot = Snapshot {
            snapshot_id: Uuid::new_v4(),
            scope: scope.clone(),
            version: prior.version + 1,
            created_at: Utc::now(),
            fingerprints: next,
        };

        Ok(DetectionResult {
            scope,
            base_version: prior.version,
            changes,
            new_snapshot,
            records,
            unmappable,
            duplicate_keys,
            summary,
            prior: prior_in_scope,
            current,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;

    fn row(customer: &str, order: &str, qty: i64) -> SourceRecord {
        SourceRecord::new()
            .with("customer", customer)
            .with("order_number", order)
            .with("style", "JK-22")
            .with("color", "NAVY")
            .with("po_number", "PO-1")
            .with("size_m", qty)
    }

    fn key(customer: &str, order: &str) -> BusinessKey {
        BusinessKey::new(customer, order, "JK-22", "NAVY", "PO-1")
    }

    fn snapshot_of(detector: &ChangeDetector, scope: SnapshotScope, rows: &[SourceRecord]) -> Snapshot {
        let mut snap = Snapshot::empty(scope);
        snap.version = 3;
        for r in rows {
            let fp = detector.hasher().fingerprint(r).unwrap();
            snap.fingerprints.insert(fp.key.clone(), fp);
        }
        snap
    }

    fn kind_of(result: &DetectionResult, k: &BusinessKey) -> ChangeKind {
        result
            .changes
            .iter()
            .find(|c| &c.key == k)
            .map(|c| c.kind)
            .unwrap()
    }

    #[test]
    fn test_classifies_new_changed_unchanged_deleted() {
        let detector = ChangeDetector::default();
        let scope = SnapshotScope::new("orders", None);
        // prior {A:h1, B:h2old, D:h4}
        let prior = snapshot_of(
            &detector,
            scope,
            &[row("ACME", "A", 1), row("ACME", "B", 1), row("ACME", "D", 4)],
        );
        // source {A:h1, B:h2, C:h3}
        let source = vec![row("ACME", "A", 1), row("ACME", "B", 2), row("ACME", "C", 3)];

        let result = detector.detect(&source, &prior).unwrap();

        assert_eq!(kind_of(&result, &key("ACME", "A")), ChangeKind::Unchanged);
        assert_eq!(kind_of(&result, &key("ACME", "B")), ChangeKind::Changed);
        assert_eq!(kind_of(&result, &key("ACME", "C")), ChangeKind::New);
        assert_eq!(kind_of(&result, &key("ACME", "D")), ChangeKind::Deleted);
        assert_eq!(result.base_version, 3);
        assert_eq!(result.new_snapshot.version, 4);
        assert!(result.new_snapshot.get(&key("ACME", "D")).is_none());
        assert_eq!(result.summary.pending(), 2);
    }

    #[test]
    fn test_customer_spellings_share_one_slice() {
        let detector = ChangeDetector::default();
        let prior = Snapshot::empty(SnapshotScope::new("orders", None));
        let source = vec![row("Acme", "SO-1", 1), row(" ACME", "SO-2", 2), row("acme", "SO-1", 1)];

        let result = detector.detect(&source, &prior).unwrap();

        assert_eq!(result.customers_with_changes(), vec!["ACME".to_string()]);
        // "Acme" and "acme" name the same order line.
        assert_eq!(result.duplicate_keys, vec![key("ACME", "SO-1")]);
        assert_eq!(result.pending_for("ACME").len(), 1);
        let synced = BTreeSet::from([key("ACME", "SO-2")]);
        assert_eq!(result.slice_for("ACME", &synced).len(), 1);
    }

    #[test]
    fn test_every_key_classified_exactly_once() {
        let detector = ChangeDetector::default();
        let scope = SnapshotScope::new("orders", None);
        let prior_rows: Vec<_> = (0..30).map(|i| row("ACME", &format!("SO-{}", i), i)).collect();
        let prior = snapshot_of(&detector, scope, &prior_rows);
        let source: Vec<_> = (15..45)
            .map(|i| row("ACME", &format!("SO-{}", i), if i % 2 == 0 { i } else { i + 100 }))
            .collect();

        let result = detector.detect(&source, &prior).unwrap();

        let keys: Vec<_> = result.changes.iter().map(|c| c.key.clone()).collect();
        let unique: BTreeSet<_> = keys.iter().cloned().collect();
        assert_eq!(keys.len(), unique.len());
        assert_eq!(keys.len(), 45);
        assert_eq!(result.summary.deleted, 15);
        assert_eq!(result.summary.new, 15);
        assert_eq!(result.summary.changed + result.summary.unchanged, 15);
    }

    #[test]
    fn test_detecting_twice_is_idempotent() {
        let detector = ChangeDetector::default();
        let scope = SnapshotScope::new("orders", None);
        let source: Vec<_> = (0..10).map(|i| row("ACME", &format!("SO-{}", i), i)).collect();

        let first = detector
            .detect(&source, &Snapshot::empty(scope))
            .unwrap();
        let second = detector.detect(&source, &first.new_snapshot).unwrap();

        assert!(second.changes.iter().all(|c| c.kind == ChangeKind::Unchanged));
        assert_eq!(
            second.new_snapshot.fingerprints,
            first.new_snapshot.fingerprints
        );
        assert!(!second.summary.has_changes());
    }

    #[test]
    fn test_unmappable_rows_are_counted_and_excluded() {
        let detector = ChangeDetector::default();
        let source = vec![
            row("ACME", "SO-1", 1),
            row("ACME", "SO-2", 1).with("po_number", Value::Null),
            row("ACME", "SO-3", 1).with("color", " "),
        ];

        let result = detector
            .detect(&source, &Snapshot::empty(SnapshotScope::new("orders", None)))
            .unwrap();

        assert_eq!(result.summary.unmappable, 2);
        assert_eq!(result.unmappable[0].row_index, 1);
        assert_eq!(result.unmappable[0].missing, vec!["po_number"]);
        assert_eq!(result.changes.len(), 1);
    }

    #[test]
    fn test_customer_filter_limits_deletions() {
        let detector = ChangeDetector::default();
        let scope = SnapshotScope::new("orders", Some("acme"));
        let mut prior = snapshot_of(&detector, scope.clone(), &[row("ACME", "SO-1", 1)]);
        let other = detector.hasher().fingerprint(&row("GLOBEX", "SO-9", 1)).unwrap();
        prior.fingerprints.insert(other.key.clone(), other);

        let result = detector.detect(&[], &prior).unwrap();

        assert_eq!(result.summary.deleted, 1);
        assert_eq!(result.changes.len(), 1);
        assert!(result.new_snapshot.get(&key("GLOBEX", "SO-9")).is_some());
    }

    #[test]
    fn test_row_outside_filter_is_config_error() {
        let detector = ChangeDetector::default();
        let prior = Snapshot::empty(SnapshotScope::new("orders", Some("ACME")));
        let err = detector
            .detect(&[row("GLOBEX", "SO-1", 1)], &prior)
            .unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_duplicate_keys_carry_prior_forward() {
        let detector = ChangeDetector::default();
        let scope = SnapshotScope::new("orders", None);
        let prior = snapshot_of(&detector, scope, &[row("ACME", "SO-1", 1)]);
        let source = vec![row("ACME", "SO-1", 2), row("ACME", "SO-1", 3)];

        let result = detector.detect(&source, &prior).unwrap();

        assert_eq!(result.duplicate_keys, vec![key("ACME", "SO-1")]);
        assert!(result.changes.is_empty());
        assert_eq!(
            result.new_snapshot.get(&key("ACME", "SO-1")),
            prior.get(&key("ACME", "SO-1"))
        );
    }

    #[test]
    fn test_detect_does_not_mutate_prior() {
        let detector = ChangeDetector::default();
        let scope = SnapshotScope::new("orders", None);
        let prior = snapshot_of(&detector, scope, &[row("ACME", "SO-1", 1)]);
        let before = prior.clone();

        detector.detect(&[row("ACME", "SO-2", 1)], &prior).unwrap();

        assert_eq!(prior, before);
    }

    #[test]
    fn test_slice_keeps_prior_fingerprint_for_failed_keys() {
        let detector = ChangeDetector::default();
        let scope = SnapshotScope::new("orders", None);
        let prior = snapshot_of(
            &detector,
            scope,
            &[row("ACME", "A", 1), row("ACME", "B", 1), row("ACME", "D", 1)],
        );
        let source = vec![row("ACME", "A", 1), row("ACME", "B", 2), row("ACME", "C", 3)];
        let result = detector.detect(&source, &prior).unwrap();

        // B failed to sync, C succeeded.
        let synced: BTreeSet<_> = [key("ACME", "C")].into_iter().collect();
        let slice = result.slice_for("ACME", &synced);
        let by_key: BTreeMap<_, _> = slice.into_iter().map(|f| (f.key.clone(), f)).collect();

        assert_eq!(by_key.len(), 3);
        assert_eq!(by_key.get(&key("ACME", "B")), prior.get(&key("ACME", "B")));
        assert_eq!(
            by_key.get(&key("ACME", "C")).map(|f| f.hash),
            result.current_fingerprint(&key("ACME", "C")).map(|f| f.hash)
        );
        assert!(!by_key.contains_key(&key("ACME", "D")));
    }
}
