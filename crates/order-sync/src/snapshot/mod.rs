//! Versioned fingerprint snapshots used as the comparison baseline.
//!
//! A [`Snapshot`] is never mutated in place. Committing a customer's slice
//! builds a new snapshot (new id, version + 1) and swaps it in as current, so
//! readers always see either the old or the new baseline.
//!
//! Backends implement [`SnapshotStore`]:
//!
//! - **PostgreSQL**: `DbSnapshotStore` in `db.rs`
//! - **Memory**: `MemorySnapshotStore` in `memory.rs` (tests, dry runs)

mod db;
mod memory;

pub use db::DbSnapshotStore;
pub use memory::MemorySnapshotStore;

use crate::error::{Result, SyncError};
use crate::hasher::Fingerprint;
use crate::record::BusinessKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Stored value of `customer_filter` for unfiltered scopes.
pub(crate) const ALL_CUSTOMERS: &str = "*";

/// Identifies one current snapshot: a source table and an optional customer filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotScope {
    pub source_table: String,
    pub customer_filter: Option<String>,
}

impl SnapshotScope {
    pub fn new(source_table: impl Into<String>, customer_filter: Option<&str>) -> Self {
        Self {
            source_table: source_table.into(),
            customer_filter: customer_filter
                .map(|c| c.trim().to_uppercase())
                .filter(|c| !c.is_empty()),
        }
    }

    /// Storage form of the filter (`*` when unfiltered).
    pub fn filter_key(&self) -> &str {
        self.customer_filter.as_deref().unwrap_or(ALL_CUSTOMERS)
    }

    /// Whether a key falls inside this scope.
    pub fn contains(&self, key: &BusinessKey) -> bool {
        match &self.customer_filter {
            Some(filter) => key.matches_customer(filter),
            None => true,
        }
    }
}

impl fmt::Display for SnapshotScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.source_table, self.filter_key())
    }
}

/// The set of fingerprints as of the last successful sync of a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: Uuid,
    pub scope: SnapshotScope,
    /// 0 for a scope that has never been committed.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub fingerprints: BTreeMap<BusinessKey, Fingerprint>,
}

impl Snapshot {
    /// Baseline for a scope with no committed snapshot.
    pub fn empty(scope: SnapshotScope) -> Self {
        Self {
            snapshot_id: Uuid::nil(),
            scope,
            version: 0,
            created_at: Utc::now(),
            fingerprints: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    pub fn get(&self, key: &BusinessKey) -> Option<&Fingerprint> {
        self.fingerprints.get(key)
    }

    /// Fingerprints belonging to one customer.
    pub fn customer_slice(&self, customer: &str) -> BTreeMap<BusinessKey, Fingerprint> {
        self.fingerprints
            .iter()
            .filter(|(k, _)| k.customer == customer)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Successor snapshot with one customer's slice replaced.
    pub fn with_slice(&self, customer: &str, slice: Vec<Fingerprint>) -> Snapshot {
        let mut fingerprints: BTreeMap<BusinessKey, Fingerprint> = self
            .fingerprints
            .iter()
            .filter(|(k, _)| k.customer != customer)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for fp in slice {
            fingerprints.insert(fp.key.clone(), fp);
        }

        Snapshot {
            snapshot_id: Uuid::new_v4(),
            scope: self.scope.clone(),
            version: self.version + 1,
            created_at: Utc::now(),
            fingerprints,
        }
    }
}

/// Reject a slice commit whose base is older than the slice's last commit.
pub(crate) fn check_slice_version(
    scope: &SnapshotScope,
    customer: &str,
    base_version: i64,
    slice_version: i64,
) -> Result<()> {
    if slice_version > base_version {
        return Err(SyncError::SnapshotConflict {
            scope: scope.to_string(),
            customer: customer.to_string(),
            expected: base_version,
            found: slice_version,
        });
    }
    Ok(())
}

/// Trait for snapshot persistence backends.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; batches for different customers
/// commit their slices concurrently, and each commit must be serialized
/// against the others for the same scope.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Initialize storage. Idempotent.
    async fn init_schema(&self) -> Result<()>;

    /// Current snapshot for a scope, or [`Snapshot::empty`] if none exists.
    async fn current(&self, scope: &SnapshotScope) -> Result<Snapshot>;

    /// Atomically replace one customer's slice of the current snapshot.
    ///
    /// `base_version` is the snapshot version detection compared against. The
    /// commit fails with [`SyncError::SnapshotConflict`] if this customer's
    /// slice was committed after that version. Keys of other customers carry
    /// over unchanged; the superseded snapshot stops being current and is
    /// discarded. Returns the new current snapshot.
    ///
    /// [`SyncError::SnapshotConflict`]: crate::error::SyncError::SnapshotConflict
    async fn commit_slice(
        &self,
        scope: &SnapshotScope,
        customer: &str,
        base_version: i64,
        slice: Vec<Fingerprint>,
    ) -> Result<Snapshot>;

    /// All scopes of a source table that have a current snapshot.
    async fn scopes(&self, source_table: &str) -> Result<Vec<SnapshotScope>>;

    /// Backend type name for logging.
    fn backend_type(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::ContentHash;

    fn fp(customer: &str, order: &str, content: &str) -> Fingerprint {
        Fingerprint {
            key: BusinessKey::new(customer, order, "S", "C", "P"),
            hash: ContentHash::of(content.as_bytes()),
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn test_scope_normalizes_filter() {
        let scope = SnapshotScope::new("orders", Some(" acme "));
        assert_eq!(scope.customer_filter.as_deref(), Some("ACME"));
        assert_eq!(scope.filter_key(), "ACME");
        assert_eq!(SnapshotScope::new("orders", Some("  ")).filter_key(), "*");
    }

    #[test]
    fn test_with_slice_replaces_only_one_customer() {
        let mut base = Snapshot::empty(SnapshotScope::new("orders", None));
        for f in [fp("ACME", "1", "a"), fp("ACME", "2", "b"), fp("GLOBEX", "1", "c")] {
            base.fingerprints.insert(f.key.clone(), f);
        }

        let next = base.with_slice("ACME", vec![fp("ACME", "3", "d")]);

        assert_eq!(next.version, 1);
        assert_ne!(next.snapshot_id, base.snapshot_id);
        assert_eq!(next.len(), 2);
        assert!(next.get(&BusinessKey::new("GLOBEX", "1", "S", "C", "P")).is_some());
        assert!(next.get(&BusinessKey::new("ACME", "1", "S", "C", "P")).is_none());
        // The predecessor is untouched.
        assert_eq!(base.len(), 3);
    }
}
