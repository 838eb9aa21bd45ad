//! In-process snapshot store.
//!
//! Used by tests and by dry runs that must not touch the database. Snapshots
//! are held behind `Arc` and swapped under a write lock, so a reader holding
//! an older `Arc` keeps a consistent view.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::{check_slice_version, Snapshot, SnapshotScope, SnapshotStore};
use crate::error::{Result, SyncError};
use crate::hasher::Fingerprint;

#[derive(Default)]
struct Inner {
    current: HashMap<SnapshotScope, Arc<Snapshot>>,
    slice_versions: HashMap<(SnapshotScope, String), i64>,
}

/// Snapshot store backed by process memory.
#[derive(Default)]
pub struct MemorySnapshotStore {
    inner: RwLock<Inner>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a snapshot as current (test setup, restores).
    pub fn install(&self, snapshot: Snapshot) -> Result<()> {
        let mut inner = self.write()?;
        inner
            .current
            .insert(snapshot.scope.clone(), Arc::new(snapshot));
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| SyncError::Snapshot("snapshot lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| SyncError::Snapshot("snapshot lock poisoned".into()))
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn current(&self, scope: &SnapshotScope) -> Result<Snapshot> {
        let inner = self.read()?;
        Ok(inner
            .current
            .get(scope)
            .map(|s| Snapshot::clone(s))
            .unwrap_or_else(|| Snapshot::empty(scope.clone())))
    }

    async fn commit_slice(
        &self,
        scope: &SnapshotScope,
        customer: &str,
        base_version: i64,
        slice: Vec<Fingerprint>,
    ) -> Result<Snapshot> {
        let mut inner = self.write()?;

        let slice_key = (scope.clone(), customer.to_string());
        let slice_version = inner.slice_versions.get(&slice_key).copied().unwrap_or(0);
        check_slice_version(scope, customer, base_version, slice_version)?;

        let base = inner
            .current
            .get(scope)
            .cloned()
            .unwrap_or_else(|| Arc::new(Snapshot::empty(scope.clone())));
        let next = base.with_slice(customer, slice);

        debug!(
            "{}: committed slice for {} (version {} -> {}, {} keys)",
            scope,
            customer,
            base.version,
            next.version,
            next.len()
        );
        inner.slice_versions.insert(slice_key, next.version);
        inner.current.insert(scope.clone(), Arc::new(next.clone()));
        Ok(next)
    }

    async fn scopes(&self, source_table: &str) -> Result<Vec<SnapshotScope>> {
        let inner = self.read()?;
        let mut scopes: Vec<SnapshotScope> = inner
            .current
            .keys()
            .filter(|s| s.source_table == source_table)
            .cloned()
            .collect();
        scopes.sort();
        Ok(scopes)
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::ContentHash;
    use crate::record::BusinessKey;
    use chrono::Utc;

    fn fp(customer: &str, order: &str) -> Fingerprint {
        Fingerprint {
            key: BusinessKey::new(customer, order, "S", "C", "P"),
            hash: ContentHash::of(order.as_bytes()),
            computed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_current_defaults_to_empty() {
        let store = MemorySnapshotStore::new();
        let scope = SnapshotScope::new("orders", None);
        let snap = store.current(&scope).await.unwrap();
        assert_eq!(snap.version, 0);
        assert!(snap.is_empty());
        assert!(store.scopes("orders").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_slice_swaps_versions() {
        let store = MemorySnapshotStore::new();
        let scope = SnapshotScope::new("orders", None);

        let before = store.current(&scope).await.unwrap();
        store
            .commit_slice(&scope, "ACME", 0, vec![fp("ACME", "1")])
            .await
            .unwrap();
        let after = store
            .commit_slice(&scope, "GLOBEX", 0, vec![fp("GLOBEX", "1")])
            .await
            .unwrap();

        assert_eq!(after.version, 2);
        assert_eq!(after.len(), 2);
        assert!(before.is_empty());
        assert_eq!(store.current(&scope).await.unwrap(), after);
        assert_eq!(store.scopes("orders").await.unwrap(), vec![scope]);
    }

    #[tokio::test]
    async fn test_concurrent_slice_commits_are_serialized() {
        let store = Arc::new(MemorySnapshotStore::new());
        let scope = SnapshotScope::new("orders", None);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let scope = scope.clone();
            handles.push(tokio::spawn(async move {
                let customer = format!("C{}", i);
                store
                    .commit_slice(&scope, &customer, 0, vec![fp(&customer, "1")])
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let snap = store.current(&scope).await.unwrap();
        assert_eq!(snap.version, 8);
        assert_eq!(snap.len(), 8);
    }

    #[tokio::test]
    async fn test_stale_slice_commit_is_rejected() {
        let store = MemorySnapshotStore::new();
        let scope = SnapshotScope::new("orders", None);

        store
            .commit_slice(&scope, "ACME", 0, vec![fp("ACME", "1")])
            .await
            .unwrap();
        let err = store
            .commit_slice(&scope, "ACME", 0, vec![fp("ACME", "2")])
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SyncError::SnapshotConflict { expected: 0, found: 1, .. }
        ));
        assert_eq!(store.current(&scope).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_poisoned_lock_is_a_snapshot_error() {
        let store = Arc::new(MemorySnapshotStore::new());
        let poisoner = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.inner.write().unwrap();
            panic!("poison");
        })
        .join();

        let err = store
            .current(&SnapshotScope::new("orders", None))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Snapshot(_)));
    }
}
