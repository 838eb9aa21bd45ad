//! End-to-end runs against the in-memory backends.

use async_trait::async_trait;
use order_sync::batch::MemoryBatchLog;
use order_sync::snapshot::MemorySnapshotStore;
use order_sync::staging::MemoryStagingStore;
use order_sync::sync::{ErrorCategory, ItemOutcome, Mutation, Platform, PlatformError};
use order_sync::{
    Backends, ChangeKind, Config, MemorySource, Orchestrator, RunOptions, SnapshotScope,
    SnapshotStore, SourceRecord,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Platform that rejects item creation for chosen orders and records calls.
struct Recording {
    rejected_orders: Mutex<HashSet<String>>,
    mutations: Mutex<Vec<Mutation>>,
    next_id: AtomicU64,
}

impl Recording {
    fn new() -> Self {
        Self {
            rejected_orders: Mutex::new(HashSet::new()),
            mutations: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(5000),
        }
    }

    fn reject(&self, orders: &[&str]) {
        let mut rejected = self.rejected_orders.lock().unwrap();
        rejected.clear();
        rejected.extend(orders.iter().map(|o| o.to_string()));
    }

    fn take_mutations(&self) -> Vec<Mutation> {
        std::mem::take(&mut *self.mutations.lock().unwrap())
    }
}

#[async_trait]
impl Platform for Recording {
    async fn execute(&self, mutations: &[Mutation]) -> Result<Vec<ItemOutcome>, PlatformError> {
        self.mutations.lock().unwrap().extend(mutations.iter().cloned());
        let rejected = self.rejected_orders.lock().unwrap().clone();
        Ok(mutations
            .iter()
            .map(|m| match m {
                Mutation::CreateItem { name, .. }
                    if rejected.contains(name.split(" / ").next().unwrap_or_default()) =>
                {
                    ItemOutcome::Rejected {
                        category: ErrorCategory::Validation,
                        message: "invalid column value".into(),
                    }
                }
                other => ItemOutcome::Created {
                    external_id: other
                        .target_id()
                        .map(str::to_string)
                        .unwrap_or_else(|| self.next_id.fetch_add(1, Ordering::SeqCst).to_string()),
                },
            })
            .collect())
    }

    fn max_items_per_call(&self) -> usize {
        25
    }

    async fn ping(&self) -> Result<(), PlatformError> {
        Ok(())
    }
}

fn config() -> Config {
    Config::from_yaml(
        r#"
database:
  host: localhost
  database: orders
  user: sync
  ssl_mode: disable
platform:
  api_token: token
  board_id: "1"
sync:
  min_interval_ms: 0
  max_concurrent_batches: 2
"#,
    )
    .unwrap()
}

fn row(customer: &str, order: &str, qty: i64) -> SourceRecord {
    SourceRecord::new()
        .with("customer", customer)
        .with("order_number", order)
        .with("style", "TEE")
        .with("color", "RED")
        .with("po_number", "PO-1")
        .with("ship_date", "2024-06-01")
        .with("size_s", qty)
        .with("size_m", qty + 1)
}

struct Pipeline {
    orchestrator: Orchestrator,
    source: Arc<MemorySource>,
    snapshots: Arc<MemorySnapshotStore>,
    staging: Arc<MemoryStagingStore>,
    platform: Arc<Recording>,
}

fn pipeline(rows: Vec<SourceRecord>) -> Pipeline {
    let source = Arc::new(MemorySource::new("orders", rows));
    let snapshots = Arc::new(MemorySnapshotStore::new());
    let staging = Arc::new(MemoryStagingStore::new());
    let platform = Arc::new(Recording::new());
    let orchestrator = Orchestrator::with_backends(
        config(),
        Backends {
            source: source.clone(),
            snapshots: snapshots.clone(),
            staging: staging.clone(),
            log: Arc::new(MemoryBatchLog::new()),
            platform: platform.clone(),
        },
    );
    Pipeline {
        orchestrator,
        source,
        snapshots,
        staging,
        platform,
    }
}

async fn run(p: &Pipeline) -> order_sync::RunResult {
    p.orchestrator
        .run(RunOptions::default(), CancellationToken::new())
        .await
        .unwrap()
}

fn all_scope() -> SnapshotScope {
    SnapshotScope::new("orders", None)
}

#[tokio::test]
async fn test_partial_batch_success() {
    let rows: Vec<_> = (1..=10).map(|i| row("ACME", &format!("SO-{}", i), i)).collect();
    let p = pipeline(rows);
    p.platform.reject(&["SO-2", "SO-5", "SO-9"]);

    let result = run(&p).await;
    assert_eq!(result.status, "completed");
    assert_eq!(result.batches_completed, 1);
    assert_eq!(result.batches[0].successful_records, 7);
    assert_eq!(result.batches[0].failed_records, 3);

    let (items, subitems) = p.staging.production().unwrap();
    assert_eq!(items.len(), 7);
    assert_eq!(subitems.len(), 14);

    // Failed keys stay out of the baseline and are picked up again.
    let current = p.snapshots.current(&all_scope()).await.unwrap();
    assert_eq!(current.len(), 7);

    p.platform.reject(&[]);
    let detection = p.orchestrator.detect(None).await.unwrap();
    assert_eq!(detection.summary.new, 3);
    assert_eq!(detection.summary.unchanged, 7);
}

#[tokio::test]
async fn test_rerun_without_source_changes_is_a_no_op() {
    let p = pipeline(vec![row("ACME", "SO-1", 1), row("GLOBEX", "SO-2", 2)]);
    run(&p).await;
    let first = p.snapshots.current(&all_scope()).await.unwrap();
    p.platform.take_mutations();

    let second = run(&p).await;
    assert_eq!(second.detection.unchanged, 2);
    assert_eq!(second.batches_total, 0);
    assert!(p.platform.take_mutations().is_empty());

    let again = p.snapshots.current(&all_scope()).await.unwrap();
    assert_eq!(again.fingerprints, first.fingerprints);
    assert_eq!(again.version, first.version);
}

#[tokio::test]
async fn test_classification_scenario() {
    let a = row("ACME", "A", 1);
    let b_old = row("ACME", "B", 2);
    let d = row("ACME", "D", 4);
    let p = pipeline(vec![a.clone(), b_old, d]);
    run(&p).await;

    let b_new = row("ACME", "B", 20);
    let c = row("ACME", "C", 3);
    p.source.set_rows(vec![a, b_new, c]).unwrap();

    let detection = p.orchestrator.detect(None).await.unwrap();
    let kinds: Vec<(String, ChangeKind)> = detection
        .changes
        .iter()
        .map(|c| (c.key.order_number.clone(), c.kind))
        .collect();
    assert_eq!(
        kinds,
        vec![
            ("A".to_string(), ChangeKind::Unchanged),
            ("B".to_string(), ChangeKind::Changed),
            ("C".to_string(), ChangeKind::New),
            ("D".to_string(), ChangeKind::Deleted),
        ]
    );
}

#[tokio::test]
async fn test_changed_records_become_updates() {
    let p = pipeline(vec![row("ACME", "SO-1", 1)]);
    run(&p).await;
    let (items, _) = p.staging.production().unwrap();
    let external_id = items[0].external_id.clone().unwrap();
    p.platform.take_mutations();

    p.source.set_rows(vec![row("ACME", "SO-1", 9)]).unwrap();
    let result = run(&p).await;
    assert_eq!(result.detection.changed, 1);
    assert_eq!(result.records_successful, 1);

    let mutations = p.platform.take_mutations();
    assert!(mutations
        .iter()
        .any(|m| matches!(m, Mutation::UpdateItem { external_id: id, .. } if *id == external_id)));
    assert!(!mutations.iter().any(|m| matches!(m, Mutation::CreateItem { .. })));

    let (items, subitems) = p.staging.production().unwrap();
    assert_eq!(items.len(), 1);
    assert!(subitems.iter().any(|s| s.size_label == "S" && s.quantity == 9));
}

#[tokio::test]
async fn test_integrity_violation_fails_only_that_batch() {
    // Two columns map to size label "M": the last sub-item breaks the
    // unique (parent, size_label) constraint at promotion.
    let broken = row("ACME", "SO-3", 1).with("SIZE_M", 5_i64);
    let p = pipeline(vec![
        row("ACME", "SO-1", 1),
        row("ACME", "SO-2", 1),
        broken,
        row("GLOBEX", "SO-9", 1),
    ]);

    let result = run(&p).await;
    assert_eq!(result.status, "failed");
    assert_eq!(result.batches_completed, 1);
    assert_eq!(result.batches_failed, 1);

    let acme = result.batches.iter().find(|b| b.customer == "ACME").unwrap();
    assert_eq!(acme.status, "FAILED");
    assert!(acme.error_summary.as_deref().unwrap().contains("size label"));

    // Nothing of the failed batch reached production or the baseline.
    let (items, _) = p.staging.production().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].key.customer, "GLOBEX");
    let current = p.snapshots.current(&all_scope()).await.unwrap();
    assert_eq!(current.len(), 1);

    // Once the source is fixed the next run syncs ACME, reusing the items
    // the failed batch already created on the platform.
    p.platform.take_mutations();
    p.source
        .set_rows(vec![
            row("ACME", "SO-1", 1),
            row("ACME", "SO-2", 1),
            row("ACME", "SO-3", 1),
            row("GLOBEX", "SO-9", 1),
        ])
        .unwrap();
    let retry = run(&p).await;
    assert_eq!(retry.status, "completed");
    assert_eq!(retry.detection.new, 3);
    assert_eq!(p.snapshots.current(&all_scope()).await.unwrap().len(), 4);

    let mutations = p.platform.take_mutations();
    assert!(!mutations
        .iter()
        .any(|m| matches!(m, Mutation::CreateItem { .. })));
    assert_eq!(
        mutations
            .iter()
            .filter(|m| matches!(m, Mutation::UpdateItem { .. }))
            .count(),
        3
    );
    let (items, _) = p.staging.production().unwrap();
    assert_eq!(items.len(), 4);
}

#[tokio::test]
async fn test_dropped_size_is_zeroed_in_production_and_on_the_platform() {
    // size_s = 2, size_m = 3
    let p = pipeline(vec![row("ACME", "SO-1", 2)]);
    run(&p).await;
    let (_, subitems) = p.staging.production().unwrap();
    let medium_id = subitems
        .iter()
        .find(|s| s.size_label == "M")
        .and_then(|s| s.external_id.clone())
        .unwrap();
    p.platform.take_mutations();

    p.source
        .set_rows(vec![row("ACME", "SO-1", 2).with("size_m", 0_i64)])
        .unwrap();
    let result = run(&p).await;
    assert_eq!(result.detection.changed, 1);
    assert_eq!(result.records_successful, 1);

    let mutations = p.platform.take_mutations();
    assert!(mutations.iter().any(|m| matches!(
        m,
        Mutation::UpdateSubitem { external_id, columns }
            if *external_id == medium_id && columns["quantity"] == serde_json::json!(0)
    )));

    let (_, subitems) = p.staging.production().unwrap();
    let quantities: Vec<(&str, i64)> = subitems
        .iter()
        .map(|s| (s.size_label.as_str(), s.quantity))
        .collect();
    assert_eq!(quantities, vec![("M", 0), ("S", 2)]);

    // The zeroed size does not come back on the next run.
    let again = run(&p).await;
    assert_eq!(again.batches_total, 0);
    assert!(p.platform.take_mutations().is_empty());
}

#[tokio::test]
async fn test_customer_filter_limits_scope() {
    let p = pipeline(vec![row("ACME", "SO-1", 1), row("GLOBEX", "SO-2", 1)]);
    let options = RunOptions {
        customer_filter: Some("globex".into()),
        ..Default::default()
    };
    let result = p
        .orchestrator
        .run(options, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.scope, "orders[GLOBEX]");
    assert_eq!(result.detection.source_rows, 1);
    assert_eq!(result.batches_total, 1);
    let scoped = p
        .snapshots
        .current(&SnapshotScope::new("orders", Some("GLOBEX")))
        .await
        .unwrap();
    assert_eq!(scoped.len(), 1);
}
