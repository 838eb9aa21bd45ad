//! Rate-limited, retrying push of staging rows to the external platform.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::limiter::RateLimiter;
use super::platform::{ErrorCategory, ItemOutcome, Mutation, Platform};
use super::retry::RetryPolicy;
use crate::error::{Result, SyncError};
use crate::staging::SyncStatus;

/// A staging row ready to be pushed.
#[derive(Debug, Clone, PartialEq)]
pub struct PushRow {
    pub staging_id: Uuid,
    pub mutation: Mutation,
}

/// Outcome of pushing one staging row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub staging_id: Uuid,
    pub external_id: Option<String>,
    /// `ExternalSuccess` or `ExternalFailed`.
    pub status: SyncStatus,
    pub error_category: Option<ErrorCategory>,
    /// Failed attempts for this row.
    pub retry_count: i32,
    pub last_error: Option<String>,
}

impl SyncResult {
    pub fn success(staging_id: Uuid, external_id: String, retry_count: u32) -> Self {
        Self {
            staging_id,
            external_id: Some(external_id),
            status: SyncStatus::ExternalSuccess,
            error_category: None,
            retry_count: retry_count as i32,
            last_error: None,
        }
    }

    pub fn failed(
        staging_id: Uuid,
        category: ErrorCategory,
        retry_count: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            staging_id,
            external_id: None,
            status: SyncStatus::ExternalFailed,
            error_category: Some(category),
            retry_count: retry_count as i32,
            last_error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::ExternalSuccess
    }
}

struct Pending {
    row: PushRow,
    failures: u32,
    last_error: String,
}

struct ChunkOutcome {
    results: Vec<SyncResult>,
    /// The platform answered at least once.
    reached: bool,
    last_error: Option<String>,
}

/// Pushes rows through the shared limiter with per-row retry.
pub struct SyncClient {
    platform: Arc<dyn Platform>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    batch_size: usize,
}

impl SyncClient {
    pub fn new(
        platform: Arc<dyn Platform>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        batch_size: usize,
    ) -> Self {
        Self {
            platform,
            limiter,
            retry,
            batch_size,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Items per platform call.
    pub fn chunk_size(&self) -> usize {
        self.batch_size
            .min(self.platform.max_items_per_call())
            .max(1)
    }

    /// Push rows and return one result per row, in input order.
    ///
    /// Record-level failures are reported in the results. The call fails
    /// only when no request reached the platform at all.
    pub async fn push(
        &self,
        rows: Vec<PushRow>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SyncResult>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let chunk_size = self.chunk_size();
        let total = rows.len();
        let mut chunks: Vec<Vec<PushRow>> = Vec::new();
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            chunks.push(rows.by_ref().take(chunk_size).collect());
        }
        debug!(
            "pushing {} rows in {} chunks of up to {}",
            total,
            chunks.len(),
            chunk_size
        );

        let outcomes: Vec<ChunkOutcome> = stream::iter(chunks)
            .map(|chunk| self.push_chunk(chunk, cancel))
            .buffered(self.limiter.max_in_flight())
            .collect()
            .await;

        if !cancel.is_cancelled() && outcomes.iter().all(|o| !o.reached) {
            let last = outcomes
                .iter()
                .rev()
                .find_map(|o| o.last_error.clone())
                .unwrap_or_else(|| "no response".to_string());
            return Err(SyncError::Connectivity(format!(
                "none of {} requests reached the platform: {}",
                outcomes.len(),
                last
            )));
        }

        Ok(outcomes.into_iter().flat_map(|o| o.results).collect())
    }

    async fn push_chunk(&self, chunk: Vec<PushRow>, cancel: &CancellationToken) -> ChunkOutcome {
        let order: Vec<Uuid> = chunk.iter().map(|r| r.staging_id).collect();
        let mut pending: Vec<Pending> = chunk
            .into_iter()
            .map(|row| Pending {
                row,
                failures: 0,
                last_error: String::new(),
            })
            .collect();
        let mut results = Vec::with_capacity(order.len());
        let mut reached = false;
        let mut last_error = None;
        let mut attempt = 0;

        while !pending.is_empty() {
            let permit = if cancel.is_cancelled() {
                None
            } else {
                self.limiter.acquire().await.ok()
            };
            let Some(permit) = permit else {
                for p in pending.drain(..) {
                    results.push(SyncResult::failed(
                        p.row.staging_id,
                        ErrorCategory::Cancelled,
                        p.failures,
                        "cancelled",
                    ));
                }
                break;
            };

            attempt += 1;
            let mutations: Vec<Mutation> = pending.iter().map(|p| p.row.mutation.clone()).collect();
            let call = self.platform.execute(&mutations).await;
            drop(permit);

            let mut hint = None;
            let mut retry = Vec::new();
            match call {
                Ok(outcomes) if outcomes.len() == pending.len() => {
                    reached = true;
                    for (mut p, outcome) in pending.drain(..).zip(outcomes) {
                        match outcome {
                            ItemOutcome::Created { external_id } => {
                                results.push(SyncResult::success(
                                    p.row.staging_id,
                                    external_id,
                                    p.failures,
                                ));
                            }
                            ItemOutcome::Rejected { category, message } if category.is_transient() => {
                                p.failures += 1;
                                p.last_error = message;
                                retry.push(p);
                            }
                            ItemOutcome::Rejected { category, message } => {
                                warn!(
                                    "staging row {} rejected ({}): {}",
                                    p.row.staging_id, category, message
                                );
                                results.push(SyncResult::failed(
                                    p.row.staging_id,
                                    category,
                                    p.failures + 1,
                                    message,
                                ));
                            }
                            ItemOutcome::Retry { message } => {
                                p.failures += 1;
                                p.last_error = message;
                                retry.push(p);
                            }
                        }
                    }
                }
                Ok(outcomes) => {
                    reached = true;
                    let message = format!(
                        "platform answered {} outcomes for {} mutations",
                        outcomes.len(),
                        pending.len()
                    );
                    for mut p in pending.drain(..) {
                        p.failures += 1;
                        p.last_error = message.clone();
                        retry.push(p);
                    }
                }
                Err(e) if e.is_transient() => {
                    if !e.is_connectivity() {
                        reached = true;
                    }
                    debug!("attempt {} of chunk failed: {}", attempt, e);
                    hint = e.retry_after();
                    last_error = Some(e.to_string());
                    for mut p in pending.drain(..) {
                        p.failures += 1;
                        p.last_error = e.to_string();
                        retry.push(p);
                    }
                }
                Err(e) => {
                    reached = true;
                    warn!("chunk of {} rows rejected: {}", pending.len(), e);
                    for p in pending.drain(..) {
                        results.push(SyncResult::failed(
                            p.row.staging_id,
                            e.category(),
                            p.failures + 1,
                            e.to_string(),
                        ));
                    }
                }
            }

            for p in retry {
                if self.retry.allows_another(p.failures) {
                    pending.push(p);
                } else {
                    warn!(
                        "staging row {} failed after {} attempts: {}",
                        p.row.staging_id, p.failures, p.last_error
                    );
                    results.push(SyncResult::failed(
                        p.row.staging_id,
                        ErrorCategory::TransientExhausted,
                        p.failures,
                        p.last_error,
                    ));
                }
            }

            if !pending.is_empty() {
                // Cancellation during the wait is handled at the top of the loop.
                self.retry.wait(attempt, hint, cancel).await;
            }
        }

        // Restore input order.
        results.sort_by_key(|r| order.iter().position(|id| *id == r.staging_id));

        ChunkOutcome {
            results,
            reached,
            last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::platform::PlatformError;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    type Answer = std::result::Result<Vec<ItemOutcome>, PlatformError>;

    /// Replays scripted answers, then creates everything.
    struct Scripted {
        answers: Mutex<VecDeque<Answer>>,
        calls: AtomicUsize,
        max_items: usize,
    }

    impl Scripted {
        fn new(answers: Vec<Answer>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                calls: AtomicUsize::new(0),
                max_items: 50,
            }
        }
    }

    #[async_trait]
    impl Platform for Scripted {
        async fn execute(&self, mutations: &[Mutation]) -> Answer {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let scripted = self.answers.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| {
                Ok(mutations
                    .iter()
                    .enumerate()
                    .map(|(i, _)| ItemOutcome::Created {
                        external_id: format!("{}-{}", n, i),
                    })
                    .collect())
            })
        }

        fn max_items_per_call(&self) -> usize {
            self.max_items
        }

        async fn ping(&self) -> std::result::Result<(), PlatformError> {
            Ok(())
        }
    }

    fn rows(n: usize) -> Vec<PushRow> {
        (0..n)
            .map(|i| PushRow {
                staging_id: Uuid::new_v4(),
                mutation: Mutation::CreateItem {
                    name: format!("item {}", i),
                    columns: BTreeMap::new(),
                },
            })
            .collect()
    }

    fn client(platform: Arc<Scripted>, max_attempts: u32, batch_size: usize) -> SyncClient {
        SyncClient::new(
            platform,
            Arc::new(RateLimiter::new(4, Duration::ZERO)),
            RetryPolicy {
                max_attempts,
                ..Default::default()
            },
            batch_size,
        )
    }

    fn server_error() -> Answer {
        Err(PlatformError::Server {
            status: 503,
            message: "unavailable".into(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_attempt_n_counts_n_minus_one() {
        let platform = Arc::new(Scripted::new(vec![server_error(), server_error()]));
        let client = client(platform.clone(), 5, 25);

        let results = client.push(rows(1), &CancellationToken::new()).await.unwrap();

        assert!(results[0].is_success());
        assert_eq!(results[0].retry_count, 2);
        assert_eq!(platform.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_count_all_failures() {
        let platform = Arc::new(Scripted::new(vec![server_error(), server_error(), server_error()]));
        let client = client(platform.clone(), 3, 25);

        let results = client.push(rows(2), &CancellationToken::new()).await.unwrap();

        for r in &results {
            assert_eq!(r.status, SyncStatus::ExternalFailed);
            assert_eq!(r.error_category, Some(ErrorCategory::TransientExhausted));
            assert_eq!(r.retry_count, 3);
        }
        assert_eq!(platform.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_rejection_is_not_retried() {
        let platform = Arc::new(Scripted::new(vec![Ok(vec![
            ItemOutcome::Created {
                external_id: "a".into(),
            },
            ItemOutcome::Rejected {
                category: ErrorCategory::Validation,
                message: "invalid date".into(),
            },
            ItemOutcome::Retry {
                message: "busy".into(),
            },
        ])]));
        let client = client(platform.clone(), 5, 25);
        let input = rows(3);
        let ids: Vec<Uuid> = input.iter().map(|r| r.staging_id).collect();

        let results = client.push(input, &CancellationToken::new()).await.unwrap();

        let got: Vec<Uuid> = results.iter().map(|r| r.staging_id).collect();
        assert_eq!(got, ids);
        assert!(results[0].is_success());
        assert_eq!(results[1].error_category, Some(ErrorCategory::Validation));
        assert_eq!(results[1].last_error.as_deref(), Some("invalid date"));
        assert!(results[2].is_success());
        assert_eq!(results[2].retry_count, 1);
        assert_eq!(platform.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rows_are_chunked_by_batch_size() {
        let platform = Arc::new(Scripted::new(vec![]));
        let client = client(platform.clone(), 5, 3);

        let results = client.push(rows(7), &CancellationToken::new()).await.unwrap();

        assert_eq!(results.len(), 7);
        assert_eq!(platform.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_connectivity_loss_fails_push() {
        let answers = (0..10)
            .map(|_| Err(PlatformError::Connection("refused".into())))
            .collect();
        let platform = Arc::new(Scripted::new(answers));
        let client = client(platform, 2, 25);

        let err = client
            .push(rows(4), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Connectivity(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_rows_are_reported() {
        let platform = Arc::new(Scripted::new(vec![]));
        let client = client(platform.clone(), 5, 25);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = client.push(rows(2), &cancel).await.unwrap();

        assert!(results
            .iter()
            .all(|r| r.error_category == Some(ErrorCategory::Cancelled)));
        assert_eq!(platform.calls.load(Ordering::SeqCst), 0);
    }
}
