//! Global request limiter for the external platform.
//!
//! Two independent caps apply to every call:
//! - a token bucket that spaces request starts by a minimum interval
//! - a semaphore bounding the number of requests in flight

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Result, SyncError};

type Pacer = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Shared limiter; clone the `Arc` into every task that calls the platform.
pub struct RateLimiter {
    in_flight: Arc<Semaphore>,
    max_in_flight: usize,
    pacer: Option<Pacer>,
    min_interval: Duration,
}

impl RateLimiter {
    /// `min_interval` of zero disables spacing.
    pub fn new(max_in_flight: usize, min_interval: Duration) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            pacer: Quota::with_period(min_interval).map(Pacer::direct),
            min_interval,
        }
    }

    /// Wait for a free slot and the next spacing token.
    ///
    /// The permit releases the in-flight slot when dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        let permit = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Cancelled)?;
        if let Some(pacer) = &self.pacer {
            pacer.until_ready().await;
        }
        Ok(permit)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Requests that could start right now without waiting for a slot.
    pub fn available(&self) -> usize {
        self.in_flight.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[tokio::test]
    async fn test_in_flight_cap() {
        let limiter = Arc::new(RateLimiter::new(2, Duration::ZERO));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            let current = current.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test]
    async fn test_spacing_between_requests() {
        let limiter = RateLimiter::new(4, Duration::from_millis(20));
        let start = Instant::now();
        for _ in 0..4 {
            drop(limiter.acquire().await.unwrap());
        }
        // First token is immediate, the remaining three are spaced.
        assert!(start.elapsed() >= Duration::from_millis(55));
    }

    #[test]
    fn test_zero_interval_disables_spacing() {
        let limiter = RateLimiter::new(0, Duration::ZERO);
        assert!(limiter.pacer.is_none());
        assert_eq!(limiter.max_in_flight(), 1);
    }
}
