//! Bounded concurrency for remote calls.
//!
//! [`ConcurrencyLimiter`] hands out a fixed number of permits. Every unit of
//! work waits for a permit, runs, and releases the permit when it finishes,
//! whether it succeeded or failed. Waiters acquire permits in arrival order.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::trace;

/// Default number of simultaneous remote calls.
pub const DEFAULT_PERMITS: usize = 10;

/// Counting limiter bounding the number of in-flight remote calls.
///
/// Cloning shares the same permits.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    permits: usize,
}

impl ConcurrencyLimiter {
    /// Create a limiter with `permits` slots (at least one).
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            permits,
        }
    }

    /// Run one unit of work once a permit is available.
    ///
    /// The permit is dropped when the future completes, so an error result
    /// never leaks a slot.
    pub async fn run<F, T>(&self, work: F) -> T
    where
        F: Future<Output = T>,
    {
        // The semaphore is owned here and never closed, so acquire cannot fail.
        let _permit = self.semaphore.acquire().await.ok();
        trace!(in_flight = self.in_flight(), permits = self.permits, "permit acquired");
        work.await
    }

    /// Run every unit under the limiter and wait for all of them to settle.
    ///
    /// Results come back in input order. A failing unit does not cancel its
    /// siblings; each result is returned independently.
    pub async fn run_all<I, F, T>(&self, units: I) -> Vec<T>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = T>,
    {
        join_all(units.into_iter().map(|unit| self.run(unit))).await
    }

    /// Total number of permits.
    pub fn permits(&self) -> usize {
        self.permits
    }

    /// Number of units currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.permits - self.semaphore.available_permits()
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_PERMITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_default_has_ten_permits() {
        let limiter = ConcurrencyLimiter::default();
        assert_eq!(limiter.permits(), 10);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_zero_permits_is_clamped() {
        let limiter = ConcurrencyLimiter::new(0);
        assert_eq!(limiter.permits(), 1);
        assert_eq!(limiter.run(async { 5 }).await, 5);
    }

    #[tokio::test]
    async fn test_at_most_n_units_run_concurrently() {
        let limiter = ConcurrencyLimiter::new(3);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let units = (0..20).map(|_| {
            let current = current.clone();
            let peak = peak.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }
        });
        limiter.run_all(units).await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_failures_release_permits_and_are_isolated() {
        let limiter = ConcurrencyLimiter::new(2);
        let units = (0..6).map(|i| async move {
            if i % 2 == 0 {
                Err(format!("unit {i} failed"))
            } else {
                Ok(i)
            }
        });
        let results: Vec<Result<i32, String>> = limiter.run_all(units).await;

        assert_eq!(results.len(), 6);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
        assert_eq!(results[1], Ok(1));
        assert_eq!(limiter.in_flight(), 0);
    }
}
