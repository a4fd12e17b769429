//! Polling helpers for state that converges asynchronously.
//!
//! Policy changes take effect once Felix has programmed the dataplane, and
//! counters only move once the metrics endpoint has been refreshed. Tests
//! that depend on either poll through [`assert_eventually`] with a category
//! naming the kind of convergence they wait for.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};

/// Categories of eventual consistency with their upper bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyCategory {
    /// Felix programming a policy change into the dataplane (30s)
    PolicyProgramming,

    /// Felix Prometheus counters reflecting dropped packets (30s)
    MetricsScrape,

    /// calico-node flushing a log line (20s)
    LogAggregation,

    /// Kubernetes resource updates (2x 30s expected = 60s)
    K8sResourceUpdate,
}

impl ConsistencyCategory {
    pub fn timeout(&self) -> Duration {
        match self {
            ConsistencyCategory::PolicyProgramming => Duration::from_secs(30),
            ConsistencyCategory::MetricsScrape => Duration::from_secs(30),
            ConsistencyCategory::LogAggregation => Duration::from_secs(20),
            ConsistencyCategory::K8sResourceUpdate => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for ConsistencyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

const INITIAL_DELAY: Duration = Duration::from_millis(500);

/// Returned when a condition never became true.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Condition '{what}' not met within {timeout:?} after {attempts} checks")]
pub struct NotConverged {
    pub what: String,
    pub timeout: Duration,
    pub attempts: u32,
}

/// Wait until `condition` returns true, within the category's timeout.
///
/// Uses exponential backoff starting at 500ms, doubling each time and capped
/// at the remaining time.
///
/// # Example
///
/// ```rust,ignore
/// use netpol_tests::eventual::{assert_eventually, ConsistencyCategory};
///
/// assert_eventually(ConsistencyCategory::MetricsScrape, || async {
///     scraper.sum_counter("calico_denied_packets", &[]).await.unwrap_or(0.0) > baseline
/// })
/// .await
/// .expect("denied packet counter should rise");
/// ```
pub async fn assert_eventually<F, Fut>(
    category: ConsistencyCategory,
    condition: F,
) -> Result<(), NotConverged>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    assert_eventually_within(&category.to_string(), category.timeout(), condition).await
}

/// Like [`assert_eventually`] with an explicit timeout.
pub async fn assert_eventually_within<F, Fut>(
    what: &str,
    timeout: Duration,
    mut condition: F,
) -> Result<(), NotConverged>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    let mut delay = INITIAL_DELAY.min(timeout);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if condition().await {
            return Ok(());
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(NotConverged {
                what: what.to_string(),
                timeout,
                attempts,
            });
        }

        let remaining = timeout.saturating_sub(elapsed);
        sleep(delay.min(remaining)).await;
        delay *= 2;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_consistency_category_timeouts() {
        assert_eq!(
            ConsistencyCategory::PolicyProgramming.timeout(),
            Duration::from_secs(30)
        );
        assert_eq!(
            ConsistencyCategory::MetricsScrape.timeout(),
            Duration::from_secs(30)
        );
        assert_eq!(
            ConsistencyCategory::LogAggregation.timeout(),
            Duration::from_secs(20)
        );
        assert_eq!(
            ConsistencyCategory::K8sResourceUpdate.timeout(),
            Duration::from_secs(60)
        );
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let result = assert_eventually(ConsistencyCategory::PolicyProgramming, || async { true }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_succeeds_after_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result = assert_eventually_within("second check", Duration::from_secs(5), move || {
            let counter = counter.clone();
            async move { counter.fetch_add(1, Ordering::SeqCst) + 1 >= 2 }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fails_on_timeout() {
        let err = assert_eventually_within("never", Duration::from_millis(50), || async { false })
            .await
            .expect_err("should time out");

        assert_eq!(err.what, "never");
        assert!(err.attempts >= 2);
        assert!(err.to_string().contains("not met within"));
    }
}
