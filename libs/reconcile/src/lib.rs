//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge desired state to current state. Key concepts:
//!
//! - **Desired state**: What the cluster should look like (from the registry).
//! - **Current state**: What it actually looks like (from agents and supervisors).
//! - **Convergence**: Repeated, idempotent passes that close the gap.
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Decisions are deterministic given the same inputs
//! - A failing item never blocks the rest of a pass; it is retried later

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::warn;

/// Default engine reconciliation interval.
pub const DEFAULT_ENGINE_RECONCILE_INTERVAL: Duration = Duration::from_secs(2);

/// Default agent reconciliation interval.
pub const DEFAULT_AGENT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Default attempts for retryable calls.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default per-call deadline for registry calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy)]
struct BackoffEntry {
    failures: u32,
    retry_at: Instant,
}

/// Per-key exponential backoff for failed items.
///
/// The delay after the n-th consecutive failure is `base * 2^(n-1)`,
/// capped at `cap`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    entries: BTreeMap<String, BackoffEntry>,
}

impl Backoff {
    /// Create a new tracker.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            entries: BTreeMap::new(),
        }
    }

    /// Record a failure for `key` at `now`.
    ///
    /// Returns the delay before the key is ready again.
    pub fn record_failure(&mut self, key: &str, now: Instant) -> Duration {
        let entry = self.entries.entry(key.to_string()).or_insert(BackoffEntry {
            failures: 0,
            retry_at: now,
        });
        entry.failures = entry.failures.saturating_add(1);

        let exponent = entry.failures.saturating_sub(1).min(31);
        let delay = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap);
        entry.retry_at = now + delay;
        delay
    }

    /// True if `key` has no pending backoff at `now`.
    pub fn is_ready(&self, key: &str, now: Instant) -> bool {
        self.entries
            .get(key)
            .is_none_or(|entry| entry.retry_at <= now)
    }

    /// Consecutive failures recorded for `key`.
    pub fn failures(&self, key: &str) -> u32 {
        self.entries.get(key).map_or(0, |entry| entry.failures)
    }

    /// Clear failure tracking for a key (on success).
    pub fn clear(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop entries whose key no longer matters.
    pub fn retain<F: FnMut(&str) -> bool>(&mut self, mut keep: F) {
        self.entries.retain(|key, _| keep(key));
    }

    /// Number of keys currently backing off or carrying failures.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Retry policy for transient failures of idempotent calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles afterwards.
    pub base_delay: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1` (attempts are 1-based), with up to
    /// 10% random jitter added.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        let jitter_ms = (delay.as_millis() / 10) as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// attempts are exhausted. The last error is returned.
    pub async fn retry<T, E, F, Fut>(
        &self,
        operation: &str,
        is_retryable: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && is_retryable(&e) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let now = Instant::now();

        assert_eq!(backoff.record_failure("a.service", now), Duration::from_secs(1));
        assert_eq!(backoff.record_failure("a.service", now), Duration::from_secs(2));
        assert_eq!(backoff.record_failure("a.service", now), Duration::from_secs(4));
        assert_eq!(backoff.record_failure("a.service", now), Duration::from_secs(5));
        assert_eq!(backoff.record_failure("a.service", now), Duration::from_secs(5));
        assert_eq!(backoff.failures("a.service"), 5);
    }

    #[test]
    fn test_backoff_readiness() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let now = Instant::now();

        assert!(backoff.is_ready("a.service", now));
        backoff.record_failure("a.service", now);
        assert!(!backoff.is_ready("a.service", now));
        assert!(backoff.is_ready("a.service", now + Duration::from_secs(1)));
        assert!(backoff.is_ready("b.service", now));

        backoff.clear("a.service");
        assert!(backoff.is_ready("a.service", now));
        assert_eq!(backoff.failures("a.service"), 0);
    }

    #[test]
    fn test_backoff_retain() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let now = Instant::now();
        backoff.record_failure("a.service", now);
        backoff.record_failure("b.service", now);
        backoff.retain(|key| key == "b.service");
        assert_eq!(backoff.len(), 1);
        assert!(backoff.is_ready("a.service", now));
    }

    #[test]
    fn test_retry_delay_bounds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        let first = policy.delay_after(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(110));
        let capped = policy.delay_after(4);
        assert!(capped >= Duration::from_millis(300) && capped <= Duration::from_millis(330));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = RetryPolicy::default()
            .retry(
                "test",
                |_| true,
                || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(format!("failure {n}"))
                    } else {
                        Ok(n)
                    }
                },
            )
            .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = RetryPolicy::default()
            .retry(
                "test",
                |_| true,
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("down".to_string())
                },
            )
            .await;
        assert_eq!(result, Err("down".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), DEFAULT_MAX_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_skips_logical_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = RetryPolicy::default()
            .retry(
                "test",
                |e: &String| e != "not found",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("not found".to_string())
                },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
