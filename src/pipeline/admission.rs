//! Admission control: per-policy token buckets with a bounded wait.
//!
//! This (together with the key-acquisition hold in the pipeline) is the only
//! queueing layer. Waiters hold no buffers; when the queue-time budget runs
//! out they fail with an admission timeout rather than growing memory.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::ProxyError;
use crate::policy::{EffectivePolicy, PacingPolicy};
use crate::util::unix_now_ms;

const WAIT_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    burst: f64,
    rate_per_ms: f64,
    last_refill_ms: u64,
}

impl TokenBucket {
    fn new(pacing: &PacingPolicy, now_ms: u64) -> Self {
        let burst = f64::from(pacing.burst.max(1));
        Self {
            tokens: burst,
            burst,
            rate_per_ms: pacing.requests_per_second / 1_000.0,
            last_refill_ms: now_ms,
        }
    }

    fn try_take(&mut self, now_ms: u64) -> bool {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        self.last_refill_ms = now_ms;
        self.tokens = (self.tokens + elapsed as f64 * self.rate_per_ms).min(self.burst);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// One bucket per policy source; policies without pacing admit immediately.
pub struct AdmissionControl {
    buckets: Mutex<FxHashMap<String, TokenBucket>>,
}

impl AdmissionControl {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(FxHashMap::default()),
        }
    }

    /// Try to take one token without waiting.
    #[must_use]
    pub fn try_admit(&self, policy: &EffectivePolicy) -> bool {
        let Some(pacing) = &policy.pacing else {
            return true;
        };
        let now_ms = unix_now_ms();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(policy.source.clone())
            .or_insert_with(|| TokenBucket::new(pacing, now_ms));
        // Pacing changes take effect on the next bucket rebuild.
        bucket.rate_per_ms = pacing.requests_per_second / 1_000.0;
        bucket.burst = f64::from(pacing.burst.max(1));
        bucket.try_take(now_ms)
    }

    /// Wait for admission up to the policy's queue-time budget.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::AdmissionTimeout`] when the budget elapses
    /// before a token frees up.
    pub async fn admit(&self, policy: &EffectivePolicy) -> Result<(), ProxyError> {
        if self.try_admit(policy) {
            return Ok(());
        }

        let budget = Duration::from_millis(policy.max_queue_time_ms);
        let started = Instant::now();
        loop {
            if started.elapsed() >= budget {
                return Err(ProxyError::AdmissionTimeout(format!(
                    "pacing budget for policy '{}' not available within {}ms",
                    policy.source, policy.max_queue_time_ms
                )));
            }
            tokio::time::sleep(WAIT_SLICE.min(budget.saturating_sub(started.elapsed()))).await;
            if self.try_admit(policy) {
                return Ok(());
            }
        }
    }
}

impl Default for AdmissionControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paced_policy(rate: f64, burst: u32, max_queue_time_ms: u64) -> EffectivePolicy {
        EffectivePolicy {
            source: "paced".to_string(),
            pacing: Some(PacingPolicy {
                requests_per_second: rate,
                burst,
            }),
            max_queue_time_ms,
            ..EffectivePolicy::default()
        }
    }

    #[test]
    fn test_unpaced_policy_admits_immediately() {
        let admission = AdmissionControl::new();
        let policy = EffectivePolicy::default();
        for _ in 0..100 {
            assert!(admission.try_admit(&policy));
        }
    }

    #[test]
    fn test_burst_then_empty() {
        let admission = AdmissionControl::new();
        let policy = paced_policy(1.0, 3, 100);
        assert!(admission.try_admit(&policy));
        assert!(admission.try_admit(&policy));
        assert!(admission.try_admit(&policy));
        assert!(!admission.try_admit(&policy));
    }

    #[tokio::test]
    async fn test_waits_for_refill() {
        let admission = AdmissionControl::new();
        // 100 rps: a token refills every 10ms, well inside the 500ms budget.
        let policy = paced_policy(100.0, 1, 500);
        assert!(admission.try_admit(&policy));
        let started = Instant::now();
        admission.admit(&policy).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_admission_timeout() {
        let admission = AdmissionControl::new();
        // One token per 100 seconds: the 50ms budget must expire.
        let policy = paced_policy(0.01, 1, 50);
        assert!(admission.try_admit(&policy));
        let err = admission.admit(&policy).await.unwrap_err();
        assert!(matches!(err, ProxyError::AdmissionTimeout(_)));
    }

    #[test]
    fn test_buckets_are_per_policy() {
        let admission = AdmissionControl::new();
        let a = paced_policy(1.0, 1, 100);
        let mut b = paced_policy(1.0, 1, 100);
        b.source = "other".to_string();
        assert!(admission.try_admit(&a));
        assert!(admission.try_admit(&b));
        assert!(!admission.try_admit(&a));
    }
}
