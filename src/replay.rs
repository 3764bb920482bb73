//! Deferred retry store: failed requests parked for controlled replay.
//!
//! Entries are deduplicated by trace id, bounded by capacity with
//! oldest-first eviction, and expired by a background timer that never keeps
//! the process alive.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::ReplayConfig;
use crate::error::ProxyError;
use crate::util::unix_now_ms;

const EVICTION_INTERVAL: Duration = Duration::from_secs(30);

/// Header names whose values never enter the queue.
const SENSITIVE_HEADERS: [&str; 6] = [
    "authorization",
    "x-api-key",
    "api-key",
    "cookie",
    "proxy-authorization",
    "x-admin-token",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStatus {
    Pending,
    Replaying,
    Succeeded,
    Failed,
    Expired,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayEntry {
    pub trace_id: String,
    pub request: Value,
    pub headers: Vec<(String, String)>,
    pub original_error: String,
    pub attempts: u32,
    pub status: ReplayStatus,
    pub created_at_ms: u64,
}

/// A claimed replay: the caller re-sends the payload and reports back.
#[derive(Debug, Clone)]
pub struct ReplayJob {
    pub trace_id: String,
    pub request: Value,
    pub headers: Vec<(String, String)>,
    pub attempt: u32,
}

/// Time window filter for `replay_all`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayFilter {
    pub after_timestamp_ms: Option<u64>,
    pub before_timestamp_ms: Option<u64>,
}

struct ReplayInner {
    entries: FxHashMap<String, ReplayEntry>,
    order: VecDeque<String>,
}

pub struct ReplayQueue {
    capacity: usize,
    max_retries: u32,
    retention_ms: u64,
    inner: Mutex<ReplayInner>,
    stopped: Arc<AtomicBool>,
    eviction_task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplayQueue {
    #[must_use]
    pub fn new(config: &ReplayConfig) -> Self {
        Self {
            capacity: config.capacity.clamp(1, 10_000),
            max_retries: config.max_retries.min(100),
            retention_ms: (config.retention_secs * 1_000)
                .clamp(1_000, 7 * 24 * 3_600 * 1_000),
            inner: Mutex::new(ReplayInner {
                entries: FxHashMap::default(),
                order: VecDeque::new(),
            }),
            stopped: Arc::new(AtomicBool::new(false)),
            eviction_task: Mutex::new(None),
        }
    }

    /// Park a failed request for later replay. Re-enqueueing a known trace id
    /// refreshes its error but keeps its place in the eviction order.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Validation`] when the trace id is empty or the
    /// request payload is not a JSON object.
    pub fn enqueue(
        &self,
        trace_id: &str,
        request: Value,
        headers: &[(String, String)],
        original_error: &str,
    ) -> Result<(), ProxyError> {
        if trace_id.trim().is_empty() {
            return Err(ProxyError::Validation(
                "replay entry requires a trace id".to_string(),
            ));
        }
        if !request.is_object() {
            return Err(ProxyError::Validation(
                "replay entry request must be an object".to_string(),
            ));
        }

        let sanitized = sanitize_headers(headers);
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.entries.get_mut(trace_id) {
            existing.original_error = original_error.to_string();
            existing.status = ReplayStatus::Pending;
            return Ok(());
        }

        while inner.order.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }

        inner.order.push_back(trace_id.to_string());
        inner.entries.insert(
            trace_id.to_string(),
            ReplayEntry {
                trace_id: trace_id.to_string(),
                request,
                headers: sanitized,
                original_error: original_error.to_string(),
                attempts: 0,
                status: ReplayStatus::Pending,
                created_at_ms: unix_now_ms(),
            },
        );
        Ok(())
    }

    /// Claim one entry for replay.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Validation`] for unknown trace ids, entries
    /// already replaying, and entries out of retry budget.
    pub fn replay(&self, trace_id: &str) -> Result<ReplayJob, ProxyError> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(trace_id) else {
            return Err(ProxyError::Validation(format!(
                "no replay entry for trace '{trace_id}'"
            )));
        };
        if entry.status == ReplayStatus::Replaying {
            return Err(ProxyError::Validation(format!(
                "trace '{trace_id}' is already replaying"
            )));
        }
        if matches!(entry.status, ReplayStatus::Succeeded | ReplayStatus::Expired) {
            return Err(ProxyError::Validation(format!(
                "trace '{trace_id}' is {:?} and cannot be replayed",
                entry.status
            )));
        }
        if entry.attempts >= self.max_retries {
            entry.status = ReplayStatus::Failed;
            return Err(ProxyError::Validation(format!(
                "trace '{trace_id}' exhausted its {} replay attempts",
                self.max_retries
            )));
        }

        entry.attempts += 1;
        entry.status = ReplayStatus::Replaying;
        Ok(ReplayJob {
            trace_id: entry.trace_id.clone(),
            request: entry.request.clone(),
            headers: entry.headers.clone(),
            attempt: entry.attempts,
        })
    }

    /// Report the outcome of a claimed replay.
    pub fn complete(&self, trace_id: &str, success: bool) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(trace_id) else {
            return;
        };
        if entry.status != ReplayStatus::Replaying {
            return;
        }
        entry.status = if success {
            ReplayStatus::Succeeded
        } else if entry.attempts >= self.max_retries {
            ReplayStatus::Failed
        } else {
            ReplayStatus::Pending
        };
    }

    /// Claim every pending entry inside the filter window, oldest first.
    #[must_use]
    pub fn replay_all(&self, filter: &ReplayFilter) -> Vec<ReplayJob> {
        let candidates: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .order
                .iter()
                .filter(|trace_id| {
                    inner.entries.get(*trace_id).is_some_and(|entry| {
                        entry.status == ReplayStatus::Pending
                            && filter
                                .after_timestamp_ms
                                .is_none_or(|after| entry.created_at_ms > after)
                            && filter
                                .before_timestamp_ms
                                .is_none_or(|before| entry.created_at_ms < before)
                    })
                })
                .cloned()
                .collect()
        };

        candidates
            .iter()
            .filter_map(|trace_id| self.replay(trace_id).ok())
            .collect()
    }

    #[must_use]
    pub fn get(&self, trace_id: &str) -> Option<ReplayEntry> {
        self.inner.lock().entries.get(trace_id).cloned()
    }

    #[must_use]
    pub fn list(&self) -> Vec<ReplayEntry> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|trace_id| inner.entries.get(trace_id))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark entries past retention as expired and drop them. Returns the
    /// number evicted.
    pub fn evict_expired(&self) -> usize {
        let cutoff = unix_now_ms().saturating_sub(self.retention_ms);
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let before = inner.order.len();
        let entries = &mut inner.entries;
        entries.retain(|_, entry| {
            if entry.created_at_ms < cutoff {
                entry.status = ReplayStatus::Expired;
                false
            } else {
                true
            }
        });
        inner.order.retain(|trace_id| entries.contains_key(trace_id));
        before - inner.order.len()
    }

    /// Start the background eviction timer. Idempotent.
    pub fn start_eviction_timer(self: &Arc<Self>) {
        let mut task = self.eviction_task.lock();
        if task.is_some() {
            return;
        }
        self.stopped.store(false, Ordering::Release);

        let queue = Arc::clone(self);
        let stopped = Arc::clone(&self.stopped);
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(EVICTION_INTERVAL).await;
                if stopped.load(Ordering::Acquire) {
                    return;
                }
                let evicted = queue.evict_expired();
                if evicted > 0 {
                    tracing::debug!(evicted, "replay queue eviction pass");
                }
            }
        }));
    }

    /// Stop the eviction timer. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(task) = self.eviction_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for ReplayQueue {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(task) = self.eviction_task.lock().take() {
            task.abort();
        }
    }
}

fn sanitize_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let lower = name.to_ascii_lowercase();
            !SENSITIVE_HEADERS.contains(&lower.as_str())
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue(capacity: usize, max_retries: u32) -> ReplayQueue {
        ReplayQueue::new(&ReplayConfig {
            capacity,
            max_retries,
            retention_secs: 3_600,
        })
    }

    #[test]
    fn test_enqueue_validates_inputs() {
        let queue = queue(4, 3);
        assert!(queue
            .enqueue("", json!({}), &[], "boom")
            .is_err());
        assert!(queue
            .enqueue("tr-1", json!("not an object"), &[], "boom")
            .is_err());
        assert!(queue
            .enqueue("tr-1", json!({ "model": "m" }), &[], "boom")
            .is_ok());
    }

    #[test]
    fn test_capacity_evicts_oldest_first() {
        let queue = queue(2, 3);
        queue.enqueue("tr-1", json!({}), &[], "e1").unwrap();
        queue.enqueue("tr-2", json!({}), &[], "e2").unwrap();
        queue.enqueue("tr-3", json!({}), &[], "e3").unwrap();
        assert_eq!(queue.len(), 2);
        assert!(queue.get("tr-1").is_none());
        assert!(queue.get("tr-3").is_some());
    }

    #[test]
    fn test_replay_refuses_reentry() {
        let queue = queue(4, 3);
        queue.enqueue("tr-1", json!({}), &[], "e").unwrap();
        let job = queue.replay("tr-1").unwrap();
        assert_eq!(job.attempt, 1);
        assert!(queue.replay("tr-1").is_err());
        queue.complete("tr-1", false);
        assert!(queue.replay("tr-1").is_ok());
    }

    #[test]
    fn test_retry_budget_exhaustion_marks_failed() {
        let queue = queue(4, 2);
        queue.enqueue("tr-1", json!({}), &[], "e").unwrap();
        for _ in 0..2 {
            queue.replay("tr-1").unwrap();
            queue.complete("tr-1", false);
        }
        assert_eq!(queue.get("tr-1").unwrap().status, ReplayStatus::Failed);
        assert!(queue.replay("tr-1").is_err());
    }

    #[test]
    fn test_success_is_terminal() {
        let queue = queue(4, 3);
        queue.enqueue("tr-1", json!({}), &[], "e").unwrap();
        queue.replay("tr-1").unwrap();
        queue.complete("tr-1", true);
        assert_eq!(queue.get("tr-1").unwrap().status, ReplayStatus::Succeeded);
        assert!(queue.replay("tr-1").is_err());
    }

    #[test]
    fn test_replay_all_honors_window() {
        let queue = queue(8, 3);
        queue.enqueue("tr-1", json!({}), &[], "e").unwrap();
        queue.enqueue("tr-2", json!({}), &[], "e").unwrap();

        let none = queue.replay_all(&ReplayFilter {
            before_timestamp_ms: Some(1),
            ..ReplayFilter::default()
        });
        assert!(none.is_empty());

        let all = queue.replay_all(&ReplayFilter::default());
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_sensitive_headers_stripped() {
        let queue = queue(4, 3);
        let headers = vec![
            ("authorization".to_string(), "Bearer secret".to_string()),
            ("X-Api-Key".to_string(), "sk-123".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ];
        queue.enqueue("tr-1", json!({}), &headers, "e").unwrap();
        let entry = queue.get("tr-1").unwrap();
        assert_eq!(entry.headers.len(), 1);
        assert_eq!(entry.headers[0].0, "content-type");
    }

    #[test]
    fn test_capacity_clamped_to_bounds() {
        let queue = ReplayQueue::new(&ReplayConfig {
            capacity: 0,
            max_retries: 200,
            retention_secs: 0,
        });
        queue.enqueue("tr-1", json!({}), &[], "e").unwrap();
        queue.enqueue("tr-2", json!({}), &[], "e").unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_eviction_timer_lifecycle() {
        let queue = Arc::new(ReplayQueue::new(&ReplayConfig {
            capacity: 8,
            max_retries: 3,
            retention_secs: 1,
        }));
        queue.start_eviction_timer();
        queue.start_eviction_timer();
        queue.stop();
        queue.stop();
    }

    #[test]
    fn test_manual_eviction_of_expired() {
        let queue = ReplayQueue::new(&ReplayConfig {
            capacity: 8,
            max_retries: 3,
            retention_secs: 1,
        });
        queue.enqueue("tr-1", json!({}), &[], "e").unwrap();
        // Not yet past retention.
        assert_eq!(queue.evict_expired(), 0);
        std::thread::sleep(std::time::Duration::from_millis(1_100));
        assert_eq!(queue.evict_expired(), 1);
        assert!(queue.is_empty());
    }
}
