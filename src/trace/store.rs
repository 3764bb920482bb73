//! Bounded FIFO store of recent traces with request-id lookup.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::Trace;

/// Filter for `TraceStore::query`. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TraceQuery {
    pub success: Option<bool>,
    pub model: Option<String>,
    pub min_duration_ms: Option<u64>,
    pub has_retries: Option<bool>,
    pub since_ms: Option<u64>,
}

struct StoreInner {
    /// Trace ids in arrival order; the front is evicted first.
    order: VecDeque<String>,
    by_trace: FxHashMap<String, Arc<Mutex<Trace>>>,
    by_request: FxHashMap<String, String>,
}

/// Keeps the latest N traces. Evicting a trace also removes its request-id
/// index entry.
pub struct TraceStore {
    capacity: usize,
    inner: Mutex<StoreInner>,
}

impl TraceStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(StoreInner {
                order: VecDeque::with_capacity(capacity),
                by_trace: FxHashMap::default(),
                by_request: FxHashMap::default(),
            }),
        }
    }

    pub(super) fn insert(&self, trace_id: String, request_id: &str, trace: Arc<Mutex<Trace>>) {
        let mut inner = self.inner.lock();
        if inner.order.len() == self.capacity {
            if let Some(evicted_id) = inner.order.pop_front() {
                if let Some(evicted) = inner.by_trace.remove(&evicted_id) {
                    let request_id = evicted.lock().request_id.clone();
                    inner.by_request.remove(&request_id);
                }
            }
        }
        inner.order.push_back(trace_id.clone());
        inner.by_request.insert(request_id.to_string(), trace_id.clone());
        inner.by_trace.insert(trace_id, trace);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one trace by id.
    #[must_use]
    pub fn get(&self, trace_id: &str) -> Option<Trace> {
        let inner = self.inner.lock();
        inner.by_trace.get(trace_id).map(|trace| trace.lock().clone())
    }

    /// Snapshot of one trace by the originating request id.
    #[must_use]
    pub fn get_by_request(&self, request_id: &str) -> Option<Trace> {
        let inner = self.inner.lock();
        let trace_id = inner.by_request.get(request_id)?;
        inner.by_trace.get(trace_id).map(|trace| trace.lock().clone())
    }

    /// The most recent traces, newest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<Trace> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|trace_id| inner.by_trace.get(trace_id))
            .map(|trace| trace.lock().clone())
            .collect()
    }

    /// Filtered snapshot, newest first. The view is consistent at the time
    /// of the call; concurrent writers may land just after.
    #[must_use]
    pub fn query(&self, query: &TraceQuery) -> Vec<Trace> {
        let snapshots = self.recent(usize::MAX);
        snapshots
            .into_iter()
            .filter(|trace| {
                if let Some(success) = query.success {
                    if trace.success != Some(success) {
                        return false;
                    }
                }
                if let Some(model) = &query.model {
                    if trace.model.as_deref() != Some(model.as_str()) {
                        return false;
                    }
                }
                if let Some(min_duration) = query.min_duration_ms {
                    if trace.duration_ms().is_none_or(|duration| duration < min_duration) {
                        return false;
                    }
                }
                if let Some(has_retries) = query.has_retries {
                    if (trace.retries > 0) != has_retries {
                        return false;
                    }
                }
                if let Some(since) = query.since_ms {
                    if trace.start_ms < since {
                        return false;
                    }
                }
                true
            })
            .collect()
    }
}
