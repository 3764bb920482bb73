//! Per-request tracing: a span tree across attempts, recorded into a
//! bounded in-memory store.
//!
//! Spans within an attempt are append-only and sequential; appending a new
//! span closes the previous open one, and ending an attempt closes whatever
//! is still open with the attempt's end time.

mod store;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::util::{next_trace_id, unix_now_ms};

pub use store::{TraceQuery, TraceStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Queued,
    KeyAcquired,
    UpstreamStart,
    FirstByte,
    Streaming,
    Complete,
    Error,
    Retry,
    Timeout,
    Cancelled,
    AdmissionHold,
}

#[derive(Debug, Clone, Serialize)]
pub struct Span {
    pub kind: SpanKind,
    pub start_ms: u64,
    pub end_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Attempt {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub spans: Vec<Span>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<AttemptOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub start_ms: u64,
    pub end_ms: Option<u64>,
}

/// The full lifecycle of one client request across retries.
#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    pub trace_id: String,
    pub request_id: String,
    pub start_ms: u64,
    pub end_ms: Option<u64>,
    pub attempts: Vec<Attempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub retries: u32,
    /// Captured request payload, present only when the matched policy asked
    /// for body capture. Never included in serialized trace listings.
    #[serde(skip)]
    pub payload: Option<bytes::Bytes>,
}

impl Trace {
    #[must_use]
    pub fn duration_ms(&self) -> Option<u64> {
        self.end_ms.map(|end| end.saturating_sub(self.start_ms))
    }
}

/// Live handle to one trace. A handle created unsampled performs no work.
#[derive(Clone)]
pub struct TraceHandle {
    inner: Option<Arc<Mutex<Trace>>>,
    trace_id: Arc<str>,
}

impl TraceHandle {
    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    #[must_use]
    pub fn is_sampled(&self) -> bool {
        self.inner.is_some()
    }

    /// Begin a new attempt. Any attempt still open is closed as failed first;
    /// a trace has at most one in-flight attempt at a time.
    pub fn begin_attempt(&self, model: &str) {
        let Some(inner) = &self.inner else { return };
        let now = unix_now_ms();
        let mut trace = inner.lock();
        close_open_attempt(&mut trace, AttemptOutcome::Failure, None, now);
        let index = trace.attempts.len();
        trace.attempts.push(Attempt {
            index,
            model: Some(model.to_string()),
            start_ms: now,
            ..Attempt::default()
        });
    }

    pub fn set_key(&self, key_id: &str) {
        let Some(inner) = &self.inner else { return };
        let mut trace = inner.lock();
        if let Some(attempt) = trace.attempts.last_mut() {
            attempt.key_id = Some(key_id.to_string());
        }
    }

    /// Append a span to the current attempt, closing the previous open span.
    pub fn add_span(&self, kind: SpanKind, detail: Option<String>) {
        let Some(inner) = &self.inner else { return };
        let now = unix_now_ms();
        let mut trace = inner.lock();
        let Some(attempt) = trace.attempts.last_mut() else {
            return;
        };
        if let Some(open) = attempt.spans.last_mut() {
            if open.end_ms.is_none() {
                open.end_ms = Some(now);
            }
        }
        attempt.spans.push(Span {
            kind,
            start_ms: now,
            end_ms: None,
            detail,
        });
    }

    /// Record a retry decision and close the current attempt as failed.
    pub fn mark_retry(&self, reason: &str) {
        self.add_span(SpanKind::Retry, Some(reason.to_string()));
        let Some(inner) = &self.inner else { return };
        let now = unix_now_ms();
        let mut trace = inner.lock();
        trace.retries += 1;
        close_open_attempt(&mut trace, AttemptOutcome::Failure, None, now);
    }

    /// Close the current attempt with an outcome.
    pub fn end_attempt(&self, outcome: AttemptOutcome, error_kind: Option<&str>) {
        let Some(inner) = &self.inner else { return };
        let now = unix_now_ms();
        let mut trace = inner.lock();
        close_open_attempt(
            &mut trace,
            outcome,
            error_kind.map(str::to_string),
            now,
        );
    }

    /// Finish the trace. Closes any open attempt with the same outcome.
    pub fn complete(&self, success: bool, final_model: Option<&str>) {
        let Some(inner) = &self.inner else { return };
        let now = unix_now_ms();
        let mut trace = inner.lock();
        let outcome = if success {
            AttemptOutcome::Success
        } else {
            AttemptOutcome::Failure
        };
        close_open_attempt(&mut trace, outcome, None, now);
        trace.end_ms = Some(now);
        trace.success = Some(success);
        if let Some(model) = final_model {
            trace.model = Some(model.to_string());
        }
    }

    /// Store the request payload, truncated to the policy's body-size cap.
    pub fn capture_payload(&self, payload: &bytes::Bytes, max_size: usize) {
        let Some(inner) = &self.inner else { return };
        let capped = if payload.len() > max_size {
            payload.slice(..max_size)
        } else {
            payload.clone()
        };
        inner.lock().payload = Some(capped);
    }
}

fn close_open_attempt(
    trace: &mut Trace,
    outcome: AttemptOutcome,
    error_kind: Option<String>,
    now: u64,
) {
    let Some(attempt) = trace.attempts.last_mut() else {
        return;
    };
    if attempt.end_ms.is_some() {
        return;
    }
    attempt.end_ms = Some(now);
    attempt.outcome = Some(outcome);
    attempt.error_kind = error_kind;
    for span in &mut attempt.spans {
        if span.end_ms.is_none() {
            span.end_ms = Some(now);
        }
    }
}

/// Creates traces and registers them in the store.
pub struct Tracer {
    store: Arc<TraceStore>,
}

impl Tracer {
    #[must_use]
    pub fn new(store: Arc<TraceStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<TraceStore> {
        &self.store
    }

    /// Start a trace for a request. An unsampled trace returns a no-op
    /// handle that still carries a usable trace id.
    #[must_use]
    pub fn start(&self, request_id: &str, sampled: bool) -> TraceHandle {
        let trace_id = next_trace_id();
        if !sampled {
            return TraceHandle {
                inner: None,
                trace_id: Arc::from(trace_id.as_str()),
            };
        }

        let trace = Arc::new(Mutex::new(Trace {
            trace_id: trace_id.clone(),
            request_id: request_id.to_string(),
            start_ms: unix_now_ms(),
            end_ms: None,
            attempts: Vec::new(),
            success: None,
            model: None,
            retries: 0,
            payload: None,
        }));
        self.store.insert(trace_id.clone(), request_id, Arc::clone(&trace));
        TraceHandle {
            inner: Some(trace),
            trace_id: Arc::from(trace_id.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracer() -> Tracer {
        Tracer::new(Arc::new(TraceStore::new(16)))
    }

    #[test]
    fn test_spans_are_monotonic_and_closed_on_attempt_end() {
        let tracer = tracer();
        let handle = tracer.start("req-1", true);
        handle.begin_attempt("glm-4-air");
        handle.add_span(SpanKind::Queued, None);
        handle.add_span(SpanKind::KeyAcquired, None);
        handle.add_span(SpanKind::Streaming, None);
        handle.end_attempt(AttemptOutcome::Success, None);
        handle.complete(true, Some("glm-4-air"));

        let trace = tracer.store().get(handle.trace_id()).unwrap();
        let attempt = &trace.attempts[0];
        assert_eq!(attempt.spans.len(), 3);
        for window in attempt.spans.windows(2) {
            assert!(window[0].start_ms <= window[1].start_ms);
        }
        for span in &attempt.spans {
            assert!(span.end_ms.is_some(), "span {:?} left open", span.kind);
        }
        assert_eq!(attempt.outcome, Some(AttemptOutcome::Success));
        assert_eq!(trace.success, Some(true));
    }

    #[test]
    fn test_retry_closes_attempt_and_counts() {
        let tracer = tracer();
        let handle = tracer.start("req-2", true);
        handle.begin_attempt("m1");
        handle.add_span(SpanKind::UpstreamStart, None);
        handle.mark_retry("upstream 503");
        handle.begin_attempt("m2");
        handle.add_span(SpanKind::Complete, None);
        handle.complete(true, Some("m2"));

        let trace = tracer.store().get(handle.trace_id()).unwrap();
        assert_eq!(trace.attempts.len(), 2);
        assert_eq!(trace.retries, 1);
        assert_eq!(trace.attempts[0].outcome, Some(AttemptOutcome::Failure));
        let retry_span = trace.attempts[0]
            .spans
            .iter()
            .find(|span| span.kind == SpanKind::Retry)
            .unwrap();
        assert_eq!(retry_span.detail.as_deref(), Some("upstream 503"));
    }

    #[test]
    fn test_unsampled_handle_is_noop() {
        let tracer = tracer();
        let handle = tracer.start("req-3", false);
        assert!(!handle.is_sampled());
        handle.begin_attempt("m");
        handle.add_span(SpanKind::Queued, None);
        handle.complete(true, None);
        assert!(tracer.store().get(handle.trace_id()).is_none());
        assert_eq!(tracer.store().recent(10).len(), 0);
    }

    #[test]
    fn test_payload_capture_respects_cap() {
        let tracer = tracer();
        let handle = tracer.start("req-4", true);
        let payload = bytes::Bytes::from(vec![b'x'; 100]);
        handle.capture_payload(&payload, 10);
        let trace = tracer.store().get(handle.trace_id()).unwrap();
        assert_eq!(trace.payload.as_ref().unwrap().len(), 10);
    }
}
