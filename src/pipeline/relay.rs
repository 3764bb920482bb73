//! Response relay: forwards upstream bytes to the client while tracking
//! first-byte latency, token usage and the attempt outcome.
//!
//! The finalizer owns the key permit and the trace for the duration of the
//! body. Dropping the stream before the body ends is the cancellation path:
//! the slot is released and no retry happens.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures_util::Stream;
use pin_project_lite::pin_project;
use serde_json::Value;

use crate::error::{ProxyError, TransportKind};
use crate::keys::KeyPermit;
use crate::metrics::MetricsRegistry;
use crate::observability::{self, TokenUsage};
use crate::router::ModelSpec;
use crate::stats::{RequestEvent, StatsAggregator};
use crate::trace::{SpanKind, TraceHandle};
use crate::webhook::WebhookEmitter;

const LINE_TAIL_CAP: usize = 8 * 1024;

/// Incremental scan of a streamed body for provider-reported token counts.
///
/// Anthropic-style streams carry usage in `message_start` and
/// `message_delta` SSE events; the scanner keeps the last value seen per
/// field and falls back to byte-count estimation when none arrive.
#[derive(Debug, Default)]
pub struct UsageScanner {
    line_tail: Vec<u8>,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    body_bytes: u64,
}

impl UsageScanner {
    pub fn on_chunk(&mut self, chunk: &[u8]) {
        self.body_bytes += chunk.len() as u64;

        let mut buffer = std::mem::take(&mut self.line_tail);
        buffer.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = buffer[start..].iter().position(|&byte| byte == b'\n') {
            let line = &buffer[start..start + offset];
            self.scan_line(line);
            start += offset + 1;
        }

        let tail = &buffer[start..];
        // An oversized partial line cannot be a usage frame worth keeping.
        self.line_tail = if tail.len() > LINE_TAIL_CAP {
            Vec::new()
        } else {
            tail.to_vec()
        };
    }

    fn scan_line(&mut self, line: &[u8]) {
        let Ok(text) = std::str::from_utf8(line) else {
            return;
        };
        let trimmed = text.trim();
        let Some(payload) = trimmed.strip_prefix("data:").map(str::trim) else {
            return;
        };
        if payload.is_empty() || payload == "[DONE]" {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            return;
        };
        let (input, output) = extract_usage(&value);
        if input.is_some() {
            self.input_tokens = input;
        }
        if output.is_some() {
            self.output_tokens = output;
        }
    }

    #[must_use]
    pub fn usage(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: None,
        }
    }

    #[must_use]
    pub fn body_bytes(&self) -> u64 {
        self.body_bytes
    }
}

/// Pull `usage.input_tokens` / `usage.output_tokens` out of a provider
/// frame, wherever the `usage` object sits.
#[must_use]
pub fn extract_usage(value: &Value) -> (Option<u64>, Option<u64>) {
    fn find_usage<'a>(value: &'a Value) -> Option<&'a Value> {
        match value {
            Value::Object(map) => {
                if let Some(usage) = map.get("usage") {
                    return Some(usage);
                }
                map.values().find_map(find_usage)
            }
            _ => None,
        }
    }

    let Some(usage) = find_usage(value) else {
        return (None, None);
    };
    (
        usage.get("input_tokens").and_then(Value::as_u64),
        usage.get("output_tokens").and_then(Value::as_u64),
    )
}

/// Everything needed to settle one attempt exactly once.
pub struct RelayFinalizer {
    trace: TraceHandle,
    permit: Option<KeyPermit>,
    stats: Arc<StatsAggregator>,
    metrics: Arc<MetricsRegistry>,
    webhook: Arc<WebhookEmitter>,
    spec: Option<Arc<ModelSpec>>,
    request_id: String,
    model: String,
    key_id: String,
    tier: String,
    source: String,
    estimated_input: u64,
    started: Instant,
    settled: bool,
}

impl RelayFinalizer {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        trace: TraceHandle,
        permit: KeyPermit,
        stats: Arc<StatsAggregator>,
        metrics: Arc<MetricsRegistry>,
        webhook: Arc<WebhookEmitter>,
        spec: Option<Arc<ModelSpec>>,
        request_id: String,
        tier: String,
        source: String,
        estimated_input: u64,
        started: Instant,
    ) -> Self {
        let model = spec.as_ref().map_or_else(String::new, |spec| spec.id.clone());
        let key_id = permit.key_id().to_string();
        Self {
            trace,
            permit: Some(permit),
            stats,
            metrics,
            webhook,
            spec,
            request_id,
            model,
            key_id,
            tier,
            source,
            estimated_input,
            started,
            settled: false,
        }
    }

    pub fn mark_first_byte(&self) {
        self.trace.add_span(SpanKind::FirstByte, None);
        self.trace.add_span(SpanKind::Streaming, None);
    }

    /// Settle the attempt as succeeded, merging provider usage with local
    /// estimates.
    pub fn success(mut self, upstream_usage: &TokenUsage, body_bytes: u64) {
        self.settled = true;
        let estimated_output = observability::estimate_tokens_from_bytes(body_bytes);
        let usage = observability::merge_usage(upstream_usage, self.estimated_input, estimated_output);
        let input_tokens = usage.input_tokens.unwrap_or(0);
        let output_tokens = usage.output_tokens.unwrap_or(0);
        let cost_usd = self
            .spec
            .as_ref()
            .map_or(0.0, |spec| spec.cost_usd(input_tokens, output_tokens));

        let elapsed = self.started.elapsed();
        let latency_ms = u32::try_from(elapsed.as_millis()).unwrap_or(u32::MAX);
        if let Some(permit) = self.permit.take() {
            permit.complete_success(latency_ms);
        }

        self.trace.add_span(SpanKind::Complete, None);
        self.trace.complete(true, Some(&self.model));

        self.metrics
            .incr_tokens(&self.tier, &self.model, input_tokens + output_tokens);
        self.metrics.observe_latency(elapsed.as_secs_f64());
        self.stats.record_request(&RequestEvent {
            request_id: self.request_id.clone(),
            model: Some(self.model.clone()),
            key_id: Some(self.key_id.clone()),
            tier: self.tier.clone(),
            source: self.source.clone(),
            success: true,
            error_kind: None,
            input_tokens,
            output_tokens,
            cost_usd,
            duration_ms: elapsed.as_millis() as u64,
        });
        observability::log_request_complete(&self.model, &self.key_id, &usage, cost_usd, elapsed);
    }

    /// Settle the attempt as failed mid-stream. By then response headers are
    /// gone to the client, so there is no retry; the error only feeds the
    /// key state, stats and webhooks.
    pub fn error(mut self, err: &ProxyError) {
        self.settled = true;
        if let Some(permit) = self.permit.take() {
            permit.complete_failure(err);
        }
        let span = match err {
            ProxyError::Timeout(_) => SpanKind::Timeout,
            _ => SpanKind::Error,
        };
        self.trace.add_span(span, Some(err.kind().to_string()));
        self.trace.complete(false, Some(&self.model));

        if let ProxyError::Transport { kind, .. } = err {
            self.stats.record_transport_fault(*kind);
        }
        let elapsed = self.started.elapsed();
        self.metrics.observe_latency(elapsed.as_secs_f64());
        self.stats.record_request(&RequestEvent {
            request_id: self.request_id.clone(),
            model: Some(self.model.clone()),
            key_id: Some(self.key_id.clone()),
            tier: self.tier.clone(),
            source: self.source.clone(),
            success: false,
            error_kind: Some(err.kind().to_string()),
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            duration_ms: elapsed.as_millis() as u64,
        });
        self.webhook.record_error(err.kind());
    }
}

impl Drop for RelayFinalizer {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // Client went away mid-stream: release the slot (the permit's drop
        // records no outcome) and close the trace without a retry.
        self.trace
            .add_span(SpanKind::Cancelled, Some("client disconnected".to_string()));
        self.trace.complete(false, Some(&self.model));
        self.stats.record_request(&RequestEvent {
            request_id: self.request_id.clone(),
            model: Some(self.model.clone()),
            key_id: Some(self.key_id.clone()),
            tier: self.tier.clone(),
            source: self.source.clone(),
            success: false,
            error_kind: Some(ProxyError::ClientDisconnect.kind().to_string()),
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            duration_ms: self.started.elapsed().as_millis() as u64,
        });
    }
}

pin_project! {
    /// Wraps the upstream byte stream, feeding the scanner and settling the
    /// finalizer when the body ends, errors, or is dropped.
    pub struct RelayStream<S> {
        #[pin]
        inner: S,
        scanner: UsageScanner,
        finalizer: Option<RelayFinalizer>,
        saw_first_byte: bool,
    }
}

impl<S> RelayStream<S> {
    #[must_use]
    pub fn new(inner: S, finalizer: RelayFinalizer) -> Self {
        Self {
            inner,
            scanner: UsageScanner::default(),
            finalizer: Some(finalizer),
            saw_first_byte: false,
        }
    }
}

impl<S> Stream for RelayStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>>,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                if !*this.saw_first_byte {
                    *this.saw_first_byte = true;
                    if let Some(finalizer) = this.finalizer.as_ref() {
                        finalizer.mark_first_byte();
                    }
                }
                this.scanner.on_chunk(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                let proxy_err = ProxyError::Transport {
                    kind: TransportKind::StreamPrematureClose,
                    message: format!("upstream body failed mid-stream: {err}"),
                };
                if let Some(finalizer) = this.finalizer.take() {
                    finalizer.error(&proxy_err);
                }
                Poll::Ready(Some(Err(std::io::Error::other(proxy_err.to_string()))))
            }
            Poll::Ready(None) => {
                if let Some(finalizer) = this.finalizer.take() {
                    finalizer.success(&this.scanner.usage(), this.scanner.body_bytes());
                }
                Poll::Ready(None)
            }
        }
    }
}
