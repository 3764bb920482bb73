//! The request-servicing engine: admission, routing, key acquisition,
//! upstream call, streaming relay and retry orchestration.

pub mod admission;
pub(crate) mod relay;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::ProxyError;
use crate::keys::KeyPermit;
use crate::policy::{EffectivePolicy, MatchRequest, TelemetryMode};
use crate::router::{RequestFeatures, RouteDecision};
use crate::state::AppState;
use crate::stats::RequestEvent;
use crate::trace::{SpanKind, TraceHandle};
use crate::transport::{classify_response, retry_backoff_delay};
use crate::webhook::WebhookEvent;

pub use admission::AdmissionControl;
pub(crate) use relay::{RelayFinalizer, RelayStream};

/// How long an admission-hold waiter sleeps between availability re-checks
/// when no slot-freed notification arrives (covers cooldown expiry).
const HOLD_RECHECK: Duration = Duration::from_millis(100);

/// A parsed inbound request. The shape is fixed; anything optional and
/// diagnostic goes through the extension map instead of ad-hoc fields.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub path: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub body_json: Value,
    pub features: RequestFeatures,
    pub client_override: Option<String>,
    pub extensions: FxHashMap<String, String>,
}

impl RequestContext {
    #[must_use]
    pub fn new(
        request_id: String,
        path: String,
        method: String,
        headers: Vec<(String, String)>,
        body: Bytes,
        client_override: Option<String>,
    ) -> Self {
        let body_json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        let features = RequestFeatures::from_body(&body_json);
        Self {
            request_id,
            path,
            method,
            headers,
            body,
            body_json,
            features,
            client_override,
            extensions: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn wants_stream(&self) -> bool {
        self.body_json
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Closes the trace as cancelled if the request future is dropped before a
/// terminal outcome is recorded.
struct CancelGuard {
    trace: Option<TraceHandle>,
}

impl CancelGuard {
    fn new(trace: TraceHandle) -> Self {
        Self { trace: Some(trace) }
    }

    fn defuse(mut self) {
        self.trace = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(trace) = self.trace.take() {
            trace.add_span(SpanKind::Cancelled, Some("request dropped".to_string()));
            trace.complete(false, None);
        }
    }
}

/// Entry point for proxy traffic: errors become client responses here.
pub async fn handle_request(state: Arc<AppState>, ctx: RequestContext) -> Response {
    match run(state, ctx).await {
        Ok(response) => response,
        Err(err) => axum::response::IntoResponse::into_response(err),
    }
}

async fn run(state: Arc<AppState>, ctx: RequestContext) -> Result<Response, ProxyError> {
    let policy = state.policies.match_request(&MatchRequest {
        path: &ctx.path,
        method: &ctx.method,
        model: &ctx.features.model,
    });

    let sampled = match policy.telemetry_mode {
        TelemetryMode::Drop => false,
        TelemetryMode::Normal | TelemetryMode::Sample => {
            fastrand::u8(0..100) < policy.tracing.sample_rate
        }
    };
    let trace = state.tracer.start(&ctx.request_id, sampled);
    if policy.tracing.include_body {
        trace.capture_payload(&ctx.body, policy.tracing.max_body_size);
    }
    if !ctx.extensions.is_empty() {
        tracing::debug!(
            request_id = ctx.request_id.as_str(),
            extensions = ?ctx.extensions,
            "request diagnostics"
        );
    }

    let started = Instant::now();
    let total_budget = Duration::from_secs(state.config.server.timeout);
    let guard = CancelGuard::new(trace.clone());

    trace.begin_attempt(&ctx.features.model);
    trace.add_span(SpanKind::Queued, None);

    if let Err(err) = state.admission.admit(&policy).await {
        let err = finish_failure(&state, &trace, &ctx, err, started).await;
        guard.defuse();
        return Err(err);
    }

    let max_attempts = policy.retry_budget.saturating_add(1);
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            trace.begin_attempt(&ctx.features.model);
        }

        let (decision, permit) =
            match route_and_acquire(&state, &trace, &ctx, &policy, attempt, started, total_budget)
                .await
            {
                Ok(pinned) => pinned,
                Err(err) => {
                    let err = finish_failure(&state, &trace, &ctx, err, started).await;
                    guard.defuse();
                    return Err(err);
                }
            };

        let model = decision
            .selected_model
            .clone()
            .unwrap_or_else(|| ctx.features.model.clone());
        trace.set_key(&permit.key_id());
        trace.add_span(SpanKind::KeyAcquired, None);

        let remaining = total_budget.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            drop(permit);
            let err = finish_failure(
                &state,
                &trace,
                &ctx,
                ProxyError::Timeout("request budget exhausted before upstream call".to_string()),
                started,
            )
            .await;
            guard.defuse();
            return Err(err);
        }

        trace.add_span(SpanKind::UpstreamStart, None);
        let outcome = call_upstream(&state, &ctx, &permit, &model, remaining).await;

        match outcome {
            Ok(response) => {
                let result = relay_response(
                    &state, &ctx, &trace, &decision, permit, &model, started, response,
                )
                .await;
                guard.defuse();
                return result;
            }
            Err(err) => {
                let key_index = permit.key_index();
                let key_id = permit.key_id();
                handle_attempt_error(&state, &permit, &err);
                permit.complete_failure(&err);
                notify_if_circuit_opened(&state, key_index, &key_id);

                let backoff = retry_backoff_delay(attempt);
                let retries_left = attempt + 1 < max_attempts;
                let budget_left = total_budget.saturating_sub(started.elapsed()) > backoff;
                if err.is_retryable() && retries_left && budget_left {
                    trace.mark_retry(err.kind());
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                    continue;
                }

                let err = finish_failure(&state, &trace, &ctx, err, started).await;
                guard.defuse();
                return Err(err);
            }
        }
    }
}

/// Route the request and pin the first candidate the key manager can
/// satisfy. With no candidate, enter an admission hold until a slot frees,
/// a cooldown expires, or the queue-time budget runs out.
async fn route_and_acquire(
    state: &Arc<AppState>,
    trace: &TraceHandle,
    ctx: &RequestContext,
    policy: &EffectivePolicy,
    attempt: u32,
    started: Instant,
    total_budget: Duration,
) -> Result<(RouteDecision, KeyPermit), ProxyError> {
    let hold_budget = Duration::from_millis(policy.max_queue_time_ms);
    let hold_started = Instant::now();
    let mut holding = false;

    loop {
        let decision = state
            .router
            .resolve(&ctx.features, ctx.client_override.as_deref(), &state.keys);
        if attempt == 0 && !holding {
            record_decision_metrics(state, &decision);
        }

        for model in &decision.candidates {
            let per_key_limit = state.router.per_key_limit(model);
            if let Some(permit) = state.keys.try_acquire(per_key_limit) {
                let mut pinned = decision.clone();
                pinned.selected_model = Some(model.clone());
                return Ok((pinned, permit));
            }
        }

        if !holding {
            holding = true;
            trace.add_span(SpanKind::AdmissionHold, None);
            state.metrics.incr_fallback("admission_hold");
        }

        let elapsed_hold = hold_started.elapsed();
        if elapsed_hold >= hold_budget
            || started.elapsed() + HOLD_RECHECK >= total_budget
        {
            return Err(ProxyError::AdmissionTimeout(format!(
                "no upstream key became available within {}ms",
                policy.max_queue_time_ms
            )));
        }

        tokio::select! {
            () = state.keys.slot_freed() => {}
            () = tokio::time::sleep(HOLD_RECHECK) => {}
        }
    }
}

fn record_decision_metrics(state: &AppState, decision: &RouteDecision) {
    state
        .metrics
        .incr_request(decision.tier.as_str(), decision.source.as_str());
    if let Some(classifier) = &decision.classifier_result {
        state.metrics.incr_upgrade(classifier.reason);
    }
    if let Some(reason) = &decision.fallback_reason {
        let label = if reason.contains("budget") {
            "downgrade_budget_spent"
        } else {
            "tier_exhausted"
        };
        state.metrics.incr_fallback(label);
    }
}

/// Send the (model-rewritten) request upstream and classify the status line.
async fn call_upstream(
    state: &AppState,
    ctx: &RequestContext,
    permit: &KeyPermit,
    model: &str,
    deadline: Duration,
) -> Result<reqwest::Response, ProxyError> {
    let body = rewrite_model(&ctx.body_json, model, &ctx.body);
    let response = state
        .transport
        .send_messages(&permit.api_key(), body, deadline)
        .await?;

    if let Some(err) = classify_response(response.status(), response.headers()) {
        return Err(err);
    }
    Ok(response)
}

/// Swap the model field so the upstream sees the routed model, not the
/// client's alias. A non-object body is forwarded untouched.
fn rewrite_model(body_json: &Value, model: &str, original: &Bytes) -> Bytes {
    let Value::Object(map) = body_json else {
        return original.clone();
    };
    if map.get("model").and_then(Value::as_str) == Some(model) {
        return original.clone();
    }
    let mut rewritten = map.clone();
    rewritten.insert("model".to_string(), Value::String(model.to_string()));
    serde_json::to_vec(&Value::Object(rewritten))
        .map(Bytes::from)
        .unwrap_or_else(|_| original.clone())
}

/// Emit a circuit-opened notification when this attempt's failure tripped
/// the key's breaker. The dedup window collapses repeated trips.
fn notify_if_circuit_opened(state: &Arc<AppState>, key_index: usize, key_id: &str) {
    let opened = state
        .keys
        .reports()
        .get(key_index)
        .is_some_and(|report| report.circuit == crate::keys::CircuitState::Open);
    if opened {
        state.webhook.emit(
            WebhookEvent::CircuitOpened,
            key_id,
            serde_json::json!({ "keyId": key_id }),
        );
    }
}

fn handle_attempt_error(state: &Arc<AppState>, permit: &KeyPermit, err: &ProxyError) {
    if let ProxyError::Transport { kind, .. } = err {
        if state.stats.record_transport_fault(*kind) {
            state.transport.recreate_client();
            state.stats.record_agent_recreation();
        }
    }
    if matches!(err, ProxyError::Auth(_)) {
        state.webhook.emit(
            WebhookEvent::KeyUnhealthy,
            &permit.key_id(),
            serde_json::json!({
                "keyId": permit.key_id().as_ref(),
                "reason": "upstream auth rejection",
            }),
        );
    }
}

/// Build the client response from a successful upstream response, settling
/// the attempt when the body finishes.
#[allow(clippy::too_many_arguments)]
async fn relay_response(
    state: &Arc<AppState>,
    ctx: &RequestContext,
    trace: &TraceHandle,
    decision: &RouteDecision,
    permit: KeyPermit,
    model: &str,
    started: Instant,
    upstream: reqwest::Response,
) -> Result<Response, ProxyError> {
    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(http::header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| http::HeaderValue::from_static("application/json"));

    let estimated_input = crate::observability::estimate_tokens_from_bytes(ctx.body.len() as u64);
    let finalizer = RelayFinalizer::new(
        trace.clone(),
        permit,
        Arc::clone(&state.stats),
        Arc::clone(&state.metrics),
        Arc::clone(&state.webhook),
        state.router.catalog().get(model).cloned(),
        ctx.request_id.clone(),
        decision.tier.as_str().to_string(),
        decision.source.as_str().to_string(),
        estimated_input,
        started,
    );

    let builder = Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, content_type)
        .header("x-request-id", ctx.request_id.as_str());

    if ctx.wants_stream() {
        let body = Body::from_stream(RelayStream::new(upstream.bytes_stream(), finalizer));
        return builder
            .body(body)
            .map_err(|err| ProxyError::Internal(format!("failed to build response: {err}")));
    }

    // Non-streaming: buffer the whole body so usage comes from the response
    // document. A body read failure here is still retry-safe upstream-wards,
    // but the attempt is settled as failed either way.
    match upstream.bytes().await {
        Ok(body) => {
            finalizer.mark_first_byte();
            let usage = serde_json::from_slice::<Value>(&body)
                .map(|value| {
                    let (input, output) = relay::extract_usage(&value);
                    crate::observability::TokenUsage {
                        input_tokens: input,
                        output_tokens: output,
                        total_tokens: None,
                    }
                })
                .unwrap_or_default();
            finalizer.success(&usage, body.len() as u64);
            builder
                .body(Body::from(body))
                .map_err(|err| ProxyError::Internal(format!("failed to build response: {err}")))
        }
        Err(err) => {
            let proxy_err = crate::transport::classify_reqwest_error(err);
            finalizer.error(&proxy_err);
            Err(proxy_err)
        }
    }
}

/// Terminal failure: close the trace, count it, notify, and maybe park the
/// request for replay.
async fn finish_failure(
    state: &Arc<AppState>,
    trace: &TraceHandle,
    ctx: &RequestContext,
    err: ProxyError,
    started: Instant,
) -> ProxyError {
    let span = match &err {
        ProxyError::Timeout(_) => SpanKind::Timeout,
        ProxyError::AdmissionTimeout(_) => SpanKind::AdmissionHold,
        _ => SpanKind::Error,
    };
    trace.add_span(span, Some(err.kind().to_string()));
    trace.complete(false, None);

    state.stats.record_request(&RequestEvent {
        request_id: ctx.request_id.clone(),
        model: Some(ctx.features.model.clone()),
        key_id: None,
        tier: "light".to_string(),
        source: "default".to_string(),
        success: false,
        error_kind: Some(err.kind().to_string()),
        input_tokens: 0,
        output_tokens: 0,
        cost_usd: 0.0,
        duration_ms: started.elapsed().as_millis() as u64,
    });
    state.metrics.observe_latency(started.elapsed().as_secs_f64());
    state.webhook.record_error(err.kind());

    // Upstream-side failures are worth replaying once capacity returns;
    // client-side and validation failures are not.
    if err.is_retryable() && ctx.body_json.is_object() {
        if let Err(enqueue_err) = state.replay.enqueue(
            trace.trace_id(),
            ctx.body_json.clone(),
            &ctx.headers,
            &err.to_string(),
        ) {
            tracing::debug!("replay enqueue skipped: {enqueue_err}");
        }
    }

    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_context_parses_features() {
        let body = Bytes::from(
            serde_json::to_vec(&json!({
                "model": "claude-3-opus",
                "stream": true,
                "messages": [{ "role": "user", "content": "hi" }]
            }))
            .unwrap(),
        );
        let ctx = RequestContext::new(
            "req-1".to_string(),
            "/v1/messages".to_string(),
            "POST".to_string(),
            Vec::new(),
            body,
            None,
        );
        assert_eq!(ctx.features.model, "claude-3-opus");
        assert!(ctx.wants_stream());
        assert_eq!(ctx.features.message_count, 1);
    }

    #[test]
    fn test_request_context_tolerates_invalid_body() {
        let ctx = RequestContext::new(
            "req-2".to_string(),
            "/v1/messages".to_string(),
            "POST".to_string(),
            Vec::new(),
            Bytes::from_static(b"not json"),
            None,
        );
        assert_eq!(ctx.body_json, Value::Null);
        assert!(!ctx.wants_stream());
    }

    #[test]
    fn test_rewrite_model_swaps_only_when_different() {
        let body_json = json!({ "model": "claude-3-opus", "max_tokens": 10 });
        let original = Bytes::from(serde_json::to_vec(&body_json).unwrap());

        let same = rewrite_model(&body_json, "claude-3-opus", &original);
        assert_eq!(same, original);

        let swapped = rewrite_model(&body_json, "glm-4-air", &original);
        let parsed: Value = serde_json::from_slice(&swapped).unwrap();
        assert_eq!(parsed["model"], "glm-4-air");
        assert_eq!(parsed["max_tokens"], 10);
    }

    #[test]
    fn test_rewrite_model_passes_non_object_through() {
        let original = Bytes::from_static(b"[1,2,3]");
        let result = rewrite_model(&json!([1, 2, 3]), "glm-4-air", &original);
        assert_eq!(result, original);
    }
}
