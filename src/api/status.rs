//! Observability endpoints: health, metrics, auth status, history rollups
//! and captured request payloads.

use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::ProxyError;
use crate::state::AppState;
use crate::stats::weighted_latency;

/// `GET /health` — key pool summary and the headline success rate.
pub(crate) fn health(state: &AppState) -> Response {
    let reports = state.keys.reports();
    let available = reports
        .iter()
        .filter(|report| {
            report.circuit == crate::keys::CircuitState::Closed
                && !report.auth_failed
                && !report.rate_limit.in_cooldown
        })
        .count();

    Json(serde_json::json!({
        "status": if available > 0 { "ok" } else { "degraded" },
        "keys": {
            "total": reports.len(),
            "available": available,
        },
        "clientSuccessRate": state.stats.client_success_rate(),
        "replayQueueDepth": state.replay.len(),
    }))
    .into_response()
}

/// `GET /metrics` — prometheus text exposition.
pub(crate) fn metrics(state: &AppState) -> Response {
    (
        [(http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

/// `GET /auth-status`.
pub(crate) fn auth_status(state: &AppState, headers: &http::HeaderMap) -> Response {
    Json(state.admin_tokens.status(headers)).into_response()
}

/// `GET /history?minutes=N` — per-minute rollup points plus the weighted
/// latency overview.
pub(crate) fn history(state: &AppState, query: Option<&str>) -> Response {
    let minutes = query
        .and_then(|query| {
            query.split('&').find_map(|pair| {
                pair.strip_prefix("minutes=")
                    .and_then(|value| value.parse::<u64>().ok())
            })
        })
        .unwrap_or(60)
        .clamp(1, 24 * 60);

    let reports = state.keys.reports();
    Json(serde_json::json!({
        "minutes": minutes,
        "points": state.stats.history(minutes),
        "latency": weighted_latency(&reports),
        "keys": reports,
    }))
    .into_response()
}

/// `GET /requests/{id}/payload` — captured request body, admin only.
pub(crate) fn request_payload(
    state: &AppState,
    headers: &http::HeaderMap,
    request_id: &str,
) -> Response {
    if let Err(err) = state.admin_tokens.authenticate(headers) {
        return err.into_response();
    }

    let Some(trace) = state.tracer.store().get_by_request(request_id) else {
        return ProxyError::Validation(format!("no trace for request '{request_id}'"))
            .into_response();
    };
    match trace.payload {
        Some(payload) => (
            [(http::header::CONTENT_TYPE, "application/json")],
            payload,
        )
            .into_response(),
        None => ProxyError::Validation(format!(
            "request '{request_id}' was traced without body capture"
        ))
        .into_response(),
    }
}
