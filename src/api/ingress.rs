//! Proxy ingress: turns an inbound messages request into a pipeline run.

use std::sync::Arc;

use axum::body::Bytes;
use axum::http::request::Parts;
use axum::response::Response;

use crate::pipeline::{self, RequestContext};
use crate::state::AppState;

/// Clients may pin a model explicitly, bypassing tier resolution.
const MODEL_OVERRIDE_HEADER: &str = "x-keyway-model-override";

pub(crate) async fn messages(state: Arc<AppState>, parts: &Parts, body: Bytes) -> Response {
    let request_id = state.next_request_id();

    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();

    let client_override = parts
        .headers
        .get(MODEL_OVERRIDE_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    let mut ctx = RequestContext::new(
        request_id,
        parts.uri.path().to_string(),
        parts.method.as_str().to_string(),
        headers,
        body,
        client_override,
    );
    if let Some(user_agent) = parts
        .headers
        .get(http::header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
    {
        ctx.extensions
            .insert("user_agent".to_string(), user_agent.to_string());
    }

    pipeline::handle_request(state, ctx).await
}
