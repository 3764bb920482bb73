//! Admin endpoints for the routing configuration.

use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use crate::error::ProxyError;
use crate::router::normalize::{normalize, NormalizeMode};
use crate::router::{ModelRouter, RequestFeatures};
use crate::state::AppState;

/// `PUT /model-routing` — accepts v1 or v2 bodies, normalizes, installs,
/// and persists behind the content-hash marker.
pub(crate) fn update_routing(
    state: &AppState,
    headers: &http::HeaderMap,
    body: &bytes::Bytes,
) -> Response {
    if let Err(err) = state.admin_tokens.authenticate(headers) {
        return err.into_response();
    }
    let body = match parse_json(body) {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };
    match state.apply_routing_update(&body) {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => err.into_response(),
    }
}

/// `PUT /model-routing/overrides` — atomic merge into the override map.
pub(crate) fn put_overrides(
    state: &AppState,
    headers: &http::HeaderMap,
    body: &bytes::Bytes,
) -> Response {
    if let Err(err) = state.admin_tokens.authenticate(headers) {
        return err.into_response();
    }
    let body = match parse_json(body) {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };
    let Some(updates) = body.get("overrides").and_then(Value::as_object) else {
        return ProxyError::Validation("body must carry an 'overrides' object".to_string())
            .into_response();
    };

    let mut config = state.router.current_config();
    for (client_model, target) in updates {
        match target.as_str() {
            Some(target) if !target.is_empty() => {
                config
                    .overrides
                    .insert(client_model.clone(), target.to_string());
            }
            _ => {
                return ProxyError::Validation(format!(
                    "override '{client_model}' must map to a model name"
                ))
                .into_response()
            }
        }
    }

    install_config(state, &config)
}

/// `DELETE /model-routing/overrides` — remove listed overrides, or all of
/// them when the body names none.
pub(crate) fn delete_overrides(
    state: &AppState,
    headers: &http::HeaderMap,
    body: &bytes::Bytes,
) -> Response {
    if let Err(err) = state.admin_tokens.authenticate(headers) {
        return err.into_response();
    }

    let mut config = state.router.current_config();
    let models: Option<Vec<String>> = if body.is_empty() {
        None
    } else {
        parse_json(body)
            .ok()
            .and_then(|value| {
                value.get("models").and_then(Value::as_array).map(|models| {
                    models
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
            })
    };

    match models {
        Some(models) => {
            for model in &models {
                config.overrides.remove(model);
            }
        }
        None => config.overrides.clear(),
    }

    install_config(state, &config)
}

/// `POST /model-routing/test` — dry-run selection for a sample request.
pub(crate) fn test_routing(state: &AppState, body: &bytes::Bytes) -> Response {
    let body = match parse_json(body) {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };
    let features = RequestFeatures::from_body(request_sample(&body));
    let decision = state.router.explain(&features, None, &state.keys);
    Json(serde_json::json!({
        "selectedModel": decision.selected_model,
        "tier": decision.tier,
        "strategy": decision.strategy,
        "source": decision.source,
        "reason": decision.reason,
    }))
    .into_response()
}

/// `POST /model-routing/explain` — the full scoring artifacts, optionally
/// previewing a candidate config before it is installed.
pub(crate) fn explain_routing(state: &AppState, body: &bytes::Bytes) -> Response {
    let body = match parse_json(body) {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };
    let features = RequestFeatures::from_body(request_sample(&body));

    let (decision, migration_preview) = match body.get("config") {
        Some(candidate) => {
            let outcome = normalize(candidate, NormalizeMode::Full);
            let preview_router = ModelRouter::new(&state.config, outcome.config);
            let decision = preview_router.explain(&features, None, &state.keys);
            (
                decision,
                Some(serde_json::json!({
                    "migrated": outcome.migrated,
                    "warnings": outcome.warnings,
                })),
            )
        }
        None => (state.router.explain(&features, None, &state.keys), None),
    };

    let mut payload = serde_json::to_value(&decision).unwrap_or_default();
    if let Value::Object(map) = &mut payload {
        map.insert(
            "features".to_string(),
            serde_json::to_value(&features).unwrap_or_default(),
        );
        if let Some(preview) = migration_preview {
            map.insert("migrationPreview".to_string(), preview);
        }
    }
    Json(payload).into_response()
}

/// `POST /model-routing/reset` — restore catalog-derived defaults.
pub(crate) fn reset_routing(state: &AppState, headers: &http::HeaderMap) -> Response {
    if let Err(err) = state.admin_tokens.authenticate(headers) {
        return err.into_response();
    }
    state.router.reset_to_defaults();
    let config = state.router.current_config();
    install_config(state, &config)
}

/// `GET /model-routing/export` — the full current config document.
pub(crate) fn export(state: &AppState, headers: &http::HeaderMap) -> Response {
    if let Err(err) = state.admin_tokens.authenticate(headers) {
        return err.into_response();
    }
    Json(state.router.current_config()).into_response()
}

fn install_config(state: &AppState, config: &crate::router::RoutingConfig) -> Response {
    match serde_json::to_value(config) {
        Ok(value) => match state.apply_routing_update(&value) {
            Ok(outcome) => Json(outcome).into_response(),
            Err(err) => err.into_response(),
        },
        Err(err) => {
            ProxyError::Internal(format!("failed to serialize config: {err}")).into_response()
        }
    }
}

fn parse_json(body: &bytes::Bytes) -> Result<Value, ProxyError> {
    serde_json::from_slice(body)
        .map_err(|err| ProxyError::Validation(format!("body is not valid JSON: {err}")))
}

/// Test/explain bodies may wrap the sample under `request`, or be the
/// sample itself.
fn request_sample(body: &Value) -> &Value {
    body.get("request").unwrap_or(body)
}
