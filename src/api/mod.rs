//! HTTP surface: proxy ingress plus the admin and observability endpoints.

pub(crate) mod admin;
pub(crate) mod ingress;
pub(crate) mod status;

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{self, Body};
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

const DEFAULT_BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

enum RouteMatch<'a> {
    Health,
    Metrics,
    Messages,
    RoutingUpdate,
    RoutingOverridesPut,
    RoutingOverridesDelete,
    RoutingTest,
    RoutingExplain,
    RoutingReset,
    RoutingExport,
    AuthStatus,
    History,
    RequestPayload { request_id: &'a str },
    MethodNotAllowed,
    NotFound,
}

/// Dispatch a raw HTTP request to the matching handler.
///
/// # Errors
///
/// This function currently never returns `Err` and uses `Infallible`.
pub async fn dispatch_request(
    state: Arc<AppState>,
    base_path: Arc<str>,
    request: Request<Body>,
) -> Result<Response, Infallible> {
    let (parts, body) = request.into_parts();
    let route = match_route(&parts.method, parts.uri.path(), base_path.as_ref());

    let response = match route {
        RouteMatch::Health => status::health(&state).into_response(),
        RouteMatch::Metrics => status::metrics(&state).into_response(),
        RouteMatch::AuthStatus => status::auth_status(&state, &parts.headers).into_response(),
        RouteMatch::History => status::history(&state, parts.uri.query()).into_response(),
        RouteMatch::RequestPayload { request_id } => {
            status::request_payload(&state, &parts.headers, request_id).into_response()
        }
        RouteMatch::RoutingExport => admin::export(&state, &parts.headers).into_response(),
        RouteMatch::Messages => {
            let body_bytes = match read_request_body(body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            ingress::messages(state, &parts, body_bytes).await
        }
        RouteMatch::RoutingUpdate
        | RouteMatch::RoutingOverridesPut
        | RouteMatch::RoutingOverridesDelete
        | RouteMatch::RoutingTest
        | RouteMatch::RoutingExplain
        | RouteMatch::RoutingReset => {
            let body_bytes = match read_request_body(body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            match route {
                RouteMatch::RoutingUpdate => {
                    admin::update_routing(&state, &parts.headers, &body_bytes).into_response()
                }
                RouteMatch::RoutingOverridesPut => {
                    admin::put_overrides(&state, &parts.headers, &body_bytes).into_response()
                }
                RouteMatch::RoutingOverridesDelete => {
                    admin::delete_overrides(&state, &parts.headers, &body_bytes).into_response()
                }
                RouteMatch::RoutingTest => {
                    admin::test_routing(&state, &body_bytes).into_response()
                }
                RouteMatch::RoutingExplain => {
                    admin::explain_routing(&state, &body_bytes).into_response()
                }
                RouteMatch::RoutingReset => {
                    admin::reset_routing(&state, &parts.headers).into_response()
                }
                _ => unreachable!("outer match restricts the route set"),
            }
        }
        RouteMatch::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        RouteMatch::NotFound => StatusCode::NOT_FOUND.into_response(),
    };

    Ok(response)
}

#[must_use]
pub fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim();
    if trimmed.is_empty() || trimmed == "/" {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.trim_end_matches('/').to_string()
    } else {
        format!("/{}", trimmed.trim_end_matches('/'))
    }
}

async fn read_request_body(body: Body) -> Result<bytes::Bytes, Response> {
    body::to_bytes(body, DEFAULT_BODY_LIMIT_BYTES)
        .await
        .map_err(|_| {
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large (max 2MiB)",
            )
                .into_response()
        })
}

fn match_route<'a>(method: &Method, path: &'a str, base_path: &str) -> RouteMatch<'a> {
    let path = match path.strip_prefix(base_path) {
        Some(stripped) if base_path.is_empty() || stripped.starts_with('/') || stripped.is_empty() => {
            if stripped.is_empty() {
                "/"
            } else {
                stripped
            }
        }
        _ => return RouteMatch::NotFound,
    };

    match path {
        "/health" => expect_method(method, &Method::GET, RouteMatch::Health),
        "/metrics" => expect_method(method, &Method::GET, RouteMatch::Metrics),
        "/v1/messages" => expect_method(method, &Method::POST, RouteMatch::Messages),
        "/model-routing" => expect_method(method, &Method::PUT, RouteMatch::RoutingUpdate),
        "/model-routing/overrides" => match *method {
            Method::PUT => RouteMatch::RoutingOverridesPut,
            Method::DELETE => RouteMatch::RoutingOverridesDelete,
            _ => RouteMatch::MethodNotAllowed,
        },
        "/model-routing/test" => expect_method(method, &Method::POST, RouteMatch::RoutingTest),
        "/model-routing/explain" => {
            expect_method(method, &Method::POST, RouteMatch::RoutingExplain)
        }
        "/model-routing/reset" => expect_method(method, &Method::POST, RouteMatch::RoutingReset),
        "/model-routing/export" => expect_method(method, &Method::GET, RouteMatch::RoutingExport),
        "/auth-status" => expect_method(method, &Method::GET, RouteMatch::AuthStatus),
        "/history" => expect_method(method, &Method::GET, RouteMatch::History),
        _ => {
            if let Some(rest) = path.strip_prefix("/requests/") {
                if let Some(request_id) = rest.strip_suffix("/payload") {
                    if !request_id.is_empty() && !request_id.contains('/') {
                        return expect_method(
                            method,
                            &Method::GET,
                            RouteMatch::RequestPayload { request_id },
                        );
                    }
                }
            }
            RouteMatch::NotFound
        }
    }
}

fn expect_method<'a>(
    method: &Method,
    expected: &Method,
    matched: RouteMatch<'a>,
) -> RouteMatch<'a> {
    if method == expected {
        matched
    } else {
        RouteMatch::MethodNotAllowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_not_found(route: &RouteMatch<'_>) -> bool {
        matches!(route, RouteMatch::NotFound)
    }

    #[test]
    fn test_match_core_routes() {
        assert!(matches!(
            match_route(&Method::POST, "/v1/messages", ""),
            RouteMatch::Messages
        ));
        assert!(matches!(
            match_route(&Method::PUT, "/model-routing", ""),
            RouteMatch::RoutingUpdate
        ));
        assert!(matches!(
            match_route(&Method::DELETE, "/model-routing/overrides", ""),
            RouteMatch::RoutingOverridesDelete
        ));
        assert!(matches!(
            match_route(&Method::GET, "/history", ""),
            RouteMatch::History
        ));
    }

    #[test]
    fn test_method_mismatch() {
        assert!(matches!(
            match_route(&Method::GET, "/v1/messages", ""),
            RouteMatch::MethodNotAllowed
        ));
        assert!(matches!(
            match_route(&Method::POST, "/model-routing", ""),
            RouteMatch::MethodNotAllowed
        ));
    }

    #[test]
    fn test_payload_route_extracts_request_id() {
        match match_route(&Method::GET, "/requests/req-abc123/payload", "") {
            RouteMatch::RequestPayload { request_id } => assert_eq!(request_id, "req-abc123"),
            _ => panic!("expected payload route"),
        }
        assert!(is_not_found(&match_route(
            &Method::GET,
            "/requests//payload",
            ""
        )));
        assert!(is_not_found(&match_route(
            &Method::GET,
            "/requests/a/b/payload",
            ""
        )));
    }

    #[test]
    fn test_base_path_stripping() {
        assert!(matches!(
            match_route(&Method::GET, "/proxy/health", "/proxy"),
            RouteMatch::Health
        ));
        assert!(is_not_found(&match_route(&Method::GET, "/health", "/proxy")));
    }

    #[test]
    fn test_normalize_base_path() {
        assert_eq!(normalize_base_path(""), "");
        assert_eq!(normalize_base_path("/"), "");
        assert_eq!(normalize_base_path("/proxy/"), "/proxy");
        assert_eq!(normalize_base_path("proxy"), "/proxy");
    }
}
