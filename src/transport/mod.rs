//! Upstream HTTP client: one pooled connection set shared by every key,
//! rebuildable when the connection-health tracker reports a hangup streak.

pub(crate) mod retry;

use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;

use crate::config::AppConfig;
use crate::error::{classify_transport_message, ProxyError, TransportKind};

pub(crate) use retry::retry_backoff_delay;

pub struct HttpTransport {
    client: ArcSwap<reqwest::Client>,
    messages_url: url::Url,
    auth_header: String,
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Duration,
}

impl HttpTransport {
    /// Build the transport from the app config.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] when the upstream URL is invalid or
    /// the client cannot be constructed.
    pub fn new(config: &AppConfig) -> Result<Self, ProxyError> {
        let base = url::Url::parse(&config.upstream.base_url)
            .map_err(|err| ProxyError::Config(format!("invalid upstream base_url: {err}")))?;
        let messages_url = base
            .join(&config.upstream.messages_path)
            .map_err(|err| ProxyError::Config(format!("invalid upstream messages_path: {err}")))?;

        let pool_max_idle_per_host = config.server.http_pool_max_idle_per_host.max(1);
        let pool_idle_timeout = Duration::from_secs(config.server.http_pool_idle_timeout_secs);
        let client = build_client(pool_max_idle_per_host, pool_idle_timeout)?;

        Ok(Self {
            client: ArcSwap::from_pointee(client),
            messages_url,
            auth_header: config.upstream.auth_header.clone(),
            pool_max_idle_per_host,
            pool_idle_timeout,
        })
    }

    /// Drop the pooled connections and start over. Called after a streak of
    /// socket hangups, where stale pooled sockets keep poisoning requests.
    pub fn recreate_client(&self) {
        match build_client(self.pool_max_idle_per_host, self.pool_idle_timeout) {
            Ok(client) => {
                self.client.store(std::sync::Arc::new(client));
                tracing::info!("upstream HTTP client recreated after hangup streak");
            }
            Err(err) => tracing::error!("failed to recreate upstream client: {err}"),
        }
    }

    /// Send a messages request upstream with the given credential and
    /// per-attempt deadline. Any HTTP status is returned as `Ok`; callers
    /// classify non-success statuses via [`classify_response`].
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Timeout`] when the deadline elapses and
    /// [`ProxyError::Transport`] for connection-level failures.
    pub async fn send_messages(
        &self,
        api_key: &str,
        body: Bytes,
        deadline: Duration,
    ) -> Result<reqwest::Response, ProxyError> {
        let client = self.client.load();
        let request = client
            .post(self.messages_url.clone())
            .header(self.auth_header.as_str(), api_key)
            .header(http::header::CONTENT_TYPE, "application/json")
            .header(http::header::ACCEPT, "application/json, text/event-stream")
            .timeout(deadline)
            .body(body);

        request.send().await.map_err(classify_reqwest_error)
    }
}

fn build_client(
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Duration,
) -> Result<reqwest::Client, ProxyError> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(5))
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .map_err(|err| ProxyError::Config(format!("failed to build HTTP client: {err}")))
}

/// Map a reqwest error into the transport taxonomy.
#[must_use]
pub fn classify_reqwest_error(err: reqwest::Error) -> ProxyError {
    if err.is_timeout() {
        return ProxyError::Timeout(format!("upstream deadline exceeded: {err}"));
    }
    let message = err.to_string();
    let kind = if err.is_connect() {
        let classified = classify_transport_message(&message);
        if classified == TransportKind::SocketHangup {
            TransportKind::ConnectionRefused
        } else {
            classified
        }
    } else {
        classify_transport_message(&message)
    };
    ProxyError::Transport { kind, message }
}

/// Classify a non-success upstream status into the error taxonomy.
/// Success statuses return `None`: the body is relayed as-is.
#[must_use]
pub fn classify_response(
    status: http::StatusCode,
    headers: &http::HeaderMap,
) -> Option<ProxyError> {
    if status.is_success() {
        return None;
    }
    match status.as_u16() {
        429 => Some(ProxyError::RateLimit {
            retry_after_ms: retry::parse_retry_after_ms(headers),
            message: "upstream rate limit".to_string(),
        }),
        401 | 403 => Some(ProxyError::Auth(format!(
            "upstream rejected credential with {status}"
        ))),
        status_code => Some(ProxyError::Upstream {
            status: status_code,
            message: format!("upstream returned {status}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_success_is_none() {
        let headers = http::HeaderMap::new();
        assert!(classify_response(http::StatusCode::OK, &headers).is_none());
    }

    #[test]
    fn test_classify_429_carries_retry_after() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::RETRY_AFTER,
            http::HeaderValue::from_static("7"),
        );
        let err = classify_response(http::StatusCode::TOO_MANY_REQUESTS, &headers).unwrap();
        match err {
            ProxyError::RateLimit { retry_after_ms, .. } => {
                assert_eq!(retry_after_ms, Some(7_000));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_auth_statuses() {
        let headers = http::HeaderMap::new();
        for status in [http::StatusCode::UNAUTHORIZED, http::StatusCode::FORBIDDEN] {
            let err = classify_response(status, &headers).unwrap();
            assert!(matches!(err, ProxyError::Auth(_)));
        }
    }

    #[test]
    fn test_classify_5xx_is_upstream_and_retryable() {
        let headers = http::HeaderMap::new();
        let err = classify_response(http::StatusCode::BAD_GATEWAY, &headers).unwrap();
        assert!(err.is_retryable());
        assert!(err.affects_breaker());
    }

    #[test]
    fn test_classify_4xx_is_upstream_non_retryable() {
        let headers = http::HeaderMap::new();
        let err = classify_response(http::StatusCode::BAD_REQUEST, &headers).unwrap();
        assert!(!err.is_retryable());
        assert!(!err.affects_breaker());
    }
}
