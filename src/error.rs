use std::fmt;

/// Canonical error type used across all modules.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Rate limited: {message}")]
    RateLimit {
        retry_after_ms: Option<u64>,
        message: String,
    },
    #[error("Deadline exceeded: {0}")]
    Timeout(String),
    #[error("Transport error ({kind}): {message}")]
    Transport {
        kind: TransportKind,
        message: String,
    },
    #[error("Client disconnected")]
    ClientDisconnect,
    #[error("No upstream key became available: {0}")]
    AdmissionTimeout(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Transport fault sub-kinds recorded in connection health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Dns,
    Tls,
    ConnectionRefused,
    BrokenPipe,
    StreamPrematureClose,
    HttpParse,
    SocketHangup,
}

impl TransportKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Dns => "dns",
            TransportKind::Tls => "tls",
            TransportKind::ConnectionRefused => "connection_refused",
            TransportKind::BrokenPipe => "broken_pipe",
            TransportKind::StreamPrematureClose => "stream_premature_close",
            TransportKind::HttpParse => "http_parse",
            TransportKind::SocketHangup => "socket_hangup",
        }
    }

    /// Hangup-family faults feed the consecutive-hangup counter.
    #[must_use]
    pub fn is_hangup(self) -> bool {
        matches!(
            self,
            TransportKind::BrokenPipe
                | TransportKind::StreamPrematureClose
                | TransportKind::SocketHangup
        )
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ProxyError {
    /// Stable taxonomy key for stats and webhook payloads.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Config(_) => "config",
            ProxyError::Auth(_) => "auth",
            ProxyError::Validation(_) => "validation",
            ProxyError::Upstream { .. } => "upstream",
            ProxyError::RateLimit { .. } => "rate_limit",
            ProxyError::Timeout(_) => "timeout",
            ProxyError::Transport { .. } => "transport",
            ProxyError::ClientDisconnect => "client_disconnect",
            ProxyError::AdmissionTimeout(_) => "admission_timeout",
            ProxyError::Internal(_) => "internal",
        }
    }

    /// Whether the pipeline may retry this attempt on another key.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            ProxyError::Upstream { status, .. } => {
                matches!(*status, 408 | 425 | 429 | 500 | 502 | 503 | 504 | 529)
            }
            ProxyError::RateLimit { .. } | ProxyError::Transport { .. } | ProxyError::Timeout(_) => {
                true
            }
            _ => false,
        }
    }

    /// Whether the failure increments the owning key's circuit breaker.
    ///
    /// Rate limits run their own cooldown path and auth failures mark the key
    /// unhealthy directly, so neither feeds the breaker.
    #[must_use]
    pub fn affects_breaker(&self) -> bool {
        match self {
            ProxyError::Transport { .. } => true,
            ProxyError::Upstream { status, .. } => (500..=599).contains(status) || *status == 529,
            _ => false,
        }
    }

    #[must_use]
    pub fn http_status(&self) -> http::StatusCode {
        match self {
            ProxyError::Validation(_) => http::StatusCode::CONFLICT,
            ProxyError::Auth(_) => http::StatusCode::UNAUTHORIZED,
            ProxyError::RateLimit { .. } => http::StatusCode::TOO_MANY_REQUESTS,
            ProxyError::AdmissionTimeout(_) => http::StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Timeout(_) => http::StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Upstream { status, .. } => http::StatusCode::from_u16(*status)
                .unwrap_or(http::StatusCode::BAD_GATEWAY),
            ProxyError::Transport { .. } => http::StatusCode::BAD_GATEWAY,
            ProxyError::ClientDisconnect => http::StatusCode::BAD_REQUEST,
            ProxyError::Config(_) | ProxyError::Internal(_) => {
                http::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Client-facing JSON body: stable kind, short reason, no sensitive data.
    #[must_use]
    pub fn client_body(&self) -> serde_json::Value {
        let message = match self {
            // Internal context stays in the logs.
            ProxyError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        serde_json::json!({
            "error": {
                "kind": self.kind(),
                "message": message,
            }
        })
    }
}

/// Classify a transport-level message from the HTTP client into a kind.
#[must_use]
pub fn classify_transport_message(message: &str) -> TransportKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("dns") || lower.contains("resolve") {
        TransportKind::Dns
    } else if lower.contains("tls") || lower.contains("certificate") || lower.contains("handshake")
    {
        TransportKind::Tls
    } else if lower.contains("connection refused") {
        TransportKind::ConnectionRefused
    } else if lower.contains("broken pipe") {
        TransportKind::BrokenPipe
    } else if lower.contains("unexpected eof") || lower.contains("premature") {
        TransportKind::StreamPrematureClose
    } else if lower.contains("parse") || lower.contains("invalid http") {
        TransportKind::HttpParse
    } else {
        TransportKind::SocketHangup
    }
}

impl axum::response::IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        (self.http_status(), axum::Json(self.client_body())).into_response()
    }
}
