//! Admin authentication: opaque bearer tokens for mutating endpoints.

use rustc_hash::FxHashSet;

use crate::config::AppConfig;
use crate::error::ProxyError;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Prebuilt token set; comparison cost does not depend on which token
/// matched.
pub struct AdminTokens {
    enabled: bool,
    tokens: FxHashSet<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    pub enabled: bool,
    pub tokens_configured: usize,
    pub tokens_required: bool,
    pub authenticated: bool,
}

impl AdminTokens {
    #[must_use]
    pub fn new(config: &AppConfig) -> Self {
        Self {
            enabled: config.admin_auth.enabled,
            tokens: config
                .admin_auth
                .tokens
                .iter()
                .filter(|token| !token.trim().is_empty())
                .cloned()
                .collect(),
        }
    }

    /// Authenticate an admin request via the token header.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Auth`] when auth is enabled and the header is
    /// missing or carries an unknown token.
    pub fn authenticate(&self, headers: &http::HeaderMap) -> Result<(), ProxyError> {
        if !self.enabled {
            return Ok(());
        }
        let presented = headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if presented.is_empty() {
            return Err(ProxyError::Auth("missing admin token".to_string()));
        }
        if self.verify(presented) {
            Ok(())
        } else {
            Err(ProxyError::Auth("invalid admin token".to_string()))
        }
    }

    /// Constant-shape membership test: every configured token is compared.
    fn verify(&self, presented: &str) -> bool {
        let mut matched = false;
        for token in &self.tokens {
            matched |= constant_time_eq(token.as_bytes(), presented.as_bytes());
        }
        matched
    }

    #[must_use]
    pub fn status(&self, headers: &http::HeaderMap) -> AuthStatus {
        AuthStatus {
            enabled: self.enabled,
            tokens_configured: self.tokens.len(),
            tokens_required: self.enabled && !self.tokens.is_empty(),
            authenticated: self.authenticate(headers).is_ok(),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0_u8;
    for (left, right) in a.iter().zip(b.iter()) {
        diff |= left ^ right;
    }
    diff == 0
}
