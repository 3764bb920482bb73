use std::collections::HashSet;

use super::{AppConfig, ConfigError};

pub(crate) const VALID_TIERS: &[&str] = &["light", "medium", "heavy"];

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_keys(config)?;
    validate_upstream(config)?;
    validate_models(config)?;
    validate_breaker(config)?;
    validate_replay(config)?;
    validate_webhook(config)?;
    validate_admin_auth(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    if let Some(max_blocking_threads) = server.runtime_max_blocking_threads {
        if max_blocking_threads == 0 {
            return Err(validation_err(
                "server.runtime_max_blocking_threads must be greater than 0 when set",
            ));
        }
    }
    if let Some(listener_count) = server.tcp_reuse_port_listener_count {
        if listener_count == 0 {
            return Err(validation_err(
                "server.tcp_reuse_port_listener_count must be greater than 0 when set",
            ));
        }
    }
    Ok(())
}

fn validate_keys(config: &AppConfig) -> Result<(), ConfigError> {
    if config.keys.is_empty() {
        return Err(validation_err("keys cannot be empty"));
    }

    let mut seen = HashSet::new();
    for key in &config.keys {
        if key.id.trim().is_empty() {
            return Err(validation_err("keys contains an entry with an empty id"));
        }
        if key.api_key.trim().is_empty() {
            return Err(validation_err(format!(
                "Key '{}': api_key cannot be empty",
                key.id
            )));
        }
        if key.max_concurrency == 0 {
            return Err(validation_err(format!(
                "Key '{}': max_concurrency must be at least 1",
                key.id
            )));
        }
        if !seen.insert(key.id.as_str()) {
            return Err(validation_err(format!("Duplicate key id '{}'", key.id)));
        }
    }
    Ok(())
}

fn validate_upstream(config: &AppConfig) -> Result<(), ConfigError> {
    let upstream = &config.upstream;
    if !upstream.base_url.starts_with("http://") && !upstream.base_url.starts_with("https://") {
        return Err(validation_err(
            "upstream.base_url must start with http:// or https://",
        ));
    }
    if !upstream.messages_path.starts_with('/') {
        return Err(validation_err("upstream.messages_path must start with '/'"));
    }
    if upstream.auth_header.trim().is_empty() {
        return Err(validation_err("upstream.auth_header cannot be empty"));
    }
    Ok(())
}

fn validate_models(config: &AppConfig) -> Result<(), ConfigError> {
    if config.models.is_empty() {
        return Err(validation_err("models cannot be empty"));
    }

    let mut seen = HashSet::new();
    for model in &config.models {
        if model.id.trim().is_empty() {
            return Err(validation_err("models contains an entry with an empty id"));
        }
        if !VALID_TIERS.contains(&model.tier.as_str()) {
            return Err(validation_err(format!(
                "Model '{}': unknown tier '{}'. Must be one of: {}",
                model.id,
                model.tier,
                VALID_TIERS.join(", ")
            )));
        }
        if model.cost_per_m_input < 0.0 || model.cost_per_m_output < 0.0 {
            return Err(validation_err(format!(
                "Model '{}': costs must not be negative",
                model.id
            )));
        }
        if model.max_concurrency_per_key == 0 {
            return Err(validation_err(format!(
                "Model '{}': max_concurrency_per_key must be at least 1",
                model.id
            )));
        }
        if !seen.insert(model.id.as_str()) {
            return Err(validation_err(format!("Duplicate model id '{}'", model.id)));
        }
    }
    Ok(())
}

fn validate_breaker(config: &AppConfig) -> Result<(), ConfigError> {
    let breaker = &config.breaker;
    if breaker.failure_threshold == 0 {
        return Err(validation_err(
            "breaker.failure_threshold must be at least 1",
        ));
    }
    if breaker.failure_window_secs == 0 {
        return Err(validation_err(
            "breaker.failure_window_secs must be at least 1",
        ));
    }
    if breaker.latency_sample_size == 0 {
        return Err(validation_err(
            "breaker.latency_sample_size must be at least 1",
        ));
    }
    Ok(())
}

fn validate_replay(config: &AppConfig) -> Result<(), ConfigError> {
    let replay = &config.replay;
    if !(1..=10_000).contains(&replay.capacity) {
        return Err(validation_err(
            "replay.capacity must be between 1 and 10000",
        ));
    }
    if replay.max_retries > 100 {
        return Err(validation_err("replay.max_retries must be at most 100"));
    }
    if !(1..=7 * 24 * 3_600).contains(&replay.retention_secs) {
        return Err(validation_err(
            "replay.retention_secs must be between 1 second and 7 days",
        ));
    }
    Ok(())
}

fn validate_webhook(config: &AppConfig) -> Result<(), ConfigError> {
    let webhook = &config.webhook;
    if let Some(url) = &webhook.url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(validation_err(
                "webhook.url must start with http:// or https://",
            ));
        }
        if webhook.secret.as_deref().is_none_or(|s| s.trim().is_empty()) {
            return Err(validation_err(
                "webhook.secret is required when webhook.url is set",
            ));
        }
    }
    Ok(())
}

fn validate_admin_auth(config: &AppConfig) -> Result<(), ConfigError> {
    let auth = &config.admin_auth;
    if auth.enabled && auth.tokens.iter().all(|token| token.trim().is_empty()) {
        return Err(validation_err(
            "admin_auth.tokens must contain at least one non-empty token when enabled",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AdminAuthConfig, BreakerConfig, DowngradeConfig, FeaturesConfig, KeyConfig, ModelConfig,
        PathsConfig, ReplayConfig, ServerConfig, UpstreamConfig, WebhookConfig,
    };

    fn base_config() -> AppConfig {
        AppConfig {
            server: ServerConfig::default(),
            upstream: UpstreamConfig {
                base_url: "https://api.example.com".to_string(),
                messages_path: "/v1/messages".to_string(),
                auth_header: "x-api-key".to_string(),
            },
            keys: vec![KeyConfig {
                id: "key-0".to_string(),
                api_key: "sk-test".to_string(),
                max_concurrency: 4,
            }],
            models: vec![ModelConfig {
                id: "glm-4-air".to_string(),
                tier: "light".to_string(),
                cost_per_m_input: 0.1,
                cost_per_m_output: 0.1,
                max_concurrency_per_key: 4,
                supports_vision: false,
                supports_streaming: true,
                context_length: 128_000,
            }],
            breaker: BreakerConfig::default(),
            downgrade: DowngradeConfig::default(),
            webhook: WebhookConfig::default(),
            replay: ReplayConfig::default(),
            admin_auth: AdminAuthConfig::default(),
            paths: PathsConfig::default(),
            features: FeaturesConfig::default(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(validate_config(&base_config()).is_ok());
    }

    #[test]
    fn test_empty_keys_rejected() {
        let mut config = base_config();
        config.keys.clear();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_duplicate_key_ids_rejected() {
        let mut config = base_config();
        let duplicate = config.keys[0].clone();
        config.keys.push(duplicate);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = base_config();
        config.keys[0].max_concurrency = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_unknown_tier_rejected() {
        let mut config = base_config();
        config.models[0].tier = "ultra".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_bad_base_url_rejected() {
        let mut config = base_config();
        config.upstream.base_url = "ftp://example.com".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_webhook_url_requires_secret() {
        let mut config = base_config();
        config.webhook.url = Some("https://hooks.example.com/x".to_string());
        assert!(validate_config(&config).is_err());
        config.webhook.secret = Some("shh".to_string());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_replay_capacity_bounds() {
        let mut config = base_config();
        config.replay.capacity = 0;
        assert!(validate_config(&config).is_err());
        config.replay.capacity = 10_001;
        assert!(validate_config(&config).is_err());
        config.replay.capacity = 10_000;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_admin_auth_enabled_requires_token() {
        let mut config = base_config();
        config.admin_auth.enabled = true;
        assert!(validate_config(&config).is_err());
        config.admin_auth.tokens = vec!["tok".to_string()];
        assert!(validate_config(&config).is_ok());
    }
}
