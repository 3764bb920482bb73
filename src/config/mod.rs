pub mod validation;

use serde::{Deserialize, Serialize};

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Whole-request timeout in seconds applied when a policy carries no
    /// tighter deadline.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    pub http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    pub http_pool_idle_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_max_blocking_threads: Option<usize>,
    #[serde(default)]
    pub base_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_reuse_port_listener_count: Option<usize>,
}

fn default_port() -> u16 {
    8790
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_timeout() -> u64 {
    180
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            timeout: default_timeout(),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
            runtime_worker_threads: None,
            runtime_max_blocking_threads: Some(8),
            base_path: String::new(),
            tcp_reuse_port_listener_count: None,
        }
    }
}

/// One upstream credential in the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    /// Opaque identifier shown in stats and logs; never the secret itself.
    pub id: String,
    pub api_key: String,
    #[serde(default = "default_key_max_concurrency")]
    pub max_concurrency: u32,
}

fn default_key_max_concurrency() -> u32 {
    4
}

/// Upstream provider endpoint shared by every key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default = "default_messages_path")]
    pub messages_path: String,
    #[serde(default = "default_auth_header")]
    pub auth_header: String,
}

fn default_messages_path() -> String {
    "/v1/messages".to_string()
}
fn default_auth_header() -> String {
    "x-api-key".to_string()
}

/// A model the router may select, with its pricing and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    /// Home tier: light, medium or heavy.
    pub tier: String,
    #[serde(default)]
    pub cost_per_m_input: f64,
    #[serde(default)]
    pub cost_per_m_output: f64,
    #[serde(default = "default_model_max_concurrency")]
    pub max_concurrency_per_key: u32,
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
    #[serde(default = "default_context_length")]
    pub context_length: u64,
}

fn default_model_max_concurrency() -> u32 {
    4
}
fn default_context_length() -> u64 {
    128_000
}

/// Circuit breaker tuning shared by all keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Sliding window over which failures count toward the threshold.
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    /// How long an opened circuit stays open before a half-open probe.
    #[serde(default = "default_breaker_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_latency_sample_size")]
    pub latency_sample_size: usize,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_failure_window_secs() -> u64 {
    60
}
fn default_breaker_cooldown_ms() -> u64 {
    30_000
}
fn default_latency_sample_size() -> usize {
    64
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            cooldown_ms: default_breaker_cooldown_ms(),
            latency_sample_size: default_latency_sample_size(),
        }
    }
}

/// Tier-downgrade budget applied when a whole tier is cooled or saturated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DowngradeConfig {
    #[serde(default = "default_downgrade_budget")]
    pub budget: u32,
    #[serde(default = "default_downgrade_window_secs")]
    pub window_secs: u64,
}

fn default_downgrade_budget() -> u32 {
    3
}
fn default_downgrade_window_secs() -> u64 {
    60
}

impl Default for DowngradeConfig {
    fn default() -> Self {
        Self {
            budget: default_downgrade_budget(),
            window_secs: default_downgrade_window_secs(),
        }
    }
}

/// Webhook notification settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_webhook_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_webhook_max_retries")]
    pub max_retries: u32,
    /// Error-spike detection: fire when this many errors land within the window.
    #[serde(default = "default_error_spike_threshold")]
    pub error_spike_threshold: u32,
    #[serde(default = "default_error_spike_window_secs")]
    pub error_spike_window_secs: u64,
}

fn default_webhook_dedup_window_secs() -> u64 {
    60
}
fn default_webhook_max_retries() -> u32 {
    3
}
fn default_error_spike_threshold() -> u32 {
    10
}
fn default_error_spike_window_secs() -> u64 {
    60
}

/// Replay queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default = "default_replay_capacity")]
    pub capacity: usize,
    #[serde(default = "default_replay_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_replay_retention_secs")]
    pub retention_secs: u64,
}

fn default_replay_capacity() -> usize {
    500
}
fn default_replay_max_retries() -> u32 {
    3
}
fn default_replay_retention_secs() -> u64 {
    3_600
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            capacity: default_replay_capacity(),
            max_retries: default_replay_max_retries(),
            retention_secs: default_replay_retention_secs(),
        }
    }
}

/// Admin authentication: opaque bearer tokens for mutating endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdminAuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tokens: Vec<String>,
}

/// Paths of files the proxy owns on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_routing_path")]
    pub routing_config: String,
    #[serde(default = "default_policy_path")]
    pub policy_file: String,
    #[serde(default = "default_stats_path")]
    pub stats_snapshot: String,
}

fn default_routing_path() -> String {
    "model-routing.json".to_string()
}
fn default_policy_path() -> String {
    "policies.json".to_string()
}
fn default_stats_path() -> String {
    "stats-snapshot.json".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            routing_config: default_routing_path(),
            policy_file: default_policy_path(),
            stats_snapshot: default_stats_path(),
        }
    }
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_trace_capacity")]
    pub trace_capacity: usize,
    #[serde(default = "default_true")]
    pub persist_routing_changes: bool,
    #[serde(default = "default_stats_autosave_secs")]
    pub stats_autosave_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_trace_capacity() -> usize {
    1_000
}
fn default_stats_autosave_secs() -> u64 {
    60
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            trace_capacity: default_trace_capacity(),
            persist_routing_changes: true,
            stats_autosave_secs: default_stats_autosave_secs(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub keys: Vec<KeyConfig>,
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub downgrade: DowngradeConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub admin_auth: AdminAuthConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_yaml::from_str(&contents)?;
    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
upstream:
  base_url: "https://api.example.com"
keys:
  - id: key-0
    api_key: sk-test-0
  - id: key-1
    api_key: sk-test-1
    max_concurrency: 8
models:
  - id: glm-4-air
    tier: light
    cost_per_m_input: 0.10
    cost_per_m_output: 0.10
  - id: glm-4-plus
    tier: heavy
    cost_per_m_input: 5.0
    cost_per_m_output: 15.0
"#
    }

    #[test]
    fn test_load_example_config() {
        // The example config should load and validate successfully
        let config = load_config("config.example.yaml");
        assert!(
            config.is_ok(),
            "Failed to load example config: {:?}",
            config.err()
        );
        let config = config.unwrap();
        assert_eq!(config.server.port, 8790);
        assert_eq!(config.keys.len(), 2);
        assert_eq!(config.models.len(), 4);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert!(!config.admin_auth.enabled);
    }

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: AppConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert_eq!(config.server.port, 8790);
        assert_eq!(config.keys.len(), 2);
        assert_eq!(config.keys[0].max_concurrency, 4);
        assert_eq!(config.keys[1].max_concurrency, 8);
        assert_eq!(config.upstream.messages_path, "/v1/messages");
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.downgrade.budget, 3);
        assert_eq!(config.downgrade.window_secs, 60);
        assert_eq!(config.paths.routing_config, "model-routing.json");
        assert!(config.features.persist_routing_changes);
    }

    #[test]
    fn test_model_defaults() {
        let config: AppConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        let model = &config.models[0];
        assert_eq!(model.max_concurrency_per_key, 4);
        assert!(model.supports_streaming);
        assert!(!model.supports_vision);
        assert_eq!(model.context_length, 128_000);
    }
}
