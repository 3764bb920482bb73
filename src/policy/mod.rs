//! Route policies: per-route retry budgets, queue limits, pacing and tracing
//! controls, matched by path/method/model with first-match-wins priority.

pub(crate) mod matcher;
pub mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

pub const DEFAULT_RETRY_BUDGET: u32 = 3;
pub const DEFAULT_MAX_QUEUE_TIME_MS: u64 = 30_000;
pub const DEFAULT_TRACE_SAMPLE_RATE: u8 = 100;
pub const DEFAULT_MAX_BODY_SIZE: usize = 64 * 1024;

/// Match block: every present criterion must match; absent criteria match
/// everything. A policy without a match block never matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PolicyMatch {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacingPolicy {
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_burst() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracingPolicy {
    pub sample_rate: u8,
    pub include_body: bool,
    pub max_body_size: usize,
}

impl Default for TracingPolicy {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_TRACE_SAMPLE_RATE,
            include_body: false,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryMode {
    #[default]
    Normal,
    Drop,
    Sample,
}

/// Partial tracing overrides as stored in the policy file; unset fields fall
/// through to the default policy (nested-object merge).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TracingOverlay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_body: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_body_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryOverlay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<TelemetryMode>,
}

/// A stored route policy. Option fields distinguish "unset, inherit the
/// default" from an explicit value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePolicy {
    pub name: String,
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub matcher: Option<PolicyMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_budget: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queue_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pacing: Option<PacingPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracing: Option<TracingOverlay>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<TelemetryOverlay>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// The fully-resolved policy a request runs under.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectivePolicy {
    /// Name of the matched policy, or "default".
    pub source: String,
    pub retry_budget: u32,
    pub max_queue_time_ms: u64,
    pub pacing: Option<PacingPolicy>,
    pub tracing: TracingPolicy,
    pub telemetry_mode: TelemetryMode,
}

impl Default for EffectivePolicy {
    fn default() -> Self {
        Self {
            source: "default".to_string(),
            retry_budget: DEFAULT_RETRY_BUDGET,
            max_queue_time_ms: DEFAULT_MAX_QUEUE_TIME_MS,
            pacing: None,
            tracing: TracingPolicy::default(),
            telemetry_mode: TelemetryMode::Normal,
        }
    }
}

impl EffectivePolicy {
    /// Deep-merge a policy over the defaults: scalars replace, the nested
    /// tracing/telemetry objects merge field-by-field.
    #[must_use]
    fn merged_from(policy: &RoutePolicy) -> Self {
        let mut effective = Self {
            source: policy.name.clone(),
            ..Self::default()
        };
        if let Some(retry_budget) = policy.retry_budget {
            effective.retry_budget = retry_budget;
        }
        if let Some(max_queue_time) = policy.max_queue_time {
            effective.max_queue_time_ms = max_queue_time;
        }
        if let Some(pacing) = policy.pacing {
            effective.pacing = Some(pacing);
        }
        if let Some(tracing) = &policy.tracing {
            if let Some(sample_rate) = tracing.sample_rate {
                effective.tracing.sample_rate = sample_rate;
            }
            if let Some(include_body) = tracing.include_body {
                effective.tracing.include_body = include_body;
            }
            if let Some(max_body_size) = tracing.max_body_size {
                effective.tracing.max_body_size = max_body_size;
            }
        }
        if let Some(telemetry) = &policy.telemetry {
            if let Some(mode) = telemetry.mode {
                effective.telemetry_mode = mode;
            }
        }
        effective
    }
}

/// The request attributes policies match on.
#[derive(Debug, Clone, Copy)]
pub struct MatchRequest<'a> {
    pub path: &'a str,
    pub method: &'a str,
    pub model: &'a str,
}

/// Report handed to the reload callback.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadReport {
    pub success: bool,
    pub policies_loaded: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct PolicyFile {
    #[serde(default)]
    policies: Vec<RoutePolicy>,
}

type ReloadCallback = Box<dyn Fn(&ReloadReport) + Send + Sync>;

/// Owns the policy set. Readers grab an immutable snapshot; reloads and CRUD
/// swap in a new sorted vector.
pub struct PolicyManager {
    path: PathBuf,
    /// Sorted descending by priority.
    policies: ArcSwap<Vec<RoutePolicy>>,
    on_reload: Mutex<Option<ReloadCallback>>,
}

impl PolicyManager {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            policies: ArcSwap::from_pointee(Vec::new()),
            on_reload: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_reload_callback<F>(&self, callback: F)
    where
        F: Fn(&ReloadReport) + Send + Sync + 'static,
    {
        *self.on_reload.lock() = Some(Box::new(callback));
    }

    /// Load the policy file. Missing files yield an empty policy set; that is
    /// a fresh deployment, not an error.
    pub fn load(&self) -> ReloadReport {
        let report = self.reload_from_disk();
        if let Some(callback) = self.on_reload.lock().as_ref() {
            callback(&report);
        }
        report
    }

    /// Re-read the policy file, dropping invalid entries with warnings.
    pub fn reload(&self) -> ReloadReport {
        self.load()
    }

    fn reload_from_disk(&self) -> ReloadReport {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.policies.store(Arc::new(Vec::new()));
                return ReloadReport {
                    success: true,
                    policies_loaded: 0,
                    errors: Vec::new(),
                };
            }
            Err(err) => {
                return ReloadReport {
                    success: false,
                    policies_loaded: self.policies.load().len(),
                    errors: vec![format!("failed to read {}: {err}", self.path.display())],
                }
            }
        };

        let file: PolicyFile = match serde_json::from_str(&contents) {
            Ok(file) => file,
            Err(err) => {
                return ReloadReport {
                    success: false,
                    policies_loaded: self.policies.load().len(),
                    errors: vec![format!("failed to parse {}: {err}", self.path.display())],
                }
            }
        };

        let mut errors = Vec::new();
        let mut valid = Vec::with_capacity(file.policies.len());
        let mut seen = std::collections::HashSet::new();
        for policy in file.policies {
            if let Err(err) = validate_policy(&policy) {
                errors.push(format!("policy '{}' dropped: {err}", policy.name));
                continue;
            }
            if !seen.insert(policy.name.clone()) {
                errors.push(format!("duplicate policy name '{}' dropped", policy.name));
                continue;
            }
            valid.push(policy);
        }

        for error in &errors {
            tracing::warn!("{error}");
        }

        self.install(valid.clone());
        ReloadReport {
            success: true,
            policies_loaded: valid.len(),
            errors,
        }
    }

    fn install(&self, mut policies: Vec<RoutePolicy>) {
        policies.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        self.policies.store(Arc::new(policies));
    }

    /// Match a request to the highest-priority enabled policy, deep-merged
    /// over the defaults. No match yields the default policy.
    #[must_use]
    pub fn match_request(&self, request: &MatchRequest<'_>) -> EffectivePolicy {
        let policies = self.policies.load();
        for policy in policies.iter() {
            if !policy.enabled {
                continue;
            }
            let Some(matcher) = &policy.matcher else {
                continue;
            };
            if policy_matches(matcher, request) {
                return EffectivePolicy::merged_from(policy);
            }
        }
        EffectivePolicy::default()
    }

    /// Add a policy with a unique name.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Validation`] for invalid or duplicate policies;
    /// server state is unchanged on error.
    pub fn add(&self, policy: RoutePolicy) -> Result<(), ProxyError> {
        validate_policy(&policy).map_err(ProxyError::Validation)?;
        let current = self.policies.load();
        if current.iter().any(|existing| existing.name == policy.name) {
            return Err(ProxyError::Validation(format!(
                "policy '{}' already exists",
                policy.name
            )));
        }
        let mut next = current.as_ref().clone();
        next.push(policy);
        self.install(next);
        self.persist()
    }

    /// Replace a policy by name.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Validation`] when the policy is invalid or the
    /// name is unknown.
    pub fn update(&self, policy: RoutePolicy) -> Result<(), ProxyError> {
        validate_policy(&policy).map_err(ProxyError::Validation)?;
        let current = self.policies.load();
        let mut next = current.as_ref().clone();
        let Some(slot) = next.iter_mut().find(|existing| existing.name == policy.name) else {
            return Err(ProxyError::Validation(format!(
                "policy '{}' does not exist",
                policy.name
            )));
        };
        *slot = policy;
        self.install(next);
        self.persist()
    }

    /// Remove a policy by name.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Validation`] when the name is unknown.
    pub fn remove(&self, name: &str) -> Result<(), ProxyError> {
        let current = self.policies.load();
        let mut next = current.as_ref().clone();
        let before = next.len();
        next.retain(|policy| policy.name != name);
        if next.len() == before {
            return Err(ProxyError::Validation(format!(
                "policy '{name}' does not exist"
            )));
        }
        self.install(next);
        self.persist()
    }

    #[must_use]
    pub fn list(&self) -> Vec<RoutePolicy> {
        self.policies.load().as_ref().clone()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<RoutePolicy> {
        self.policies
            .load()
            .iter()
            .find(|policy| policy.name == name)
            .cloned()
    }

    fn persist(&self) -> Result<(), ProxyError> {
        let file = PolicyFile {
            policies: self.policies.load().as_ref().clone(),
        };
        let body = serde_json::to_string_pretty(&file)
            .map_err(|err| ProxyError::Internal(format!("failed to serialize policies: {err}")))?;
        std::fs::write(&self.path, body).map_err(|err| {
            ProxyError::Internal(format!(
                "failed to write {}: {err}",
                self.path.display()
            ))
        })
    }
}

fn policy_matches(matcher: &PolicyMatch, request: &MatchRequest<'_>) -> bool {
    if !matcher.paths.is_empty()
        && !matcher
            .paths
            .iter()
            .any(|pattern| matcher::path_pattern_matches(pattern, request.path))
    {
        return false;
    }
    if !matcher.methods.is_empty() {
        let method = request.method.to_ascii_lowercase();
        if !matcher
            .methods
            .iter()
            .any(|candidate| candidate.to_ascii_lowercase() == method)
        {
            return false;
        }
    }
    if !matcher.models.is_empty()
        && !matcher
            .models
            .iter()
            .any(|pattern| matcher::model_pattern_matches(pattern, request.model))
    {
        return false;
    }
    true
}

fn validate_policy(policy: &RoutePolicy) -> Result<(), String> {
    if policy.name.trim().is_empty() {
        return Err("name cannot be empty".to_string());
    }
    if let Some(tracing) = &policy.tracing {
        if tracing.sample_rate.is_some_and(|rate| rate > 100) {
            return Err("tracing.sampleRate must be within 0..=100".to_string());
        }
    }
    if let Some(pacing) = &policy.pacing {
        if !pacing.requests_per_second.is_finite() || pacing.requests_per_second <= 0.0 {
            return Err("pacing.requestsPerSecond must be positive".to_string());
        }
        if pacing.burst == 0 {
            return Err("pacing.burst must be at least 1".to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_json(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("policies.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn request<'a>(path: &'a str, method: &'a str, model: &'a str) -> MatchRequest<'a> {
        MatchRequest {
            path,
            method,
            model,
        }
    }

    #[test]
    fn test_match_and_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = policy_json(
            dir.path(),
            r#"{ "policies": [ {
                "name": "v1-claude",
                "match": { "paths": ["/v1/*"], "methods": ["POST"], "models": ["claude-*"] },
                "retryBudget": 10
            } ] }"#,
        );
        let manager = PolicyManager::new(path);
        assert!(manager.load().success);

        let matched = manager.match_request(&request("/v1/messages", "POST", "claude-3-opus"));
        assert_eq!(matched.source, "v1-claude");
        assert_eq!(matched.retry_budget, 10);
        // Unset fields inherit the defaults.
        assert_eq!(matched.max_queue_time_ms, 30_000);

        let unmatched = manager.match_request(&request("/v2/messages", "POST", "claude-3-opus"));
        assert_eq!(unmatched.source, "default");
        assert_eq!(unmatched.retry_budget, 3);
    }

    #[test]
    fn test_priority_order_first_match_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = policy_json(
            dir.path(),
            r#"{ "policies": [
                { "name": "low", "priority": 1, "match": { "paths": ["/v1/"] }, "retryBudget": 1 },
                { "name": "high", "priority": 10, "match": { "paths": ["/v1/"] }, "retryBudget": 9 }
            ] }"#,
        );
        let manager = PolicyManager::new(path);
        manager.load();
        let matched = manager.match_request(&request("/v1/messages", "POST", "m"));
        assert_eq!(matched.source, "high");
        assert_eq!(matched.retry_budget, 9);
    }

    #[test]
    fn test_disabled_and_matchless_policies_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = policy_json(
            dir.path(),
            r#"{ "policies": [
                { "name": "off", "priority": 10, "enabled": false, "match": {}, "retryBudget": 7 },
                { "name": "no-match-block", "priority": 9, "retryBudget": 8 },
                { "name": "wildcard", "priority": 1, "match": {}, "retryBudget": 5 }
            ] }"#,
        );
        let manager = PolicyManager::new(path);
        manager.load();
        let matched = manager.match_request(&request("/anything", "GET", "any-model"));
        assert_eq!(matched.source, "wildcard");
        assert_eq!(matched.retry_budget, 5);
    }

    #[test]
    fn test_methods_match_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let path = policy_json(
            dir.path(),
            r#"{ "policies": [
                { "name": "posts", "match": { "methods": ["post"] }, "retryBudget": 2 }
            ] }"#,
        );
        let manager = PolicyManager::new(path);
        manager.load();
        assert_eq!(
            manager.match_request(&request("/x", "POST", "m")).source,
            "posts"
        );
        assert_eq!(
            manager.match_request(&request("/x", "GET", "m")).source,
            "default"
        );
    }

    #[test]
    fn test_nested_tracing_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = policy_json(
            dir.path(),
            r#"{ "policies": [ {
                "name": "sampled",
                "match": {},
                "tracing": { "sampleRate": 25 }
            } ] }"#,
        );
        let manager = PolicyManager::new(path);
        manager.load();
        let matched = manager.match_request(&request("/x", "POST", "m"));
        assert_eq!(matched.tracing.sample_rate, 25);
        // Fields absent from the overlay keep their defaults.
        assert!(!matched.tracing.include_body);
        assert_eq!(matched.tracing.max_body_size, DEFAULT_MAX_BODY_SIZE);
    }

    #[test]
    fn test_invalid_entries_dropped_with_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = policy_json(
            dir.path(),
            r#"{ "policies": [
                { "name": "", "match": {} },
                { "name": "bad-rate", "match": {}, "tracing": { "sampleRate": 300 } },
                { "name": "good", "match": {}, "retryBudget": 4 }
            ] }"#,
        );
        let manager = PolicyManager::new(path);
        let report = manager.load();
        assert!(report.success);
        assert_eq!(report.policies_loaded, 1);
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn test_missing_file_is_empty_policy_set() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PolicyManager::new(dir.path().join("absent.json"));
        let report = manager.load();
        assert!(report.success);
        assert_eq!(report.policies_loaded, 0);
        let matched = manager.match_request(&request("/x", "POST", "m"));
        assert_eq!(matched.source, "default");
    }

    #[test]
    fn test_crud_roundtrip_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.json");
        let manager = PolicyManager::new(&path);
        manager.load();

        let policy = RoutePolicy {
            name: "pace-light".to_string(),
            matcher: Some(PolicyMatch {
                models: vec!["glm-*".to_string()],
                ..PolicyMatch::default()
            }),
            retry_budget: Some(2),
            max_queue_time: None,
            pacing: Some(PacingPolicy {
                requests_per_second: 5.0,
                burst: 2,
            }),
            tracing: None,
            telemetry: None,
            priority: 3,
            enabled: true,
        };
        manager.add(policy.clone()).unwrap();
        assert!(manager.add(policy.clone()).is_err()); // duplicate

        assert_eq!(manager.list().len(), 1);
        assert_eq!(manager.get("pace-light").unwrap().priority, 3);

        let mut updated = policy.clone();
        updated.retry_budget = Some(6);
        manager.update(updated).unwrap();
        assert_eq!(manager.get("pace-light").unwrap().retry_budget, Some(6));

        // A second manager sees the persisted state.
        let reloaded = PolicyManager::new(&path);
        reloaded.load();
        assert_eq!(reloaded.list().len(), 1);

        manager.remove("pace-light").unwrap();
        assert!(manager.remove("pace-light").is_err());
        assert!(manager.list().is_empty());
    }

    #[test]
    fn test_reload_callback_fires() {
        let dir = tempfile::tempdir().unwrap();
        let path = policy_json(dir.path(), r#"{ "policies": [] }"#);
        let manager = PolicyManager::new(path);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.set_reload_callback(move |report| {
            sink.lock().push(report.policies_loaded);
        });
        manager.load();
        manager.reload();
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_invalid_pacing_rejected_on_add() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PolicyManager::new(dir.path().join("p.json"));
        let policy = RoutePolicy {
            name: "bad".to_string(),
            matcher: Some(PolicyMatch::default()),
            retry_budget: None,
            max_queue_time: None,
            pacing: Some(PacingPolicy {
                requests_per_second: 0.0,
                burst: 1,
            }),
            tracing: None,
            telemetry: None,
            priority: 0,
            enabled: true,
        };
        assert!(matches!(
            manager.add(policy),
            Err(ProxyError::Validation(_))
        ));
    }
}
