//! End-to-end selection behavior: policy matching over the wire shapes,
//! deterministic tiebreaks, and circuit breaker failover choreography.

use std::sync::Arc;

use serde_json::json;

use keyway::config::KeyConfig;
use keyway::keys::{BreakerSettings, CircuitState, KeyManager};
use keyway::policy::{MatchRequest, PolicyManager};
use keyway::router::normalize::{normalize, NormalizeMode};
use keyway::router::{ModelRouter, RequestFeatures};

fn app_config() -> keyway::config::AppConfig {
    serde_yaml::from_str(
        r#"
upstream:
  base_url: "https://api.example.com"
keys:
  - { id: key-0, api_key: sk-0, max_concurrency: 50 }
models:
  - { id: glm-4-air, tier: light, cost_per_m_input: 0.05, cost_per_m_output: 0.05, max_concurrency_per_key: 10 }
  - { id: glm-4-flash, tier: light, cost_per_m_input: 0.05, cost_per_m_output: 0.05, max_concurrency_per_key: 10 }
"#,
    )
    .unwrap()
}

fn key_manager(key_count: usize, cooldown_ms: u64) -> Arc<KeyManager> {
    let keys: Vec<KeyConfig> = (0..key_count)
        .map(|index| KeyConfig {
            id: format!("key-{index}"),
            api_key: format!("sk-{index}"),
            max_concurrency: 10,
        })
        .collect();
    Arc::new(KeyManager::with_settings(
        &keys,
        BreakerSettings {
            failure_threshold: 5,
            failure_window_ms: 60_000,
            cooldown_ms,
            latency_sample_size: 16,
        },
    ))
}

fn upstream_503() -> keyway::error::ProxyError {
    keyway::error::ProxyError::Upstream {
        status: 503,
        message: "unavailable".into(),
    }
}

#[test]
fn policy_file_matching_merges_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policies.json");
    std::fs::write(
        &path,
        serde_json::to_string(&json!({
            "policies": [{
                "name": "v1-claude",
                "match": {
                    "paths": ["/v1/*"],
                    "methods": ["POST"],
                    "models": ["claude-*"]
                },
                "retryBudget": 10
            }]
        }))
        .unwrap(),
    )
    .unwrap();

    let manager = PolicyManager::new(&path);
    assert!(manager.load().success);

    let matched = manager.match_request(&MatchRequest {
        path: "/v1/messages",
        method: "POST",
        model: "claude-3-opus",
    });
    assert_eq!(matched.retry_budget, 10);
    assert_eq!(matched.max_queue_time_ms, 30_000);

    let unmatched = manager.match_request(&MatchRequest {
        path: "/v2/messages",
        method: "POST",
        model: "claude-3-opus",
    });
    assert_eq!(unmatched.source, "default");
    assert_eq!(unmatched.retry_budget, 3);
}

#[test]
fn fully_tied_candidates_break_ties_by_name() {
    // Both models share availability, cost and capacity; throughput and
    // pool must both order glm-4-air before glm-4-flash.
    for strategy in ["throughput", "pool"] {
        let routing = normalize(
            &json!({
                "tiers": {
                    "light": { "models": ["glm-4-flash", "glm-4-air"], "strategy": strategy }
                }
            }),
            NormalizeMode::Full,
        )
        .config;
        let router = ModelRouter::new(&app_config(), routing);
        let keys = key_manager(5, 30_000);

        let features = RequestFeatures {
            model: "glm-4-flash".to_string(),
            ..RequestFeatures::default()
        };
        let decision = router.resolve(&features, None, &keys);
        assert_eq!(
            decision.selected_model.as_deref(),
            Some("glm-4-air"),
            "strategy {strategy}"
        );
        assert_eq!(decision.candidates, vec!["glm-4-air", "glm-4-flash"]);
    }
}

#[test]
fn circuit_opens_fails_over_and_recovers_through_half_open() {
    let keys = key_manager(2, 50);

    // Drive key 0 to the threshold with consecutive upstream 5xx failures.
    for _ in 0..5 {
        let held: Vec<_> = (0..20).filter_map(|_| keys.try_acquire(10)).collect();
        let on_key_0 = held
            .into_iter()
            .find(|permit| permit.key_index() == 0)
            .expect("key 0 has free slots");
        on_key_0.complete_failure(&upstream_503());
    }
    assert_eq!(keys.reports()[0].circuit, CircuitState::Open);

    // The sixth attempt must land on the other key.
    let permit = keys.try_acquire(10).unwrap();
    assert_eq!(permit.key_index(), 1);
    permit.complete_success(15);

    // After the cooldown the first probe goes to key 0 in half-open; a
    // single success closes the circuit again.
    std::thread::sleep(std::time::Duration::from_millis(60));
    let probe = keys.try_acquire(10).unwrap();
    assert_eq!(probe.key_index(), 0);
    assert_eq!(keys.reports()[0].circuit, CircuitState::HalfOpen);
    probe.complete_success(20);
    assert_eq!(keys.reports()[0].circuit, CircuitState::Closed);
}

#[test]
fn open_circuit_never_lends_slots() {
    let keys = key_manager(1, 60_000);
    for _ in 0..5 {
        let permit = keys.try_acquire(10).unwrap();
        permit.complete_failure(&upstream_503());
    }
    assert_eq!(keys.reports()[0].circuit, CircuitState::Open);
    assert!(keys.try_acquire(10).is_none());

    let availability = keys.model_availability(10);
    assert!(!availability.is_eligible());
    assert!(availability.fully_cooled());
}

#[test]
fn router_reports_hold_when_pool_is_exhausted() {
    let routing = normalize(
        &json!({ "tiers": { "light": { "models": ["glm-4-air"] } } }),
        NormalizeMode::Full,
    )
    .config;
    let router = ModelRouter::new(&app_config(), routing);
    let keys = key_manager(1, 30_000);

    let held: Vec<_> = (0..10).filter_map(|_| keys.try_acquire(10)).collect();
    assert_eq!(held.len(), 10);

    let features = RequestFeatures {
        model: "glm-4-air".to_string(),
        ..RequestFeatures::default()
    };
    let decision = router.resolve(&features, None, &keys);
    // Saturation is a back-pressure signal, not a routing failure.
    assert!(decision.selected_model.is_none());
    assert!(decision
        .cooldown_reasons
        .iter()
        .any(|reason| reason.contains("saturated")));

    drop(held);
    let decision = router.resolve(&features, None, &keys);
    assert_eq!(decision.selected_model.as_deref(), Some("glm-4-air"));
}
