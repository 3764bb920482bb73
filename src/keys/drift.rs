//! Drift detection between the router's perceived availability and the key
//! manager's ground truth.
//!
//! Runs on a periodic tick; mismatches only feed counters and logs, they
//! never block or reroute a request.

use serde::Serialize;

use super::KeyManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftReason {
    RouterAvailableKmExcluded,
    KmAvailableRouterCooled,
    ConcurrencyMismatch,
    CooldownMismatch,
}

impl DriftReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DriftReason::RouterAvailableKmExcluded => "router_available_km_excluded",
            DriftReason::KmAvailableRouterCooled => "km_available_router_cooled",
            DriftReason::ConcurrencyMismatch => "concurrency_mismatch",
            DriftReason::CooldownMismatch => "cooldown_mismatch",
        }
    }
}

/// What the router believed about one model when it last made a decision.
#[derive(Debug, Clone)]
pub struct ObservedAvailability {
    pub model: String,
    pub tier: String,
    pub available_slots: u32,
    pub in_cooldown: bool,
    pub per_key_limit: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftEvent {
    pub model: String,
    pub tier: String,
    pub reason: DriftReason,
}

/// Compare the router's cached observations against fresh key-manager truth.
#[must_use]
pub fn detect(observations: &[ObservedAvailability], manager: &KeyManager) -> Vec<DriftEvent> {
    let mut events = Vec::new();

    for observed in observations {
        let fresh = manager.model_availability(observed.per_key_limit);
        let router_thinks_available = observed.available_slots > 0 && !observed.in_cooldown;
        let km_available = fresh.is_eligible();

        if router_thinks_available && !km_available {
            events.push(event(observed, DriftReason::RouterAvailableKmExcluded));
        }
        if km_available && observed.in_cooldown {
            events.push(event(observed, DriftReason::KmAvailableRouterCooled));
        }
        if observed.available_slots != fresh.available_slots {
            events.push(event(observed, DriftReason::ConcurrencyMismatch));
        }
        if observed.in_cooldown != fresh.fully_cooled() {
            events.push(event(observed, DriftReason::CooldownMismatch));
        }
    }

    events
}

fn event(observed: &ObservedAvailability, reason: DriftReason) -> DriftEvent {
    DriftEvent {
        model: observed.model.clone(),
        tier: observed.tier.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyConfig;
    use crate::keys::BreakerSettings;
    use std::sync::Arc;

    fn manager() -> Arc<KeyManager> {
        Arc::new(KeyManager::with_settings(
            &[KeyConfig {
                id: "key-0".to_string(),
                api_key: "sk".to_string(),
                max_concurrency: 4,
            }],
            BreakerSettings {
                failure_threshold: 5,
                failure_window_ms: 60_000,
                cooldown_ms: 30_000,
                latency_sample_size: 8,
            },
        ))
    }

    fn observation(available_slots: u32, in_cooldown: bool) -> ObservedAvailability {
        ObservedAvailability {
            model: "glm-4-air".to_string(),
            tier: "light".to_string(),
            available_slots,
            in_cooldown,
            per_key_limit: 4,
        }
    }

    #[test]
    fn test_no_drift_when_views_agree() {
        let manager = manager();
        let events = detect(&[observation(4, false)], &manager);
        assert!(events.is_empty());
    }

    #[test]
    fn test_concurrency_mismatch_detected() {
        let manager = manager();
        let _permit = manager.try_acquire(4).unwrap();
        let events = detect(&[observation(4, false)], &manager);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, DriftReason::ConcurrencyMismatch);
    }

    #[test]
    fn test_router_cooled_but_km_available() {
        let manager = manager();
        let events = detect(&[observation(4, true)], &manager);
        let reasons: Vec<DriftReason> = events.iter().map(|event| event.reason).collect();
        assert!(reasons.contains(&DriftReason::KmAvailableRouterCooled));
        assert!(reasons.contains(&DriftReason::CooldownMismatch));
    }
}
