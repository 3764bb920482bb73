//! Credential pool management: per-key concurrency slots, circuit breakers,
//! rate-limit cooldowns and health reporting.

pub mod drift;
mod health;
mod state;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use crate::config::{AppConfig, KeyConfig};
use crate::error::ProxyError;
use crate::util::unix_now_ms;

pub use health::LatencySummary;
pub use state::{BreakerSettings, CircuitState, RateLimitState};

use state::KeyState;

/// Admin/stats view of one key. Scores and summaries are derived on read.
#[derive(Debug, Clone, Serialize)]
pub struct KeyReport {
    pub index: usize,
    pub id: String,
    pub circuit: CircuitState,
    pub in_flight: u32,
    pub max_concurrency: u32,
    pub total_requests: u64,
    pub success_count: u64,
    pub failures_in_window: u32,
    pub rate_limit: RateLimitState,
    pub auth_failed: bool,
    pub health_score: f64,
    pub latency: Option<LatencySummary>,
}

/// Availability of the pool for one model's per-key concurrency limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelAvailability {
    pub available_slots: u32,
    pub admissible_keys: u32,
    pub cooled_keys: u32,
    pub saturated_keys: u32,
    pub open_keys: u32,
}

impl ModelAvailability {
    /// A model is eligible when at least one key can take its traffic.
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.admissible_keys > 0
    }

    /// All capacity is gone specifically to cooldowns/open circuits rather
    /// than plain saturation.
    #[must_use]
    pub fn fully_cooled(&self) -> bool {
        self.admissible_keys == 0 && (self.cooled_keys > 0 || self.open_keys > 0)
    }
}

struct KeySlot {
    index: usize,
    id: Arc<str>,
    secret: Arc<str>,
    max_concurrency: u32,
    state: Mutex<KeyState>,
}

/// Owns every upstream credential and serializes mutation per key.
pub struct KeyManager {
    keys: Vec<KeySlot>,
    settings: BreakerSettings,
    slot_freed: Notify,
}

impl KeyManager {
    #[must_use]
    pub fn new(config: &AppConfig) -> Self {
        let settings = BreakerSettings {
            failure_threshold: config.breaker.failure_threshold,
            failure_window_ms: config.breaker.failure_window_secs * 1_000,
            cooldown_ms: config.breaker.cooldown_ms,
            latency_sample_size: config.breaker.latency_sample_size,
        };
        Self::with_settings(&config.keys, settings)
    }

    #[must_use]
    pub fn with_settings(keys: &[KeyConfig], settings: BreakerSettings) -> Self {
        let keys = keys
            .iter()
            .enumerate()
            .map(|(index, key)| KeySlot {
                index,
                id: Arc::from(key.id.as_str()),
                secret: Arc::from(key.api_key.as_str()),
                max_concurrency: key.max_concurrency.max(1),
                state: Mutex::new(KeyState::new(&settings)),
            })
            .collect();
        Self {
            keys,
            settings,
            slot_freed: Notify::new(),
        }
    }

    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn key_id(&self, index: usize) -> Option<Arc<str>> {
        self.keys.get(index).map(|key| Arc::clone(&key.id))
    }

    /// Try to lend a slot for a request pinned to a model with the given
    /// per-key concurrency limit. `None` is a back-pressure signal: the
    /// caller should enter an admission hold, not fail.
    ///
    /// A key whose circuit cooldown has elapsed takes its half-open probe
    /// before anything else, so recovered capacity returns promptly.
    /// Otherwise selection prefers the key with the most free slots, ties
    /// resolving to the lowest index.
    #[must_use]
    pub fn try_acquire(self: &Arc<Self>, per_key_limit: u32) -> Option<KeyPermit> {
        let now_ms = unix_now_ms();

        let mut best: Option<(usize, u32)> = None;
        let mut probe: Option<usize> = None;
        for key in &self.keys {
            let limit = per_key_limit.min(key.max_concurrency);
            let mut state = key.state.lock();
            let Some(candidate) = peek_available(&mut state, limit, now_ms) else {
                continue;
            };
            drop(state);
            match candidate {
                PeekOutcome::Probe => {
                    if probe.is_none() {
                        probe = Some(key.index);
                    }
                }
                PeekOutcome::Open(available) => match best {
                    Some((_, best_available)) if best_available >= available => {}
                    _ => best = Some((key.index, available)),
                },
            }
        }

        let index = probe.or(best.map(|(index, _)| index))?;
        let key = &self.keys[index];
        let limit = per_key_limit.min(key.max_concurrency);
        let mut state = key.state.lock();
        if !state.admissible(limit, now_ms) {
            return None;
        }
        state.in_flight += 1;
        drop(state);

        Some(KeyPermit {
            manager: Arc::clone(self),
            key_index: index,
            acquired_at_ms: now_ms,
            completed: false,
        })
    }

    /// Pool availability for one model's per-key limit.
    #[must_use]
    pub fn model_availability(&self, per_key_limit: u32) -> ModelAvailability {
        let now_ms = unix_now_ms();
        let mut availability = ModelAvailability::default();

        for key in &self.keys {
            let limit = per_key_limit.min(key.max_concurrency);
            let mut state = key.state.lock();
            if let Some(candidate) = peek_available(&mut state, limit, now_ms) {
                availability.admissible_keys += 1;
                availability.available_slots += match candidate {
                    PeekOutcome::Probe => 1,
                    PeekOutcome::Open(available) => available,
                };
                continue;
            }
            if state.auth_failed {
                continue;
            }
            if state.rate_limit.in_cooldown && now_ms < state.rate_limit.until_ms {
                availability.cooled_keys += 1;
            } else if matches!(state.circuit, CircuitState::Open | CircuitState::HalfOpen) {
                availability.open_keys += 1;
            } else if state.in_flight >= limit {
                availability.saturated_keys += 1;
            }
        }

        availability
    }

    /// Total pool concurrency for one model's per-key limit.
    #[must_use]
    pub fn pool_capacity(&self, per_key_limit: u32) -> u32 {
        self.keys
            .iter()
            .map(|key| per_key_limit.min(key.max_concurrency))
            .sum()
    }

    /// Wait until some slot frees or a cooldown may have expired. Used by the
    /// admission hold; spurious wakeups are fine, callers re-check.
    pub async fn slot_freed(&self) {
        self.slot_freed.notified().await;
    }

    #[must_use]
    pub fn reports(&self) -> Vec<KeyReport> {
        let now_ms = unix_now_ms();
        self.keys
            .iter()
            .map(|key| {
                let mut state = key.state.lock();
                let failures_in_window = state.failure_count(&self.settings, now_ms);
                let latency = health::summarize_latency(&state.latency_ms);
                let in_cooldown =
                    state.rate_limit.in_cooldown && now_ms < state.rate_limit.until_ms;
                let health_score = health::health_score(
                    state.total_requests,
                    state.success_count,
                    state.circuit,
                    in_cooldown,
                    latency.as_ref(),
                );
                KeyReport {
                    index: key.index,
                    id: key.id.to_string(),
                    circuit: state.circuit,
                    in_flight: state.in_flight,
                    max_concurrency: key.max_concurrency,
                    total_requests: state.total_requests,
                    success_count: state.success_count,
                    failures_in_window,
                    rate_limit: state.rate_limit.clone(),
                    auth_failed: state.auth_failed,
                    health_score,
                    latency,
                }
            })
            .collect()
    }

    /// Operator reset for a key: clears breaker, cooldown and auth flags.
    pub fn reset_key(&self, id: &str) -> bool {
        for key in &self.keys {
            if key.id.as_ref() == id {
                key.state.lock().reset();
                self.slot_freed.notify_waiters();
                return true;
            }
        }
        false
    }

    fn finish(&self, key_index: usize, outcome: PermitOutcome) {
        let Some(key) = self.keys.get(key_index) else {
            return;
        };
        let mut state = key.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        // A half-open probe that went nowhere frees the probe slot.
        if state.circuit == CircuitState::HalfOpen && matches!(outcome, PermitOutcome::Abandoned) {
            state.half_open_probe_in_flight = false;
        }
        match outcome {
            PermitOutcome::Success { latency_ms } => state.record_success(latency_ms),
            PermitOutcome::Failure { err } => {
                state.record_failure(&err, &self.settings, unix_now_ms());
            }
            PermitOutcome::Abandoned => {}
        }
        drop(state);
        self.slot_freed.notify_waiters();
    }
}

/// What a non-consuming availability check found.
#[derive(Debug, Clone, Copy)]
enum PeekOutcome {
    /// Closed circuit with this many free slots.
    Open(u32),
    /// Open-past-cooldown or half-open: exactly one probe available.
    Probe,
}

/// Availability check without consuming half-open probes or mutating flags
/// beyond expiring stale cooldowns lazily.
fn peek_available(state: &mut KeyState, limit: u32, now_ms: u64) -> Option<PeekOutcome> {
    if state.auth_failed || state.in_flight >= limit {
        return None;
    }
    if state.rate_limit.in_cooldown && now_ms < state.rate_limit.until_ms {
        return None;
    }

    match state.circuit {
        CircuitState::Closed => Some(PeekOutcome::Open(limit - state.in_flight)),
        CircuitState::Open => {
            let cooldown_until = state.cooldown_until?;
            (now_ms >= cooldown_until).then_some(PeekOutcome::Probe)
        }
        CircuitState::HalfOpen => {
            (!state.half_open_probe_in_flight).then_some(PeekOutcome::Probe)
        }
    }
}

enum PermitOutcome {
    Success { latency_ms: u32 },
    Failure { err: ProxyError },
    Abandoned,
}

/// A borrowed slot on one key. Dropping without completing releases the slot
/// with no outcome recorded, which is the cancellation path.
pub struct KeyPermit {
    manager: Arc<KeyManager>,
    key_index: usize,
    acquired_at_ms: u64,
    completed: bool,
}

impl KeyPermit {
    #[must_use]
    pub fn key_index(&self) -> usize {
        self.key_index
    }

    #[must_use]
    pub fn key_id(&self) -> Arc<str> {
        self.manager
            .key_id(self.key_index)
            .unwrap_or_else(|| Arc::from("<unknown-key>"))
    }

    /// The credential secret, for the upstream auth header only. Never logged.
    #[must_use]
    pub fn api_key(&self) -> Arc<str> {
        self.manager
            .keys
            .get(self.key_index)
            .map_or_else(|| Arc::from(""), |key| Arc::clone(&key.secret))
    }

    #[must_use]
    pub fn held_ms(&self) -> u64 {
        unix_now_ms().saturating_sub(self.acquired_at_ms)
    }

    pub fn complete_success(mut self, latency_ms: u32) {
        self.completed = true;
        self.manager
            .finish(self.key_index, PermitOutcome::Success { latency_ms });
    }

    pub fn complete_failure(mut self, err: &ProxyError) {
        self.completed = true;
        let err = clone_for_record(err);
        self.manager
            .finish(self.key_index, PermitOutcome::Failure { err });
    }
}

impl Drop for KeyPermit {
    fn drop(&mut self) {
        if !self.completed {
            self.manager.finish(self.key_index, PermitOutcome::Abandoned);
        }
    }
}

/// The key state machine only needs the error's shape, not its allocation.
fn clone_for_record(err: &ProxyError) -> ProxyError {
    match err {
        ProxyError::Upstream { status, message } => ProxyError::Upstream {
            status: *status,
            message: message.clone(),
        },
        ProxyError::RateLimit {
            retry_after_ms,
            message,
        } => ProxyError::RateLimit {
            retry_after_ms: *retry_after_ms,
            message: message.clone(),
        },
        ProxyError::Timeout(message) => ProxyError::Timeout(message.clone()),
        ProxyError::Transport { kind, message } => ProxyError::Transport {
            kind: *kind,
            message: message.clone(),
        },
        ProxyError::Auth(message) => ProxyError::Auth(message.clone()),
        ProxyError::ClientDisconnect => ProxyError::ClientDisconnect,
        ProxyError::AdmissionTimeout(message) => ProxyError::AdmissionTimeout(message.clone()),
        ProxyError::Validation(message) => ProxyError::Validation(message.clone()),
        ProxyError::Config(message) => ProxyError::Config(message.clone()),
        ProxyError::Internal(message) => ProxyError::Internal(message.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_cooldown(
        key_count: usize,
        max_concurrency: u32,
        cooldown_ms: u64,
    ) -> Arc<KeyManager> {
        let keys: Vec<KeyConfig> = (0..key_count)
            .map(|index| KeyConfig {
                id: format!("key-{index}"),
                api_key: format!("sk-{index}"),
                max_concurrency,
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

    fn manager(key_count: usize, max_concurrency: u32) -> Arc<KeyManager> {
        manager_with_cooldown(key_count, max_concurrency, 30_000)
    }

    fn upstream_503() -> ProxyError {
        ProxyError::Upstream {
            status: 503,
            message: "unavailable".into(),
        }
    }

    #[test]
    fn test_in_flight_never_exceeds_max() {
        let manager = manager(1, 2);
        let first = manager.try_acquire(8).unwrap();
        let second = manager.try_acquire(8).unwrap();
        assert!(manager.try_acquire(8).is_none());
        drop(first);
        assert!(manager.try_acquire(8).is_some());
        second.complete_success(10);
    }

    #[test]
    fn test_per_model_limit_binds_below_key_limit() {
        let manager = manager(1, 8);
        let _permit = manager.try_acquire(1).unwrap();
        assert!(manager.try_acquire(1).is_none());
        assert!(manager.try_acquire(8).is_some());
    }

    #[test]
    fn test_open_key_excluded_and_traffic_moves_over() {
        let manager = manager(2, 4);

        // Key 0 accumulates failures until its circuit opens.
        for _ in 0..5 {
            // Exhaust key-1 slots so key-0 is the only candidate.
            let holds: Vec<KeyPermit> =
                (0..4).filter_map(|_| manager.try_acquire(4)).collect();
            let on_key_0 = holds
                .into_iter()
                .find(|permit| permit.key_index() == 0)
                .expect("key 0 should be among acquired permits");
            on_key_0.complete_failure(&upstream_503());
        }

        let reports = manager.reports();
        assert_eq!(reports[0].circuit, CircuitState::Open);

        // The sixth attempt lands on the other key.
        let permit = manager.try_acquire(4).unwrap();
        assert_eq!(permit.key_index(), 1);
        permit.complete_success(10);
    }

    #[test]
    fn test_half_open_probe_and_recovery() {
        let manager = manager_with_cooldown(1, 4, 50);
        for _ in 0..5 {
            let permit = manager.try_acquire(4).unwrap();
            permit.complete_failure(&upstream_503());
        }
        assert!(manager.try_acquire(4).is_none());

        std::thread::sleep(std::time::Duration::from_millis(60));

        // First probe admitted, concurrent second refused.
        let probe = manager.try_acquire(4).unwrap();
        assert!(manager.try_acquire(4).is_none());
        probe.complete_success(20);

        assert_eq!(manager.reports()[0].circuit, CircuitState::Closed);
        assert!(manager.try_acquire(4).is_some());
    }

    #[test]
    fn test_abandoned_permit_releases_slot() {
        let manager = manager(1, 1);
        let permit = manager.try_acquire(1).unwrap();
        drop(permit); // client cancelled
        assert!(manager.try_acquire(1).is_some());
        let report = &manager.reports()[0];
        assert_eq!(report.in_flight, 1);
        assert_eq!(report.total_requests, 0);
    }

    #[test]
    fn test_model_availability_counts() {
        let manager = manager(2, 4);
        let availability = manager.model_availability(2);
        assert_eq!(availability.available_slots, 4);
        assert_eq!(availability.admissible_keys, 2);
        assert!(availability.is_eligible());

        let _a = manager.try_acquire(2).unwrap();
        let _b = manager.try_acquire(2).unwrap();
        let after = manager.model_availability(2);
        assert_eq!(after.available_slots, 2);
    }

    #[test]
    fn test_rate_limited_key_excluded_until_cooldown() {
        let manager = manager(1, 4);
        let permit = manager.try_acquire(4).unwrap();
        permit.complete_failure(&ProxyError::RateLimit {
            retry_after_ms: Some(1_000),
            message: "429".into(),
        });
        let availability = manager.model_availability(4);
        assert!(!availability.is_eligible());
        assert_eq!(availability.cooled_keys, 1);
        assert!(availability.fully_cooled());
        assert!(manager.try_acquire(4).is_none());
    }

    #[test]
    fn test_reset_key_clears_auth_failure() {
        let manager = manager(1, 4);
        let permit = manager.try_acquire(4).unwrap();
        permit.complete_failure(&ProxyError::Auth("401 from upstream".into()));
        assert!(manager.try_acquire(4).is_none());
        assert!(manager.reset_key("key-0"));
        assert!(manager.try_acquire(4).is_some());
        assert!(!manager.reset_key("missing"));
    }

    #[test]
    fn test_health_score_visible_in_reports() {
        let manager = manager(1, 4);
        let permit = manager.try_acquire(4).unwrap();
        permit.complete_success(100);
        let report = &manager.reports()[0];
        assert!(report.health_score > 99.0);
        assert_eq!(report.latency.unwrap().samples, 1);
    }
}
