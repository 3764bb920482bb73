//! Per-key mutable state: concurrency slots, circuit breaker, cooldowns and
//! latency samples. Everything here is mutated under the owning key's lock;
//! time is passed in so transitions stay unit-testable.

use serde::Serialize;

use crate::collections::RingBuffer;
use crate::error::ProxyError;

/// Rate-limit cooldowns respect the upstream-advertised delay within bounds.
pub const RATE_LIMIT_MIN_COOLDOWN_MS: u64 = 1_000;
pub const RATE_LIMIT_MAX_COOLDOWN_MS: u64 = 5 * 60 * 1_000;
const RATE_LIMIT_DEFAULT_COOLDOWN_MS: u64 = 60_000;

/// Timeouts only feed the breaker once they repeat on the same key.
const TIMEOUT_BREAKER_AFTER: u32 = 2;

const FAILURE_TIMESTAMP_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimitState {
    pub in_cooldown: bool,
    pub until_ms: u64,
    pub retry_after_ms: u64,
    pub reason: String,
}

/// Breaker tuning, copied out of the app config at startup.
#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub failure_window_ms: u64,
    pub cooldown_ms: u64,
    pub latency_sample_size: usize,
}

#[derive(Debug)]
pub(crate) struct KeyState {
    pub in_flight: u32,
    pub circuit: CircuitState,
    pub failure_timestamps: RingBuffer<u64>,
    pub opened_at: Option<u64>,
    pub cooldown_until: Option<u64>,
    pub half_open_probe_in_flight: bool,
    pub rate_limit: RateLimitState,
    pub latency_ms: RingBuffer<u32>,
    pub total_requests: u64,
    pub success_count: u64,
    pub consecutive_timeouts: u32,
    /// Set by a 401/403 from upstream; only an operator reset clears it.
    pub auth_failed: bool,
}

impl KeyState {
    pub(crate) fn new(settings: &BreakerSettings) -> Self {
        Self {
            in_flight: 0,
            circuit: CircuitState::Closed,
            failure_timestamps: RingBuffer::new(FAILURE_TIMESTAMP_CAPACITY),
            opened_at: None,
            cooldown_until: None,
            half_open_probe_in_flight: false,
            rate_limit: RateLimitState::default(),
            latency_ms: RingBuffer::new(settings.latency_sample_size),
            total_requests: 0,
            success_count: 0,
            consecutive_timeouts: 0,
            auth_failed: false,
        }
    }

    /// Failures inside the sliding window.
    pub(crate) fn failure_count(&mut self, settings: &BreakerSettings, now_ms: u64) -> u32 {
        let window_start = now_ms.saturating_sub(settings.failure_window_ms);
        self.failure_timestamps
            .drain_front_while(|stamp| *stamp < window_start);
        u32::try_from(self.failure_timestamps.len()).unwrap_or(u32::MAX)
    }

    /// Whether this key may serve a request right now. An Open circuit whose
    /// cooldown has elapsed transitions to HalfOpen and admits one probe.
    pub(crate) fn admissible(&mut self, per_key_limit: u32, now_ms: u64) -> bool {
        if self.auth_failed {
            return false;
        }
        if self.in_flight >= per_key_limit {
            return false;
        }
        if self.rate_limit.in_cooldown {
            if now_ms < self.rate_limit.until_ms {
                return false;
            }
            self.rate_limit.in_cooldown = false;
        }

        match self.circuit {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let Some(cooldown_until) = self.cooldown_until else {
                    return false;
                };
                if now_ms < cooldown_until {
                    return false;
                }
                self.circuit = CircuitState::HalfOpen;
                self.half_open_probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if self.half_open_probe_in_flight {
                    return false;
                }
                self.half_open_probe_in_flight = true;
                true
            }
        }
    }

    pub(crate) fn record_success(&mut self, latency_ms: u32) {
        self.total_requests += 1;
        self.success_count += 1;
        self.consecutive_timeouts = 0;
        self.latency_ms.push(latency_ms);

        if self.circuit == CircuitState::HalfOpen {
            // One successful probe closes the circuit.
            self.circuit = CircuitState::Closed;
            self.half_open_probe_in_flight = false;
            self.opened_at = None;
            self.cooldown_until = None;
            self.failure_timestamps.clear();
        }
    }

    pub(crate) fn record_failure(
        &mut self,
        err: &ProxyError,
        settings: &BreakerSettings,
        now_ms: u64,
    ) {
        self.total_requests += 1;

        match err {
            ProxyError::RateLimit { retry_after_ms, .. } => {
                let advertised = retry_after_ms.unwrap_or(RATE_LIMIT_DEFAULT_COOLDOWN_MS);
                let clamped =
                    advertised.clamp(RATE_LIMIT_MIN_COOLDOWN_MS, RATE_LIMIT_MAX_COOLDOWN_MS);
                self.rate_limit = RateLimitState {
                    in_cooldown: true,
                    until_ms: now_ms.saturating_add(clamped),
                    retry_after_ms: clamped,
                    reason: err.kind().to_string(),
                };
                if self.circuit == CircuitState::HalfOpen {
                    self.reopen(settings, now_ms);
                }
            }
            ProxyError::Auth(_) => {
                self.auth_failed = true;
            }
            ProxyError::Timeout(_) => {
                self.consecutive_timeouts += 1;
                if self.consecutive_timeouts >= TIMEOUT_BREAKER_AFTER {
                    self.record_breaker_failure(settings, now_ms);
                }
            }
            err if err.affects_breaker() => {
                self.consecutive_timeouts = 0;
                self.record_breaker_failure(settings, now_ms);
            }
            // Client-side and validation failures never touch the breaker.
            _ => {}
        }
    }

    fn record_breaker_failure(&mut self, settings: &BreakerSettings, now_ms: u64) {
        if self.circuit == CircuitState::HalfOpen {
            self.reopen(settings, now_ms);
            return;
        }

        self.failure_timestamps.push(now_ms);
        if self.circuit == CircuitState::Closed
            && self.failure_count(settings, now_ms) >= settings.failure_threshold
        {
            self.reopen(settings, now_ms);
        }
    }

    fn reopen(&mut self, settings: &BreakerSettings, now_ms: u64) {
        self.circuit = CircuitState::Open;
        self.half_open_probe_in_flight = false;
        self.opened_at = Some(now_ms);
        self.cooldown_until = Some(now_ms.saturating_add(settings.cooldown_ms));
    }

    /// Operator reset: clears the breaker, cooldowns and the auth flag.
    pub(crate) fn reset(&mut self) {
        self.circuit = CircuitState::Closed;
        self.half_open_probe_in_flight = false;
        self.opened_at = None;
        self.cooldown_until = None;
        self.failure_timestamps.clear();
        self.rate_limit = RateLimitState::default();
        self.consecutive_timeouts = 0;
        self.auth_failed = false;
    }
}
