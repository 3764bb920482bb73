//! Signed webhook notifications with retry, a dedup window and error-spike
//! detection.
//!
//! Deliveries are spawned so the pipeline never waits on a webhook endpoint.
//! The signature is HMAC-SHA256 over `timestamp + "\n" + body`; sensitive
//! keys are stripped from payloads before signing so the signed bytes never
//! contain credentials.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde_json::Value;
use sha2::Sha256;

use crate::collections::{LruMap, RingBuffer};
use crate::config::WebhookConfig;
use crate::util::unix_now_ms;

type HmacSha256 = Hmac<Sha256>;

const DEDUP_CAPACITY: usize = 1_024;
const ERROR_WINDOW_CAPACITY: usize = 4_096;
const RETRY_BACKOFF_BASE_MS: u64 = 250;

/// Payload keys that must never leave the process.
const SENSITIVE_KEYS: [&str; 6] = [
    "key",
    "secret",
    "password",
    "token",
    "authorization",
    "apikey",
];

/// Event names emitted by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEvent {
    CircuitOpened,
    KeyUnhealthy,
    ErrorSpike,
}

impl WebhookEvent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookEvent::CircuitOpened => "circuit_opened",
            WebhookEvent::KeyUnhealthy => "key_unhealthy",
            WebhookEvent::ErrorSpike => "error_spike",
        }
    }
}

pub struct WebhookEmitter {
    url: Option<String>,
    secret: String,
    dedup_window_ms: u64,
    max_retries: u32,
    error_spike_threshold: u32,
    error_spike_window_ms: u64,
    client: reqwest::Client,
    dedup: Mutex<LruMap<String, u64>>,
    error_window: Mutex<RingBuffer<u64>>,
    stopped: Arc<AtomicBool>,
}

impl WebhookEmitter {
    #[must_use]
    pub fn new(config: &WebhookConfig) -> Self {
        Self {
            url: config.url.clone(),
            secret: config.secret.clone().unwrap_or_default(),
            dedup_window_ms: config.dedup_window_secs * 1_000,
            max_retries: config.max_retries,
            error_spike_threshold: config.error_spike_threshold,
            error_spike_window_ms: config.error_spike_window_secs * 1_000,
            client: reqwest::Client::new(),
            dedup: Mutex::new(LruMap::new(DEDUP_CAPACITY)),
            error_window: Mutex::new(RingBuffer::new(ERROR_WINDOW_CAPACITY)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.url.is_some() && !self.stopped.load(Ordering::Acquire)
    }

    /// Emit an event unless an identical `(event, dedupe_key)` fired inside
    /// the dedup window. Delivery happens on a spawned task.
    pub fn emit(self: &Arc<Self>, event: WebhookEvent, dedupe_key: &str, payload: Value) {
        if !self.enabled() {
            return;
        }
        if !self.try_claim_dedup_slot(event, dedupe_key) {
            return;
        }

        let emitter = Arc::clone(self);
        let payload = sanitize_payload(payload);
        let event_id = uuid::Uuid::new_v4().to_string();
        tokio::spawn(async move {
            emitter.deliver(event, &event_id, payload).await;
        });
    }

    /// Record a request error for spike detection. When the threshold is
    /// crossed within the window, an `error_spike` event is emitted (itself
    /// deduplicated by the window).
    pub fn record_error(self: &Arc<Self>, error_kind: &str) {
        if self.error_spike_threshold == 0 {
            return;
        }
        let now = unix_now_ms();
        let count = {
            let mut window = self.error_window.lock();
            window.push(now);
            let cutoff = now.saturating_sub(self.error_spike_window_ms);
            window.drain_front_while(|stamp| *stamp < cutoff);
            window.len() as u32
        };

        if count >= self.error_spike_threshold {
            self.emit(
                WebhookEvent::ErrorSpike,
                "window",
                serde_json::json!({
                    "errorsInWindow": count,
                    "windowSeconds": self.error_spike_window_ms / 1_000,
                    "lastErrorKind": error_kind,
                }),
            );
        }
    }

    /// Stop accepting new emissions. Idempotent; in-flight deliveries finish
    /// their retries and exit.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn try_claim_dedup_slot(&self, event: WebhookEvent, dedupe_key: &str) -> bool {
        let slot = format!("{}:{dedupe_key}", event.as_str());
        let now = unix_now_ms();
        let mut dedup = self.dedup.lock();
        if let Some(last_sent) = dedup.peek(&slot) {
            if now.saturating_sub(*last_sent) < self.dedup_window_ms {
                return false;
            }
        }
        dedup.insert(slot, now);
        true
    }

    async fn deliver(&self, event: WebhookEvent, event_id: &str, payload: Value) {
        let Some(url) = &self.url else { return };
        let timestamp = unix_now_ms();
        let body = serde_json::json!({
            "id": event_id,
            "type": event.as_str(),
            "timestamp": timestamp,
            "payload": payload,
        });
        let Ok(body_bytes) = serde_json::to_vec(&body) else {
            return;
        };
        let signature = sign(&self.secret, timestamp, &body_bytes);

        for attempt in 0..=self.max_retries {
            let response = self
                .client
                .post(url)
                .header("content-type", "application/json")
                .header("X-Keyway-Event", event.as_str())
                .header("X-Keyway-Timestamp", timestamp.to_string())
                .header("X-Keyway-Signature", &signature)
                .body(body_bytes.clone())
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(event = event.as_str(), attempt, "webhook delivered");
                    return;
                }
                Ok(response) => {
                    tracing::warn!(
                        event = event.as_str(),
                        status = response.status().as_u16(),
                        attempt,
                        "webhook delivery rejected"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        event = event.as_str(),
                        attempt,
                        "webhook delivery failed: {err}"
                    );
                }
            }

            if attempt < self.max_retries {
                let backoff = RETRY_BACKOFF_BASE_MS << attempt.min(6);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }
    }
}

/// `sha256=<hex>` over `timestamp + "\n" + body`.
#[must_use]
pub fn sign(secret: &str, timestamp_ms: u64, body: &[u8]) -> String {
    // HMAC accepts keys of any length, so this cannot fail in practice.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return "sha256=".to_string();
    };
    mac.update(timestamp_ms.to_string().as_bytes());
    mac.update(b"\n");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Recursively remove sensitive keys from a payload before signing.
#[must_use]
pub fn sanitize_payload(payload: Value) -> Value {
    match payload {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| {
                    let lower = key.to_ascii_lowercase();
                    !SENSITIVE_KEYS.contains(&lower.as_str())
                })
                .map(|(key, value)| (key, sanitize_payload(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_payload).collect()),
        other => other,
    }
}
