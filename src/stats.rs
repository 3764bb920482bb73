//! Request statistics: taxonomy counters, token and cost accounting,
//! weighted latency aggregation, per-minute history and a persisted,
//! schema-versioned snapshot.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::collections::RingBuffer;
use crate::error::TransportKind;
use crate::keys::KeyReport;
use crate::util::unix_now_ms;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Consecutive hangups before the upstream agent is worth recreating.
pub const AGENT_RECREATE_AFTER_HANGUPS: u32 = 3;

const HISTORY_MINUTES: usize = 240;

/// One finished request, as reported to the aggregator and its listeners.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEvent {
    pub request_id: String,
    pub model: Option<String>,
    pub key_id: Option<String>,
    pub tier: String,
    pub source: String,
    pub success: bool,
    pub error_kind: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
    pub total: u64,
    pub request_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerKeyTotals {
    pub requests: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub tokens: TokenTotals,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealth {
    pub total_hangups: u64,
    pub consecutive_hangups: u32,
    pub agent_recreations: u64,
    pub last_recreation_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryBucket {
    pub minute_epoch: u64,
    pub requests: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Weighted latency aggregate across keys. `None` when no key has samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateLatency {
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: u32,
    pub max_ms: u32,
    pub samples: usize,
}

/// Weight each key's percentile by its sample count; min/max are global.
#[must_use]
pub fn weighted_latency(reports: &[KeyReport]) -> Option<AggregateLatency> {
    let sampled: Vec<_> = reports
        .iter()
        .filter_map(|report| report.latency.as_ref())
        .filter(|latency| latency.samples > 0)
        .collect();
    if sampled.is_empty() {
        return None;
    }

    let total_samples: usize = sampled.iter().map(|latency| latency.samples).sum();
    let weight_total = total_samples as f64;
    let weighted = |field: fn(&crate::keys::LatencySummary) -> f64| {
        sampled
            .iter()
            .map(|latency| field(latency) * latency.samples as f64)
            .sum::<f64>()
            / weight_total
    };

    Some(AggregateLatency {
        avg_ms: weighted(|latency| latency.avg_ms),
        p50_ms: weighted(|latency| latency.p50_ms),
        p95_ms: weighted(|latency| latency.p95_ms),
        p99_ms: weighted(|latency| latency.p99_ms),
        min_ms: sampled.iter().map(|latency| latency.min_ms).min().unwrap_or(0),
        max_ms: sampled.iter().map(|latency| latency.max_ms).max().unwrap_or(0),
        samples: total_samples,
    })
}

/// Persisted snapshot shape. Token counters never reset across restarts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsSnapshot {
    pub schema_version: u32,
    pub client_requests: u64,
    pub client_succeeded: u64,
    pub client_failed: u64,
    #[serde(default)]
    pub errors_by_kind: std::collections::BTreeMap<String, u64>,
    #[serde(default)]
    pub tokens: TokenTotals,
    #[serde(default)]
    pub tokens_by_key: std::collections::BTreeMap<String, TokenTotals>,
    #[serde(default)]
    pub per_key: std::collections::BTreeMap<String, PerKeyTotals>,
    #[serde(default)]
    pub connection_health: ConnectionHealth,
    #[serde(default)]
    pub total_cost_usd: f64,
}

struct StatsInner {
    client_requests: u64,
    client_succeeded: u64,
    client_failed: u64,
    errors_by_kind: FxHashMap<String, u64>,
    tokens: TokenTotals,
    per_key: FxHashMap<String, PerKeyTotals>,
    connection_health: ConnectionHealth,
    total_cost_usd: f64,
    history: RingBuffer<HistoryBucket>,
}

type Listener = Box<dyn Fn(&RequestEvent) + Send + Sync>;

/// Aggregates request outcomes. All maps live behind one lock; reads take a
/// consistent-but-possibly-stale snapshot.
pub struct StatsAggregator {
    inner: Mutex<StatsInner>,
    listeners: Mutex<Vec<Listener>>,
    snapshot_path: PathBuf,
    stopped: Arc<AtomicBool>,
    autosave_task: Mutex<Option<JoinHandle<()>>>,
}

impl StatsAggregator {
    #[must_use]
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                client_requests: 0,
                client_succeeded: 0,
                client_failed: 0,
                errors_by_kind: FxHashMap::default(),
                tokens: TokenTotals::default(),
                per_key: FxHashMap::default(),
                connection_health: ConnectionHealth::default(),
                total_cost_usd: 0.0,
                history: RingBuffer::new(HISTORY_MINUTES),
            }),
            listeners: Mutex::new(Vec::new()),
            snapshot_path: snapshot_path.into(),
            stopped: Arc::new(AtomicBool::new(false)),
            autosave_task: Mutex::new(None),
        }
    }

    /// Record one finished request and fan out to listeners. A panicking
    /// listener is logged and skipped; the rest still run.
    pub fn record_request(&self, event: &RequestEvent) {
        {
            let mut inner = self.inner.lock();
            inner.client_requests += 1;
            if event.success {
                inner.client_succeeded += 1;
                inner.connection_health.consecutive_hangups = 0;
            } else {
                inner.client_failed += 1;
                if let Some(kind) = &event.error_kind {
                    *inner.errors_by_kind.entry(kind.clone()).or_insert(0) += 1;
                }
            }

            inner.tokens.input += event.input_tokens;
            inner.tokens.output += event.output_tokens;
            inner.tokens.total += event.input_tokens + event.output_tokens;
            inner.tokens.request_count += 1;
            inner.total_cost_usd += event.cost_usd;

            if let Some(key_id) = &event.key_id {
                let entry = inner.per_key.entry(key_id.clone()).or_default();
                entry.requests += 1;
                if event.success {
                    entry.succeeded += 1;
                } else {
                    entry.failed += 1;
                }
                entry.tokens.input += event.input_tokens;
                entry.tokens.output += event.output_tokens;
                entry.tokens.total += event.input_tokens + event.output_tokens;
                entry.tokens.request_count += 1;
            }

            bump_history(&mut inner, event);
        }

        let listeners = self.listeners.lock();
        for listener in listeners.iter() {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener(event);
            }));
            if outcome.is_err() {
                tracing::error!(
                    request_id = event.request_id.as_str(),
                    "stats listener panicked; continuing with remaining listeners"
                );
            }
        }
    }

    /// Record a transport hangup. Returns true when enough consecutive
    /// hangups accumulated that the upstream agent should be recreated.
    pub fn record_transport_fault(&self, kind: TransportKind) -> bool {
        if !kind.is_hangup() {
            return false;
        }
        let mut inner = self.inner.lock();
        inner.connection_health.total_hangups += 1;
        inner.connection_health.consecutive_hangups += 1;
        inner.connection_health.consecutive_hangups >= AGENT_RECREATE_AFTER_HANGUPS
    }

    pub fn record_agent_recreation(&self) {
        let mut inner = self.inner.lock();
        inner.connection_health.agent_recreations += 1;
        inner.connection_health.consecutive_hangups = 0;
        inner.connection_health.last_recreation_at_ms = Some(unix_now_ms());
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&RequestEvent) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Box::new(listener));
    }

    /// Current counters as a serializable snapshot.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock();
        StatsSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            client_requests: inner.client_requests,
            client_succeeded: inner.client_succeeded,
            client_failed: inner.client_failed,
            errors_by_kind: inner
                .errors_by_kind
                .iter()
                .map(|(kind, count)| (kind.clone(), *count))
                .collect(),
            tokens: inner.tokens.clone(),
            tokens_by_key: inner
                .per_key
                .iter()
                .map(|(key, totals)| (key.clone(), totals.tokens.clone()))
                .collect(),
            per_key: inner
                .per_key
                .iter()
                .map(|(key, totals)| (key.clone(), totals.clone()))
                .collect(),
            connection_health: inner.connection_health.clone(),
            total_cost_usd: inner.total_cost_usd,
        }
    }

    /// Client success rate in 0..1; the headline number.
    #[must_use]
    pub fn client_success_rate(&self) -> Option<f64> {
        let inner = self.inner.lock();
        if inner.client_requests == 0 {
            return None;
        }
        Some(inner.client_succeeded as f64 / inner.client_requests as f64)
    }

    /// Per-minute rollup points covering the last `minutes`, oldest first.
    #[must_use]
    pub fn history(&self, minutes: u64) -> Vec<HistoryBucket> {
        let cutoff = (unix_now_ms() / 60_000).saturating_sub(minutes);
        let inner = self.inner.lock();
        inner
            .history
            .iter()
            .filter(|bucket| bucket.minute_epoch >= cutoff)
            .copied()
            .collect()
    }

    /// Load a persisted snapshot. A newer schema version loads best-effort
    /// with a warning; counters with `never` reset policy carry over.
    pub fn load_snapshot(&self) {
        let contents = match std::fs::read_to_string(&self.snapshot_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                tracing::warn!("failed to read stats snapshot: {err}");
                return;
            }
        };
        let snapshot: StatsSnapshot = match serde_json::from_str(&contents) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!("failed to parse stats snapshot: {err}");
                return;
            }
        };
        if snapshot.schema_version > SNAPSHOT_SCHEMA_VERSION {
            tracing::warn!(
                found = snapshot.schema_version,
                supported = SNAPSHOT_SCHEMA_VERSION,
                "stats snapshot written by a newer version; loading best-effort"
            );
        }

        let mut inner = self.inner.lock();
        inner.client_requests = snapshot.client_requests;
        inner.client_succeeded = snapshot.client_succeeded;
        inner.client_failed = snapshot.client_failed;
        inner.errors_by_kind = snapshot.errors_by_kind.into_iter().collect();
        inner.tokens = snapshot.tokens;
        inner.per_key = snapshot.per_key.into_iter().collect();
        inner.connection_health = snapshot.connection_health;
        inner.total_cost_usd = snapshot.total_cost_usd;
    }

    /// Write the snapshot to disk.
    pub fn flush(&self) {
        let snapshot = self.snapshot();
        match serde_json::to_string_pretty(&snapshot) {
            Ok(body) => {
                if let Err(err) = std::fs::write(&self.snapshot_path, body) {
                    tracing::warn!(
                        path = %self.snapshot_path.display(),
                        "failed to write stats snapshot: {err}"
                    );
                }
            }
            Err(err) => tracing::warn!("failed to serialize stats snapshot: {err}"),
        }
    }

    /// Start periodic snapshot writes. Idempotent.
    pub fn start_autosave(self: &Arc<Self>, interval: Duration) {
        let mut task = self.autosave_task.lock();
        if task.is_some() {
            return;
        }
        self.stopped.store(false, Ordering::Release);

        let stats = Arc::clone(self);
        let stopped = Arc::clone(&self.stopped);
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if stopped.load(Ordering::Acquire) {
                    return;
                }
                stats.flush();
            }
        }));
    }

    /// Stop auto-save, drop listeners, and flush once. Idempotent.
    pub fn destroy(&self) {
        let already_stopped = self.stopped.swap(true, Ordering::AcqRel);
        if let Some(task) = self.autosave_task.lock().take() {
            task.abort();
        }
        self.listeners.lock().clear();
        if !already_stopped {
            self.flush();
        }
    }
}

fn bump_history(inner: &mut StatsInner, event: &RequestEvent) {
    let minute_epoch = unix_now_ms() / 60_000;
    let needs_new_bucket = inner
        .history
        .last_mut()
        .is_none_or(|bucket| bucket.minute_epoch != minute_epoch);
    if needs_new_bucket {
        inner.history.push(HistoryBucket {
            minute_epoch,
            ..HistoryBucket::default()
        });
    }
    if let Some(bucket) = inner.history.last_mut() {
        bucket.requests += 1;
        if event.success {
            bucket.succeeded += 1;
        } else {
            bucket.failed += 1;
        }
        bucket.input_tokens += event.input_tokens;
        bucket.output_tokens += event.output_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::LatencySummary;

    fn event(success: bool, key: &str, input: u64, output: u64) -> RequestEvent {
        RequestEvent {
            request_id: "req-1".to_string(),
            model: Some("glm-4-air".to_string()),
            key_id: Some(key.to_string()),
            tier: "light".to_string(),
            source: "default".to_string(),
            success,
            error_kind: (!success).then(|| "upstream".to_string()),
            input_tokens: input,
            output_tokens: output,
            cost_usd: 0.001,
            duration_ms: 120,
        }
    }

    fn report_with_latency(p95: f64, samples: usize) -> KeyReport {
        KeyReport {
            index: 0,
            id: "key".to_string(),
            circuit: crate::keys::CircuitState::Closed,
            in_flight: 0,
            max_concurrency: 4,
            total_requests: samples as u64,
            success_count: samples as u64,
            failures_in_window: 0,
            rate_limit: crate::keys::RateLimitState::default(),
            auth_failed: false,
            health_score: 100.0,
            latency: Some(LatencySummary {
                samples,
                avg_ms: p95,
                p50_ms: p95,
                p95_ms: p95,
                p99_ms: p95,
                min_ms: p95 as u32,
                max_ms: p95 as u32,
            }),
        }
    }

    #[test]
    fn test_weighted_percentile_mean() {
        // (p95=100, samples=100) + (p95=200, samples=100) -> 150
        let reports = vec![report_with_latency(100.0, 100), report_with_latency(200.0, 100)];
        let aggregate = weighted_latency(&reports).unwrap();
        assert!((aggregate.p95_ms - 150.0).abs() < f64::EPSILON);
        assert_eq!(aggregate.min_ms, 100);
        assert_eq!(aggregate.max_ms, 200);
        assert_eq!(aggregate.samples, 200);
    }

    #[test]
    fn test_weighted_percentile_unequal_weights() {
        let reports = vec![report_with_latency(100.0, 300), report_with_latency(200.0, 100)];
        let aggregate = weighted_latency(&reports).unwrap();
        assert!((aggregate.p95_ms - 125.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_no_samples_yields_none() {
        assert!(weighted_latency(&[]).is_none());
        let report = KeyReport {
            latency: None,
            ..report_with_latency(1.0, 1)
        };
        assert!(weighted_latency(&[report]).is_none());
    }

    #[test]
    fn test_counters_and_success_rate() {
        let dir = tempfile::tempdir().unwrap();
        let stats = StatsAggregator::new(dir.path().join("stats.json"));
        stats.record_request(&event(true, "key-0", 100, 50));
        stats.record_request(&event(false, "key-0", 10, 0));
        stats.record_request(&event(true, "key-1", 30, 20));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.client_requests, 3);
        assert_eq!(snapshot.client_succeeded, 2);
        assert_eq!(snapshot.client_failed, 1);
        assert_eq!(snapshot.errors_by_kind.get("upstream"), Some(&1));
        assert_eq!(snapshot.tokens.input, 140);
        assert_eq!(snapshot.tokens.total, 210);
        assert_eq!(snapshot.per_key.get("key-0").unwrap().requests, 2);
        assert_eq!(snapshot.per_key.get("key-1").unwrap().succeeded, 1);
        let rate = stats.client_success_rate().unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_listener_panic_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let stats = StatsAggregator::new(dir.path().join("stats.json"));
        let seen = Arc::new(std::sync::atomic::AtomicU64::new(0));

        stats.add_listener(|_| panic!("bad listener"));
        let counter = Arc::clone(&seen);
        stats.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        stats.record_request(&event(true, "key-0", 1, 1));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hangup_tracking_and_recreation() {
        let dir = tempfile::tempdir().unwrap();
        let stats = StatsAggregator::new(dir.path().join("stats.json"));
        assert!(!stats.record_transport_fault(TransportKind::BrokenPipe));
        assert!(!stats.record_transport_fault(TransportKind::SocketHangup));
        assert!(stats.record_transport_fault(TransportKind::StreamPrematureClose));
        stats.record_agent_recreation();

        let health = stats.snapshot().connection_health;
        assert_eq!(health.total_hangups, 3);
        assert_eq!(health.consecutive_hangups, 0);
        assert_eq!(health.agent_recreations, 1);
        assert!(health.last_recreation_at_ms.is_some());

        // Non-hangup transport faults are not counted.
        assert!(!stats.record_transport_fault(TransportKind::Dns));
        assert_eq!(stats.snapshot().connection_health.total_hangups, 3);
    }

    #[test]
    fn test_success_resets_consecutive_hangups() {
        let dir = tempfile::tempdir().unwrap();
        let stats = StatsAggregator::new(dir.path().join("stats.json"));
        stats.record_transport_fault(TransportKind::BrokenPipe);
        stats.record_transport_fault(TransportKind::BrokenPipe);
        stats.record_request(&event(true, "key-0", 1, 1));
        assert_eq!(stats.snapshot().connection_health.consecutive_hangups, 0);
        assert_eq!(stats.snapshot().connection_health.total_hangups, 2);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let stats = StatsAggregator::new(&path);
        stats.record_request(&event(true, "key-0", 100, 50));
        stats.flush();

        let restored = StatsAggregator::new(&path);
        restored.load_snapshot();
        let snapshot = restored.snapshot();
        assert_eq!(snapshot.client_requests, 1);
        assert_eq!(snapshot.tokens.input, 100);
        assert_eq!(snapshot.tokens_by_key.get("key-0").unwrap().input, 100);
    }

    #[test]
    fn test_newer_schema_loads_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        std::fs::write(
            &path,
            r#"{ "schemaVersion": 99, "clientRequests": 7, "clientSucceeded": 7, "clientFailed": 0, "futureField": true }"#,
        )
        .unwrap();
        let stats = StatsAggregator::new(&path);
        stats.load_snapshot();
        assert_eq!(stats.snapshot().client_requests, 7);
    }

    #[test]
    fn test_history_rollup() {
        let dir = tempfile::tempdir().unwrap();
        let stats = StatsAggregator::new(dir.path().join("stats.json"));
        stats.record_request(&event(true, "key-0", 10, 5));
        stats.record_request(&event(false, "key-0", 20, 0));
        let history = stats.history(5);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].requests, 2);
        assert_eq!(history[0].succeeded, 1);
        assert_eq!(history[0].input_tokens, 30);
    }

    #[test]
    fn test_destroy_is_idempotent_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let stats = StatsAggregator::new(&path);
        stats.record_request(&event(true, "key-0", 1, 1));
        stats.destroy();
        stats.destroy();
        assert!(path.exists());
    }
}
