//! Public counter contract.
//!
//! Every counter has a name, help string, bounded label enums and a reset
//! policy. Labels outside the bounded sets are logged and dropped so series
//! cardinality stays fixed. The registry is constructed once and carried in
//! app state; nothing here is a process-wide static.

use std::collections::HashSet;

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};

pub const TIER_LABELS: [&str; 3] = ["light", "medium", "heavy"];
pub const SOURCE_LABELS: [&str; 6] = [
    "override",
    "saved-override",
    "rule",
    "classifier",
    "default",
    "passthrough",
];
pub const UPGRADE_REASONS: [&str; 5] = [
    "has_tools",
    "has_vision",
    "max_tokens",
    "message_count",
    "system_length",
];
pub const FALLBACK_REASONS: [&str; 3] = [
    "tier_exhausted",
    "downgrade_budget_spent",
    "admission_hold",
];
pub const MIGRATION_RESULTS: [&str; 4] = ["migrated", "unchanged", "skipped", "failed"];
pub const DRIFT_REASONS: [&str; 4] = [
    "router_available_km_excluded",
    "km_available_router_cooled",
    "concurrency_mismatch",
    "cooldown_mismatch",
];

/// When a counter's value may legitimately return to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPolicy {
    /// Resets on process restart.
    Process,
    /// Carried across restarts via the stats snapshot.
    Never,
    /// Resets when the routing config is replaced.
    Config,
}

/// One row of the metrics contract, exposed for documentation endpoints.
#[derive(Debug, Clone, Copy)]
pub struct CounterSpec {
    pub name: &'static str,
    pub help: &'static str,
    pub labels: &'static [&'static str],
    pub reset: ResetPolicy,
}

pub const COUNTER_SPECS: [CounterSpec; 6] = [
    CounterSpec {
        name: "requests_total",
        help: "Requests by resolved tier and decision source",
        labels: &["tier", "source"],
        reset: ResetPolicy::Process,
    },
    CounterSpec {
        name: "upgrade_total",
        help: "Classifier tier upgrades by reason",
        labels: &["reason"],
        reset: ResetPolicy::Process,
    },
    CounterSpec {
        name: "fallback_total",
        help: "Tier downgrades and admission fallbacks by reason",
        labels: &["reason"],
        reset: ResetPolicy::Process,
    },
    CounterSpec {
        name: "config_migration_total",
        help: "Routing config normalization outcomes",
        labels: &["result"],
        reset: ResetPolicy::Config,
    },
    CounterSpec {
        name: "drift_total",
        help: "Router/key-manager availability mismatches",
        labels: &["tier", "reason"],
        reset: ResetPolicy::Process,
    },
    CounterSpec {
        name: "tokens_total",
        help: "Tokens consumed by tier and model",
        labels: &["tier", "model"],
        reset: ResetPolicy::Never,
    },
];

pub struct MetricsRegistry {
    registry: Registry,
    requests_total: IntCounterVec,
    upgrade_total: IntCounterVec,
    fallback_total: IntCounterVec,
    config_migration_total: IntCounterVec,
    drift_total: IntCounterVec,
    tokens_total: IntCounterVec,
    request_latency: Histogram,
    /// Model ids from the catalog: the bounded enum for the model label.
    allowed_models: HashSet<String>,
}

impl MetricsRegistry {
    /// Build the registry. Registration of a fixed set of collectors into a
    /// fresh registry cannot collide; failures degrade to unregistered
    /// collectors rather than a panic.
    #[must_use]
    pub fn new(model_ids: impl IntoIterator<Item = String>) -> Self {
        let registry = Registry::new();

        let requests_total =
            counter_vec("requests_total", COUNTER_SPECS[0].help, &["tier", "source"]);
        let upgrade_total = counter_vec("upgrade_total", COUNTER_SPECS[1].help, &["reason"]);
        let fallback_total = counter_vec("fallback_total", COUNTER_SPECS[2].help, &["reason"]);
        let config_migration_total =
            counter_vec("config_migration_total", COUNTER_SPECS[3].help, &["result"]);
        let drift_total = counter_vec("drift_total", COUNTER_SPECS[4].help, &["tier", "reason"]);
        let tokens_total = counter_vec("tokens_total", COUNTER_SPECS[5].help, &["tier", "model"]);
        let request_latency = Histogram::with_opts(
            HistogramOpts::new("request_latency_seconds", "End-to-end request latency")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )
        .expect("fixed histogram opts");

        for collector in [
            &requests_total,
            &upgrade_total,
            &fallback_total,
            &config_migration_total,
            &drift_total,
            &tokens_total,
        ] {
            if let Err(err) = registry.register(Box::new(collector.clone())) {
                tracing::warn!("failed to register counter: {err}");
            }
        }
        if let Err(err) = registry.register(Box::new(request_latency.clone())) {
            tracing::warn!("failed to register histogram: {err}");
        }

        Self {
            registry,
            requests_total,
            upgrade_total,
            fallback_total,
            config_migration_total,
            drift_total,
            tokens_total,
            request_latency,
            allowed_models: model_ids.into_iter().collect(),
        }
    }

    pub fn incr_request(&self, tier: &str, source: &str) {
        if !label_ok("requests_total", "tier", tier, &TIER_LABELS)
            || !label_ok("requests_total", "source", source, &SOURCE_LABELS)
        {
            return;
        }
        self.requests_total.with_label_values(&[tier, source]).inc();
    }

    pub fn incr_upgrade(&self, reason: &str) {
        if !label_ok("upgrade_total", "reason", reason, &UPGRADE_REASONS) {
            return;
        }
        self.upgrade_total.with_label_values(&[reason]).inc();
    }

    pub fn incr_fallback(&self, reason: &str) {
        if !label_ok("fallback_total", "reason", reason, &FALLBACK_REASONS) {
            return;
        }
        self.fallback_total.with_label_values(&[reason]).inc();
    }

    pub fn incr_config_migration(&self, result: &str) {
        if !label_ok(
            "config_migration_total",
            "result",
            result,
            &MIGRATION_RESULTS,
        ) {
            return;
        }
        self.config_migration_total
            .with_label_values(&[result])
            .inc();
    }

    pub fn incr_drift(&self, tier: &str, reason: &str) {
        if !label_ok("drift_total", "tier", tier, &TIER_LABELS)
            || !label_ok("drift_total", "reason", reason, &DRIFT_REASONS)
        {
            return;
        }
        self.drift_total.with_label_values(&[tier, reason]).inc();
    }

    pub fn incr_tokens(&self, tier: &str, model: &str, tokens: u64) {
        if !label_ok("tokens_total", "tier", tier, &TIER_LABELS) {
            return;
        }
        if !self.allowed_models.contains(model) {
            tracing::warn!(
                counter = "tokens_total",
                model,
                "model label outside catalog; dropped"
            );
            return;
        }
        self.tokens_total
            .with_label_values(&[tier, model])
            .inc_by(tokens);
    }

    pub fn observe_latency(&self, seconds: f64) {
        self.request_latency.observe(seconds);
    }

    /// Prometheus text exposition of every registered series.
    #[must_use]
    pub fn render(&self) -> String {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

fn counter_vec(name: &str, help: &'static str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("fixed counter opts")
}

fn label_ok(counter: &str, label: &str, value: &str, allowed: &[&str]) -> bool {
    if allowed.contains(&value) {
        return true;
    }
    tracing::warn!(counter, label, value, "label outside bounded enum; dropped");
    false
}
