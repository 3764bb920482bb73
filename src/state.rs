//! Shared application state: every subsystem wired once at startup and
//! handed around as an `Arc<AppState>`. Background lifecycles (watcher,
//! eviction, autosave, drift tick) start and stop together.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::auth::AdminTokens;
use crate::config::AppConfig;
use crate::error::ProxyError;
use crate::keys::{drift, KeyManager};
use crate::metrics::MetricsRegistry;
use crate::pipeline::AdmissionControl;
use crate::policy::watcher::PolicyWatcher;
use crate::policy::PolicyManager;
use crate::replay::ReplayQueue;
use crate::router::normalize::{normalize, NormalizeMode};
use crate::router::{persist, ModelCatalog, ModelRouter};
use crate::stats::StatsAggregator;
use crate::trace::{TraceStore, Tracer};
use crate::transport::HttpTransport;
use crate::webhook::WebhookEmitter;

const DRIFT_TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Outcome of an admin routing-config update.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingUpdateOutcome {
    pub persisted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub legacy: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

struct BackgroundTasks {
    watcher: PolicyWatcher,
    drift_task: Mutex<Option<JoinHandle<()>>>,
}

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub transport: HttpTransport,
    pub keys: Arc<KeyManager>,
    pub router: ModelRouter,
    pub policies: Arc<PolicyManager>,
    pub tracer: Tracer,
    pub replay: Arc<ReplayQueue>,
    pub stats: Arc<StatsAggregator>,
    pub webhook: Arc<WebhookEmitter>,
    pub metrics: Arc<MetricsRegistry>,
    pub admission: AdmissionControl,
    pub admin_tokens: AdminTokens,
    background: BackgroundTasks,
}

impl AppState {
    /// Wire every subsystem. Background timers are not started here; call
    /// [`AppState::start_background`] once the runtime is up.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] when the transport cannot be built.
    pub fn new(config: AppConfig) -> Result<Self, ProxyError> {
        let transport = HttpTransport::new(&config)?;
        let keys = Arc::new(KeyManager::new(&config));
        let catalog_models: Vec<String> =
            config.models.iter().map(|model| model.id.clone()).collect();
        let metrics = Arc::new(MetricsRegistry::new(catalog_models));

        let routing = load_routing_config(&config, &metrics);
        let router = ModelRouter::new(&config, routing);

        let policies = Arc::new(PolicyManager::new(&config.paths.policy_file));
        let report = policies.load();
        if !report.errors.is_empty() {
            tracing::warn!(
                errors = report.errors.len(),
                "policy file loaded with dropped entries"
            );
        }
        let watcher = PolicyWatcher::new(Arc::clone(&policies));

        let tracer = Tracer::new(Arc::new(TraceStore::new(config.features.trace_capacity)));
        let replay = Arc::new(ReplayQueue::new(&config.replay));
        let stats = Arc::new(StatsAggregator::new(&config.paths.stats_snapshot));
        stats.load_snapshot();
        let webhook = Arc::new(WebhookEmitter::new(&config.webhook));
        let admin_tokens = AdminTokens::new(&config);

        Ok(Self {
            config,
            transport,
            keys,
            router,
            policies,
            tracer,
            replay,
            stats,
            webhook,
            metrics,
            admission: AdmissionControl::new(),
            admin_tokens,
            background: BackgroundTasks {
                watcher,
                drift_task: Mutex::new(None),
            },
        })
    }

    /// Start the background lifecycles: policy watcher, replay eviction,
    /// stats autosave and the drift tick. Idempotent.
    pub fn start_background(self: &Arc<Self>) {
        self.background.watcher.start();
        self.replay.start_eviction_timer();
        self.stats.start_autosave(Duration::from_secs(
            self.config.features.stats_autosave_secs.max(1),
        ));

        let mut drift_task = self.background.drift_task.lock();
        if drift_task.is_none() {
            let state = Arc::downgrade(self);
            *drift_task = Some(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(DRIFT_TICK_INTERVAL).await;
                    let Some(state) = state.upgrade() else { return };
                    state.run_drift_tick();
                }
            }));
        }
    }

    /// Compare the router's cached availability view against key-manager
    /// truth; mismatches only bump counters.
    pub fn run_drift_tick(&self) {
        let observations = self.router.observations();
        if observations.is_empty() {
            return;
        }
        let events = drift::detect(&observations, &self.keys);
        for event in &events {
            self.metrics.incr_drift(&event.tier, event.reason.as_str());
            tracing::debug!(
                model = event.model.as_str(),
                reason = event.reason.as_str(),
                "availability drift detected"
            );
        }
    }

    /// Stop background work and flush state. Idempotent.
    pub fn shutdown(&self) {
        self.background.watcher.stop();
        self.replay.stop();
        self.webhook.stop();
        if let Some(task) = self.background.drift_task.lock().take() {
            task.abort();
        }
        self.stats.destroy();
    }

    #[must_use]
    pub fn next_request_id(&self) -> String {
        format!("req-{}", uuid::Uuid::new_v4().simple())
    }

    /// Normalize and install a routing config update, persisting when the
    /// content hash changed and persistence is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Validation`] when the body is not a JSON
    /// object; server state is unchanged in that case.
    pub fn apply_routing_update(&self, body: &Value) -> Result<RoutingUpdateOutcome, ProxyError> {
        if !body.is_object() {
            return Err(ProxyError::Validation(
                "routing config must be a JSON object".to_string(),
            ));
        }

        let outcome = normalize(body, NormalizeMode::Full);
        for warning in &outcome.warnings {
            tracing::warn!("routing config warning: {warning}");
        }
        self.metrics.incr_config_migration(if outcome.migrated {
            "migrated"
        } else {
            "unchanged"
        });

        self.router.update_config(outcome.config.clone());

        if !self.config.features.persist_routing_changes {
            return Ok(RoutingUpdateOutcome {
                persisted: false,
                warning: Some("runtime_only_change".to_string()),
                legacy: outcome.migrated,
                warnings: outcome.warnings,
            });
        }

        let value = serde_json::to_value(&outcome.config)
            .map_err(|err| ProxyError::Internal(format!("failed to serialize config: {err}")))?;
        let persisted = persist::persist_if_changed(Path::new(&self.config.paths.routing_config), &value);
        if persisted.warning.is_some() {
            self.metrics.incr_config_migration("failed");
        } else if !persisted.wrote {
            self.metrics.incr_config_migration("skipped");
        }

        Ok(RoutingUpdateOutcome {
            persisted: persisted.wrote,
            warning: persisted.warning,
            legacy: outcome.migrated,
            warnings: outcome.warnings,
        })
    }
}

/// Startup routing config: the persisted file when present, otherwise
/// defaults derived from the model catalog. Migrated legacy files are
/// rewritten on disk immediately.
fn load_routing_config(
    config: &AppConfig,
    metrics: &MetricsRegistry,
) -> crate::router::RoutingConfig {
    let path = Path::new(&config.paths.routing_config);
    let Some(persisted) = persist::load_persisted(path) else {
        return ModelCatalog::new(&config.models).default_routing();
    };

    let outcome = normalize(&persisted, NormalizeMode::Full);
    for warning in &outcome.warnings {
        tracing::warn!("persisted routing config warning: {warning}");
    }

    if outcome.migrated {
        metrics.incr_config_migration("migrated");
        if config.features.persist_routing_changes {
            if let Ok(value) = serde_json::to_value(&outcome.config) {
                let result = persist::persist_if_changed(path, &value);
                if let Some(warning) = result.warning {
                    tracing::warn!("failed to rewrite migrated routing config: {warning}");
                }
            }
        }
    }

    outcome.config
}
