//! Model routing: tier resolution, strategy-driven candidate selection and
//! decision introspection.
//!
//! Resolution order per request: explicit override, saved override map,
//! first matching rule, threshold classifier, then the requested model's
//! home tier. Within the resolved tier, the tier's strategy orders eligible
//! models; the pipeline pins the first the key manager can satisfy.

mod classify;
pub mod config;
pub mod normalize;
pub mod persist;
mod strategy;

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use regex_lite::Regex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use smallvec::SmallVec;

use crate::config::{AppConfig, ModelConfig};
use crate::keys::drift::ObservedAvailability;
use crate::keys::{KeyManager, ModelAvailability};
use crate::policy::matcher::compile_model_pattern;
use crate::util::unix_now_ms;

pub use classify::{classify, ClassifierResult, RequestFeatures};
pub use config::{
    Glm5Config, RoutingConfig, RoutingRule, RuleMatch, Strategy, Tier, TierConfig,
};
pub use strategy::{Candidate, ScoreRow};

const GLM5_MODEL_PREFIX: &str = "glm-5";

/// A model known to the proxy, with pricing and limits.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSpec {
    pub id: String,
    pub home_tier: Tier,
    pub cost_per_m_input: f64,
    pub cost_per_m_output: f64,
    pub max_concurrency_per_key: u32,
    pub supports_vision: bool,
    pub supports_streaming: bool,
    pub context_length: u64,
}

impl ModelSpec {
    fn from_config(model: &ModelConfig) -> Option<Self> {
        Some(Self {
            id: model.id.clone(),
            home_tier: Tier::parse(&model.tier)?,
            cost_per_m_input: model.cost_per_m_input,
            cost_per_m_output: model.cost_per_m_output,
            max_concurrency_per_key: model.max_concurrency_per_key,
            supports_vision: model.supports_vision,
            supports_streaming: model.supports_streaming,
            context_length: model.context_length,
        })
    }

    /// Cost of one request in USD from token counts.
    #[must_use]
    pub fn cost_usd(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.cost_per_m_input
            + output_tokens as f64 * self.cost_per_m_output)
            / 1_000_000.0
    }
}

/// Immutable model registry built once at startup.
#[derive(Debug, Default)]
pub struct ModelCatalog {
    models: FxHashMap<String, Arc<ModelSpec>>,
}

impl ModelCatalog {
    #[must_use]
    pub fn new(models: &[ModelConfig]) -> Self {
        let models = models
            .iter()
            .filter_map(ModelSpec::from_config)
            .map(|spec| (spec.id.clone(), Arc::new(spec)))
            .collect();
        Self { models }
    }

    #[must_use]
    pub fn get(&self, model: &str) -> Option<&Arc<ModelSpec>> {
        self.models.get(model)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModelSpec>> {
        self.models.values()
    }

    /// Routing defaults: every catalog model listed under its home tier,
    /// ordered by descending cost inside the tier (best model first).
    #[must_use]
    pub fn default_routing(&self) -> RoutingConfig {
        let mut config = RoutingConfig::default();
        for tier in Tier::ALL {
            let mut members: Vec<&Arc<ModelSpec>> = self
                .models
                .values()
                .filter(|spec| spec.home_tier == tier)
                .collect();
            members.sort_by(|a, b| {
                (b.cost_per_m_input + b.cost_per_m_output)
                    .partial_cmp(&(a.cost_per_m_input + a.cost_per_m_output))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
            if let Some(entry) = config.tiers.get_mut(tier.as_str()) {
                entry.models = members.iter().map(|spec| spec.id.clone()).collect();
            }
        }
        config
    }
}

/// Where the routing decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteSource {
    Override,
    SavedOverride,
    Rule,
    Classifier,
    Default,
    Passthrough,
}

impl RouteSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RouteSource::Override => "override",
            RouteSource::SavedOverride => "saved-override",
            RouteSource::Rule => "rule",
            RouteSource::Classifier => "classifier",
            RouteSource::Default => "default",
            RouteSource::Passthrough => "passthrough",
        }
    }
}

/// The full routing decision for one attempt, also the `explain` payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDecision {
    pub selected_model: Option<String>,
    /// Strategy-ordered eligible models; the pipeline pins the first the
    /// key manager can satisfy.
    pub candidates: Vec<String>,
    pub tier: Tier,
    pub strategy: Strategy,
    pub source: RouteSource,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classifier_result: Option<ClassifierResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    pub glm5_eligible: bool,
    pub scoring_table: Vec<ScoreRow>,
    pub cooldown_reasons: Vec<String>,
}

struct CompiledRule {
    rule: RoutingRule,
    model_regex: Option<Regex>,
}

impl CompiledRule {
    fn matches(&self, features: &RequestFeatures) -> bool {
        let criteria = &self.rule.criteria;
        if let Some(pattern) = &criteria.model {
            let matched = match &self.model_regex {
                Some(regex) => regex.is_match(&features.model),
                None => pattern == "*" || pattern == &features.model,
            };
            if !matched {
                return false;
            }
        }
        if let Some(min) = criteria.max_tokens_gte {
            if features.max_tokens.is_none_or(|tokens| tokens < min) {
                return false;
            }
        }
        if let Some(min) = criteria.message_count_gte {
            if features.message_count < min {
                return false;
            }
        }
        if let Some(min) = criteria.system_length_gte {
            if features.system_length < min {
                return false;
            }
        }
        if let Some(wants_tools) = criteria.has_tools {
            if features.has_tools != wants_tools {
                return false;
            }
        }
        if let Some(wants_vision) = criteria.has_vision {
            if features.has_vision != wants_vision {
                return false;
            }
        }
        true
    }
}

struct RouterSnapshot {
    config: RoutingConfig,
    rules: Vec<CompiledRule>,
}

impl RouterSnapshot {
    fn new(config: RoutingConfig) -> Self {
        let rules = config
            .rules
            .iter()
            .cloned()
            .map(|rule| {
                let model_regex = rule
                    .criteria
                    .model
                    .as_deref()
                    .filter(|pattern| pattern.contains('*') && *pattern != "*")
                    .and_then(compile_model_pattern);
                CompiledRule { rule, model_regex }
            })
            .collect();
        Self { config, rules }
    }
}

struct DowngradeWindow {
    window_start_ms: u64,
    used: u32,
}

/// Tier resolution and candidate selection. Reads swap-in immutable
/// snapshots; per-request state lives entirely on the stack.
pub struct ModelRouter {
    catalog: ModelCatalog,
    snapshot: ArcSwap<RouterSnapshot>,
    downgrade_budget: u32,
    downgrade_window_ms: u64,
    downgrade: Mutex<DowngradeWindow>,
    observations: Mutex<FxHashMap<String, ObservedAvailability>>,
}

impl ModelRouter {
    #[must_use]
    pub fn new(app: &AppConfig, routing: RoutingConfig) -> Self {
        let catalog = ModelCatalog::new(&app.models);
        Self {
            catalog,
            snapshot: ArcSwap::from_pointee(RouterSnapshot::new(routing)),
            downgrade_budget: app.downgrade.budget,
            downgrade_window_ms: app.downgrade.window_secs * 1_000,
            downgrade: Mutex::new(DowngradeWindow {
                window_start_ms: 0,
                used: 0,
            }),
            observations: Mutex::new(FxHashMap::default()),
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Replace the routing config; readers see the new snapshot atomically.
    pub fn update_config(&self, config: RoutingConfig) {
        self.snapshot.store(Arc::new(RouterSnapshot::new(config)));
    }

    #[must_use]
    pub fn current_config(&self) -> RoutingConfig {
        self.snapshot.load().config.clone()
    }

    /// Restore routing defaults derived from the model catalog.
    pub fn reset_to_defaults(&self) {
        self.update_config(self.catalog.default_routing());
    }

    /// Per-key concurrency limit the key manager should enforce for a model.
    /// Unknown models (passthrough traffic) are bounded by the key limit only.
    #[must_use]
    pub fn per_key_limit(&self, model: &str) -> u32 {
        self.catalog
            .get(model)
            .map_or(u32::MAX, |spec| spec.max_concurrency_per_key)
    }

    /// Snapshot of the router's cached availability view, for drift checks.
    #[must_use]
    pub fn observations(&self) -> Vec<ObservedAvailability> {
        self.observations.lock().values().cloned().collect()
    }

    /// Resolve a live routing decision, consuming downgrade budget and
    /// recording availability observations.
    #[must_use]
    pub fn resolve(
        &self,
        features: &RequestFeatures,
        client_override: Option<&str>,
        keys: &KeyManager,
    ) -> RouteDecision {
        self.resolve_inner(features, client_override, keys, true)
    }

    /// Read-only resolution for the test/explain endpoints: no budget is
    /// consumed and no observations recorded.
    #[must_use]
    pub fn explain(
        &self,
        features: &RequestFeatures,
        client_override: Option<&str>,
        keys: &KeyManager,
    ) -> RouteDecision {
        self.resolve_inner(features, client_override, keys, false)
    }

    fn resolve_inner(
        &self,
        features: &RequestFeatures,
        client_override: Option<&str>,
        keys: &KeyManager,
        live: bool,
    ) -> RouteDecision {
        let snapshot = self.snapshot.load();
        let config = &snapshot.config;

        if !config.enabled {
            let tier = self
                .catalog
                .get(&features.model)
                .map_or(Tier::Light, |spec| spec.home_tier);
            return RouteDecision {
                selected_model: Some(features.model.clone()),
                candidates: vec![features.model.clone()],
                tier,
                strategy: Strategy::Balanced,
                source: RouteSource::Passthrough,
                reason: "routing disabled".to_string(),
                matched_rule: None,
                classifier_result: None,
                fallback_reason: None,
                glm5_eligible: false,
                scoring_table: Vec::new(),
                cooldown_reasons: Vec::new(),
            };
        }

        // 1. Explicit override wins outright.
        if let Some(target) = client_override {
            return self.override_decision(target, RouteSource::Override, "client override");
        }
        if let Some(target) = config.overrides.get(&features.model) {
            return self.override_decision(
                target,
                RouteSource::SavedOverride,
                "saved override map",
            );
        }

        // 2. Rules, first match wins.
        let mut matched_rule = None;
        let mut classifier_result = None;
        let (tier, source, reason) = if let Some(compiled) = snapshot
            .rules
            .iter()
            .find(|compiled| compiled.matches(features))
        {
            let name = compiled
                .rule
                .name
                .clone()
                .unwrap_or_else(|| format!("rule targeting {}", compiled.rule.target_tier));
            matched_rule = Some(name.clone());
            (compiled.rule.target_tier, RouteSource::Rule, name)
        } else if let Some(result) =
            classify(features, &config.complexity_upgrade.thresholds)
        {
            let tier = result.tier;
            let reason = format!("classifier: {}", result.reason);
            classifier_result = Some(result);
            (tier, RouteSource::Classifier, reason)
        } else {
            // 3. Default: the requested model's home tier.
            let tier = self
                .catalog
                .get(&features.model)
                .map_or(Tier::Light, |spec| spec.home_tier);
            (tier, RouteSource::Default, format!("home tier of {}", features.model))
        };

        let glm5_eligible = !features.has_vision
            && self
                .catalog
                .iter()
                .any(|spec| spec.id.starts_with(GLM5_MODEL_PREFIX));

        let mut cooldown_reasons = Vec::new();
        let (mut selection_tier, mut candidates) =
            (tier, self.tier_candidates(config, tier, keys, live, &mut cooldown_reasons));

        // 4. One-tier downgrade under budget when the whole tier is out.
        let mut fallback_reason = None;
        if candidates.is_empty() {
            if let Some(lower) = tier.downgraded() {
                if self.try_consume_downgrade(live) {
                    let lower_candidates =
                        self.tier_candidates(config, lower, keys, live, &mut cooldown_reasons);
                    if lower_candidates.is_empty() {
                        fallback_reason =
                            Some(format!("{tier} exhausted; {lower} also unavailable"));
                    } else {
                        fallback_reason = Some(format!("{tier} exhausted; downgraded to {lower}"));
                        selection_tier = lower;
                        candidates = lower_candidates;
                    }
                } else {
                    fallback_reason = Some(format!("{tier} exhausted; downgrade budget spent"));
                }
            }
        }

        let strategy = config
            .tier(selection_tier)
            .map_or(Strategy::Balanced, |entry| entry.strategy);
        strategy::order_candidates(strategy, &mut candidates);

        // GLM-5 preference: move an eligible glm-5 candidate to the front for
        // the configured share of requests. Zero percent is shadow mode.
        if glm5_eligible && config.glm5.preference_percent > 0 {
            let roll = fastrand::u8(0..100);
            if roll < config.glm5.preference_percent {
                if let Some(index) = candidates
                    .iter()
                    .position(|candidate| candidate.model.starts_with(GLM5_MODEL_PREFIX))
                {
                    let preferred = candidates.remove(index);
                    candidates.insert(0, preferred);
                }
            }
        }

        let scoring_table = strategy::scoring_table(strategy, &candidates);
        let ordered: Vec<String> = candidates
            .iter()
            .map(|candidate| candidate.model.clone())
            .collect();

        RouteDecision {
            selected_model: ordered.first().cloned(),
            candidates: ordered,
            tier: selection_tier,
            strategy,
            source,
            reason,
            matched_rule,
            classifier_result,
            fallback_reason,
            glm5_eligible,
            scoring_table,
            cooldown_reasons,
        }
    }

    fn override_decision(
        &self,
        target: &str,
        source: RouteSource,
        reason: &str,
    ) -> RouteDecision {
        let tier = self
            .catalog
            .get(target)
            .map_or(Tier::Light, |spec| spec.home_tier);
        RouteDecision {
            selected_model: Some(target.to_string()),
            candidates: vec![target.to_string()],
            tier,
            strategy: Strategy::Balanced,
            source,
            reason: reason.to_string(),
            matched_rule: None,
            classifier_result: None,
            fallback_reason: None,
            glm5_eligible: false,
            scoring_table: Vec::new(),
            cooldown_reasons: Vec::new(),
        }
    }

    /// Eligible candidates of one tier: models with at least one available
    /// key and no pool-wide cooldown.
    fn tier_candidates(
        &self,
        config: &RoutingConfig,
        tier: Tier,
        keys: &KeyManager,
        live: bool,
        cooldown_reasons: &mut Vec<String>,
    ) -> SmallVec<[Candidate; 4]> {
        let Some(entry) = config.tier(tier) else {
            return SmallVec::new();
        };

        let mut candidates = SmallVec::with_capacity(entry.models.len());
        for (position, model) in entry.models.iter().enumerate() {
            let Some(spec) = self.catalog.get(model) else {
                cooldown_reasons.push(format!("{model}: not in model catalog"));
                continue;
            };
            let availability = keys.model_availability(spec.max_concurrency_per_key);
            if live {
                self.record_observation(spec, tier, availability);
            }
            if availability.is_eligible() {
                candidates.push(Candidate {
                    model: spec.id.clone(),
                    position,
                    available: availability.available_slots,
                    max_concurrency: keys.pool_capacity(spec.max_concurrency_per_key),
                    cost_per_m_tokens: spec.cost_per_m_input + spec.cost_per_m_output,
                });
            } else if availability.fully_cooled() {
                cooldown_reasons.push(format!(
                    "{model}: {} key(s) cooling, {} circuit(s) open",
                    availability.cooled_keys, availability.open_keys
                ));
            } else {
                cooldown_reasons.push(format!("{model}: all keys saturated"));
            }
        }
        candidates
    }

    fn record_observation(&self, spec: &ModelSpec, tier: Tier, availability: ModelAvailability) {
        self.observations.lock().insert(
            spec.id.clone(),
            ObservedAvailability {
                model: spec.id.clone(),
                tier: tier.as_str().to_string(),
                available_slots: availability.available_slots,
                in_cooldown: availability.fully_cooled(),
                per_key_limit: spec.max_concurrency_per_key,
            },
        );
    }

    fn try_consume_downgrade(&self, live: bool) -> bool {
        let now_ms = unix_now_ms();
        let mut window = self.downgrade.lock();
        if now_ms.saturating_sub(window.window_start_ms) > self.downgrade_window_ms {
            window.window_start_ms = now_ms;
            window.used = 0;
        }
        if window.used >= self.downgrade_budget {
            return false;
        }
        if live {
            window.used += 1;
        }
        true
    }
}
