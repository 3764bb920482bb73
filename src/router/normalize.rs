//! Idempotent rewrite of any prior-shape routing config into the v2 schema.
//!
//! Legacy (v1) tiers carry `targetModel` / `fallbackModels` / `failoverModel`;
//! the current shape carries an ordered `models` list. Normalization never
//! fails: invalid input degrades to a minimal valid skeleton with a warning.

use serde_json::Value;

use super::config::{
    ClassifierThresholds, ComplexityUpgrade, Glm5Config, RoutingConfig, RoutingRule, Strategy,
    Tier, TierConfig, ROUTING_CONFIG_VERSION,
};

const V1_TIER_FIELDS: [&str; 3] = ["targetModel", "fallbackModels", "failoverModel"];

/// Whether missing tiers are synthesized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeMode {
    /// Ensure the light/medium/heavy tiers all exist.
    Full,
    /// Partial update: only tiers present in the input are emitted.
    Patch,
}

/// Result of a normalization pass.
#[derive(Debug, Clone)]
pub struct NormalizeOutcome {
    pub config: RoutingConfig,
    /// True iff at least one tier in the input carried a v1 field.
    pub migrated: bool,
    pub warnings: Vec<String>,
}

/// Rewrite `input` into the v2 schema.
///
/// Guarantees:
/// - the output never contains `targetModel`, `fallbackModels` or
///   `failoverModel` in any tier;
/// - `normalize(normalize(x)) == normalize(x)`;
/// - invalid input yields a skeleton config plus a warning, never an error.
#[must_use]
pub fn normalize(input: &Value, mode: NormalizeMode) -> NormalizeOutcome {
    let mut warnings = Vec::new();

    let Some(root) = input.as_object() else {
        warnings.push("routing config is not an object; using defaults".to_string());
        return NormalizeOutcome {
            config: skeleton(mode),
            migrated: false,
            warnings,
        };
    };

    let mut config = RoutingConfig {
        version: ROUTING_CONFIG_VERSION.to_string(),
        enabled: root.get("enabled").and_then(Value::as_bool).unwrap_or(true),
        tiers: Default::default(),
        rules: Vec::new(),
        overrides: Default::default(),
        complexity_upgrade: ComplexityUpgrade::default(),
        glm5: Glm5Config::default(),
    };
    let mut migrated = false;

    match root.get("tiers") {
        None => {}
        Some(Value::Object(tiers)) => {
            for (name, tier_value) in tiers {
                let (tier_config, tier_migrated) =
                    normalize_tier(name, tier_value, &mut warnings);
                migrated |= tier_migrated;
                config.tiers.insert(name.clone(), tier_config);
            }
        }
        Some(_) => {
            warnings.push("tiers is not an object; ignoring".to_string());
        }
    }

    if mode == NormalizeMode::Full {
        for tier in Tier::ALL {
            config
                .tiers
                .entry(tier.as_str().to_string())
                .or_default();
        }
    }

    normalize_rules(root.get("rules"), &mut config.rules, &mut warnings);
    normalize_overrides(root.get("overrides"), &mut config.overrides, &mut warnings);
    config.complexity_upgrade = normalize_thresholds(root.get("complexityUpgrade"));
    config.glm5 = normalize_glm5(root.get("glm5"), &mut warnings);

    NormalizeOutcome {
        config,
        migrated,
        warnings,
    }
}

fn skeleton(mode: NormalizeMode) -> RoutingConfig {
    match mode {
        NormalizeMode::Full => RoutingConfig::default(),
        NormalizeMode::Patch => RoutingConfig {
            tiers: Default::default(),
            ..RoutingConfig::default()
        },
    }
}

/// Normalize a single tier. Returns the v2 tier and whether it was v1-shaped.
fn normalize_tier(name: &str, value: &Value, warnings: &mut Vec<String>) -> (TierConfig, bool) {
    let Some(tier) = value.as_object() else {
        warnings.push(format!("tier '{name}' is not an object; using empty tier"));
        return (TierConfig::default(), false);
    };

    let has_v1_field = V1_TIER_FIELDS.iter().any(|field| tier.contains_key(*field));
    let v2_models: Option<Vec<String>> = tier.get("models").and_then(Value::as_array).map(|models| {
        models
            .iter()
            .filter_map(Value::as_str)
            .filter(|model| !model.is_empty())
            .map(str::to_string)
            .collect()
    });
    let has_v2_models = v2_models.as_ref().is_some_and(|models| !models.is_empty());

    let models = if has_v2_models {
        if has_v1_field {
            warnings.push(format!(
                "tier '{name}' carries both legacy and current fields; using 'models'"
            ));
        }
        // Current-shape lists pass through as-is (already cloned above).
        v2_models.unwrap_or_default()
    } else if has_v1_field {
        let mut collected = Vec::new();
        if let Some(target) = tier.get("targetModel").and_then(Value::as_str) {
            collected.push(target.to_string());
        }
        if let Some(fallbacks) = tier.get("fallbackModels").and_then(Value::as_array) {
            collected.extend(
                fallbacks
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string),
            );
        }
        if let Some(failover) = tier.get("failoverModel").and_then(Value::as_str) {
            collected.push(failover.to_string());
        }
        collected.retain(|model| !model.is_empty());
        dedup_preserving_order(collected)
    } else {
        v2_models.unwrap_or_default()
    };

    let strategy = normalize_strategy(tier.get("strategy"));
    let label = tier.get("label").and_then(Value::as_str).map(str::to_string);
    let client_model_policy = tier
        .get("clientModelPolicy")
        .and_then(Value::as_str)
        .map(str::to_string);

    (
        TierConfig {
            models,
            strategy,
            label,
            client_model_policy,
        },
        has_v1_field,
    )
}

fn normalize_strategy(value: Option<&Value>) -> Strategy {
    match value.and_then(Value::as_str) {
        Some("quality") => Strategy::Quality,
        Some("throughput") => Strategy::Throughput,
        Some("pool") => Strategy::Pool,
        // The legacy "failover" value and everything unknown collapse to balanced.
        _ => Strategy::Balanced,
    }
}

fn normalize_rules(value: Option<&Value>, out: &mut Vec<RoutingRule>, warnings: &mut Vec<String>) {
    let Some(value) = value else { return };
    let Some(rules) = value.as_array() else {
        warnings.push("rules is not an array; ignoring".to_string());
        return;
    };

    for (index, rule_value) in rules.iter().enumerate() {
        match serde_json::from_value::<RoutingRule>(rule_value.clone()) {
            Ok(rule) => out.push(rule),
            Err(err) => warnings.push(format!("rule #{index} is invalid and was dropped: {err}")),
        }
    }
}

fn normalize_overrides(
    value: Option<&Value>,
    out: &mut std::collections::BTreeMap<String, String>,
    warnings: &mut Vec<String>,
) {
    let Some(value) = value else { return };
    let Some(overrides) = value.as_object() else {
        warnings.push("overrides is not an object; ignoring".to_string());
        return;
    };

    for (client_model, target) in overrides {
        match target.as_str() {
            Some(target) if !target.is_empty() => {
                out.insert(client_model.clone(), target.to_string());
            }
            _ => warnings.push(format!(
                "override '{client_model}' does not map to a model name; dropped"
            )),
        }
    }
}

fn normalize_thresholds(value: Option<&Value>) -> ComplexityUpgrade {
    let thresholds = value
        .and_then(|upgrade| upgrade.get("thresholds"))
        .and_then(|thresholds| {
            serde_json::from_value::<ClassifierThresholds>(thresholds.clone()).ok()
        })
        .unwrap_or_default();
    ComplexityUpgrade { thresholds }
}

fn normalize_glm5(value: Option<&Value>, warnings: &mut Vec<String>) -> Glm5Config {
    let Some(percent) = value
        .and_then(|glm5| glm5.get("preferencePercent"))
        .and_then(Value::as_u64)
    else {
        return Glm5Config::default();
    };

    if percent > 100 {
        warnings.push(format!(
            "glm5.preferencePercent {percent} is out of range; clamped to 100"
        ));
    }
    Glm5Config {
        preference_percent: u8::try_from(percent.min(100)).unwrap_or(100),
    }
}

fn dedup_preserving_order(models: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    models
        .into_iter()
        .filter(|model| seen.insert(model.clone()))
        .collect()
}

/// Field-by-field scan for legacy tier fields anywhere under `tiers`.
#[must_use]
pub fn contains_v1_fields(value: &Value) -> bool {
    let Some(tiers) = value.get("tiers").and_then(Value::as_object) else {
        return false;
    };
    tiers.values().any(|tier| {
        tier.as_object().is_some_and(|tier| {
            V1_TIER_FIELDS.iter().any(|field| tier.contains_key(*field))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_v1_tier_maps_to_models_in_first_seen_order() {
        let input = json!({
            "tiers": {
                "heavy": {
                    "targetModel": "m5",
                    "fallbackModels": ["m7", "m6"],
                    "failoverModel": "m+"
                }
            }
        });
        let outcome = normalize(&input, NormalizeMode::Full);

        assert!(outcome.migrated);
        assert!(outcome.warnings.is_empty());
        let heavy = outcome.config.tiers.get("heavy").unwrap();
        assert_eq!(heavy.models, vec!["m5", "m7", "m6", "m+"]);
        assert_eq!(heavy.strategy, Strategy::Balanced);
        for tier in ["light", "medium"] {
            let entry = outcome.config.tiers.get(tier).unwrap();
            assert!(entry.models.is_empty());
            assert_eq!(entry.strategy, Strategy::Balanced);
        }
        assert_eq!(outcome.config.version, "2.0");
    }

    #[test]
    fn test_v1_drops_empty_and_duplicate_entries() {
        let input = json!({
            "tiers": {
                "light": {
                    "targetModel": "a",
                    "fallbackModels": ["", "b", "a", "b"],
                    "failoverModel": "a"
                }
            }
        });
        let outcome = normalize(&input, NormalizeMode::Full);
        assert_eq!(
            outcome.config.tiers.get("light").unwrap().models,
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_v2_passes_through_unmigrated() {
        let input = json!({
            "tiers": {
                "medium": { "models": ["x", "y"], "strategy": "quality" }
            }
        });
        let outcome = normalize(&input, NormalizeMode::Full);
        assert!(!outcome.migrated);
        assert!(outcome.warnings.is_empty());
        let medium = outcome.config.tiers.get("medium").unwrap();
        assert_eq!(medium.models, vec!["x", "y"]);
        assert_eq!(medium.strategy, Strategy::Quality);
    }

    #[test]
    fn test_mixed_shape_warns_and_v2_wins_but_counts_as_migrated() {
        let input = json!({
            "tiers": {
                "heavy": {
                    "targetModel": "legacy",
                    "models": ["current"]
                }
            }
        });
        let outcome = normalize(&input, NormalizeMode::Full);
        assert!(outcome.migrated);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(
            outcome.config.tiers.get("heavy").unwrap().models,
            vec!["current"]
        );
    }

    #[test]
    fn test_failover_strategy_rewritten_to_balanced() {
        let input = json!({
            "tiers": {
                "heavy": { "targetModel": "m", "strategy": "failover" },
                "light": { "models": ["a"], "strategy": "definitely-not-a-strategy" }
            }
        });
        let outcome = normalize(&input, NormalizeMode::Full);
        assert_eq!(
            outcome.config.tiers.get("heavy").unwrap().strategy,
            Strategy::Balanced
        );
        assert_eq!(
            outcome.config.tiers.get("light").unwrap().strategy,
            Strategy::Balanced
        );
    }

    #[test]
    fn test_output_never_contains_v1_fields() {
        let input = json!({
            "tiers": {
                "heavy": { "targetModel": "m5", "fallbackModels": ["m7"], "failoverModel": "m+" },
                "light": { "models": ["a"], "targetModel": "stale" }
            }
        });
        let outcome = normalize(&input, NormalizeMode::Full);
        let value = serde_json::to_value(&outcome.config).unwrap();
        assert!(!contains_v1_fields(&value));
        assert!(contains_v1_fields(&input));
    }

    #[test]
    fn test_idempotence() {
        let input = json!({
            "tiers": {
                "heavy": { "targetModel": "m5", "fallbackModels": ["m7", "m6"] }
            },
            "overrides": { "claude-3-opus": "m5" },
            "glm5": { "preferencePercent": 30 }
        });
        let first = normalize(&input, NormalizeMode::Full);
        let first_value = serde_json::to_value(&first.config).unwrap();
        let second = normalize(&first_value, NormalizeMode::Full);

        assert_eq!(first.config, second.config);
        assert!(first.migrated);
        assert!(!second.migrated);
    }

    #[test]
    fn test_invalid_input_returns_skeleton_with_warning() {
        let outcome = normalize(&json!("not an object"), NormalizeMode::Full);
        assert!(!outcome.migrated);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.config.tiers.len(), 3);
    }

    #[test]
    fn test_non_object_tier_entry_degrades_with_warning() {
        let input = json!({ "tiers": { "heavy": 42 } });
        let outcome = normalize(&input, NormalizeMode::Full);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.config.tiers.get("heavy").unwrap().models.is_empty());
    }

    #[test]
    fn test_patch_mode_does_not_synthesize_tiers() {
        let input = json!({ "tiers": { "heavy": { "models": ["m"] } } });
        let outcome = normalize(&input, NormalizeMode::Patch);
        assert_eq!(outcome.config.tiers.len(), 1);
        assert!(outcome.config.tiers.contains_key("heavy"));
    }

    #[test]
    fn test_invalid_rule_dropped_with_warning() {
        let input = json!({
            "rules": [
                { "match": { "hasTools": true }, "targetTier": "heavy" },
                { "targetTier": "not-a-tier" }
            ]
        });
        let outcome = normalize(&input, NormalizeMode::Full);
        assert_eq!(outcome.config.rules.len(), 1);
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn test_glm5_percent_clamped() {
        let input = json!({ "glm5": { "preferencePercent": 250 } });
        let outcome = normalize(&input, NormalizeMode::Full);
        assert_eq!(outcome.config.glm5.preference_percent, 100);
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn test_enabled_false_preserved() {
        let outcome = normalize(&json!({ "enabled": false }), NormalizeMode::Full);
        assert!(!outcome.config.enabled);
    }
}
