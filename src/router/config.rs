//! Current-schema (v2) routing configuration types.
//!
//! The wire shape is JSON with camelCase fields. Legacy (v1) documents are
//! rewritten into this shape by [`crate::router::normalize`] before they reach
//! any typed code; nothing here knows about `targetModel` and friends.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const ROUTING_CONFIG_VERSION: &str = "2.0";

/// Routing tier names, ordered light < medium < heavy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Light,
    Medium,
    Heavy,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Light, Tier::Medium, Tier::Heavy];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Light => "light",
            Tier::Medium => "medium",
            Tier::Heavy => "heavy",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Tier> {
        match value {
            "light" => Some(Tier::Light),
            "medium" => Some(Tier::Medium),
            "heavy" => Some(Tier::Heavy),
            _ => None,
        }
    }

    /// The next tier down, used by the downgrade budget. Light has none.
    #[must_use]
    pub fn downgraded(self) -> Option<Tier> {
        match self {
            Tier::Heavy => Some(Tier::Medium),
            Tier::Medium => Some(Tier::Light),
            Tier::Light => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule for picking a model out of a tier's ordered list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Quality,
    Throughput,
    #[default]
    Balanced,
    Pool,
}

impl Strategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Quality => "quality",
            Strategy::Throughput => "throughput",
            Strategy::Balanced => "balanced",
            Strategy::Pool => "pool",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tier's model list and selection strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TierConfig {
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_model_policy: Option<String>,
}

/// Feature criteria a routing rule matches against. Absent criteria match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_gte: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count_gte: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_length_gte: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_tools: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_vision: Option<bool>,
}

/// An ordered routing rule; the first whose match fits wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "match", default)]
    pub criteria: RuleMatch,
    pub target_tier: Tier,
}

/// Thresholds the classifier compares request features against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierThresholds {
    #[serde(default = "default_max_tokens_threshold")]
    pub max_tokens: u64,
    #[serde(default = "default_message_count_threshold")]
    pub message_count: u64,
    #[serde(default = "default_system_length_threshold")]
    pub system_length: u64,
}

fn default_max_tokens_threshold() -> u64 {
    4_096
}
fn default_message_count_threshold() -> u64 {
    20
}
fn default_system_length_threshold() -> u64 {
    4_000
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens_threshold(),
            message_count: default_message_count_threshold(),
            system_length: default_system_length_threshold(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ComplexityUpgrade {
    #[serde(default)]
    pub thresholds: ClassifierThresholds,
}

/// GLM-5 rollout lever. `preference_percent == 0` is shadow mode: eligible
/// requests are tagged but not routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Glm5Config {
    #[serde(default)]
    pub preference_percent: u8,
}

/// The complete v2 routing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tiers: BTreeMap<String, TierConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RoutingRule>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub complexity_upgrade: ComplexityUpgrade,
    #[serde(default)]
    pub glm5: Glm5Config,
}

fn default_version() -> String {
    ROUTING_CONFIG_VERSION.to_string()
}
fn default_enabled() -> bool {
    true
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let mut tiers = BTreeMap::new();
        for tier in Tier::ALL {
            tiers.insert(tier.as_str().to_string(), TierConfig::default());
        }
        Self {
            version: default_version(),
            enabled: default_enabled(),
            tiers,
            rules: Vec::new(),
            overrides: BTreeMap::new(),
            complexity_upgrade: ComplexityUpgrade::default(),
            glm5: Glm5Config::default(),
        }
    }
}

impl RoutingConfig {
    #[must_use]
    pub fn tier(&self, tier: Tier) -> Option<&TierConfig> {
        self.tiers.get(tier.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering_and_downgrade() {
        assert!(Tier::Light < Tier::Heavy);
        assert_eq!(Tier::Heavy.downgraded(), Some(Tier::Medium));
        assert_eq!(Tier::Medium.downgraded(), Some(Tier::Light));
        assert_eq!(Tier::Light.downgraded(), None);
    }

    #[test]
    fn test_strategy_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&Strategy::Throughput).unwrap(),
            "\"throughput\""
        );
        let parsed: Strategy = serde_json::from_str("\"pool\"").unwrap();
        assert_eq!(parsed, Strategy::Pool);
    }

    #[test]
    fn test_default_config_has_all_tiers() {
        let config = RoutingConfig::default();
        for tier in Tier::ALL {
            let entry = config.tier(tier).unwrap();
            assert!(entry.models.is_empty());
            assert_eq!(entry.strategy, Strategy::Balanced);
        }
        assert_eq!(config.version, "2.0");
        assert!(config.enabled);
    }

    #[test]
    fn test_rule_match_field_names_are_camel_case() {
        let rule: RoutingRule = serde_json::from_value(serde_json::json!({
            "name": "big-context",
            "match": { "maxTokensGte": 8000, "hasTools": true },
            "targetTier": "heavy"
        }))
        .unwrap();
        assert_eq!(rule.criteria.max_tokens_gte, Some(8_000));
        assert_eq!(rule.criteria.has_tools, Some(true));
        assert_eq!(rule.target_tier, Tier::Heavy);
    }
}
