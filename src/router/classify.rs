//! Shallow request classification: feature extraction from the request body
//! and threshold-based tier selection.
//!
//! Precedence when several thresholds are crossed: has_tools, then
//! has_vision, then max_tokens, then message_count, then system_length.
//! Tools and vision imply the heavy tier, large token budgets imply heavy,
//! long conversations and long system prompts imply medium. A request that
//! crosses nothing falls through to the requested model's home tier.

use serde::Serialize;
use serde_json::Value;

use super::config::{ClassifierThresholds, Tier};

/// Features the router and rules match against. Extraction is shallow: no
/// content inspection beyond counting and flag detection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestFeatures {
    pub model: String,
    pub max_tokens: Option<u64>,
    pub message_count: u64,
    pub system_length: u64,
    pub has_tools: bool,
    pub has_vision: bool,
}

impl RequestFeatures {
    /// Extract features from a messages-style request body. Malformed bodies
    /// yield empty features rather than an error; validation happens later.
    #[must_use]
    pub fn from_body(body: &Value) -> Self {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let max_tokens = body.get("max_tokens").and_then(Value::as_u64);
        let messages = body.get("messages").and_then(Value::as_array);
        let message_count = messages.map_or(0, |messages| messages.len() as u64);

        let system_length = match body.get("system") {
            Some(Value::String(system)) => system.len() as u64,
            Some(Value::Array(blocks)) => blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .map(|text| text.len() as u64)
                .sum(),
            _ => 0,
        };

        let has_tools = body
            .get("tools")
            .and_then(Value::as_array)
            .is_some_and(|tools| !tools.is_empty());

        let has_vision = messages.is_some_and(|messages| {
            messages.iter().any(|message| {
                message
                    .get("content")
                    .and_then(Value::as_array)
                    .is_some_and(|blocks| {
                        blocks.iter().any(|block| {
                            block.get("type").and_then(Value::as_str) == Some("image")
                        })
                    })
            })
        });

        Self {
            model,
            max_tokens,
            message_count,
            system_length,
            has_tools,
            has_vision,
        }
    }
}

/// Outcome of a classification pass, kept for `explain`.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifierResult {
    pub tier: Tier,
    pub reason: &'static str,
}

/// Classify features against thresholds. `None` means nothing crossed a
/// threshold and the caller should use the requested model's home tier.
#[must_use]
pub fn classify(
    features: &RequestFeatures,
    thresholds: &ClassifierThresholds,
) -> Option<ClassifierResult> {
    if features.has_tools {
        return Some(ClassifierResult {
            tier: Tier::Heavy,
            reason: "has_tools",
        });
    }
    if features.has_vision {
        return Some(ClassifierResult {
            tier: Tier::Heavy,
            reason: "has_vision",
        });
    }
    if features
        .max_tokens
        .is_some_and(|max_tokens| max_tokens >= thresholds.max_tokens)
    {
        return Some(ClassifierResult {
            tier: Tier::Heavy,
            reason: "max_tokens",
        });
    }
    if features.message_count >= thresholds.message_count {
        return Some(ClassifierResult {
            tier: Tier::Medium,
            reason: "message_count",
        });
    }
    if features.system_length >= thresholds.system_length {
        return Some(ClassifierResult {
            tier: Tier::Medium,
            reason: "system_length",
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn thresholds() -> ClassifierThresholds {
        ClassifierThresholds {
            max_tokens: 4_096,
            message_count: 20,
            system_length: 4_000,
        }
    }

    #[test]
    fn test_extract_features_from_full_body() {
        let body = json!({
            "model": "claude-3-opus",
            "max_tokens": 8192,
            "system": "You are terse.",
            "messages": [
                { "role": "user", "content": "hi" },
                { "role": "assistant", "content": "hello" }
            ],
            "tools": [ { "name": "get_weather" } ]
        });
        let features = RequestFeatures::from_body(&body);
        assert_eq!(features.model, "claude-3-opus");
        assert_eq!(features.max_tokens, Some(8192));
        assert_eq!(features.message_count, 2);
        assert_eq!(features.system_length, 14);
        assert!(features.has_tools);
        assert!(!features.has_vision);
    }

    #[test]
    fn test_vision_detected_in_content_blocks() {
        let body = json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "image", "source": { "type": "base64" } },
                    { "type": "text", "text": "what is this" }
                ]
            }]
        });
        assert!(RequestFeatures::from_body(&body).has_vision);
    }

    #[test]
    fn test_malformed_body_yields_empty_features() {
        let features = RequestFeatures::from_body(&json!("nonsense"));
        assert_eq!(features.model, "");
        assert_eq!(features.message_count, 0);
        assert!(!features.has_tools);
    }

    #[test]
    fn test_tools_beat_everything() {
        let features = RequestFeatures {
            model: "m".into(),
            max_tokens: Some(100),
            message_count: 1,
            system_length: 0,
            has_tools: true,
            has_vision: true,
        };
        let result = classify(&features, &thresholds()).unwrap();
        assert_eq!(result.tier, Tier::Heavy);
        assert_eq!(result.reason, "has_tools");
    }

    #[test]
    fn test_max_tokens_crossing_goes_heavy() {
        let features = RequestFeatures {
            max_tokens: Some(4_096),
            ..RequestFeatures::default()
        };
        let result = classify(&features, &thresholds()).unwrap();
        assert_eq!(result.tier, Tier::Heavy);
        assert_eq!(result.reason, "max_tokens");
    }

    #[test]
    fn test_long_conversation_goes_medium() {
        let features = RequestFeatures {
            message_count: 25,
            ..RequestFeatures::default()
        };
        let result = classify(&features, &thresholds()).unwrap();
        assert_eq!(result.tier, Tier::Medium);
        assert_eq!(result.reason, "message_count");
    }

    #[test]
    fn test_nothing_crossed_returns_none() {
        let features = RequestFeatures {
            max_tokens: Some(512),
            message_count: 2,
            system_length: 80,
            ..RequestFeatures::default()
        };
        assert!(classify(&features, &thresholds()).is_none());
    }
}
