//! Agent settings: system defaults, layered deep merge, canonical JSON for
//! hashing, and the prompt-settings filter applied before dispatch.
//!
//! Settings layer as `defaults < shared campaign settings < agent settings`.
//! Later layers win on scalar leaves; objects merge recursively.

use leadflow_types::agent::AgentName;
use serde_json::{Map, Value, json};

/// Version tag recorded in run snapshots for the defaults below.
pub const DEFAULTS_VERSION: &str = "v1";

/// Critique threshold used when nothing overrides it.
pub const DEFAULT_MIN_SCORE: i64 = 6;

/// Rewrite budget used when nothing overrides it.
pub const DEFAULT_MAX_REWRITES: u32 = 2;

/// Keys that configure the engine rather than the model and are stripped
/// from settings handed to language-model agents.
const ENGINE_ONLY_KEYS: &[&str] = &["min_score_for_send"];

/// System defaults for one agent.
pub fn agent_defaults(agent: AgentName) -> Value {
    match agent {
        AgentName::Writer => json!({
            "product_info": "",
            "sender_company": "",
        }),
        AgentName::Critique => json!({
            "strictness": "moderate",
            "min_score_for_send": DEFAULT_MIN_SCORE,
            "rewrite_policy": "rewrite_if_bad",
            "variant_selection": "highest_overall_score",
            "checks": {
                "check_personalization": true,
                "check_brand_voice": true,
                "check_spamminess": true,
            },
            "max_rewrites": DEFAULT_MAX_REWRITES,
        }),
        AgentName::Search | AgentName::Design | AgentName::Sender => json!({}),
    }
}

/// Recursively merge `overlay` onto `base`.
///
/// Non-object inputs are treated as empty objects, so a `null` settings
/// column merges like `{}`.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    let mut merged = as_object(base);
    for (key, value) in as_object(overlay) {
        let next = match merged.get(&key) {
            Some(existing) if existing.is_object() && value.is_object() => {
                deep_merge(existing, &value)
            }
            _ => value,
        };
        merged.insert(key, next);
    }
    Value::Object(merged)
}

fn as_object(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    }
}

/// Merge the three settings layers for `agent`.
pub fn merged_settings(agent: AgentName, shared: &Value, agent_settings: &Value) -> Value {
    deep_merge(&agent_defaults(agent), &deep_merge(shared, agent_settings))
}

/// Serialize with object keys sorted at every depth, so semantically equal
/// settings always produce identical text.
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Strip engine-only keys (at any depth) from settings bound for an LLM agent.
/// Non-LLM agents receive their settings unchanged.
pub fn prompt_settings(agent: AgentName, settings: &Value) -> Value {
    if agent.is_llm() {
        strip_engine_keys(settings)
    } else {
        settings.clone()
    }
}

fn strip_engine_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !ENGINE_ONLY_KEYS.contains(&key.as_str()))
                .map(|(key, v)| (key.clone(), strip_engine_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_engine_keys).collect()),
        other => other.clone(),
    }
}

/// Read an integer setting, accepting numeric strings and truncating floats.
pub fn int_setting(settings: &Value, key: &str) -> Option<i64> {
    match settings.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Run-level `(min_score, max_rewrites)` derived from the merged CRITIQUE settings.
pub fn planning_thresholds(critique_settings: &Value) -> (i64, u32) {
    let min_score = int_setting(critique_settings, "min_score_for_send")
        .unwrap_or(DEFAULT_MIN_SCORE)
        .clamp(0, 10);
    let max_rewrites = int_setting(critique_settings, "max_rewrites")
        .map(|n| n.max(0) as u32)
        .unwrap_or(DEFAULT_MAX_REWRITES);
    (min_score, max_rewrites)
}
