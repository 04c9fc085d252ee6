//! Agent vocabulary, per-campaign agent configuration, and the structured
//! error shape agents report back to the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

use crate::id::{AgentConfigId, CampaignId};

// ---------------------------------------------------------------------------
// Agent names
// ---------------------------------------------------------------------------

/// The fixed step vocabulary of a lead pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentName {
    Search,
    Writer,
    Critique,
    Design,
    Sender,
}

impl AgentName {
    /// Canonical pipeline order used by the planner.
    pub const PIPELINE: [AgentName; 5] = [
        AgentName::Search,
        AgentName::Writer,
        AgentName::Critique,
        AgentName::Design,
        AgentName::Sender,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentName::Search => "SEARCH",
            AgentName::Writer => "WRITER",
            AgentName::Critique => "CRITIQUE",
            AgentName::Design => "DESIGN",
            AgentName::Sender => "SENDER",
        }
    }

    /// Whether this agent is backed by a language model (and so receives
    /// prompt settings). SENDER only hands off to the delivery job.
    pub fn is_llm(&self) -> bool {
        !matches!(self, AgentName::Sender)
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "SEARCH" => Ok(AgentName::Search),
            "WRITER" => Ok(AgentName::Writer),
            "CRITIQUE" => Ok(AgentName::Critique),
            "DESIGN" => Ok(AgentName::Design),
            "SENDER" => Ok(AgentName::Sender),
            other => Err(format!("invalid agent name: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent configuration
// ---------------------------------------------------------------------------

/// Per-campaign configuration for one agent.
///
/// `id` and `updated_at` together form the "config version" recorded on
/// steps that observe this row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: AgentConfigId,
    pub campaign_id: CampaignId,
    pub agent: AgentName,
    pub enabled: bool,
    /// Agent-specific settings, deep-merged over shared campaign settings.
    pub settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Configuration resolved for one agent at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedAgentConfig {
    pub enabled: bool,
    /// Fully merged settings (defaults < shared < agent).
    pub settings_snapshot: serde_json::Value,
    pub config_id: Option<AgentConfigId>,
    pub config_updated_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Agent errors
// ---------------------------------------------------------------------------

/// Structured error fields reported by an agent or its provider.
///
/// Serialized with the payload keys stored on failed outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Machine-readable error code.
    #[serde(rename = "error")]
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
    #[serde(rename = "error_code", default, skip_serializing_if = "Option::is_none")]
    pub provider_code: Option<String>,
    #[serde(rename = "error_type", default, skip_serializing_if = "Option::is_none")]
    pub provider_type: Option<String>,
    #[serde(rename = "provider", default, skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_error: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<String>,
}

impl ErrorDetails {
    /// A non-retryable error carrying only a code.
    pub fn code(code: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            message: code.clone(),
            code,
            ..Default::default()
        }
    }

    /// Extract error details from an agent payload that carries an explicit
    /// `error_type` marker. Returns `None` for ordinary success payloads.
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        let obj = payload.as_object()?;
        let provider_type = obj
            .get("error_type")
            .and_then(non_empty_string)?;

        let message = obj
            .get("error")
            .and_then(non_empty_string)
            .or_else(|| obj.get("detail").and_then(non_empty_string))
            .unwrap_or_else(|| "Agent returned error".to_string());

        Some(Self {
            code: message.clone(),
            message,
            retryable: obj.get("retryable").and_then(|v| v.as_bool()).unwrap_or(false),
            provider_code: obj.get("error_code").and_then(non_empty_string),
            provider_type: Some(provider_type),
            provider_name: obj.get("provider").and_then(non_empty_string),
            provider_error: obj.get("provider_error").filter(|v| !v.is_null()).cloned(),
            request_id: obj.get("request_id").and_then(non_empty_string),
            occurred_at: obj.get("occurred_at").and_then(non_empty_string),
        })
    }

    /// Merge these fields into an existing payload, keeping unrelated keys.
    pub fn merge_into(&self, payload: &mut serde_json::Value) {
        if !payload.is_object() {
            *payload = serde_json::Value::Object(serde_json::Map::new());
        }
        let fields = match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => return,
        };
        if let Some(target) = payload.as_object_mut() {
            for (key, value) in fields {
                target.insert(key, value);
            }
        }
    }
}

fn non_empty_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Failure reported by the agent-execution boundary.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// The agent or its provider failed; fields are persisted on the output.
    #[error("agent error: {}", .0.message)]
    Provider(ErrorDetails),

    /// A precondition for running the step did not hold.
    #[error("{0}")]
    Precondition(String),
}

impl AgentError {
    pub fn into_details(self) -> ErrorDetails {
        match self {
            AgentError::Provider(details) => details,
            AgentError::Precondition(code) => ErrorDetails::code(code),
        }
    }
}
