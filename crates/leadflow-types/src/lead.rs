//! Leads, their derived stage projection, and the campaigns that own them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;

use crate::id::{CampaignId, LeadId, RunId, UserId};

/// A work item advanced through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub campaign_id: CampaignId,
    /// Human-facing milestone label. Derived; never used for decisions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<LeadStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
    /// The lead's current non-terminal run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_run_id: Option<RunId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(campaign_id: CampaignId) -> Self {
        let now = Utc::now();
        Self {
            id: LeadId::new(),
            campaign_id,
            stage: None,
            quality: None,
            current_run_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Milestone labels projected onto a lead as steps complete.
///
/// Stored as its display string (`"rewritten (2)"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum LeadStage {
    Searched,
    Written,
    Rewritten(u32),
    Critiqued,
    Designed,
    Sent,
    SendFailed,
}

impl fmt::Display for LeadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeadStage::Searched => write!(f, "searched"),
            LeadStage::Written => write!(f, "written"),
            LeadStage::Rewritten(n) => write!(f, "rewritten ({n})"),
            LeadStage::Critiqued => write!(f, "critiqued"),
            LeadStage::Designed => write!(f, "designed"),
            LeadStage::Sent => write!(f, "sent"),
            LeadStage::SendFailed => write!(f, "send_failed"),
        }
    }
}

impl FromStr for LeadStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "searched" => Ok(LeadStage::Searched),
            "written" => Ok(LeadStage::Written),
            "critiqued" => Ok(LeadStage::Critiqued),
            "designed" => Ok(LeadStage::Designed),
            "sent" => Ok(LeadStage::Sent),
            "send_failed" => Ok(LeadStage::SendFailed),
            other => other
                .strip_prefix("rewritten (")
                .and_then(|rest| rest.strip_suffix(')'))
                .and_then(|n| n.parse::<u32>().ok())
                .map(LeadStage::Rewritten)
                .ok_or_else(|| format!("invalid lead stage: '{other}'")),
        }
    }
}

impl From<LeadStage> for String {
    fn from(stage: LeadStage) -> Self {
        stage.to_string()
    }
}

impl TryFrom<String> for LeadStage {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Coarse quality label set when a critique completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// The critique had no feedback.
    High,
    Medium,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::High => write!(f, "high"),
            Quality::Medium => write!(f, "medium"),
        }
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Quality::High),
            "medium" => Ok(Quality::Medium),
            other => Err(format!("invalid quality: '{other}'")),
        }
    }
}

/// A campaign groups leads and carries settings shared by all its agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub user_id: UserId,
    pub name: String,
    #[serde(default)]
    pub shared_settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
