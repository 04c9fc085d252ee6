//! Pipeline run domain types.
//!
//! A `LeadRun` is one attempt at advancing a lead through the agent pipeline.
//! It owns an ordered list of `RunStep`s (sparse integer positions) and each
//! step owns at most one `AgentOutput`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::fmt;

use crate::agent::AgentName;
use crate::id::{AgentConfigId, CampaignId, LeadId, OutputId, RunId, StepId};

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Derive a run's status from its steps: failed if any step failed,
    /// completed if none are queued or running, otherwise running.
    pub fn from_steps<I>(statuses: I) -> RunStatus
    where
        I: IntoIterator<Item = StepStatus>,
    {
        let mut active = false;
        for status in statuses {
            match status {
                StepStatus::Failed => return RunStatus::Failed,
                StepStatus::Queued | StepStatus::Running => active = true,
                StepStatus::Completed | StepStatus::Skipped => {}
            }
        }
        if active {
            RunStatus::Running
        } else {
            RunStatus::Completed
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Queued => write!(f, "queued"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, StepStatus::Queued | StepStatus::Running)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Queued => write!(f, "queued"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Lifecycle of a step's output record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    /// Recorded but awaiting an external completion (SENDER handoff).
    Pending,
    Completed,
    Failed,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// One pipeline attempt for a lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadRun {
    pub id: RunId,
    pub lead_id: LeadId,
    pub campaign_id: CampaignId,
    pub status: RunStatus,
    pub rewrite_count: u32,
    pub max_rewrites: u32,
    /// Minimum critique score (0..=10) required to proceed without a rewrite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<i64>,
    /// Agent names in planned order.
    pub plan: Vec<AgentName>,
    /// Frozen configuration captured at planning time.
    pub config_snapshot: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// Why a step was skipped. Only `Disabled` skips may be reversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The executor found the agent disabled when the step came up.
    AgentDisabled,
    /// The reconciler skipped the step after the agent was disabled mid-run.
    Disabled,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::AgentDisabled => "agent_disabled",
            SkipReason::Disabled => "disabled",
        }
    }
}

/// Typed step metadata: linkage ids, frozen settings, and skip audit fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMeta {
    /// CRITIQUE: the WRITER step whose draft is being critiqued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer_step_id: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_variant_index: Option<u32>,
    /// SENDER: the step whose output is the email to deliver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_step_id: Option<StepId>,
    /// Rewrite WRITER: the CRITIQUE step that triggered the rewrite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critique_step_id: Option<StepId>,
    /// Rewrite WRITER: 1-based rewrite number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_snapshot: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_snapshot_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_id: Option<AgentConfigId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_updated_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_agent_name: Option<AgentName>,

    /// Async delivery job id; a step carrying one awaits an external completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
}

/// One agent invocation within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStep {
    pub id: StepId,
    pub run_id: RunId,
    /// Sparse ordering key, unique within the run.
    pub position: i64,
    pub agent: AgentName,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub meta: StepMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_id: Option<OutputId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunStep {
    /// A fresh queued step.
    pub fn queued(run_id: RunId, position: i64, agent: AgentName, meta: StepMeta) -> Self {
        let now = Utc::now();
        Self {
            id: StepId::new(),
            run_id,
            position,
            agent,
            status: StepStatus::Queued,
            started_at: None,
            finished_at: None,
            meta,
            output_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Result of one step. At most one exists per step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub id: OutputId,
    pub step_id: StepId,
    pub run_id: RunId,
    pub lead_id: LeadId,
    pub agent: AgentName,
    pub status: OutputStatus,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentOutput {
    pub fn new(
        step: &RunStep,
        lead_id: LeadId,
        status: OutputStatus,
        payload: serde_json::Value,
        error_message: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: OutputId::new(),
            step_id: step.id,
            run_id: step.run_id,
            lead_id,
            agent: step.agent,
            status,
            payload,
            error_message,
            created_at: now,
            updated_at: now,
        }
    }

    /// String field of the payload, if present and non-empty.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    }
}
