//! Boundaries to the collaborators the engine drives but does not implement:
//! agent execution and email delivery.

use std::collections::BTreeMap;

use leadflow_types::agent::AgentError;
use leadflow_types::id::{CampaignId, LeadId, RunId, StepId, UserId};
use leadflow_types::run::{LeadRun, RunStep};
use serde::{Deserialize, Serialize};

/// Everything an agent needs to execute one claimed step.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub run: LeadRun,
    pub step: RunStep,
    /// The step's frozen settings with engine-only keys removed.
    pub settings: serde_json::Value,
}

/// Executes LLM-backed agents (SEARCH, WRITER, CRITIQUE, DESIGN).
///
/// Implementations must be safe to call again for the same step: a crash
/// between dispatch and finalize leads to a retry on a later call.
pub trait AgentDispatcher: Send + Sync {
    /// Run the agent and return its payload.
    ///
    /// A payload carrying a non-empty `error_type` key is treated as a
    /// failure even though it is returned as `Ok`.
    fn dispatch(
        &self,
        request: DispatchRequest,
    ) -> impl std::future::Future<Output = Result<serde_json::Value, AgentError>> + Send;
}

/// Result of checking whether email delivery is configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryCheck {
    pub ok: bool,
    /// Machine-readable status per delivery channel (e.g. `"smtp": "missing_password"`).
    #[serde(default)]
    pub reasons: BTreeMap<String, String>,
}

impl DeliveryCheck {
    pub fn configured() -> Self {
        Self {
            ok: true,
            reasons: BTreeMap::new(),
        }
    }
}

/// Identifies the SENDER step an async delivery job must finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub lead_id: LeadId,
    pub run_id: RunId,
    pub step_id: StepId,
}

/// Email delivery: configuration check plus async job handoff.
///
/// A job enqueued here must eventually report back through
/// `DeliveryRecorder::record` so its step never stays running forever.
pub trait DeliveryGateway: Send + Sync {
    fn check(
        &self,
        user_id: &UserId,
        campaign_id: &CampaignId,
    ) -> impl std::future::Future<Output = DeliveryCheck> + Send;

    /// Enqueue the delivery job and return its job id.
    fn enqueue(
        &self,
        job: DeliveryJob,
    ) -> impl std::future::Future<Output = Result<String, AgentError>> + Send;
}
