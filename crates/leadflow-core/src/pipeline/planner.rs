//! Run planning.
//!
//! Turns a lead plus its campaign's live agent configuration into a new
//! run: the enabled agents in canonical order, run-level thresholds, a
//! frozen configuration snapshot, and linked steps at positions 10, 20, ...

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use leadflow_types::agent::{AgentName, ResolvedAgentConfig};
use leadflow_types::error::RepositoryError;
use leadflow_types::id::RunId;
use leadflow_types::lead::{Campaign, Lead};
use leadflow_types::run::{LeadRun, RunStatus, RunStep, StepMeta};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, info};

use crate::pipeline::dispatch::DeliveryGateway;
use crate::pipeline::positions::POSITION_STRIDE;
use crate::pipeline::resolver::ConfigResolver;
use crate::pipeline::settings::{DEFAULTS_VERSION, planning_thresholds};
use crate::repository::campaign::CampaignConfigRepository;
use crate::repository::run::RunRepository;
use crate::service::hash::SettingsHasher;

/// Version tag recorded in every config snapshot.
pub const PLANNER_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("no agents are enabled for this campaign")]
    NoAgentsEnabled,

    #[error("CRITIQUE is enabled but WRITER is not")]
    CritiqueRequiresWriter,

    #[error("DESIGN is enabled but WRITER is not")]
    DesignRequiresWriter,

    #[error("SENDER is enabled but WRITER is not")]
    SendRequiresWriter,

    #[error("email sending is not configured")]
    SendingNotConfigured { reasons: BTreeMap<String, String> },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl PlannerError {
    /// Machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            PlannerError::NoAgentsEnabled => "no_agents_enabled",
            PlannerError::CritiqueRequiresWriter => "critique_requires_writer",
            PlannerError::DesignRequiresWriter => "design_requires_writer",
            PlannerError::SendRequiresWriter => "send_requires_writer",
            PlannerError::SendingNotConfigured { .. } => "sending_not_configured",
            PlannerError::Repository(_) => "repository_error",
        }
    }
}

/// Builds runs for leads.
pub struct RunPlanner<R, C, D, H> {
    repo: Arc<R>,
    resolver: ConfigResolver<C>,
    delivery: Arc<D>,
    hasher: Arc<H>,
}

impl<R, C, D, H> Clone for RunPlanner<R, C, D, H> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            resolver: self.resolver.clone(),
            delivery: Arc::clone(&self.delivery),
            hasher: Arc::clone(&self.hasher),
        }
    }
}

impl<R, C, D, H> RunPlanner<R, C, D, H>
where
    R: RunRepository,
    C: CampaignConfigRepository,
    D: DeliveryGateway,
    H: SettingsHasher,
{
    pub fn new(repo: Arc<R>, resolver: ConfigResolver<C>, delivery: Arc<D>, hasher: Arc<H>) -> Self {
        Self {
            repo,
            resolver,
            delivery,
            hasher,
        }
    }

    /// Plan and persist a new run for `lead`, pointing the lead at it.
    ///
    /// Fails with `RepositoryError::Conflict` if the lead already has an
    /// active run.
    pub async fn build(&self, lead: &Lead) -> Result<LeadRun, PlannerError> {
        let campaign = self.resolver.campaign(&lead.campaign_id).await?;

        let mut resolved: BTreeMap<AgentName, ResolvedAgentConfig> = BTreeMap::new();
        for agent in AgentName::PIPELINE {
            resolved.insert(agent, self.resolver.resolve(&campaign, agent).await?);
        }

        let plan: Vec<AgentName> = AgentName::PIPELINE
            .into_iter()
            .filter(|agent| resolved.get(agent).is_some_and(|r| r.enabled))
            .collect();
        self.validate(&campaign, &plan).await?;

        let (min_score, max_rewrites) = resolved
            .get(&AgentName::Critique)
            .map(|r| planning_thresholds(&r.settings_snapshot))
            .unwrap_or_else(|| planning_thresholds(&Value::Null));

        let now = Utc::now();
        let run = LeadRun {
            id: RunId::new(),
            lead_id: lead.id,
            campaign_id: campaign.id,
            status: RunStatus::Queued,
            rewrite_count: 0,
            max_rewrites,
            min_score: Some(min_score),
            plan: plan.clone(),
            config_snapshot: self.config_snapshot(&campaign, &plan, &resolved),
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        let steps = plan_steps(&run);

        self.repo.create_run(&run, &steps).await?;
        info!(
            lead_id = %lead.id,
            run_id = %run.id,
            plan = ?plan,
            min_score,
            max_rewrites,
            "run planned"
        );
        Ok(run)
    }

    /// The lead's active run, planning one if there is none.
    pub async fn ensure_active_run(&self, lead: &Lead) -> Result<LeadRun, PlannerError> {
        if let Some(run) = self.repo.active_run_for_lead(&lead.id).await? {
            return Ok(run);
        }
        match self.build(lead).await {
            Err(PlannerError::Repository(RepositoryError::Conflict(msg))) => {
                debug!(lead_id = %lead.id, "concurrent run creation, re-reading active run");
                self.repo
                    .active_run_for_lead(&lead.id)
                    .await?
                    .ok_or(PlannerError::Repository(RepositoryError::Conflict(msg)))
            }
            other => other,
        }
    }

    async fn validate(&self, campaign: &Campaign, plan: &[AgentName]) -> Result<(), PlannerError> {
        if plan.is_empty() {
            return Err(PlannerError::NoAgentsEnabled);
        }
        let has = |agent: AgentName| plan.contains(&agent);
        if !has(AgentName::Writer) {
            if has(AgentName::Critique) {
                return Err(PlannerError::CritiqueRequiresWriter);
            }
            if has(AgentName::Design) {
                return Err(PlannerError::DesignRequiresWriter);
            }
            if has(AgentName::Sender) {
                return Err(PlannerError::SendRequiresWriter);
            }
        }
        if has(AgentName::Sender) {
            let check = self.delivery.check(&campaign.user_id, &campaign.id).await;
            if !check.ok {
                return Err(PlannerError::SendingNotConfigured {
                    reasons: check.reasons,
                });
            }
        }
        Ok(())
    }

    fn config_snapshot(
        &self,
        campaign: &Campaign,
        plan: &[AgentName],
        resolved: &BTreeMap<AgentName, ResolvedAgentConfig>,
    ) -> Value {
        let mut agents = Map::new();
        for agent in plan {
            if let Some(config) = resolved.get(agent) {
                agents.insert(
                    agent.as_str().to_string(),
                    json!({
                        "settings": config.settings_snapshot,
                        "agent_config_id": config.config_id,
                        "agent_config_updated_at": config.config_updated_at,
                    }),
                );
            }
        }

        json!({
            "planner_version": PLANNER_VERSION,
            "defaults_version": DEFAULTS_VERSION,
            "shared_settings_hash": self.hasher.hash_settings(&campaign.shared_settings),
            "shared_settings": campaign.shared_settings,
            "planned_at": Utc::now(),
            "agents": agents,
        })
    }
}

/// Steps for a fresh run, linked the way the executor expects: CRITIQUE
/// points at the preceding WRITER and SENDER at DESIGN (or WRITER).
fn plan_steps(run: &LeadRun) -> Vec<RunStep> {
    let mut steps: Vec<RunStep> = Vec::with_capacity(run.plan.len());
    for (idx, agent) in run.plan.iter().enumerate() {
        let last_of = |wanted: AgentName| {
            steps
                .iter()
                .rev()
                .find(|s: &&RunStep| s.agent == wanted)
                .map(|s| s.id)
        };
        let meta = match agent {
            AgentName::Critique => StepMeta {
                writer_step_id: last_of(AgentName::Writer),
                selected_variant_index: Some(0),
                ..Default::default()
            },
            AgentName::Sender => StepMeta {
                source_step_id: last_of(AgentName::Design).or_else(|| last_of(AgentName::Writer)),
                ..Default::default()
            },
            _ => StepMeta::default(),
        };
        let position = (idx as i64 + 1) * POSITION_STRIDE;
        steps.push(RunStep::queued(run.id, position, *agent, meta));
    }
    steps
}
