//! Sendable-run resolution.
//!
//! A SENDER request either reuses the lead's active run (when the only
//! work left in it is sending) or creates a one-step send-only run that
//! delivers the lead's best existing email. Runs under the lead lease and
//! then the run lease, always in that order.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use leadflow_types::agent::AgentName;
use leadflow_types::config::EngineConfig;
use leadflow_types::error::RepositoryError;
use leadflow_types::id::{LeadId, RunId, StepId};
use leadflow_types::lead::{Campaign, Lead};
use leadflow_types::run::{LeadRun, OutputStatus, RunStatus, RunStep, StepMeta, StepStatus};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::pipeline::dispatch::DeliveryGateway;
use crate::pipeline::lease::{LeaseError, LeaseManager, LeaseScope};
use crate::pipeline::planner::{PlannerError, RunPlanner};
use crate::pipeline::positions::POSITION_STRIDE;
use crate::pipeline::reconciler::{ReconcileError, Reconciler};
use crate::pipeline::resolver::ConfigResolver;
use crate::repository::campaign::CampaignConfigRepository;
use crate::repository::run::RunRepository;
use crate::service::hash::SettingsHasher;

/// Output delivery states that mean an email is still on its way.
const IN_FLIGHT_EMAIL_STATUSES: &[&str] = &["queued", "sending", "retrying"];

#[derive(Debug, Error)]
pub enum SendOnlyError {
    #[error("lead {0} not found")]
    LeadNotFound(LeadId),

    #[error("SENDER is not planned: {reason}")]
    SenderNotPlanned { reason: &'static str },

    #[error("email sending is not configured")]
    SendingNotConfigured { reasons: BTreeMap<String, String> },

    #[error("an email is already being sent (run {run_id}, step {step_id})")]
    AlreadySending { run_id: RunId, step_id: StepId },

    #[error("run {run_id} still has {next_agent} work queued")]
    RunInProgress { run_id: RunId, next_agent: AgentName },

    #[error("no completed email to send")]
    SendSourceMissing,

    #[error(transparent)]
    Planner(#[from] PlannerError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl SendOnlyError {
    pub fn code(&self) -> &'static str {
        match self {
            SendOnlyError::LeadNotFound(_) => "lead_not_found",
            SendOnlyError::SenderNotPlanned { .. } => "sender_not_planned",
            SendOnlyError::SendingNotConfigured { .. } => "sending_not_configured",
            SendOnlyError::AlreadySending { .. } => "already_sending",
            SendOnlyError::RunInProgress { .. } => "run_in_progress",
            SendOnlyError::SendSourceMissing => "send_source_missing",
            SendOnlyError::Planner(e) => e.code(),
            SendOnlyError::Reconcile(_) | SendOnlyError::Lease(_) | SendOnlyError::Repository(_) => {
                "internal_error"
            }
        }
    }
}

pub struct SendableRuns<R, C, D, H> {
    repo: Arc<R>,
    resolver: ConfigResolver<C>,
    delivery: Arc<D>,
    planner: RunPlanner<R, C, D, H>,
    reconciler: Reconciler<R, C>,
    leases: LeaseManager<R>,
}

impl<R, C, D, H> SendableRuns<R, C, D, H>
where
    R: RunRepository,
    C: CampaignConfigRepository,
    D: DeliveryGateway,
    H: SettingsHasher,
{
    pub fn new(
        repo: Arc<R>,
        resolver: ConfigResolver<C>,
        delivery: Arc<D>,
        hasher: Arc<H>,
        config: &EngineConfig,
    ) -> Self {
        let planner = RunPlanner::new(
            Arc::clone(&repo),
            resolver.clone(),
            Arc::clone(&delivery),
            hasher,
        );
        let reconciler = Reconciler::new(Arc::clone(&repo), resolver.clone(), config);
        let leases = LeaseManager::new(Arc::clone(&repo), config);
        Self {
            repo,
            resolver,
            delivery,
            planner,
            reconciler,
            leases,
        }
    }

    /// The run a caller should drive to satisfy `requested`.
    ///
    /// Non-SENDER requests get the lead's active run (planned if needed).
    pub async fn ensure_sendable_run(
        &self,
        lead_id: LeadId,
        requested: AgentName,
    ) -> Result<LeadRun, SendOnlyError> {
        let lead = self
            .repo
            .get_lead(&lead_id)
            .await?
            .ok_or(SendOnlyError::LeadNotFound(lead_id))?;

        if requested != AgentName::Sender {
            return Ok(self.planner.ensure_active_run(&lead).await?);
        }

        self.leases
            .hold(LeaseScope::Lead(lead.id), self.sender_run(&lead))
            .await
    }

    async fn sender_run(&self, lead: &Lead) -> Result<LeadRun, SendOnlyError> {
        let campaign = self.resolver.campaign(&lead.campaign_id).await?;
        if let Some(run) = self.repo.active_run_for_lead(&lead.id).await? {
            let reused = self
                .leases
                .hold(LeaseScope::Run(run.id), self.reuse_active(lead, &campaign, run))
                .await?;
            if let Some(run) = reused {
                return Ok(run);
            }
        }
        self.create_send_only(lead, &campaign).await
    }

    /// `Some(run)` when the active run can deliver the email itself;
    /// `None` when it turned out to have no work left.
    async fn reuse_active(
        &self,
        lead: &Lead,
        campaign: &Campaign,
        run: LeadRun,
    ) -> Result<Option<LeadRun>, SendOnlyError> {
        self.reconciler.skip_all_disabled(&run).await?;
        self.validate_sender(campaign).await?;

        let steps = self.repo.list_steps(&run.id).await?;
        let active: Vec<&RunStep> = steps.iter().filter(|s| s.status.is_active()).collect();

        if let Some(sending) = active
            .iter()
            .find(|s| s.agent == AgentName::Sender && s.status == StepStatus::Running)
        {
            return Err(SendOnlyError::AlreadySending {
                run_id: run.id,
                step_id: sending.id,
            });
        }

        let Some(first) = active.first() else {
            let status = self.reconciler.refresh_status(&run).await?;
            debug!(run_id = %run.id, %status, "active run had no work left");
            return Ok(None);
        };

        if active.iter().all(|s| s.agent == AgentName::Sender) {
            self.repair_source(lead, first).await?;
            info!(lead_id = %lead.id, run_id = %run.id, "reusing active run for send");
            return Ok(Some(run));
        }

        Err(SendOnlyError::RunInProgress {
            run_id: run.id,
            next_agent: first.agent,
        })
    }

    async fn create_send_only(&self, lead: &Lead, campaign: &Campaign) -> Result<LeadRun, SendOnlyError> {
        self.validate_sender(campaign).await?;
        let source = self
            .find_send_source(&lead.id)
            .await?
            .ok_or(SendOnlyError::SendSourceMissing)?;
        self.guard_in_flight(&lead.id).await?;

        let now = Utc::now();
        let run = LeadRun {
            id: RunId::new(),
            lead_id: lead.id,
            campaign_id: campaign.id,
            status: RunStatus::Queued,
            rewrite_count: 0,
            max_rewrites: 0,
            min_score: Some(0),
            plan: vec![AgentName::Sender],
            config_snapshot: json!({
                "send_only": true,
                "source_step_id": source,
                "planned_at": now,
            }),
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        let step = RunStep::queued(
            run.id,
            POSITION_STRIDE,
            AgentName::Sender,
            StepMeta {
                source_step_id: Some(source),
                ..Default::default()
            },
        );

        match self.repo.create_run(&run, &[step]).await {
            Ok(()) => {
                info!(lead_id = %lead.id, run_id = %run.id, source_step_id = %source, "send-only run created");
                Ok(run)
            }
            Err(RepositoryError::Conflict(msg)) => {
                debug!(lead_id = %lead.id, "concurrent run creation, re-reading active run");
                self.repo
                    .active_run_for_lead(&lead.id)
                    .await?
                    .ok_or(SendOnlyError::Repository(RepositoryError::Conflict(msg)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn validate_sender(&self, campaign: &Campaign) -> Result<(), SendOnlyError> {
        if !self.resolver.has_config(&campaign.id, AgentName::Sender).await? {
            return Err(SendOnlyError::SenderNotPlanned {
                reason: "config_missing",
            });
        }
        if !self.resolver.resolve(campaign, AgentName::Sender).await?.enabled {
            return Err(SendOnlyError::SenderNotPlanned {
                reason: "config_disabled",
            });
        }
        let check = self.delivery.check(&campaign.user_id, &campaign.id).await;
        if !check.ok {
            return Err(SendOnlyError::SendingNotConfigured {
                reasons: check.reasons,
            });
        }
        Ok(())
    }

    /// Latest completed DESIGN output with an email, else the latest
    /// completed WRITER output with one.
    pub async fn find_send_source(&self, lead_id: &LeadId) -> Result<Option<StepId>, SendOnlyError> {
        let candidates = [
            (AgentName::Design, &["formatted_email", "email"][..]),
            (AgentName::Writer, &["email"][..]),
        ];
        for (agent, keys) in candidates {
            for output in self.repo.outputs_for_lead(lead_id, agent).await? {
                if output.status != OutputStatus::Completed
                    || !keys.iter().any(|key| output.payload_str(key).is_some())
                {
                    continue;
                }
                let completed = self
                    .repo
                    .get_step(&output.step_id)
                    .await?
                    .is_some_and(|s| s.status == StepStatus::Completed);
                if completed {
                    return Ok(Some(output.step_id));
                }
            }
        }
        Ok(None)
    }

    async fn guard_in_flight(&self, lead_id: &LeadId) -> Result<(), SendOnlyError> {
        for output in self.repo.outputs_for_lead(lead_id, AgentName::Sender).await? {
            let in_flight = output
                .payload_str("email_status")
                .is_some_and(|status| IN_FLIGHT_EMAIL_STATUSES.contains(&status));
            if !in_flight {
                continue;
            }
            let active = self
                .repo
                .get_step(&output.step_id)
                .await?
                .is_some_and(|s| s.status.is_active());
            if active {
                return Err(SendOnlyError::AlreadySending {
                    run_id: output.run_id,
                    step_id: output.step_id,
                });
            }
        }
        Ok(())
    }

    /// Point a queued SENDER at a usable source if its planned one has no
    /// completed email.
    async fn repair_source(&self, lead: &Lead, sender: &RunStep) -> Result<(), SendOnlyError> {
        let usable = match sender.meta.source_step_id {
            Some(source) => self
                .repo
                .get_output_for_step(&source)
                .await?
                .is_some_and(|o| {
                    o.status == OutputStatus::Completed
                        && (o.payload_str("formatted_email").is_some() || o.payload_str("email").is_some())
                }),
            None => false,
        };
        if usable {
            return Ok(());
        }

        if let Some(source) = self.find_send_source(&lead.id).await? {
            let meta = StepMeta {
                source_step_id: Some(source),
                ..sender.meta.clone()
            };
            self.repo.update_step_meta(&sender.id, &meta).await?;
            info!(step_id = %sender.id, source_step_id = %source, "repaired sender source step");
        }
        Ok(())
    }
}
