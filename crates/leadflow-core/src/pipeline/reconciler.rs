//! Mid-run reconciliation against live agent configuration.
//!
//! Disabling an agent skips its queued steps (`skip_reason = disabled`);
//! re-enabling requeues exactly those steps. Steps that are running or
//! already finished are never touched. Also inserts a missing agent step in
//! front of an anchor step (DESIGN before SENDER).

use std::sync::Arc;

use chrono::Utc;
use leadflow_types::agent::AgentName;
use leadflow_types::config::EngineConfig;
use leadflow_types::error::RepositoryError;
use leadflow_types::id::{RunId, StepId};
use leadflow_types::run::{LeadRun, RunStatus, RunStep, SkipReason, StepMeta, StepStatus};
use thiserror::Error;
use tracing::{debug, info};

use crate::pipeline::lease::{LeaseError, LeaseManager, LeaseScope};
use crate::pipeline::positions::{Anchor, PositionError, append_position, plan_insertion};
use crate::pipeline::resolver::ConfigResolver;
use crate::pipeline::rollup::{apply_rollup, statuses_after};
use crate::repository::campaign::CampaignConfigRepository;
use crate::repository::run::{RunRepository, RunTransition};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("anchor {agent} step {step_id} is {status}, cannot insert before it")]
    AnchorNotQueued {
        agent: AgentName,
        step_id: StepId,
        status: StepStatus,
    },

    #[error(transparent)]
    Positions(#[from] PositionError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Counts from a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub skipped: u64,
    pub requeued: u64,
}

/// Result of `insert_before_anchor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    /// The agent already has a step in the run.
    AlreadyPresent(StepId),
    InsertedBefore { step_id: StepId, anchor: StepId },
    /// No anchor step exists; the new step went to the end.
    Appended(StepId),
    /// The run is terminal and was left alone.
    RunTerminal,
}

pub struct Reconciler<R, C> {
    repo: Arc<R>,
    resolver: ConfigResolver<C>,
    leases: LeaseManager<R>,
}

impl<R, C> Clone for Reconciler<R, C> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            resolver: self.resolver.clone(),
            leases: self.leases.clone(),
        }
    }
}

impl<R, C> Reconciler<R, C>
where
    R: RunRepository,
    C: CampaignConfigRepository,
{
    pub fn new(repo: Arc<R>, resolver: ConfigResolver<C>, config: &EngineConfig) -> Self {
        let leases = LeaseManager::new(Arc::clone(&repo), config);
        Self {
            repo,
            resolver,
            leases,
        }
    }

    /// Skip the queued steps of `agent`. Returns how many were skipped.
    pub async fn disable_agent(&self, run_id: RunId, agent: AgentName) -> Result<u64, ReconcileError> {
        self.leases
            .hold(LeaseScope::Run(run_id), async {
                let Some(run) = self.active_run(run_id).await? else {
                    return Ok(0);
                };
                let skipped = self.skip_disabled(&run, agent).await?;
                if skipped > 0 {
                    self.refresh_status(&run).await?;
                }
                Ok(skipped)
            })
            .await
    }

    /// Requeue the steps of `agent` skipped by `disable_agent`.
    pub async fn enable_agent(&self, run_id: RunId, agent: AgentName) -> Result<u64, ReconcileError> {
        self.leases
            .hold(LeaseScope::Run(run_id), async {
                let Some(run) = self.active_run(run_id).await? else {
                    return Ok(0);
                };
                let requeued = self
                    .repo
                    .requeue_skipped_steps(&run.id, agent, SkipReason::Disabled)
                    .await?;
                if requeued > 0 {
                    info!(run_id = %run.id, %agent, requeued, "requeued re-enabled agent steps");
                    self.refresh_status(&run).await?;
                }
                Ok(requeued)
            })
            .await
    }

    /// Bring every agent's steps in line with its live enabled flag.
    pub async fn reconcile_enablement(&self, run_id: RunId) -> Result<ReconcileSummary, ReconcileError> {
        self.leases
            .hold(LeaseScope::Run(run_id), async {
                let Some(run) = self.active_run(run_id).await? else {
                    return Ok(ReconcileSummary::default());
                };
                let summary = self.reconcile_locked(&run).await?;
                if summary != ReconcileSummary::default() {
                    self.refresh_status(&run).await?;
                }
                Ok(summary)
            })
            .await
    }

    /// Make sure `agent` has a step placed immediately before the first
    /// queued `anchor` step.
    pub async fn insert_before_anchor(
        &self,
        run_id: RunId,
        agent: AgentName,
        anchor: AgentName,
    ) -> Result<Insertion, ReconcileError> {
        self.leases
            .hold(LeaseScope::Run(run_id), async {
                let Some(run) = self.active_run(run_id).await? else {
                    return Ok(Insertion::RunTerminal);
                };
                self.insert_locked(&run, agent, anchor).await
            })
            .await
    }

    /// DESIGN before SENDER.
    pub async fn ensure_design_step(&self, run_id: RunId) -> Result<Insertion, ReconcileError> {
        self.insert_before_anchor(run_id, AgentName::Design, AgentName::Sender)
            .await
    }

    // -----------------------------------------------------------------------
    // Lease-free internals; callers hold the run lease.
    // -----------------------------------------------------------------------

    pub(crate) async fn skip_disabled(&self, run: &LeadRun, agent: AgentName) -> Result<u64, ReconcileError> {
        let skipped = self
            .repo
            .skip_queued_steps(&run.id, agent, SkipReason::Disabled, Utc::now())
            .await?;
        if skipped > 0 {
            info!(run_id = %run.id, %agent, skipped, "skipped steps of disabled agent");
        }
        Ok(skipped)
    }

    /// Skip queued steps of every agent that is disabled right now.
    pub(crate) async fn skip_all_disabled(&self, run: &LeadRun) -> Result<u64, ReconcileError> {
        let campaign = self.resolver.campaign(&run.campaign_id).await?;
        let mut skipped = 0;
        for agent in AgentName::PIPELINE {
            if !self.resolver.resolve(&campaign, agent).await?.enabled {
                skipped += self.skip_disabled(run, agent).await?;
            }
        }
        Ok(skipped)
    }

    async fn reconcile_locked(&self, run: &LeadRun) -> Result<ReconcileSummary, ReconcileError> {
        let campaign = self.resolver.campaign(&run.campaign_id).await?;
        let mut summary = ReconcileSummary::default();
        for agent in AgentName::PIPELINE {
            if self.resolver.resolve(&campaign, agent).await?.enabled {
                summary.requeued += self
                    .repo
                    .requeue_skipped_steps(&run.id, agent, SkipReason::Disabled)
                    .await?;
            } else {
                summary.skipped += self.skip_disabled(run, agent).await?;
            }
        }
        debug!(run_id = %run.id, skipped = summary.skipped, requeued = summary.requeued, "reconciled enablement");
        Ok(summary)
    }

    async fn insert_locked(
        &self,
        run: &LeadRun,
        agent: AgentName,
        anchor: AgentName,
    ) -> Result<Insertion, ReconcileError> {
        let steps = self.repo.list_steps(&run.id).await?;
        if let Some(existing) = steps.iter().find(|s| s.agent == agent) {
            return Ok(Insertion::AlreadyPresent(existing.id));
        }

        let anchors: Vec<&RunStep> = steps.iter().filter(|s| s.agent == anchor).collect();
        let queued_anchor = anchors.iter().find(|s| s.status == StepStatus::Queued);

        let mut transition = RunTransition::new(run.id, run.lead_id);
        let (step, anchor_id) = match (queued_anchor, anchors.first()) {
            (Some(target), _) => {
                let plan = plan_insertion(&steps, Anchor::Before(target.id), 1)?;
                transition.renumber = plan.renumber;
                let step = RunStep::queued(run.id, plan.positions[0], agent, StepMeta::default());
                (step, Some(target.id))
            }
            (None, Some(blocked)) => {
                return Err(ReconcileError::AnchorNotQueued {
                    agent: anchor,
                    step_id: blocked.id,
                    status: blocked.status,
                });
            }
            (None, None) => {
                let step = RunStep::queued(run.id, append_position(&steps), agent, StepMeta::default());
                (step, None)
            }
        };

        let step_id = step.id;
        transition.new_steps = vec![step];
        let statuses = statuses_after(&steps, &[], &transition.new_steps);
        apply_rollup(&mut transition, run, &statuses, Utc::now());
        self.repo.apply_transition(&transition).await?;

        // A SENDER anchored behind a new DESIGN step now sends the design.
        if let (Some(anchor_id), AgentName::Design, AgentName::Sender) = (anchor_id, agent, anchor) {
            if let Some(sender) = steps.iter().find(|s| s.id == anchor_id) {
                let meta = StepMeta {
                    source_step_id: Some(step_id),
                    ..sender.meta.clone()
                };
                self.repo.update_step_meta(&anchor_id, &meta).await?;
            }
        }

        info!(run_id = %run.id, %agent, %anchor, step_id = %step_id, "inserted agent step");
        Ok(match anchor_id {
            Some(anchor) => Insertion::InsertedBefore { step_id, anchor },
            None => Insertion::Appended(step_id),
        })
    }

    pub(crate) async fn active_run(&self, run_id: RunId) -> Result<Option<LeadRun>, ReconcileError> {
        let run = self
            .repo
            .get_run(&run_id)
            .await?
            .ok_or(ReconcileError::RunNotFound(run_id))?;
        Ok((!run.status.is_terminal()).then_some(run))
    }

    /// Recompute the run status from its steps.
    pub(crate) async fn refresh_status(&self, run: &LeadRun) -> Result<RunStatus, ReconcileError> {
        let steps = self.repo.list_steps(&run.id).await?;
        let mut transition = RunTransition::new(run.id, run.lead_id);
        let statuses = statuses_after(&steps, &[], &[]);
        let status = apply_rollup(&mut transition, run, &statuses, Utc::now());
        self.repo.apply_transition(&transition).await?;
        Ok(status)
    }
}
