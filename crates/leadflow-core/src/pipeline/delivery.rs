//! Delivery finalization.
//!
//! A SENDER step hands its email to an async delivery job and stays
//! running. The job reports progress here; `sent` and `failed` close the
//! step, project the lead stage and recompute the run.

use std::sync::Arc;

use chrono::Utc;
use leadflow_types::agent::{AgentName, ErrorDetails};
use leadflow_types::config::EngineConfig;
use leadflow_types::error::RepositoryError;
use leadflow_types::id::StepId;
use leadflow_types::lead::LeadStage;
use leadflow_types::run::{AgentOutput, OutputStatus, RunStatus, StepStatus};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pipeline::lease::{LeaseError, LeaseManager, LeaseScope};
use crate::pipeline::rollup::{apply_rollup, statuses_after};
use crate::repository::run::{RunRepository, RunTransition, StepTransition};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("step {0} not found")]
    StepNotFound(StepId),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Progress reported by the delivery job.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryReport {
    Sending,
    Retrying { attempt: u32 },
    Sent { message_id: Option<String> },
    Failed(ErrorDetails),
}

impl DeliveryReport {
    fn email_status(&self) -> &'static str {
        match self {
            DeliveryReport::Sending => "sending",
            DeliveryReport::Retrying { .. } => "retrying",
            DeliveryReport::Sent { .. } => "sent",
            DeliveryReport::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Only the output's `email_status` changed.
    Progress,
    Finalized {
        step_status: StepStatus,
        run_status: RunStatus,
    },
    /// The step is not a running SENDER; nothing was written.
    Ignored { step_status: StepStatus },
}

/// Applies delivery job reports to SENDER steps.
pub struct DeliveryRecorder<R> {
    repo: Arc<R>,
    leases: LeaseManager<R>,
}

impl<R: RunRepository> DeliveryRecorder<R> {
    pub fn new(repo: Arc<R>, config: &EngineConfig) -> Self {
        let leases = LeaseManager::new(Arc::clone(&repo), config);
        Self { repo, leases }
    }

    pub async fn record(
        &self,
        step_id: StepId,
        report: DeliveryReport,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let step = self
            .repo
            .get_step(&step_id)
            .await?
            .ok_or(DeliveryError::StepNotFound(step_id))?;
        self.leases
            .hold(LeaseScope::Run(step.run_id), self.apply(step_id, report))
            .await
    }

    async fn apply(
        &self,
        step_id: StepId,
        report: DeliveryReport,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let step = self
            .repo
            .get_step(&step_id)
            .await?
            .ok_or(DeliveryError::StepNotFound(step_id))?;
        if step.agent != AgentName::Sender || step.status != StepStatus::Running {
            debug!(step_id = %step_id, status = %step.status, "delivery report ignored");
            return Ok(DeliveryOutcome::Ignored {
                step_status: step.status,
            });
        }

        let run = self
            .repo
            .get_run(&step.run_id)
            .await?
            .ok_or(RepositoryError::NotFound)?;

        // The job may report before the executor has stored its pending output.
        let mut output = match self.repo.get_output_for_step(&step_id).await? {
            Some(output) => output,
            None => {
                let pending = AgentOutput::new(
                    &step,
                    run.lead_id,
                    OutputStatus::Pending,
                    json!({ "enqueued": true, "job_id": step.meta.handoff_job_id }),
                    None,
                );
                self.repo.insert_output(&pending).await?
            }
        };

        if let Some(map) = output.payload.as_object_mut() {
            map.insert("email_status".into(), json!(report.email_status()));
        }

        let (step_status, stage) = match &report {
            DeliveryReport::Sending => {
                self.repo.update_output(&output).await?;
                return Ok(DeliveryOutcome::Progress);
            }
            DeliveryReport::Retrying { attempt } => {
                if let Some(map) = output.payload.as_object_mut() {
                    map.insert("attempts".into(), json!(attempt));
                }
                self.repo.update_output(&output).await?;
                return Ok(DeliveryOutcome::Progress);
            }
            DeliveryReport::Sent { message_id } => {
                if let Some(map) = output.payload.as_object_mut() {
                    map.insert("sent_at".into(), json!(Utc::now()));
                    if let Some(id) = message_id {
                        map.insert("message_id".into(), json!(id));
                    }
                }
                output.status = OutputStatus::Completed;
                (StepStatus::Completed, LeadStage::Sent)
            }
            DeliveryReport::Failed(details) => {
                details.merge_into(&mut output.payload);
                output.status = OutputStatus::Failed;
                output.error_message = Some(details.message.chars().take(500).collect());
                (StepStatus::Failed, LeadStage::SendFailed)
            }
        };

        let now = Utc::now();
        let steps = self.repo.list_steps(&run.id).await?;
        let mut transition = RunTransition::new(run.id, run.lead_id);
        transition.step = Some(StepTransition {
            step_id,
            from: StepStatus::Running,
            to: step_status,
            started_at: None,
            finished_at: Some(now),
            output_id: Some(output.id),
            meta: None,
        });
        transition.output = Some(output);
        transition.lead.stage = Some(stage);
        let statuses = statuses_after(&steps, &[(step_id, step_status)], &[]);
        let run_status = apply_rollup(&mut transition, &run, &statuses, now);

        if !self.repo.apply_transition(&transition).await? {
            warn!(step_id = %step_id, "sender step changed before delivery could be recorded");
            return Ok(DeliveryOutcome::Ignored {
                step_status: StepStatus::Running,
            });
        }
        info!(
            run_id = %run.id,
            step_id = %step_id,
            email_status = report.email_status(),
            run_status = %run_status,
            "delivery recorded"
        );
        Ok(DeliveryOutcome::Finalized {
            step_status,
            run_status,
        })
    }
}
