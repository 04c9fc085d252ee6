//! Step execution.
//!
//! `run_next` advances a run by at most one step in three phases:
//!
//! - **A** (under the run lease): recover or finalize a running step, skip
//!   disabled agents, and claim the next queued step.
//! - **B** (no lease): dispatch the claimed step and persist its output.
//! - **C** (under the run lease): apply the outcome in one atomic commit.
//!
//! Calls are safe to repeat and to run concurrently; every state change is
//! a conditional transition on the step's current status.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use leadflow_types::agent::{AgentError, AgentName, ErrorDetails};
use leadflow_types::config::EngineConfig;
use leadflow_types::error::RepositoryError;
use leadflow_types::id::{RunId, StepId};
use leadflow_types::run::{
    AgentOutput, LeadRun, OutputStatus, RunStatus, RunStep, SkipReason, StepMeta, StepStatus,
};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::pipeline::dispatch::{AgentDispatcher, DeliveryGateway, DeliveryJob, DispatchRequest};
use crate::pipeline::lease::{LeaseError, LeaseManager, LeaseScope};
use crate::pipeline::outcome::{
    CritiqueVerdict, MIN_SCORE_NOT_MET, SCORE_PARSE_FAILED, apply_critique_normalization,
    critique_threshold, parse_score, stage_for_completed,
};
use crate::pipeline::positions::{Anchor, PositionError, plan_insertion};
use crate::pipeline::resolver::ConfigResolver;
use crate::pipeline::rollup::{apply_rollup, statuses_after};
use crate::pipeline::settings::prompt_settings;
use crate::repository::campaign::CampaignConfigRepository;
use crate::repository::run::{RunRepository, RunTransition, StepTransition};

/// Error code and payload for a step force-failed by stale recovery.
pub const TIMEOUT: &str = "timeout";

/// Longest `error_message` stored on a failed output.
const MAX_ERROR_MESSAGE: usize = 500;

/// Longest `message` written into a failed output's payload.
const MAX_PAYLOAD_MESSAGE: usize = 200;

/// Error codes for engine-side failures after a step was claimed.
pub const REPOSITORY_ERROR: &str = "repository_error";
pub const CONFIG_UNAVAILABLE: &str = "config_unavailable";
pub const OUTPUT_PERSIST_FAILED: &str = "output_persist_failed";

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error(transparent)]
    Positions(#[from] PositionError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Why a `run_next` call found nothing to advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NothingToDoReason {
    Terminal,
    /// A running step without a start time. Logged, never repaired.
    CorruptRunningStep,
    StepRunning,
    AwaitingDelivery,
    NoQueuedSteps,
}

impl NothingToDoReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NothingToDoReason::Terminal => "terminal",
            NothingToDoReason::CorruptRunningStep => "corrupt_running_step",
            NothingToDoReason::StepRunning => "step_running",
            NothingToDoReason::AwaitingDelivery => "awaiting_delivery",
            NothingToDoReason::NoQueuedSteps => "no_queued_steps",
        }
    }
}

/// Outcome of one `run_next` call.
#[derive(Debug, Clone, PartialEq)]
pub enum RunNextResult {
    Paused,
    NothingToDo {
        reason: NothingToDoReason,
    },
    BlockedWrongNextStep {
        requested: AgentName,
        next_agent: AgentName,
    },
    FailedTimeoutRecovery {
        step_id: StepId,
        agent: AgentName,
    },
    Finalized {
        step_id: StepId,
        agent: AgentName,
        step_status: StepStatus,
        run_status: RunStatus,
        from_existing_output: bool,
    },
    NoopStepAlreadyTerminal {
        step_id: StepId,
    },
    NoopStepNotRunning {
        step_id: StepId,
    },
}

impl RunNextResult {
    fn nothing(reason: NothingToDoReason) -> Self {
        RunNextResult::NothingToDo { reason }
    }
}

enum Selection {
    Done(RunNextResult),
    Claimed { run: LeadRun, step: RunStep },
}

/// Drives runs one step at a time.
pub struct RunExecutor<R, C, A, D> {
    repo: Arc<R>,
    resolver: ConfigResolver<C>,
    dispatcher: Arc<A>,
    delivery: Arc<D>,
    leases: LeaseManager<R>,
    config: EngineConfig,
}

impl<R, C, A, D> Clone for RunExecutor<R, C, A, D> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            resolver: self.resolver.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            delivery: Arc::clone(&self.delivery),
            leases: self.leases.clone(),
            config: self.config.clone(),
        }
    }
}

impl<R, C, A, D> RunExecutor<R, C, A, D>
where
    R: RunRepository,
    C: CampaignConfigRepository,
    A: AgentDispatcher,
    D: DeliveryGateway,
{
    pub fn new(
        repo: Arc<R>,
        resolver: ConfigResolver<C>,
        dispatcher: Arc<A>,
        delivery: Arc<D>,
        config: EngineConfig,
    ) -> Self {
        let leases = LeaseManager::new(Arc::clone(&repo), &config);
        Self {
            repo,
            resolver,
            dispatcher,
            delivery,
            leases,
            config,
        }
    }

    /// Advance `run_id` by at most one step.
    ///
    /// With `requested` set, the call refuses to claim any other agent and
    /// returns `BlockedWrongNextStep` instead.
    pub async fn run_next(
        &self,
        run_id: RunId,
        requested: Option<AgentName>,
    ) -> Result<RunNextResult, ExecutorError> {
        if self.config.paused {
            debug!(run_id = %run_id, "engine paused");
            return Ok(RunNextResult::Paused);
        }

        let scope = LeaseScope::Run(run_id);
        let (run, step) = match self.leases.hold(scope, self.select(run_id, requested)).await? {
            Selection::Done(result) => return Ok(result),
            Selection::Claimed { run, step } => (run, step),
        };

        match self.repo.get_output_for_step(&step.id).await {
            Ok(Some(_)) => return self.leases.hold(scope, self.finalize(step.id, true)).await,
            Ok(None) => {}
            Err(e) => warn!(run_id = %run.id, step_id = %step.id, error = %e, "output lookup after claim failed"),
        }

        let result = match step.agent {
            AgentName::Sender => self.hand_off(&run, &step).await,
            agent => {
                let settings = step.meta.settings_snapshot.clone().unwrap_or_else(|| json!({}));
                let request = DispatchRequest {
                    run: run.clone(),
                    step: step.clone(),
                    settings: prompt_settings(agent, &settings),
                };
                self.dispatcher.dispatch(request).await
            }
        };
        let enqueued = result
            .as_ref()
            .is_ok_and(|payload| payload.get("enqueued").and_then(Value::as_bool) == Some(true));
        if let Err(e) = self.persist(&run, &step, result).await {
            error!(run_id = %run.id, step_id = %step.id, agent = %step.agent, error = %e, "storing step output failed");
            // The delivery job stores the pending output itself when it reports.
            if enqueued {
                return Err(e);
            }
            self.record_failure(&run, &step, internal_error(OUTPUT_PERSIST_FAILED, &e), None)
                .await?;
        }

        self.leases.hold(scope, self.finalize(step.id, false)).await
    }

    // -----------------------------------------------------------------------
    // Phase A
    // -----------------------------------------------------------------------

    async fn select(
        &self,
        run_id: RunId,
        requested: Option<AgentName>,
    ) -> Result<Selection, ExecutorError> {
        let run = self
            .repo
            .get_run(&run_id)
            .await?
            .ok_or(ExecutorError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Ok(Selection::Done(RunNextResult::nothing(NothingToDoReason::Terminal)));
        }

        let campaign = self.resolver.campaign(&run.campaign_id).await?;

        loop {
            let steps = self.repo.list_steps(&run_id).await?;
            if let Some(running) = steps.iter().find(|s| s.status == StepStatus::Running) {
                let result = self.inspect_running(&run, running, &steps).await?;
                return Ok(Selection::Done(result));
            }

            let Some(next) = steps.iter().find(|s| s.status == StepStatus::Queued) else {
                return Ok(Selection::Done(RunNextResult::nothing(
                    NothingToDoReason::NoQueuedSteps,
                )));
            };

            let resolved = self.resolver.resolve(&campaign, next.agent).await?;
            let now = Utc::now();

            if !resolved.enabled {
                let meta = StepMeta {
                    skip_reason: Some(SkipReason::AgentDisabled),
                    skipped_at: Some(now),
                    skipped_agent_name: Some(next.agent),
                    config_id: resolved.config_id,
                    config_updated_at: resolved.config_updated_at,
                    ..next.meta.clone()
                };
                let mut transition = RunTransition::new(run.id, run.lead_id);
                transition.step = Some(StepTransition {
                    step_id: next.id,
                    from: StepStatus::Queued,
                    to: StepStatus::Skipped,
                    started_at: None,
                    finished_at: Some(now),
                    output_id: None,
                    meta: Some(meta),
                });
                let statuses = statuses_after(&steps, &[(next.id, StepStatus::Skipped)], &[]);
                apply_rollup(&mut transition, &run, &statuses, now);

                if self.repo.apply_transition(&transition).await? {
                    info!(run_id = %run.id, step_id = %next.id, agent = %next.agent, "skipped disabled agent");
                }
                continue;
            }

            if let Some(requested) = requested.filter(|r| *r != next.agent) {
                debug!(run_id = %run.id, %requested, next_agent = %next.agent, "requested agent is not next");
                return Ok(Selection::Done(RunNextResult::BlockedWrongNextStep {
                    requested,
                    next_agent: next.agent,
                }));
            }

            let mut meta = next.meta.clone();
            if meta.settings_snapshot.is_none() {
                meta.settings_snapshot = Some(resolved.settings_snapshot);
                meta.settings_snapshot_at = Some(now);
                meta.config_id = resolved.config_id;
                meta.config_updated_at = resolved.config_updated_at;
            }

            let mut transition = RunTransition::new(run.id, run.lead_id);
            transition.step = Some(StepTransition {
                step_id: next.id,
                from: StepStatus::Queued,
                to: StepStatus::Running,
                started_at: Some(now),
                finished_at: None,
                output_id: None,
                meta: Some(meta),
            });
            transition.run.status = Some(RunStatus::Running);
            transition.run.started_at = Some(now);

            if !self.repo.apply_transition(&transition).await? {
                debug!(run_id = %run.id, step_id = %next.id, "lost claim race, re-reading");
                continue;
            }
            info!(run_id = %run.id, step_id = %next.id, agent = %next.agent, position = next.position, "claimed step");

            let step = self.repo.get_step(&next.id).await?.ok_or(RepositoryError::NotFound)?;
            let run = self
                .repo
                .get_run(&run_id)
                .await?
                .ok_or(ExecutorError::RunNotFound(run_id))?;
            return Ok(Selection::Claimed { run, step });
        }
    }

    async fn inspect_running(
        &self,
        run: &LeadRun,
        step: &RunStep,
        steps: &[RunStep],
    ) -> Result<RunNextResult, ExecutorError> {
        let Some(started_at) = step.started_at else {
            error!(
                run_id = %run.id,
                step_id = %step.id,
                agent = %step.agent,
                "running step has no start time"
            );
            return Ok(RunNextResult::nothing(NothingToDoReason::CorruptRunningStep));
        };

        let output = self.repo.get_output_for_step(&step.id).await?;
        let awaiting_delivery = step.meta.handoff_job_id.is_some();

        if is_stale(&self.config, step, started_at, Utc::now()) {
            if output.is_some() {
                return self.finalize(step.id, true).await;
            }
            return self.recover_timeout(run, step, steps).await;
        }

        match output {
            Some(output) if awaiting_delivery && output.status == OutputStatus::Pending => {
                Ok(RunNextResult::nothing(NothingToDoReason::AwaitingDelivery))
            }
            Some(_) => self.finalize(step.id, true).await,
            None if awaiting_delivery => Ok(RunNextResult::nothing(NothingToDoReason::AwaitingDelivery)),
            None => Ok(RunNextResult::nothing(NothingToDoReason::StepRunning)),
        }
    }

    async fn recover_timeout(
        &self,
        run: &LeadRun,
        step: &RunStep,
        steps: &[RunStep],
    ) -> Result<RunNextResult, ExecutorError> {
        let timeout = AgentOutput::new(
            step,
            run.lead_id,
            OutputStatus::Failed,
            json!({ "error": TIMEOUT }),
            Some(TIMEOUT.to_string()),
        );
        let stored = self.repo.insert_output(&timeout).await?;
        if stored.id != timeout.id {
            debug!(step_id = %step.id, "real output won the timeout race");
            return self.finalize(step.id, true).await;
        }

        let now = Utc::now();
        let mut transition = RunTransition::new(run.id, run.lead_id);
        transition.step = Some(StepTransition {
            step_id: step.id,
            from: StepStatus::Running,
            to: StepStatus::Failed,
            started_at: None,
            finished_at: Some(now),
            output_id: Some(stored.id),
            meta: None,
        });
        let statuses = statuses_after(steps, &[(step.id, StepStatus::Failed)], &[]);
        apply_rollup(&mut transition, run, &statuses, now);

        if !self.repo.apply_transition(&transition).await? {
            return Ok(RunNextResult::NoopStepNotRunning { step_id: step.id });
        }
        warn!(
            run_id = %run.id,
            step_id = %step.id,
            agent = %step.agent,
            started_at = %step.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            "stale running step force-failed"
        );
        Ok(RunNextResult::FailedTimeoutRecovery {
            step_id: step.id,
            agent: step.agent,
        })
    }

    // -----------------------------------------------------------------------
    // Phase B
    // -----------------------------------------------------------------------

    /// Validate a SENDER step and hand it to the delivery job.
    ///
    /// Storage failures before the enqueue fail the step. After it, a lost
    /// meta write is repaired by finalize from the payload's `job_id`.
    async fn hand_off(&self, run: &LeadRun, step: &RunStep) -> Result<Value, AgentError> {
        let Some(source_step_id) = step.meta.source_step_id else {
            return Err(precondition("missing_source_step_id"));
        };

        let campaign = self
            .resolver
            .campaign(&run.campaign_id)
            .await
            .map_err(|e| AgentError::Provider(internal_error(CONFIG_UNAVAILABLE, &e)))?;
        let check = self.delivery.check(&campaign.user_id, &campaign.id).await;
        if !check.ok {
            return Err(precondition("sending_not_configured_at_send_time"));
        }

        let has_source = self
            .repo
            .get_output_for_step(&source_step_id)
            .await
            .map_err(|e| AgentError::Provider(internal_error(REPOSITORY_ERROR, &e)))?
            .is_some_and(|o| o.status == OutputStatus::Completed);
        if !has_source {
            return Err(precondition("missing_send_source_output"));
        }

        let job = DeliveryJob {
            lead_id: run.lead_id,
            run_id: run.id,
            step_id: step.id,
        };
        let job_id = self.delivery.enqueue(job).await?;

        let meta = StepMeta {
            handoff_job_id: Some(job_id.clone()),
            enqueued_at: Some(Utc::now()),
            ..step.meta.clone()
        };
        match self.repo.update_step_meta(&step.id, &meta).await {
            Ok(()) => info!(run_id = %run.id, step_id = %step.id, job_id = %job_id, "delivery enqueued"),
            Err(e) => error!(
                run_id = %run.id,
                step_id = %step.id,
                job_id = %job_id,
                error = %e,
                "delivery enqueued but handoff not recorded"
            ),
        }

        Ok(json!({
            "enqueued": true,
            "job_id": job_id,
            "source_step_id": source_step_id,
        }))
    }

    /// Store the dispatch result as the step's output. Never overwrites a
    /// successful output written by a concurrent caller.
    async fn persist(
        &self,
        run: &LeadRun,
        step: &RunStep,
        result: Result<Value, AgentError>,
    ) -> Result<AgentOutput, ExecutorError> {
        let (details, returned) = match result {
            Ok(payload) => match ErrorDetails::from_payload(&payload) {
                Some(details) => (details, Some(payload)),
                None => {
                    let status = match step.agent {
                        AgentName::Sender => OutputStatus::Pending,
                        _ => OutputStatus::Completed,
                    };
                    let output = AgentOutput::new(step, run.lead_id, status, payload, None);
                    return Ok(self.repo.insert_output(&output).await?);
                }
            },
            Err(e) => (e.into_details(), None),
        };

        warn!(
            run_id = %run.id,
            step_id = %step.id,
            agent = %step.agent,
            error = %details.message,
            retryable = details.retryable,
            "agent step failed"
        );
        self.record_failure(run, step, details, returned).await
    }

    async fn record_failure(
        &self,
        run: &LeadRun,
        step: &RunStep,
        details: ErrorDetails,
        returned: Option<Value>,
    ) -> Result<AgentOutput, ExecutorError> {
        let base = returned.unwrap_or_else(|| json!({}));
        let fresh = AgentOutput::new(step, run.lead_id, OutputStatus::Failed, base, None);
        let mut output = match self.repo.get_output_for_step(&step.id).await? {
            Some(existing) => existing,
            None => self.repo.insert_output(&fresh).await?,
        };

        let error_message = truncate_chars(&details.message, MAX_ERROR_MESSAGE);
        let payload_details = ErrorDetails {
            message: truncate_chars(&details.message, MAX_PAYLOAD_MESSAGE),
            ..details
        };
        payload_details.merge_into(&mut output.payload);
        output.status = OutputStatus::Failed;
        output.error_message = Some(error_message);

        self.repo.update_output(&output).await?;
        Ok(output)
    }

    // -----------------------------------------------------------------------
    // Phase C
    // -----------------------------------------------------------------------

    /// Apply a running step's output to the step, run and lead. Callers
    /// must hold the run lease.
    async fn finalize(
        &self,
        step_id: StepId,
        from_existing_output: bool,
    ) -> Result<RunNextResult, ExecutorError> {
        let step = self.repo.get_step(&step_id).await?.ok_or(RepositoryError::NotFound)?;
        if step.status.is_terminal() {
            return Ok(RunNextResult::NoopStepAlreadyTerminal { step_id });
        }
        if step.status != StepStatus::Running {
            return Ok(RunNextResult::NoopStepNotRunning { step_id });
        }

        let run = self
            .repo
            .get_run(&step.run_id)
            .await?
            .ok_or(ExecutorError::RunNotFound(step.run_id))?;
        let Some(mut output) = self.repo.get_output_for_step(&step_id).await? else {
            return Ok(RunNextResult::nothing(NothingToDoReason::StepRunning));
        };
        let steps = self.repo.list_steps(&run.id).await?;
        let mut transition = RunTransition::new(run.id, run.lead_id);

        let step_status = match step.agent {
            AgentName::Critique => {
                self.critique_outcome(&run, &step, &steps, &mut output, &mut transition)?
            }
            AgentName::Sender => sender_outcome(&mut output),
            _ => match output.status {
                OutputStatus::Failed => StepStatus::Failed,
                _ => {
                    output.status = OutputStatus::Completed;
                    StepStatus::Completed
                }
            },
        };

        if step_status == StepStatus::Running {
            if step.meta.handoff_job_id.is_none() {
                if let Some(job_id) = output.payload_str("job_id") {
                    let meta = StepMeta {
                        handoff_job_id: Some(job_id.to_string()),
                        enqueued_at: Some(output.created_at),
                        ..step.meta.clone()
                    };
                    self.repo.update_step_meta(&step.id, &meta).await?;
                    info!(run_id = %run.id, step_id = %step.id, job_id, "handoff recorded from output");
                }
            }
            transition.output = Some(output);
            self.repo.apply_transition(&transition).await?;
            debug!(run_id = %run.id, step_id = %step.id, "step awaits delivery");
            return Ok(RunNextResult::Finalized {
                step_id,
                agent: step.agent,
                step_status,
                run_status: run.status,
                from_existing_output,
            });
        }

        if step_status == StepStatus::Completed {
            transition.lead.stage = stage_for_completed(&step);
            if step.agent == AgentName::Critique {
                transition.lead.quality = Some(apply_critique_normalization(&mut output.payload));
            }
        }

        let now = Utc::now();
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
        let statuses = statuses_after(&steps, &[(step_id, step_status)], &transition.new_steps);
        let run_status = apply_rollup(&mut transition, &run, &statuses, now);

        if !self.repo.apply_transition(&transition).await? {
            return Ok(RunNextResult::NoopStepNotRunning { step_id });
        }
        info!(
            run_id = %run.id,
            step_id = %step.id,
            agent = %step.agent,
            step_status = %step_status,
            run_status = %run_status,
            "step finalized"
        );

        Ok(RunNextResult::Finalized {
            step_id,
            agent: step.agent,
            step_status,
            run_status,
            from_existing_output,
        })
    }

    fn critique_outcome(
        &self,
        run: &LeadRun,
        step: &RunStep,
        steps: &[RunStep],
        output: &mut AgentOutput,
        transition: &mut RunTransition,
    ) -> Result<StepStatus, ExecutorError> {
        if output.status == OutputStatus::Failed {
            return Ok(StepStatus::Failed);
        }

        let Some(score) = parse_score(&output.payload) else {
            let message = output
                .error_message
                .clone()
                .or_else(|| output.payload_str("message").map(str::to_string))
                .unwrap_or_else(|| SCORE_PARSE_FAILED.to_string());
            set_payload_error(&mut output.payload, SCORE_PARSE_FAILED, &message);
            output.status = OutputStatus::Failed;
            output.error_message = Some(message);
            warn!(run_id = %run.id, step_id = %step.id, "critique score unparseable");
            return Ok(StepStatus::Failed);
        };

        let verdict = CritiqueVerdict::evaluate(score, critique_threshold(run, step));
        output.payload = verdict.annotate(&output.payload, step);

        if verdict.meets_min_score {
            output.status = OutputStatus::Completed;
            return Ok(StepStatus::Completed);
        }

        if run.rewrite_count < run.max_rewrites {
            let already_inserted = steps
                .iter()
                .any(|s| s.meta.critique_step_id == Some(step.id));
            if !already_inserted {
                let revision = run.rewrite_count + 1;
                let plan = plan_insertion(steps, Anchor::After(step.id), 2).inspect_err(|e| {
                    error!(run_id = %run.id, step_id = %step.id, error = %e, "cannot place rewrite steps");
                })?;
                let writer = RunStep::queued(
                    run.id,
                    plan.positions[0],
                    AgentName::Writer,
                    StepMeta {
                        revision: Some(revision),
                        critique_step_id: Some(step.id),
                        ..Default::default()
                    },
                );
                let critique = RunStep::queued(
                    run.id,
                    plan.positions[1],
                    AgentName::Critique,
                    StepMeta {
                        writer_step_id: Some(writer.id),
                        selected_variant_index: Some(0),
                        ..Default::default()
                    },
                );
                transition.renumber = plan.renumber;
                transition.new_steps = vec![writer, critique];
                transition.run.rewrite_count = Some(revision);
                info!(
                    run_id = %run.id,
                    step_id = %step.id,
                    score,
                    threshold = verdict.threshold.value,
                    revision,
                    "score below threshold, rewrite scheduled"
                );
            }
            output.status = OutputStatus::Completed;
            return Ok(StepStatus::Completed);
        }

        set_payload_error(
            &mut output.payload,
            MIN_SCORE_NOT_MET,
            &format!("score {score} below threshold {}", verdict.threshold.value),
        );
        output.status = OutputStatus::Failed;
        output.error_message = Some(MIN_SCORE_NOT_MET.to_string());
        info!(run_id = %run.id, step_id = %step.id, score, "rewrite budget exhausted");
        Ok(StepStatus::Failed)
    }
}

/// A SENDER that enqueued its job stays running until delivery reports back.
fn sender_outcome(output: &mut AgentOutput) -> StepStatus {
    let enqueued = output.payload.get("enqueued").and_then(Value::as_bool) == Some(true);
    if enqueued && output.status != OutputStatus::Failed {
        if let Some(map) = output.payload.as_object_mut() {
            map.entry("email_status").or_insert_with(|| json!("queued"));
        }
        output.status = OutputStatus::Pending;
        return StepStatus::Running;
    }
    if output.status != OutputStatus::Failed {
        set_payload_error(&mut output.payload, "send_not_enqueued", "delivery job was not enqueued");
        output.error_message = Some("send_not_enqueued".to_string());
        output.status = OutputStatus::Failed;
    }
    StepStatus::Failed
}

/// Whether a running step has outlived its timeout. Steps handed to the
/// delivery job are never stale.
pub fn is_stale(config: &EngineConfig, step: &RunStep, started_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let Some(limit) = stale_limit(config, step) else {
        return false;
    };
    (now - started_at).to_std().is_ok_and(|age| age > limit)
}

fn stale_limit(config: &EngineConfig, step: &RunStep) -> Option<Duration> {
    if step.meta.handoff_job_id.is_some() {
        return None;
    }
    match step.agent {
        AgentName::Sender => Some(config.sender_stale_timeout()),
        _ => Some(config.stale_step_timeout()),
    }
}

fn internal_error(code: &str, err: &dyn std::fmt::Display) -> ErrorDetails {
    ErrorDetails {
        code: code.to_string(),
        message: format!("{code}: {err}"),
        retryable: true,
        ..Default::default()
    }
}

fn precondition(code: &str) -> AgentError {
    AgentError::Precondition(code.to_string())
}

fn set_payload_error(payload: &mut Value, code: &str, message: &str) {
    if !payload.is_object() {
        *payload = json!({});
    }
    if let Some(map) = payload.as_object_mut() {
        map.insert("error".into(), json!(code));
        map.insert("message".into(), json!(truncate_chars(message, MAX_PAYLOAD_MESSAGE)));
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeGateway, MemoryRepo, ScriptedDispatcher, seed_lead, set_agent};
    use crate::pipeline::dispatch::DeliveryCheck;
    use leadflow_types::lead::{Lead, LeadStage, Quality};

    type Executor = RunExecutor<MemoryRepo, MemoryRepo, ScriptedDispatcher, FakeGateway>;

    struct Harness {
        repo: Arc<MemoryRepo>,
        dispatcher: Arc<ScriptedDispatcher>,
        gateway: Arc<FakeGateway>,
        executor: Executor,
        lead: Lead,
    }

    async fn harness(plan: &[AgentName], max_rewrites: u32, min_score: i64) -> (Harness, LeadRun) {
        let repo = Arc::new(MemoryRepo::default());
        let (campaign, lead) = seed_lead(&repo, json!({})).await;
        for agent in AgentName::PIPELINE {
            set_agent(&repo, campaign.id, agent, plan.contains(&agent), json!({})).await;
        }
        let run = seeded_run(&repo, &lead, plan, max_rewrites, min_score).await;

        let dispatcher = Arc::new(ScriptedDispatcher::default());
        let gateway = Arc::new(FakeGateway::default());
        let executor = RunExecutor::new(
            Arc::clone(&repo),
            ConfigResolver::new(Arc::clone(&repo)),
            Arc::clone(&dispatcher),
            Arc::clone(&gateway),
            EngineConfig::default(),
        );
        (
            Harness {
                repo,
                dispatcher,
                gateway,
                executor,
                lead,
            },
            run,
        )
    }

    async fn seeded_run(
        repo: &MemoryRepo,
        lead: &Lead,
        plan: &[AgentName],
        max_rewrites: u32,
        min_score: i64,
    ) -> LeadRun {
        let now = Utc::now();
        let run = LeadRun {
            id: RunId::new(),
            lead_id: lead.id,
            campaign_id: lead.campaign_id,
            status: RunStatus::Queued,
            rewrite_count: 0,
            max_rewrites,
            min_score: Some(min_score),
            plan: plan.to_vec(),
            config_snapshot: json!({}),
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        let mut steps: Vec<RunStep> = Vec::new();
        for (idx, agent) in plan.iter().enumerate() {
            let writer = steps.iter().rev().find(|s| s.agent == AgentName::Writer).map(|s| s.id);
            let meta = match agent {
                AgentName::Critique => StepMeta {
                    writer_step_id: writer,
                    selected_variant_index: Some(0),
                    ..Default::default()
                },
                AgentName::Sender => StepMeta {
                    source_step_id: writer,
                    ..Default::default()
                },
                _ => StepMeta::default(),
            };
            steps.push(RunStep::queued(run.id, (idx as i64 + 1) * 10, *agent, meta));
        }
        repo.create_run(&run, &steps).await.unwrap();
        run
    }

    async fn drive(executor: &Executor, run_id: RunId) -> Vec<RunNextResult> {
        let mut results = Vec::new();
        for _ in 0..20 {
            let result = executor.run_next(run_id, None).await.unwrap();
            if matches!(result, RunNextResult::NothingToDo { .. }) {
                results.push(result);
                break;
            }
            results.push(result);
        }
        results
    }

    #[tokio::test]
    async fn completes_simple_run_and_projects_stage() {
        let (h, run) = harness(&[AgentName::Search, AgentName::Writer], 0, 6).await;
        h.dispatcher.push(AgentName::Writer, Ok(json!({"email": "Hi there", "subject": "Hello"})));

        let first = h.executor.run_next(run.id, None).await.unwrap();
        assert!(matches!(
            first,
            RunNextResult::Finalized { agent: AgentName::Search, step_status: StepStatus::Completed, run_status: RunStatus::Running, .. }
        ));
        assert_eq!(h.repo.lead_now(&h.lead.id).stage, Some(LeadStage::Searched));

        let second = h.executor.run_next(run.id, None).await.unwrap();
        assert!(matches!(
            second,
            RunNextResult::Finalized { run_status: RunStatus::Completed, .. }
        ));
        let lead = h.repo.lead_now(&h.lead.id);
        assert_eq!(lead.stage, Some(LeadStage::Written));
        assert_eq!(lead.current_run_id, None);

        let run = h.repo.run_now(&run.id);
        assert!(run.started_at.is_some());
        assert!(run.finished_at.is_some());

        let third = h.executor.run_next(run.id, None).await.unwrap();
        assert_eq!(third, RunNextResult::nothing(NothingToDoReason::Terminal));
    }

    #[tokio::test]
    async fn paused_engine_touches_nothing() {
        let (h, run) = harness(&[AgentName::Search], 0, 6).await;
        let executor = RunExecutor::new(
            Arc::clone(&h.repo),
            ConfigResolver::new(Arc::clone(&h.repo)),
            Arc::clone(&h.dispatcher),
            Arc::clone(&h.gateway),
            EngineConfig {
                paused: true,
                ..Default::default()
            },
        );
        assert_eq!(executor.run_next(run.id, None).await.unwrap(), RunNextResult::Paused);
        assert_eq!(h.repo.steps_now(&run.id)[0].status, StepStatus::Queued);
    }

    #[tokio::test]
    async fn requested_agent_mismatch_blocks_without_claiming() {
        let (h, run) = harness(&[AgentName::Search, AgentName::Writer], 0, 6).await;
        let result = h.executor.run_next(run.id, Some(AgentName::Writer)).await.unwrap();
        assert_eq!(
            result,
            RunNextResult::BlockedWrongNextStep {
                requested: AgentName::Writer,
                next_agent: AgentName::Search,
            }
        );
        assert!(h.repo.steps_now(&run.id).iter().all(|s| s.status == StepStatus::Queued));
    }

    #[tokio::test]
    async fn disabled_agent_is_skipped_when_reached() {
        let (h, run) = harness(&[AgentName::Search, AgentName::Writer], 0, 6).await;
        set_agent(&h.repo, run.campaign_id, AgentName::Search, false, json!({})).await;

        let result = h.executor.run_next(run.id, None).await.unwrap();
        assert!(matches!(result, RunNextResult::Finalized { agent: AgentName::Writer, .. }));

        let steps = h.repo.steps_now(&run.id);
        assert_eq!(steps[0].status, StepStatus::Skipped);
        assert_eq!(steps[0].meta.skip_reason, Some(SkipReason::AgentDisabled));
        assert_eq!(steps[0].meta.skipped_agent_name, Some(AgentName::Search));
        assert!(steps[0].meta.config_id.is_some());
    }

    #[tokio::test]
    async fn claim_freezes_settings_and_strips_engine_keys() {
        let (h, run) = harness(&[AgentName::Writer, AgentName::Critique], 0, 6).await;
        set_agent(&h.repo, run.campaign_id, AgentName::Critique, true, json!({"min_score_for_send": 9})).await;
        h.dispatcher.push(AgentName::Critique, Ok(json!({"score": 9, "critique": "none"})));

        drive(&h.executor, run.id).await;

        let steps = h.repo.steps_now(&run.id);
        let snapshot = steps[1].meta.settings_snapshot.clone().unwrap();
        assert_eq!(snapshot["min_score_for_send"], 9);

        let requests = h.dispatcher.requests.lock().unwrap();
        let critique = requests.iter().find(|r| r.step.agent == AgentName::Critique).unwrap();
        assert!(critique.settings.get("min_score_for_send").is_none());
        assert_eq!(critique.settings["strictness"], "moderate");
    }

    #[tokio::test]
    async fn snapshot_threshold_beats_later_config_change() {
        let (h, run) = harness(&[AgentName::Writer, AgentName::Critique], 0, 6).await;
        set_agent(&h.repo, run.campaign_id, AgentName::Critique, true, json!({"min_score_for_send": 5})).await;

        h.executor.run_next(run.id, None).await.unwrap();
        // A snapshot already frozen on the step survives the claim.
        let critique = h.repo.steps_now(&run.id)[1].clone();
        let mut claimed = critique.clone();
        claimed.meta.settings_snapshot = Some(json!({"min_score_for_send": 5}));
        h.repo.put_step(claimed);

        set_agent(&h.repo, run.campaign_id, AgentName::Critique, true, json!({"min_score_for_send": 9})).await;
        h.dispatcher.push(AgentName::Critique, Ok(json!({"score": 5})));
        let result = h.executor.run_next(run.id, None).await.unwrap();
        assert!(matches!(result, RunNextResult::Finalized { step_status: StepStatus::Completed, .. }));

        let output = h.repo.get_output_for_step(&critique.id).await.unwrap().unwrap();
        assert_eq!(output.payload["threshold_used"], 5);
        assert_eq!(output.payload["threshold_source"], "settings_snapshot");
    }

    #[tokio::test]
    async fn low_score_with_budget_inserts_rewrite_pair() {
        let (h, run) = harness(&[AgentName::Writer, AgentName::Critique, AgentName::Design], 2, 6).await;
        h.dispatcher.push(AgentName::Critique, Ok(json!({"score": 4, "critique": "Too long"})));

        h.executor.run_next(run.id, None).await.unwrap();
        let result = h.executor.run_next(run.id, None).await.unwrap();
        assert!(matches!(
            result,
            RunNextResult::Finalized { agent: AgentName::Critique, step_status: StepStatus::Completed, .. }
        ));

        let steps = h.repo.steps_now(&run.id);
        let agents: Vec<AgentName> = steps.iter().map(|s| s.agent).collect();
        assert_eq!(
            agents,
            vec![AgentName::Writer, AgentName::Critique, AgentName::Writer, AgentName::Critique, AgentName::Design]
        );
        assert_eq!(steps[2].position, 21);
        assert_eq!(steps[3].position, 22);
        assert_eq!(steps[2].meta.revision, Some(1));
        assert_eq!(steps[2].meta.critique_step_id, Some(steps[1].id));
        assert_eq!(steps[3].meta.writer_step_id, Some(steps[2].id));
        assert_eq!(h.repo.run_now(&run.id).rewrite_count, 1);

        let lead = h.repo.lead_now(&h.lead.id);
        assert_eq!(lead.stage, Some(LeadStage::Critiqued));
        assert_eq!(lead.quality, Some(Quality::Medium));
    }

    #[tokio::test]
    async fn zero_budget_fails_immediately() {
        let (h, run) = harness(&[AgentName::Writer, AgentName::Critique], 0, 6).await;
        h.dispatcher.push(AgentName::Critique, Ok(json!({"score": "3/10"})));

        let results = drive(&h.executor, run.id).await;
        assert!(results.iter().any(|r| matches!(
            r,
            RunNextResult::Finalized { step_status: StepStatus::Failed, run_status: RunStatus::Failed, .. }
        )));

        let critique = h.repo.steps_now(&run.id)[1].clone();
        let output = h.repo.get_output_for_step(&critique.id).await.unwrap().unwrap();
        assert_eq!(output.status, OutputStatus::Failed);
        assert_eq!(output.payload["error"], MIN_SCORE_NOT_MET);
        assert_eq!(output.payload["meets_min_score"], false);
        assert_eq!(h.repo.steps_now(&run.id).len(), 2);
    }

    #[tokio::test]
    async fn unparseable_score_fails_with_code() {
        let (h, run) = harness(&[AgentName::Writer, AgentName::Critique], 2, 6).await;
        h.dispatcher.push(AgentName::Critique, Ok(json!({"score": "great"})));

        drive(&h.executor, run.id).await;
        let critique = h.repo.steps_now(&run.id)[1].clone();
        assert_eq!(critique.status, StepStatus::Failed);
        let output = h.repo.get_output_for_step(&critique.id).await.unwrap().unwrap();
        assert_eq!(output.payload["error"], SCORE_PARSE_FAILED);
        assert_eq!(output.error_message.as_deref(), Some(SCORE_PARSE_FAILED));
        assert_eq!(h.repo.run_now(&run.id).status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn provider_error_is_recorded_with_details() {
        let (h, run) = harness(&[AgentName::Search], 0, 6).await;
        h.dispatcher.push(
            AgentName::Search,
            Err(AgentError::Provider(ErrorDetails {
                code: "rate_limited".into(),
                message: "x".repeat(700),
                retryable: true,
                provider_name: Some("openai".into()),
                request_id: Some("req_1".into()),
                ..Default::default()
            })),
        );

        let result = h.executor.run_next(run.id, None).await.unwrap();
        assert!(matches!(result, RunNextResult::Finalized { step_status: StepStatus::Failed, .. }));

        let step = h.repo.steps_now(&run.id)[0].clone();
        let output = h.repo.get_output_for_step(&step.id).await.unwrap().unwrap();
        assert_eq!(output.payload["error"], "rate_limited");
        assert_eq!(output.payload["retryable"], true);
        assert_eq!(output.payload["provider"], "openai");
        assert_eq!(output.payload["message"].as_str().unwrap().len(), 200);
        assert_eq!(output.error_message.unwrap().len(), 500);
        assert_eq!(h.repo.lead_now(&h.lead.id).stage, None);
    }

    #[tokio::test]
    async fn error_type_payload_counts_as_failure() {
        let (h, run) = harness(&[AgentName::Search], 0, 6).await;
        h.dispatcher.push(
            AgentName::Search,
            Ok(json!({"error_type": "invalid_request", "error": "bad prompt", "partial": 1})),
        );
        h.executor.run_next(run.id, None).await.unwrap();

        let step = h.repo.steps_now(&run.id)[0].clone();
        let output = h.repo.get_output_for_step(&step.id).await.unwrap().unwrap();
        assert_eq!(output.status, OutputStatus::Failed);
        assert_eq!(output.payload["error_type"], "invalid_request");
        assert_eq!(output.payload["partial"], 1);
        assert_eq!(output.error_message.as_deref(), Some("bad prompt"));
    }

    fn backdate(repo: &MemoryRepo, run_id: &RunId, agent: AgentName, minutes: i64, handoff: bool) -> RunStep {
        let mut step = repo
            .steps_now(run_id)
            .into_iter()
            .find(|s| s.agent == agent)
            .unwrap();
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now() - chrono::Duration::minutes(minutes));
        if handoff {
            step.meta.handoff_job_id = Some("job-x".into());
        }
        repo.put_step(step.clone());
        step
    }

    #[tokio::test]
    async fn stale_step_is_force_failed() {
        let (h, run) = harness(&[AgentName::Search, AgentName::Writer], 0, 6).await;
        let step = backdate(&h.repo, &run.id, AgentName::Search, 20, false);

        let result = h.executor.run_next(run.id, None).await.unwrap();
        assert_eq!(
            result,
            RunNextResult::FailedTimeoutRecovery {
                step_id: step.id,
                agent: AgentName::Search
            }
        );
        let output = h.repo.get_output_for_step(&step.id).await.unwrap().unwrap();
        assert_eq!(output.payload, json!({"error": "timeout"}));
        assert_eq!(h.repo.run_now(&run.id).status, RunStatus::Failed);
        assert_eq!(h.repo.lead_now(&h.lead.id).current_run_id, None);
    }

    #[tokio::test]
    async fn fresh_running_step_is_left_alone() {
        let (h, run) = harness(&[AgentName::Search], 0, 6).await;
        backdate(&h.repo, &run.id, AgentName::Search, 5, false);
        let result = h.executor.run_next(run.id, None).await.unwrap();
        assert_eq!(result, RunNextResult::nothing(NothingToDoReason::StepRunning));
    }

    #[tokio::test]
    async fn sender_with_handoff_is_never_stale() {
        let (h, run) = harness(&[AgentName::Writer, AgentName::Sender], 0, 6).await;
        backdate(&h.repo, &run.id, AgentName::Sender, 24 * 60, true);
        let result = h.executor.run_next(run.id, None).await.unwrap();
        assert_eq!(result, RunNextResult::nothing(NothingToDoReason::AwaitingDelivery));
    }

    #[tokio::test]
    async fn sender_without_handoff_gets_an_hour() {
        let (h, run) = harness(&[AgentName::Writer, AgentName::Sender], 0, 6).await;
        backdate(&h.repo, &run.id, AgentName::Sender, 30, false);
        assert_eq!(
            h.executor.run_next(run.id, None).await.unwrap(),
            RunNextResult::nothing(NothingToDoReason::StepRunning)
        );
        backdate(&h.repo, &run.id, AgentName::Sender, 61, false);
        assert!(matches!(
            h.executor.run_next(run.id, None).await.unwrap(),
            RunNextResult::FailedTimeoutRecovery { .. }
        ));
    }

    #[tokio::test]
    async fn running_step_without_start_time_is_reported_not_repaired() {
        let (h, run) = harness(&[AgentName::Search], 0, 6).await;
        let mut step = h.repo.steps_now(&run.id)[0].clone();
        step.status = StepStatus::Running;
        h.repo.put_step(step.clone());

        let result = h.executor.run_next(run.id, None).await.unwrap();
        assert_eq!(result, RunNextResult::nothing(NothingToDoReason::CorruptRunningStep));
        assert_eq!(h.repo.step_now(&step.id).status, StepStatus::Running);
    }

    #[tokio::test]
    async fn running_step_with_output_is_finalized_from_it() {
        let (h, run) = harness(&[AgentName::Search], 0, 6).await;
        let step = backdate(&h.repo, &run.id, AgentName::Search, 1, false);
        let output = AgentOutput::new(&step, h.lead.id, OutputStatus::Completed, json!({"found": true}), None);
        h.repo.insert_output(&output).await.unwrap();

        let result = h.executor.run_next(run.id, None).await.unwrap();
        assert!(matches!(
            result,
            RunNextResult::Finalized { from_existing_output: true, step_status: StepStatus::Completed, .. }
        ));
        assert!(h.dispatcher.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sender_enqueues_and_stays_running() {
        let (h, run) = harness(&[AgentName::Writer, AgentName::Sender], 0, 6).await;
        h.dispatcher.push(AgentName::Writer, Ok(json!({"email": "Body", "subject": "Hi"})));

        h.executor.run_next(run.id, None).await.unwrap();
        let result = h.executor.run_next(run.id, None).await.unwrap();
        assert!(matches!(
            result,
            RunNextResult::Finalized { agent: AgentName::Sender, step_status: StepStatus::Running, .. }
        ));

        let sender = h.repo.steps_now(&run.id)[1].clone();
        assert_eq!(sender.status, StepStatus::Running);
        assert_eq!(sender.meta.handoff_job_id.as_deref(), Some("job-0"));
        let output = h.repo.get_output_for_step(&sender.id).await.unwrap().unwrap();
        assert_eq!(output.status, OutputStatus::Pending);
        assert_eq!(output.payload["email_status"], "queued");
        assert_eq!(output.payload["enqueued"], true);
        assert_eq!(h.gateway.jobs.lock().unwrap().len(), 1);

        assert_eq!(
            h.executor.run_next(run.id, None).await.unwrap(),
            RunNextResult::nothing(NothingToDoReason::AwaitingDelivery)
        );
    }

    #[tokio::test]
    async fn sender_preconditions_fail_the_step() {
        let (h, run) = harness(&[AgentName::Writer, AgentName::Sender], 0, 6).await;
        h.dispatcher.push(AgentName::Writer, Ok(json!({"email": "Body"})));
        h.executor.run_next(run.id, None).await.unwrap();
        *h.gateway.check.lock().unwrap() = DeliveryCheck::default();

        h.executor.run_next(run.id, None).await.unwrap();
        let sender = h.repo.steps_now(&run.id)[1].clone();
        assert_eq!(sender.status, StepStatus::Failed);
        let output = h.repo.get_output_for_step(&sender.id).await.unwrap().unwrap();
        assert_eq!(output.payload["error"], "sending_not_configured_at_send_time");
        assert!(h.gateway.jobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn at_most_one_step_runs_under_concurrent_callers() {
        let (h, run) = harness(&[AgentName::Search, AgentName::Writer, AgentName::Design], 0, 6).await;
        let mut handles = Vec::new();
        for _ in 0..6 {
            let executor = h.executor.clone();
            handles.push(tokio::spawn(async move { executor.run_next(run.id, None).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        drive(&h.executor, run.id).await;

        let steps = h.repo.steps_now(&run.id);
        assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(h.dispatcher.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn critique_with_pending_rewrite_pair_does_not_insert_another() {
        let (h, run) = harness(&[AgentName::Writer, AgentName::Critique, AgentName::Design], 2, 6).await;
        h.executor.run_next(run.id, None).await.unwrap();

        let critique = backdate(&h.repo, &run.id, AgentName::Critique, 1, false);
        let rewrite = RunStep::queued(
            run.id,
            21,
            AgentName::Writer,
            StepMeta {
                revision: Some(1),
                critique_step_id: Some(critique.id),
                ..Default::default()
            },
        );
        h.repo.put_step(rewrite);
        let output = AgentOutput::new(&critique, h.lead.id, OutputStatus::Completed, json!({"score": 3}), None);
        h.repo.insert_output(&output).await.unwrap();

        let result = h.executor.run_next(run.id, None).await.unwrap();
        assert!(matches!(
            result,
            RunNextResult::Finalized { step_status: StepStatus::Completed, from_existing_output: true, .. }
        ));
        assert_eq!(h.repo.steps_now(&run.id).len(), 4);
        assert_eq!(h.repo.run_now(&run.id).rewrite_count, 0);
    }

    #[tokio::test]
    async fn second_low_score_after_last_rewrite_fails_run() {
        let (h, run) = harness(&[AgentName::Writer, AgentName::Critique], 1, 6).await;
        h.dispatcher.push(AgentName::Critique, Ok(json!({"score": 4})));
        h.dispatcher.push(AgentName::Critique, Ok(json!({"score": 4})));

        drive(&h.executor, run.id).await;

        let steps = h.repo.steps_now(&run.id);
        let agents: Vec<AgentName> = steps.iter().map(|s| s.agent).collect();
        assert_eq!(
            agents,
            vec![AgentName::Writer, AgentName::Critique, AgentName::Writer, AgentName::Critique]
        );
        assert_eq!(steps[1].status, StepStatus::Completed);
        assert_eq!(steps[3].status, StepStatus::Failed);
        let output = h.repo.get_output_for_step(&steps[3].id).await.unwrap().unwrap();
        assert_eq!(output.payload["error"], MIN_SCORE_NOT_MET);

        let run = h.repo.run_now(&run.id);
        assert_eq!(run.rewrite_count, 1);
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn output_store_failure_fails_step_without_waiting_for_timeout() {
        let (h, run) = harness(&[AgentName::Search, AgentName::Writer], 0, 6).await;
        h.repo.fail_output_inserts(1);

        let result = h.executor.run_next(run.id, None).await.unwrap();
        assert!(matches!(
            result,
            RunNextResult::Finalized { agent: AgentName::Search, step_status: StepStatus::Failed, run_status: RunStatus::Failed, .. }
        ));

        let search = h.repo.steps_now(&run.id)[0].clone();
        let output = h.repo.get_output_for_step(&search.id).await.unwrap().unwrap();
        assert_eq!(output.status, OutputStatus::Failed);
        assert_eq!(output.payload["error"], OUTPUT_PERSIST_FAILED);
        assert_eq!(output.payload["retryable"], true);
        assert_eq!(h.repo.lead_now(&h.lead.id).current_run_id, None);
    }

    #[tokio::test]
    async fn sender_handoff_survives_failed_meta_write() {
        let (h, run) = harness(&[AgentName::Writer, AgentName::Sender], 0, 6).await;
        h.dispatcher.push(AgentName::Writer, Ok(json!({"email": "Body", "subject": "Hi"})));
        h.executor.run_next(run.id, None).await.unwrap();

        h.repo.fail_meta_updates(1);
        let result = h.executor.run_next(run.id, None).await.unwrap();
        assert!(matches!(
            result,
            RunNextResult::Finalized { agent: AgentName::Sender, step_status: StepStatus::Running, .. }
        ));

        let sender = h.repo.steps_now(&run.id)[1].clone();
        assert_eq!(sender.meta.handoff_job_id.as_deref(), Some("job-0"));
        let started_at = sender.started_at.unwrap();
        let much_later = started_at + chrono::Duration::hours(3);
        assert!(!is_stale(&EngineConfig::default(), &sender, started_at, much_later));
        assert_eq!(
            h.executor.run_next(run.id, None).await.unwrap(),
            RunNextResult::nothing(NothingToDoReason::AwaitingDelivery)
        );
    }
}
