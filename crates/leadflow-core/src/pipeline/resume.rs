//! Resume checks: whether a run has work an executor call could advance.

use chrono::Utc;
use leadflow_types::config::EngineConfig;
use leadflow_types::error::RepositoryError;
use leadflow_types::id::RunId;
use leadflow_types::run::{OutputStatus, StepStatus};
use serde::Serialize;
use std::fmt;

use crate::pipeline::executor::is_stale;
use crate::repository::run::RunRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeReason {
    MissingRun,
    Terminal,
    CorruptRunningStep,
    RunningHasOutput,
    StaleRunning,
    AlreadyRunning,
    QueuedSteps,
    NoWork,
}

impl ResumeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResumeReason::MissingRun => "missing_run",
            ResumeReason::Terminal => "terminal",
            ResumeReason::CorruptRunningStep => "corrupt_running_step",
            ResumeReason::RunningHasOutput => "running_has_output",
            ResumeReason::StaleRunning => "stale_running",
            ResumeReason::AlreadyRunning => "already_running",
            ResumeReason::QueuedSteps => "queued_steps",
            ResumeReason::NoWork => "no_work",
        }
    }
}

impl fmt::Display for ResumeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResumeDecision {
    pub resume: bool,
    pub reason: ResumeReason,
}

impl ResumeDecision {
    fn new(resume: bool, reason: ResumeReason) -> Self {
        Self { resume, reason }
    }
}

/// Read-only; takes no lease.
pub async fn check_resume<R: RunRepository>(
    repo: &R,
    config: &EngineConfig,
    run_id: &RunId,
) -> Result<ResumeDecision, RepositoryError> {
    let Some(run) = repo.get_run(run_id).await? else {
        return Ok(ResumeDecision::new(false, ResumeReason::MissingRun));
    };
    if run.status.is_terminal() {
        return Ok(ResumeDecision::new(false, ResumeReason::Terminal));
    }

    let steps = repo.list_steps(run_id).await?;
    if let Some(running) = steps.iter().find(|s| s.status == StepStatus::Running) {
        let Some(started_at) = running.started_at else {
            return Ok(ResumeDecision::new(false, ResumeReason::CorruptRunningStep));
        };
        if let Some(output) = repo.get_output_for_step(&running.id).await? {
            let awaiting_delivery =
                running.meta.handoff_job_id.is_some() && output.status == OutputStatus::Pending;
            return Ok(if awaiting_delivery {
                ResumeDecision::new(false, ResumeReason::AlreadyRunning)
            } else {
                ResumeDecision::new(true, ResumeReason::RunningHasOutput)
            });
        }
        if is_stale(config, running, started_at, Utc::now()) {
            return Ok(ResumeDecision::new(true, ResumeReason::StaleRunning));
        }
        return Ok(ResumeDecision::new(false, ResumeReason::AlreadyRunning));
    }

    if steps.iter().any(|s| s.status == StepStatus::Queued) {
        return Ok(ResumeDecision::new(true, ResumeReason::QueuedSteps));
    }
    Ok(ResumeDecision::new(false, ResumeReason::NoWork))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryRepo, seed_lead};
    use chrono::Duration;
    use leadflow_types::agent::AgentName;
    use leadflow_types::run::{AgentOutput, LeadRun, RunStatus, RunStep, StepMeta};
    use serde_json::json;

    async fn run_with(repo: &MemoryRepo, status: RunStatus, steps: &[(AgentName, StepStatus)]) -> (LeadRun, Vec<RunStep>) {
        let (campaign, lead) = seed_lead(repo, json!({})).await;
        let now = Utc::now();
        let run = LeadRun {
            id: RunId::new(),
            lead_id: lead.id,
            campaign_id: campaign.id,
            status,
            rewrite_count: 0,
            max_rewrites: 0,
            min_score: None,
            plan: steps.iter().map(|(a, _)| *a).collect(),
            config_snapshot: json!({}),
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        let steps: Vec<RunStep> = steps
            .iter()
            .enumerate()
            .map(|(i, (agent, status))| {
                let mut step = RunStep::queued(run.id, (i as i64 + 1) * 10, *agent, StepMeta::default());
                step.status = *status;
                if *status == StepStatus::Running {
                    step.started_at = Some(now);
                }
                step
            })
            .collect();
        repo.create_run(&run, &steps).await.unwrap();
        (run, steps)
    }

    async fn decide(repo: &MemoryRepo, run_id: &RunId) -> ResumeDecision {
        check_resume(repo, &EngineConfig::default(), run_id).await.unwrap()
    }

    #[tokio::test]
    async fn missing_and_terminal_runs_do_not_resume() {
        let repo = MemoryRepo::default();
        assert_eq!(decide(&repo, &RunId::new()).await.reason, ResumeReason::MissingRun);

        let (run, _) = run_with(&repo, RunStatus::Completed, &[(AgentName::Writer, StepStatus::Completed)]).await;
        let decision = decide(&repo, &run.id).await;
        assert!(!decision.resume);
        assert_eq!(decision.reason, ResumeReason::Terminal);
    }

    #[tokio::test]
    async fn queued_work_resumes() {
        let repo = MemoryRepo::default();
        let (run, _) = run_with(&repo, RunStatus::Queued, &[(AgentName::Search, StepStatus::Queued)]).await;
        assert_eq!(decide(&repo, &run.id).await, ResumeDecision::new(true, ResumeReason::QueuedSteps));
    }

    #[tokio::test]
    async fn fresh_running_step_is_left_alone() {
        let repo = MemoryRepo::default();
        let (run, _) = run_with(
            &repo,
            RunStatus::Running,
            &[(AgentName::Writer, StepStatus::Running), (AgentName::Critique, StepStatus::Queued)],
        )
        .await;
        assert_eq!(decide(&repo, &run.id).await, ResumeDecision::new(false, ResumeReason::AlreadyRunning));
    }

    #[tokio::test]
    async fn stale_or_finished_running_steps_resume() {
        let repo = MemoryRepo::default();
        let (run, steps) = run_with(&repo, RunStatus::Running, &[(AgentName::Writer, StepStatus::Running)]).await;

        let mut stale = steps[0].clone();
        stale.started_at = Some(Utc::now() - Duration::minutes(20));
        repo.put_step(stale.clone());
        assert_eq!(decide(&repo, &run.id).await, ResumeDecision::new(true, ResumeReason::StaleRunning));

        let output = AgentOutput::new(&stale, run.lead_id, OutputStatus::Completed, json!({"email": "x"}), None);
        repo.insert_output(&output).await.unwrap();
        assert_eq!(decide(&repo, &run.id).await, ResumeDecision::new(true, ResumeReason::RunningHasOutput));
    }

    #[tokio::test]
    async fn corrupt_and_handed_off_steps_do_not_resume() {
        let repo = MemoryRepo::default();
        let (run, steps) = run_with(&repo, RunStatus::Running, &[(AgentName::Sender, StepStatus::Running)]).await;

        let mut sender = steps[0].clone();
        sender.meta.handoff_job_id = Some("job-1".into());
        repo.put_step(sender.clone());
        let output = AgentOutput::new(&sender, run.lead_id, OutputStatus::Pending, json!({"enqueued": true}), None);
        repo.insert_output(&output).await.unwrap();
        assert_eq!(decide(&repo, &run.id).await, ResumeDecision::new(false, ResumeReason::AlreadyRunning));

        sender.started_at = None;
        repo.put_step(sender);
        assert_eq!(decide(&repo, &run.id).await.reason, ResumeReason::CorruptRunningStep);
    }
}
