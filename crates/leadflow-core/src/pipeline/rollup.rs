//! Run status recomputation after step changes.

use chrono::{DateTime, Utc};
use leadflow_types::id::StepId;
use leadflow_types::run::{LeadRun, RunStatus, RunStep, StepStatus};

use crate::repository::run::RunTransition;

/// Step statuses as they will be once `changed` and `added` are applied.
pub fn statuses_after(
    steps: &[RunStep],
    changed: &[(StepId, StepStatus)],
    added: &[RunStep],
) -> Vec<StepStatus> {
    steps
        .iter()
        .map(|step| {
            changed
                .iter()
                .find(|(id, _)| *id == step.id)
                .map(|(_, status)| *status)
                .unwrap_or(step.status)
        })
        .chain(added.iter().map(|step| step.status))
        .collect()
}

/// Fold the recomputed run status into `transition`.
///
/// A run that never started stays queued while all of its steps are still
/// queued. A terminal result stamps `finished_at` and clears the lead's
/// active-run pointer.
pub fn apply_rollup(
    transition: &mut RunTransition,
    run: &LeadRun,
    statuses: &[StepStatus],
    now: DateTime<Utc>,
) -> RunStatus {
    let mut status = RunStatus::from_steps(statuses.iter().copied());
    if status == RunStatus::Running
        && run.status == RunStatus::Queued
        && statuses.iter().all(|s| *s == StepStatus::Queued || *s == StepStatus::Skipped)
    {
        status = RunStatus::Queued;
    }

    transition.run.status = Some(status);
    if status.is_terminal() {
        transition.run.finished_at = Some(now);
        transition.lead.clear_pointer_for = Some(run.id);
    }
    status
}
