//! Run repository trait definition.
//!
//! Defines the storage interface for leads, runs, steps, outputs, and the
//! lease rows that serialize decisions per run. The infrastructure layer
//! (leadflow-infra) implements this trait with SQLite persistence.

use std::time::Duration;

use chrono::{DateTime, Utc};
use leadflow_types::agent::AgentName;
use leadflow_types::error::RepositoryError;
use leadflow_types::id::{LeadId, OutputId, RunId, StepId};
use leadflow_types::lead::{Lead, LeadStage, Quality};
use leadflow_types::run::{AgentOutput, LeadRun, RunStatus, RunStep, SkipReason, StepMeta, StepStatus};

// ---------------------------------------------------------------------------
// Transition payloads
// ---------------------------------------------------------------------------

/// Conditional status change of one step.
///
/// Applied only while the step's stored status still equals `from`; this is
/// what keeps two racing callers from claiming or finalizing the same step.
#[derive(Debug, Clone)]
pub struct StepTransition {
    pub step_id: StepId,
    pub from: StepStatus,
    pub to: StepStatus,
    /// Set when present; existing values are kept otherwise.
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output_id: Option<OutputId>,
    /// Replaces the stored meta when present.
    pub meta: Option<StepMeta>,
}

/// Run fields touched by a transition. `None` leaves a column unchanged.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub rewrite_count: Option<u32>,
    /// Only written when the run has no start time yet.
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Lead projection changes carried by a transition.
#[derive(Debug, Clone, Default)]
pub struct LeadUpdate {
    pub stage: Option<LeadStage>,
    pub quality: Option<Quality>,
    /// Clear the lead's active-run pointer if it still points at this run.
    pub clear_pointer_for: Option<RunId>,
}

/// Everything a single engine decision writes, committed in one transaction.
#[derive(Debug, Clone)]
pub struct RunTransition {
    pub run_id: RunId,
    pub lead_id: LeadId,
    pub step: Option<StepTransition>,
    /// Output row to overwrite (status, payload, error message).
    pub output: Option<AgentOutput>,
    /// New positions for existing steps, applied before `new_steps` are inserted.
    pub renumber: Vec<(StepId, i64)>,
    pub new_steps: Vec<RunStep>,
    pub run: RunUpdate,
    pub lead: LeadUpdate,
}

impl RunTransition {
    pub fn new(run_id: RunId, lead_id: LeadId) -> Self {
        Self {
            run_id,
            lead_id,
            step: None,
            output: None,
            renumber: Vec::new(),
            new_steps: Vec::new(),
            run: RunUpdate::default(),
            lead: LeadUpdate::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Repository trait
// ---------------------------------------------------------------------------

/// Repository trait for pipeline run persistence.
///
/// Covers four entity families:
/// - **Leads:** the work item and its active-run pointer.
/// - **Runs and steps:** plans, conditional transitions, bulk reconciliation.
/// - **Outputs:** race-tolerant, at most one per step.
/// - **Leases:** TTL-bounded mutual exclusion rows.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Leads
    // -----------------------------------------------------------------------

    /// Insert or update a lead.
    fn save_lead(
        &self,
        lead: &Lead,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_lead(
        &self,
        id: &LeadId,
    ) -> impl std::future::Future<Output = Result<Option<Lead>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Persist a run and its steps atomically and point the lead at the run.
    ///
    /// Returns `RepositoryError::Conflict` if the lead already has an active run.
    fn create_run(
        &self,
        run: &LeadRun,
        steps: &[RunStep],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_run(
        &self,
        id: &RunId,
    ) -> impl std::future::Future<Output = Result<Option<LeadRun>, RepositoryError>> + Send;

    /// The lead's non-terminal run, if any.
    fn active_run_for_lead(
        &self,
        lead_id: &LeadId,
    ) -> impl std::future::Future<Output = Result<Option<LeadRun>, RepositoryError>> + Send;

    /// All runs of a lead, newest first.
    fn list_runs_for_lead(
        &self,
        lead_id: &LeadId,
    ) -> impl std::future::Future<Output = Result<Vec<LeadRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Steps of a run ordered by position.
    fn list_steps(
        &self,
        run_id: &RunId,
    ) -> impl std::future::Future<Output = Result<Vec<RunStep>, RepositoryError>> + Send;

    fn get_step(
        &self,
        id: &StepId,
    ) -> impl std::future::Future<Output = Result<Option<RunStep>, RepositoryError>> + Send;

    /// Overwrite a step's metadata without touching its status.
    fn update_step_meta(
        &self,
        id: &StepId,
        meta: &StepMeta,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Skip every still-queued step of `agent` in the run, stamping the reason.
    /// Returns the number of steps skipped.
    fn skip_queued_steps(
        &self,
        run_id: &RunId,
        agent: AgentName,
        reason: SkipReason,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Requeue steps of `agent` that were skipped with exactly `reason`.
    /// Returns the number of steps requeued.
    fn requeue_skipped_steps(
        &self,
        run_id: &RunId,
        agent: AgentName,
        reason: SkipReason,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Apply a transition atomically.
    ///
    /// Returns `false` (and writes nothing) when the step transition's
    /// expected `from` status no longer matches.
    fn apply_transition(
        &self,
        transition: &RunTransition,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Outputs
    // -----------------------------------------------------------------------

    fn get_output(
        &self,
        id: &OutputId,
    ) -> impl std::future::Future<Output = Result<Option<AgentOutput>, RepositoryError>> + Send;

    fn get_output_for_step(
        &self,
        step_id: &StepId,
    ) -> impl std::future::Future<Output = Result<Option<AgentOutput>, RepositoryError>> + Send;

    /// Insert an output unless the step already has one, and return the
    /// stored row (ours, or the winner of a concurrent insert).
    fn insert_output(
        &self,
        output: &AgentOutput,
    ) -> impl std::future::Future<Output = Result<AgentOutput, RepositoryError>> + Send;

    /// Overwrite an output's status, payload and error message.
    fn update_output(
        &self,
        output: &AgentOutput,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Outputs produced by `agent` for a lead across all runs, newest first.
    fn outputs_for_lead(
        &self,
        lead_id: &LeadId,
        agent: AgentName,
    ) -> impl std::future::Future<Output = Result<Vec<AgentOutput>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Leases
    // -----------------------------------------------------------------------

    /// Take the lease `(scope, key)` for `holder` if it is free or expired.
    fn try_acquire_lease(
        &self,
        scope: &str,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Release the lease if `holder` still owns it.
    fn release_lease(
        &self,
        scope: &str,
        key: &str,
        holder: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
