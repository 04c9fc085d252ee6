//! In-memory repositories and scripted collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use leadflow_types::agent::{AgentConfig, AgentError, AgentName};
use leadflow_types::error::RepositoryError;
use leadflow_types::id::{CampaignId, LeadId, OutputId, RunId, StepId, UserId};
use leadflow_types::lead::{Campaign, Lead};
use leadflow_types::run::{AgentOutput, LeadRun, RunStep, SkipReason, StepMeta, StepStatus};
use serde_json::Value;

use crate::pipeline::dispatch::{
    AgentDispatcher, DeliveryCheck, DeliveryGateway, DeliveryJob, DispatchRequest,
};
use crate::repository::campaign::CampaignConfigRepository;
use crate::repository::run::{RunRepository, RunTransition};

#[derive(Default)]
struct State {
    leads: HashMap<LeadId, Lead>,
    runs: HashMap<RunId, LeadRun>,
    steps: HashMap<StepId, RunStep>,
    outputs: HashMap<OutputId, AgentOutput>,
    leases: HashMap<(String, String), (String, DateTime<Utc>)>,
    campaigns: HashMap<CampaignId, Campaign>,
    configs: HashMap<(CampaignId, AgentName), AgentConfig>,
}

/// Both repository traits over a single mutex.
#[derive(Default)]
pub struct MemoryRepo {
    state: Mutex<State>,
    failing_meta_updates: AtomicUsize,
    failing_output_inserts: AtomicUsize,
}

fn take_failure(counter: &AtomicUsize) -> Result<(), RepositoryError> {
    let failing = counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return Err(RepositoryError::Query("injected failure".into()));
    }
    Ok(())
}

impl MemoryRepo {
    pub fn step_now(&self, id: &StepId) -> RunStep {
        self.state.lock().unwrap().steps[id].clone()
    }

    pub fn run_now(&self, id: &RunId) -> LeadRun {
        self.state.lock().unwrap().runs[id].clone()
    }

    pub fn lead_now(&self, id: &LeadId) -> Lead {
        self.state.lock().unwrap().leads[id].clone()
    }

    pub fn steps_now(&self, run_id: &RunId) -> Vec<RunStep> {
        let state = self.state.lock().unwrap();
        let mut steps: Vec<RunStep> = state
            .steps
            .values()
            .filter(|s| s.run_id == *run_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.position);
        steps
    }

    /// Make the next `n` step meta updates fail.
    pub fn fail_meta_updates(&self, n: usize) {
        self.failing_meta_updates.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` output inserts fail.
    pub fn fail_output_inserts(&self, n: usize) {
        self.failing_output_inserts.store(n, Ordering::SeqCst);
    }

    /// Overwrite a step in place (test setup only).
    pub fn put_step(&self, step: RunStep) {
        self.state.lock().unwrap().steps.insert(step.id, step);
    }
}

impl RunRepository for MemoryRepo {
    async fn save_lead(&self, lead: &Lead) -> Result<(), RepositoryError> {
        self.state.lock().unwrap().leads.insert(lead.id, lead.clone());
        Ok(())
    }

    async fn get_lead(&self, id: &LeadId) -> Result<Option<Lead>, RepositoryError> {
        Ok(self.state.lock().unwrap().leads.get(id).cloned())
    }

    async fn create_run(&self, run: &LeadRun, steps: &[RunStep]) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let active = state
            .runs
            .values()
            .any(|r| r.lead_id == run.lead_id && !r.status.is_terminal());
        if active {
            return Err(RepositoryError::Conflict("lead already has an active run".into()));
        }
        state.runs.insert(run.id, run.clone());
        for step in steps {
            state.steps.insert(step.id, step.clone());
        }
        if !run.status.is_terminal() {
            if let Some(lead) = state.leads.get_mut(&run.lead_id) {
                lead.current_run_id = Some(run.id);
            }
        }
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<LeadRun>, RepositoryError> {
        Ok(self.state.lock().unwrap().runs.get(id).cloned())
    }

    async fn active_run_for_lead(&self, lead_id: &LeadId) -> Result<Option<LeadRun>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .runs
            .values()
            .filter(|r| r.lead_id == *lead_id && !r.status.is_terminal())
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn list_runs_for_lead(&self, lead_id: &LeadId) -> Result<Vec<LeadRun>, RepositoryError> {
        let state = self.state.lock().unwrap();
        let mut runs: Vec<LeadRun> = state
            .runs
            .values()
            .filter(|r| r.lead_id == *lead_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(runs)
    }

    async fn list_steps(&self, run_id: &RunId) -> Result<Vec<RunStep>, RepositoryError> {
        Ok(self.steps_now(run_id))
    }

    async fn get_step(&self, id: &StepId) -> Result<Option<RunStep>, RepositoryError> {
        Ok(self.state.lock().unwrap().steps.get(id).cloned())
    }

    async fn update_step_meta(&self, id: &StepId, meta: &StepMeta) -> Result<(), RepositoryError> {
        take_failure(&self.failing_meta_updates)?;
        let mut state = self.state.lock().unwrap();
        let step = state.steps.get_mut(id).ok_or(RepositoryError::NotFound)?;
        step.meta = meta.clone();
        step.updated_at = Utc::now();
        Ok(())
    }

    async fn skip_queued_steps(
        &self,
        run_id: &RunId,
        agent: AgentName,
        reason: SkipReason,
        at: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let mut count = 0;
        for step in state.steps.values_mut() {
            if step.run_id == *run_id && step.agent == agent && step.status == StepStatus::Queued {
                step.status = StepStatus::Skipped;
                step.finished_at = Some(at);
                step.meta.skip_reason = Some(reason);
                step.meta.skipped_at = Some(at);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn requeue_skipped_steps(
        &self,
        run_id: &RunId,
        agent: AgentName,
        reason: SkipReason,
    ) -> Result<u64, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let mut count = 0;
        for step in state.steps.values_mut() {
            if step.run_id == *run_id
                && step.agent == agent
                && step.status == StepStatus::Skipped
                && step.meta.skip_reason == Some(reason)
            {
                step.status = StepStatus::Queued;
                step.started_at = None;
                step.finished_at = None;
                step.meta.skip_reason = None;
                step.meta.skipped_at = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn apply_transition(&self, t: &RunTransition) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();

        if let Some(st) = &t.step {
            let step = state.steps.get_mut(&st.step_id).ok_or(RepositoryError::NotFound)?;
            if step.status != st.from {
                return Ok(false);
            }
            step.status = st.to;
            if st.started_at.is_some() {
                step.started_at = st.started_at;
            }
            if st.finished_at.is_some() {
                step.finished_at = st.finished_at;
            }
            if st.output_id.is_some() {
                step.output_id = st.output_id;
            }
            if let Some(meta) = &st.meta {
                step.meta = meta.clone();
            }
            step.updated_at = now;
        }

        if let Some(output) = &t.output {
            let stored = state.outputs.get_mut(&output.id).ok_or(RepositoryError::NotFound)?;
            stored.status = output.status;
            stored.payload = output.payload.clone();
            stored.error_message = output.error_message.clone();
            stored.updated_at = now;
        }

        for (id, position) in &t.renumber {
            if let Some(step) = state.steps.get_mut(id) {
                step.position = *position;
            }
        }
        for step in &t.new_steps {
            let taken = state
                .steps
                .values()
                .any(|s| s.run_id == step.run_id && s.position == step.position);
            if taken {
                return Err(RepositoryError::Conflict("position taken".into()));
            }
            state.steps.insert(step.id, step.clone());
        }

        if let Some(run) = state.runs.get_mut(&t.run_id) {
            if let Some(status) = t.run.status {
                run.status = status;
            }
            if let Some(count) = t.run.rewrite_count {
                run.rewrite_count = count;
            }
            if run.started_at.is_none() && t.run.started_at.is_some() {
                run.started_at = t.run.started_at;
            }
            if t.run.finished_at.is_some() {
                run.finished_at = t.run.finished_at;
            }
            run.updated_at = now;
        }

        if let Some(lead) = state.leads.get_mut(&t.lead_id) {
            if t.lead.stage.is_some() {
                lead.stage = t.lead.stage;
            }
            if t.lead.quality.is_some() {
                lead.quality = t.lead.quality;
            }
            if t.lead.clear_pointer_for.is_some() && lead.current_run_id == t.lead.clear_pointer_for {
                lead.current_run_id = None;
            }
        }
        Ok(true)
    }

    async fn get_output(&self, id: &OutputId) -> Result<Option<AgentOutput>, RepositoryError> {
        Ok(self.state.lock().unwrap().outputs.get(id).cloned())
    }

    async fn get_output_for_step(&self, step_id: &StepId) -> Result<Option<AgentOutput>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state.outputs.values().find(|o| o.step_id == *step_id).cloned())
    }

    async fn insert_output(&self, output: &AgentOutput) -> Result<AgentOutput, RepositoryError> {
        take_failure(&self.failing_output_inserts)?;
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.outputs.values().find(|o| o.step_id == output.step_id) {
            return Ok(existing.clone());
        }
        state.outputs.insert(output.id, output.clone());
        Ok(output.clone())
    }

    async fn update_output(&self, output: &AgentOutput) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let stored = state.outputs.get_mut(&output.id).ok_or(RepositoryError::NotFound)?;
        stored.status = output.status;
        stored.payload = output.payload.clone();
        stored.error_message = output.error_message.clone();
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn outputs_for_lead(
        &self,
        lead_id: &LeadId,
        agent: AgentName,
    ) -> Result<Vec<AgentOutput>, RepositoryError> {
        let state = self.state.lock().unwrap();
        let mut outputs: Vec<AgentOutput> = state
            .outputs
            .values()
            .filter(|o| o.lead_id == *lead_id && o.agent == agent)
            .cloned()
            .collect();
        outputs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(outputs)
    }

    async fn try_acquire_lease(
        &self,
        scope: &str,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let slot = (scope.to_string(), key.to_string());
        if let Some((_, expires_at)) = state.leases.get(&slot) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap();
        state.leases.insert(slot, (holder.to_string(), expires_at));
        Ok(true)
    }

    async fn release_lease(&self, scope: &str, key: &str, holder: &str) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let slot = (scope.to_string(), key.to_string());
        if state.leases.get(&slot).is_some_and(|(h, _)| h == holder) {
            state.leases.remove(&slot);
        }
        Ok(())
    }
}

impl CampaignConfigRepository for MemoryRepo {
    async fn save_campaign(&self, campaign: &Campaign) -> Result<(), RepositoryError> {
        self.state.lock().unwrap().campaigns.insert(campaign.id, campaign.clone());
        Ok(())
    }

    async fn get_campaign(&self, id: &CampaignId) -> Result<Option<Campaign>, RepositoryError> {
        Ok(self.state.lock().unwrap().campaigns.get(id).cloned())
    }

    async fn save_agent_config(&self, config: &AgentConfig) -> Result<(), RepositoryError> {
        self.state
            .lock()
            .unwrap()
            .configs
            .insert((config.campaign_id, config.agent), config.clone());
        Ok(())
    }

    async fn get_agent_config(
        &self,
        campaign_id: &CampaignId,
        agent: AgentName,
    ) -> Result<Option<AgentConfig>, RepositoryError> {
        Ok(self.state.lock().unwrap().configs.get(&(*campaign_id, agent)).cloned())
    }

    async fn list_agent_configs(&self, campaign_id: &CampaignId) -> Result<Vec<AgentConfig>, RepositoryError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .configs
            .values()
            .filter(|c| c.campaign_id == *campaign_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Dispatcher that replays scripted results per agent, falling back to `{}`.
#[derive(Default)]
pub struct ScriptedDispatcher {
    script: Mutex<HashMap<AgentName, VecDeque<Result<Value, AgentError>>>>,
    pub requests: Mutex<Vec<DispatchRequest>>,
}

impl ScriptedDispatcher {
    pub fn push(&self, agent: AgentName, result: Result<Value, AgentError>) {
        self.script.lock().unwrap().entry(agent).or_default().push_back(result);
    }
}

impl AgentDispatcher for ScriptedDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<Value, AgentError> {
        let agent = request.step.agent;
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .get_mut(&agent)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| Ok(serde_json::json!({})))
    }
}

/// Delivery gateway with a switchable configuration check.
pub struct FakeGateway {
    pub check: Mutex<DeliveryCheck>,
    pub jobs: Mutex<Vec<DeliveryJob>>,
    counter: AtomicUsize,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self {
            check: Mutex::new(DeliveryCheck::configured()),
            jobs: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
        }
    }
}

impl FakeGateway {
    pub fn unconfigured(reason: &str) -> Self {
        let gateway = Self::default();
        let mut check = DeliveryCheck::default();
        check.reasons.insert("smtp".into(), reason.into());
        *gateway.check.lock().unwrap() = check;
        gateway
    }
}

impl DeliveryGateway for FakeGateway {
    async fn check(&self, _user_id: &UserId, _campaign_id: &CampaignId) -> DeliveryCheck {
        self.check.lock().unwrap().clone()
    }

    async fn enqueue(&self, job: DeliveryJob) -> Result<String, AgentError> {
        self.jobs.lock().unwrap().push(job);
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("job-{n}"))
    }
}

/// A campaign with a lead, saved into `repo`.
pub async fn seed_lead(repo: &MemoryRepo, shared: Value) -> (Campaign, Lead) {
    let campaign = Campaign {
        id: CampaignId::new(),
        user_id: UserId::new(),
        name: "Test campaign".into(),
        shared_settings: shared,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    repo.save_campaign(&campaign).await.unwrap();
    let lead = Lead::new(campaign.id);
    repo.save_lead(&lead).await.unwrap();
    (campaign, lead)
}

/// Save an agent config row for `agent`.
pub async fn set_agent(repo: &MemoryRepo, campaign_id: CampaignId, agent: AgentName, enabled: bool, settings: Value) {
    let existing = repo.get_agent_config(&campaign_id, agent).await.unwrap();
    let config = AgentConfig {
        id: existing.map(|c| c.id).unwrap_or_default(),
        campaign_id,
        agent,
        enabled,
        settings,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    repo.save_agent_config(&config).await.unwrap();
}
