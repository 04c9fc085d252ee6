//! SQLite run repository implementation.
//!
//! Implements `RunRepository` from `leadflow-core` using sqlx with split
//! read/write pools. Every multi-row change goes through one transaction on
//! the single writer connection, and step transitions are conditional on the
//! step's current status so racing callers cannot both win.

use std::time::Duration;

use chrono::{DateTime, Utc};
use leadflow_core::repository::run::{RunRepository, RunTransition};
use leadflow_types::agent::AgentName;
use leadflow_types::error::RepositoryError;
use leadflow_types::id::{CampaignId, LeadId, OutputId, RunId, StepId};
use leadflow_types::lead::{Lead, LeadStage, Quality};
use leadflow_types::run::{AgentOutput, LeadRun, RunStep, SkipReason, StepMeta, StepStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use super::codec::{
    enum_str, format_datetime, is_unique_violation, parse_datetime, parse_enum, parse_id, parse_json,
    parse_opt_datetime, parse_opt_id, to_json,
};
use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunRepository`.
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_agent(s: &str) -> Result<AgentName, RepositoryError> {
    s.parse::<AgentName>().map_err(RepositoryError::Query)
}

fn parse_count(n: i64, column: &str) -> Result<u32, RepositoryError> {
    u32::try_from(n).map_err(|_| RepositoryError::Query(format!("invalid {column}: {n}")))
}

fn lead_from_row(row: &SqliteRow) -> Result<Lead, RepositoryError> {
    let stage: Option<String> = row.try_get("stage").map_err(query_err)?;
    let quality: Option<String> = row.try_get("quality").map_err(query_err)?;
    let current_run_id: Option<String> = row.try_get("current_run_id").map_err(query_err)?;
    let id: String = row.try_get("id").map_err(query_err)?;
    let campaign_id: String = row.try_get("campaign_id").map_err(query_err)?;
    let created_at: String = row.try_get("created_at").map_err(query_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(query_err)?;

    Ok(Lead {
        id: parse_id::<LeadId>(&id)?,
        campaign_id: parse_id::<CampaignId>(&campaign_id)?,
        stage: stage
            .map(|s| s.parse::<LeadStage>())
            .transpose()
            .map_err(RepositoryError::Query)?,
        quality: quality
            .map(|s| s.parse::<Quality>())
            .transpose()
            .map_err(RepositoryError::Query)?,
        current_run_id: parse_opt_id::<RunId>(current_run_id.as_deref())?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

struct RunRow {
    id: String,
    lead_id: String,
    campaign_id: String,
    status: String,
    rewrite_count: i64,
    max_rewrites: i64,
    min_score: Option<i64>,
    plan: String,
    config_snapshot: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            lead_id: row.try_get("lead_id")?,
            campaign_id: row.try_get("campaign_id")?,
            status: row.try_get("status")?,
            rewrite_count: row.try_get("rewrite_count")?,
            max_rewrites: row.try_get("max_rewrites")?,
            min_score: row.try_get("min_score")?,
            plan: row.try_get("plan")?,
            config_snapshot: row.try_get("config_snapshot")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_run(self) -> Result<LeadRun, RepositoryError> {
        Ok(LeadRun {
            id: parse_id::<RunId>(&self.id)?,
            lead_id: parse_id::<LeadId>(&self.lead_id)?,
            campaign_id: parse_id::<CampaignId>(&self.campaign_id)?,
            status: parse_enum(&self.status, "run status")?,
            rewrite_count: parse_count(self.rewrite_count, "rewrite_count")?,
            max_rewrites: parse_count(self.max_rewrites, "max_rewrites")?,
            min_score: self.min_score,
            plan: parse_json(&self.plan, "plan")?,
            config_snapshot: parse_json(&self.config_snapshot, "config_snapshot")?,
            started_at: parse_opt_datetime(self.started_at.as_deref())?,
            finished_at: parse_opt_datetime(self.finished_at.as_deref())?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct StepRow {
    id: String,
    run_id: String,
    position: i64,
    agent: String,
    status: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    meta: String,
    output_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl StepRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            position: row.try_get("position")?,
            agent: row.try_get("agent")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            meta: row.try_get("meta")?,
            output_id: row.try_get("output_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_step(self) -> Result<RunStep, RepositoryError> {
        Ok(RunStep {
            id: parse_id::<StepId>(&self.id)?,
            run_id: parse_id::<RunId>(&self.run_id)?,
            position: self.position,
            agent: parse_agent(&self.agent)?,
            status: parse_enum(&self.status, "step status")?,
            started_at: parse_opt_datetime(self.started_at.as_deref())?,
            finished_at: parse_opt_datetime(self.finished_at.as_deref())?,
            meta: parse_json(&self.meta, "meta")?,
            output_id: parse_opt_id::<OutputId>(self.output_id.as_deref())?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct OutputRow {
    id: String,
    step_id: String,
    run_id: String,
    lead_id: String,
    agent: String,
    status: String,
    payload: String,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
}

impl OutputRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            step_id: row.try_get("step_id")?,
            run_id: row.try_get("run_id")?,
            lead_id: row.try_get("lead_id")?,
            agent: row.try_get("agent")?,
            status: row.try_get("status")?,
            payload: row.try_get("payload")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_output(self) -> Result<AgentOutput, RepositoryError> {
        Ok(AgentOutput {
            id: parse_id::<OutputId>(&self.id)?,
            step_id: parse_id::<StepId>(&self.step_id)?,
            run_id: parse_id::<RunId>(&self.run_id)?,
            lead_id: parse_id::<LeadId>(&self.lead_id)?,
            agent: parse_agent(&self.agent)?,
            status: parse_enum(&self.status, "output status")?,
            payload: parse_json(&self.payload, "payload")?,
            error_message: self.error_message,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

fn run_from_row(row: &SqliteRow) -> Result<LeadRun, RepositoryError> {
    RunRow::from_row(row).map_err(query_err)?.into_run()
}

fn step_from_row(row: &SqliteRow) -> Result<RunStep, RepositoryError> {
    StepRow::from_row(row).map_err(query_err)?.into_step()
}

fn output_from_row(row: &SqliteRow) -> Result<AgentOutput, RepositoryError> {
    OutputRow::from_row(row).map_err(query_err)?.into_output()
}

async fn insert_step(tx: &mut Transaction<'_, Sqlite>, step: &RunStep) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO run_steps
           (id, run_id, position, agent, status, started_at, finished_at, meta, output_id, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(step.id.to_string())
    .bind(step.run_id.to_string())
    .bind(step.position)
    .bind(step.agent.as_str())
    .bind(enum_str(&step.status)?)
    .bind(step.started_at.as_ref().map(format_datetime))
    .bind(step.finished_at.as_ref().map(format_datetime))
    .bind(to_json(&step.meta)?)
    .bind(step.output_id.map(|id| id.to_string()))
    .bind(format_datetime(&step.created_at))
    .bind(format_datetime(&step.updated_at))
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            RepositoryError::Conflict(format!(
                "position {} already taken in run {}",
                step.position, step.run_id
            ))
        } else {
            query_err(e)
        }
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    async fn save_lead(&self, lead: &Lead) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO leads (id, campaign_id, stage, quality, current_run_id, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 stage = excluded.stage,
                 quality = excluded.quality,
                 current_run_id = excluded.current_run_id,
                 updated_at = excluded.updated_at"#,
        )
        .bind(lead.id.to_string())
        .bind(lead.campaign_id.to_string())
        .bind(lead.stage.map(|s| s.to_string()))
        .bind(lead.quality.map(|q| q.to_string()))
        .bind(lead.current_run_id.map(|id| id.to_string()))
        .bind(format_datetime(&lead.created_at))
        .bind(format_datetime(&lead.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_lead(&self, id: &LeadId) -> Result<Option<Lead>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM leads WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.as_ref().map(lead_from_row).transpose()
    }

    async fn create_run(&self, run: &LeadRun, steps: &[RunStep]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        sqlx::query(
            r#"INSERT INTO lead_runs
               (id, lead_id, campaign_id, status, rewrite_count, max_rewrites, min_score,
                plan, config_snapshot, started_at, finished_at, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(run.lead_id.to_string())
        .bind(run.campaign_id.to_string())
        .bind(enum_str(&run.status)?)
        .bind(i64::from(run.rewrite_count))
        .bind(i64::from(run.max_rewrites))
        .bind(run.min_score)
        .bind(to_json(&run.plan)?)
        .bind(to_json(&run.config_snapshot)?)
        .bind(run.started_at.as_ref().map(format_datetime))
        .bind(run.finished_at.as_ref().map(format_datetime))
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!("lead {} already has an active run", run.lead_id))
            } else {
                query_err(e)
            }
        })?;

        for step in steps {
            insert_step(&mut tx, step).await?;
        }

        if !run.status.is_terminal() {
            sqlx::query("UPDATE leads SET current_run_id = ?, updated_at = ? WHERE id = ?")
                .bind(run.id.to_string())
                .bind(format_datetime(&Utc::now()))
                .bind(run.lead_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<LeadRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM lead_runs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn active_run_for_lead(&self, lead_id: &LeadId) -> Result<Option<LeadRun>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM lead_runs WHERE lead_id = ? AND status IN ('queued', 'running')
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(lead_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs_for_lead(&self, lead_id: &LeadId) -> Result<Vec<LeadRun>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM lead_runs WHERE lead_id = ? ORDER BY created_at DESC, id DESC")
            .bind(lead_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter().map(run_from_row).collect()
    }

    async fn list_steps(&self, run_id: &RunId) -> Result<Vec<RunStep>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM run_steps WHERE run_id = ? ORDER BY position ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter().map(step_from_row).collect()
    }

    async fn get_step(&self, id: &StepId) -> Result<Option<RunStep>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM run_steps WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.as_ref().map(step_from_row).transpose()
    }

    async fn update_step_meta(&self, id: &StepId, meta: &StepMeta) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE run_steps SET meta = ?, updated_at = ? WHERE id = ?")
            .bind(to_json(meta)?)
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn skip_queued_steps(
        &self,
        run_id: &RunId,
        agent: AgentName,
        reason: SkipReason,
        at: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let at = format_datetime(&at);
        let result = sqlx::query(
            r#"UPDATE run_steps
               SET status = 'skipped',
                   finished_at = ?,
                   meta = json_set(meta, '$.skip_reason', ?, '$.skipped_at', ?),
                   updated_at = ?
               WHERE run_id = ? AND agent = ? AND status = 'queued'"#,
        )
        .bind(&at)
        .bind(reason.as_str())
        .bind(&at)
        .bind(&at)
        .bind(run_id.to_string())
        .bind(agent.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected())
    }

    async fn requeue_skipped_steps(
        &self,
        run_id: &RunId,
        agent: AgentName,
        reason: SkipReason,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE run_steps
               SET status = 'queued',
                   started_at = NULL,
                   finished_at = NULL,
                   meta = json_remove(meta, '$.skip_reason', '$.skipped_at'),
                   updated_at = ?
               WHERE run_id = ? AND agent = ? AND status = 'skipped'
                 AND json_extract(meta, '$.skip_reason') = ?"#,
        )
        .bind(format_datetime(&Utc::now()))
        .bind(run_id.to_string())
        .bind(agent.as_str())
        .bind(reason.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected())
    }

    async fn apply_transition(&self, t: &RunTransition) -> Result<bool, RepositoryError> {
        let now = format_datetime(&Utc::now());
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        if let Some(st) = &t.step {
            let meta = st.meta.as_ref().map(to_json).transpose()?;
            let result = sqlx::query(
                r#"UPDATE run_steps
                   SET status = ?,
                       started_at = COALESCE(?, started_at),
                       finished_at = COALESCE(?, finished_at),
                       output_id = COALESCE(?, output_id),
                       meta = COALESCE(?, meta),
                       updated_at = ?
                   WHERE id = ? AND status = ?"#,
            )
            .bind(enum_str(&st.to)?)
            .bind(st.started_at.as_ref().map(format_datetime))
            .bind(st.finished_at.as_ref().map(format_datetime))
            .bind(st.output_id.map(|id| id.to_string()))
            .bind(meta)
            .bind(&now)
            .bind(st.step_id.to_string())
            .bind(enum_str(&st.from)?)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

            if result.rows_affected() == 0 {
                let exists = sqlx::query("SELECT 1 FROM run_steps WHERE id = ?")
                    .bind(st.step_id.to_string())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(query_err)?
                    .is_some();
                if !exists {
                    return Err(RepositoryError::NotFound);
                }
                return Ok(false);
            }
        }

        if let Some(output) = &t.output {
            let result = sqlx::query(
                "UPDATE agent_outputs SET status = ?, payload = ?, error_message = ?, updated_at = ? WHERE id = ?",
            )
            .bind(enum_str(&output.status)?)
            .bind(to_json(&output.payload)?)
            .bind(&output.error_message)
            .bind(&now)
            .bind(output.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

            if result.rows_affected() == 0 {
                return Err(RepositoryError::NotFound);
            }
        }

        // Park renumbered steps on negative positions first so the
        // (run_id, position) constraint holds between the two passes.
        for (id, position) in &t.renumber {
            sqlx::query("UPDATE run_steps SET position = ? WHERE id = ? AND run_id = ?")
                .bind(-position)
                .bind(id.to_string())
                .bind(t.run_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }
        for (id, position) in &t.renumber {
            sqlx::query("UPDATE run_steps SET position = ?, updated_at = ? WHERE id = ? AND run_id = ?")
                .bind(position)
                .bind(&now)
                .bind(id.to_string())
                .bind(t.run_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }

        for step in &t.new_steps {
            insert_step(&mut tx, step).await?;
        }

        let run_status = t.run.status.as_ref().map(enum_str).transpose()?;
        sqlx::query(
            r#"UPDATE lead_runs
               SET status = COALESCE(?, status),
                   rewrite_count = COALESCE(?, rewrite_count),
                   started_at = COALESCE(started_at, ?),
                   finished_at = COALESCE(?, finished_at),
                   updated_at = ?
               WHERE id = ?"#,
        )
        .bind(run_status)
        .bind(t.run.rewrite_count.map(i64::from))
        .bind(t.run.started_at.as_ref().map(format_datetime))
        .bind(t.run.finished_at.as_ref().map(format_datetime))
        .bind(&now)
        .bind(t.run_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        let clear_for = t.lead.clear_pointer_for.map(|id| id.to_string());
        sqlx::query(
            r#"UPDATE leads
               SET stage = COALESCE(?, stage),
                   quality = COALESCE(?, quality),
                   current_run_id = CASE WHEN ? IS NOT NULL AND current_run_id = ? THEN NULL ELSE current_run_id END,
                   updated_at = ?
               WHERE id = ?"#,
        )
        .bind(t.lead.stage.map(|s| s.to_string()))
        .bind(t.lead.quality.map(|q| q.to_string()))
        .bind(&clear_for)
        .bind(&clear_for)
        .bind(&now)
        .bind(t.lead_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(true)
    }

    async fn get_output(&self, id: &OutputId) -> Result<Option<AgentOutput>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM agent_outputs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.as_ref().map(output_from_row).transpose()
    }

    async fn get_output_for_step(&self, step_id: &StepId) -> Result<Option<AgentOutput>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM agent_outputs WHERE step_id = ?")
            .bind(step_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.as_ref().map(output_from_row).transpose()
    }

    async fn insert_output(&self, output: &AgentOutput) -> Result<AgentOutput, RepositoryError> {
        sqlx::query(
            r#"INSERT INTO agent_outputs
               (id, step_id, run_id, lead_id, agent, status, payload, error_message, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(step_id) DO NOTHING"#,
        )
        .bind(output.id.to_string())
        .bind(output.step_id.to_string())
        .bind(output.run_id.to_string())
        .bind(output.lead_id.to_string())
        .bind(output.agent.as_str())
        .bind(enum_str(&output.status)?)
        .bind(to_json(&output.payload)?)
        .bind(&output.error_message)
        .bind(format_datetime(&output.created_at))
        .bind(format_datetime(&output.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        // Read back through the writer: the row may belong to a racing insert.
        let row = sqlx::query("SELECT * FROM agent_outputs WHERE step_id = ?")
            .bind(output.step_id.to_string())
            .fetch_one(&self.pool.writer)
            .await
            .map_err(query_err)?;
        output_from_row(&row)
    }

    async fn update_output(&self, output: &AgentOutput) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE agent_outputs SET status = ?, payload = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(enum_str(&output.status)?)
        .bind(to_json(&output.payload)?)
        .bind(&output.error_message)
        .bind(format_datetime(&Utc::now()))
        .bind(output.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn outputs_for_lead(
        &self,
        lead_id: &LeadId,
        agent: AgentName,
    ) -> Result<Vec<AgentOutput>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM agent_outputs WHERE lead_id = ? AND agent = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(lead_id.to_string())
        .bind(agent.as_str())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter().map(output_from_row).collect()
    }

    async fn try_acquire_lease(
        &self,
        scope: &str,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, RepositoryError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| RepositoryError::Query(format!("invalid lease ttl: {e}")))?;
        let result = sqlx::query(
            r#"INSERT INTO leases (scope, key, holder, expires_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(scope, key) DO UPDATE SET
                 holder = excluded.holder,
                 expires_at = excluded.expires_at
               WHERE leases.expires_at <= ?"#,
        )
        .bind(scope)
        .bind(key)
        .bind(holder)
        .bind(format_datetime(&(now + ttl)))
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, scope: &str, key: &str, holder: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM leases WHERE scope = ? AND key = ? AND holder = ?")
            .bind(scope)
            .bind(key)
            .bind(holder)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(())
    }
}
