//! Run inspection commands (inspect, resume-check).

use anyhow::{Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use leadflow_core::pipeline::resume::check_resume;
use leadflow_core::repository::run::RunRepository;
use leadflow_types::id::RunId;
use leadflow_types::run::{OutputStatus, RunStatus, RunStep, StepStatus};

use crate::state::AppState;

pub(crate) fn parse_run_id(raw: &str) -> Result<RunId> {
    raw.parse::<RunId>()
        .with_context(|| format!("invalid run id '{raw}'"))
}

pub(crate) fn run_status_cell(status: RunStatus) -> Cell {
    let cell = Cell::new(status);
    match status {
        RunStatus::Queued => cell.fg(Color::DarkGrey),
        RunStatus::Running => cell.fg(Color::Yellow),
        RunStatus::Completed => cell.fg(Color::Green),
        RunStatus::Failed => cell.fg(Color::Red),
    }
}

fn step_status_cell(status: StepStatus) -> Cell {
    let cell = Cell::new(status);
    match status {
        StepStatus::Queued => cell.fg(Color::DarkGrey),
        StepStatus::Running => cell.fg(Color::Yellow),
        StepStatus::Completed => cell.fg(Color::Green),
        StepStatus::Failed => cell.fg(Color::Red),
        StepStatus::Skipped => cell.fg(Color::DarkGrey),
    }
}

fn step_note(step: &RunStep) -> String {
    let meta = &step.meta;
    let mut parts = Vec::new();
    if let Some(reason) = meta.skip_reason {
        parts.push(format!("skipped: {}", reason.as_str()));
    }
    if let Some(revision) = meta.revision {
        parts.push(format!("revision {revision}"));
    }
    if let Some(index) = meta.selected_variant_index {
        parts.push(format!("variant {index}"));
    }
    if let Some(job) = &meta.handoff_job_id {
        parts.push(format!("job {job}"));
    }
    parts.join(", ")
}

/// Show a run header and a table of its steps.
pub async fn inspect(state: &AppState, run_id: &str, with_outputs: bool, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let run = state
        .runs
        .get_run(&run_id)
        .await?
        .with_context(|| format!("run {run_id} not found"))?;
    let steps = state.runs.list_steps(&run_id).await?;

    let mut outputs = Vec::new();
    if with_outputs {
        for step in &steps {
            outputs.push(state.runs.get_output_for_step(&step.id).await?);
        }
    }

    if json {
        let mut value = serde_json::json!({
            "run": run,
            "steps": steps,
        });
        if with_outputs {
            value["outputs"] = serde_json::to_value(outputs.iter().flatten().collect::<Vec<_>>())?;
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!();
    println!(
        "  Run {} for lead {}",
        style(run.id).cyan().bold(),
        style(run.lead_id).cyan()
    );
    println!();
    println!("  Status:    {}", run.status);
    println!("  Plan:      {}", run.plan.iter().map(|a| a.as_str()).collect::<Vec<_>>().join(" -> "));
    println!("  Rewrites:  {}/{}", run.rewrite_count, run.max_rewrites);
    if let Some(min) = run.min_score {
        println!("  Min score: {min}");
    }
    if run.config_snapshot.get("send_only").and_then(|v| v.as_bool()) == Some(true) {
        println!("  {}", style("send-only run").yellow());
    }
    println!();

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);

    let mut header = vec![
        Cell::new("Pos").fg(Color::White),
        Cell::new("Agent").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Started").fg(Color::White),
        Cell::new("Notes").fg(Color::White),
    ];
    if with_outputs {
        header.push(Cell::new("Output").fg(Color::White));
    }
    table.set_header(header);

    for (i, step) in steps.iter().enumerate() {
        let started = step
            .started_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut row = vec![
            Cell::new(step.position),
            Cell::new(step.agent).fg(Color::Cyan),
            step_status_cell(step.status),
            Cell::new(started).fg(Color::DarkGrey),
            Cell::new(step_note(step)),
        ];
        if with_outputs {
            let summary = match outputs.get(i).and_then(|o| o.as_ref()) {
                Some(output) => match output.status {
                    OutputStatus::Failed => output
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "failed".to_string()),
                    OutputStatus::Pending => "pending".to_string(),
                    OutputStatus::Completed => preview(&output.payload.to_string()),
                },
                None => "-".to_string(),
            };
            row.push(Cell::new(summary).fg(Color::DarkGrey));
        }
        table.add_row(row);
    }

    println!("{table}");
    println!();
    Ok(())
}

fn preview(s: &str) -> String {
    if s.chars().count() > 60 {
        format!("{}...", s.chars().take(57).collect::<String>())
    } else {
        s.to_string()
    }
}

/// Print the resume decision for a run.
pub async fn resume_check(state: &AppState, run_id: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let decision = check_resume(state.runs.as_ref(), &state.config, &run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&decision)?);
        return Ok(());
    }

    let verdict = if decision.resume {
        style("resume").green().bold()
    } else {
        style("leave").dim()
    };
    println!();
    println!("  {verdict} run {} ({})", style(run_id).cyan(), decision.reason);
    println!();
    Ok(())
}
