//! Lead history command.

use anyhow::{Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use leadflow_core::repository::run::RunRepository;
use leadflow_types::id::LeadId;

use super::run::run_status_cell;
use crate::state::AppState;

/// Show a lead's derived labels and every run it has had, newest first.
pub async fn show_lead(state: &AppState, lead_id: &str, json: bool) -> Result<()> {
    let lead_id = lead_id
        .parse::<LeadId>()
        .with_context(|| format!("invalid lead id '{lead_id}'"))?;
    let lead = state
        .runs
        .get_lead(&lead_id)
        .await?
        .with_context(|| format!("lead {lead_id} not found"))?;
    let runs = state.runs.list_runs_for_lead(&lead_id).await?;

    if json {
        let value = serde_json::json!({
            "lead": lead,
            "runs": runs,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!();
    println!("  Lead {}", style(lead.id).cyan().bold());
    println!();
    let stage = lead.stage.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
    let quality = lead.quality.map(|q| q.to_string()).unwrap_or_else(|| "-".into());
    println!("  Stage:   {stage}");
    println!("  Quality: {quality}");
    match lead.current_run_id {
        Some(run_id) => println!("  Active:  {}", style(run_id).yellow()),
        None => println!("  Active:  {}", style("none").dim()),
    }
    println!();

    if runs.is_empty() {
        println!("  {}", style("No runs yet.").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Run").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Plan").fg(Color::White),
        Cell::new("Rewrites").fg(Color::White),
        Cell::new("Created").fg(Color::White),
    ]);

    for run in &runs {
        let plan = run
            .plan
            .iter()
            .map(|a| a.as_str())
            .collect::<Vec<_>>()
            .join(",");
        table.add_row(vec![
            Cell::new(run.id).fg(Color::Cyan),
            run_status_cell(run.status),
            Cell::new(plan),
            Cell::new(format!("{}/{}", run.rewrite_count, run.max_rewrites)),
            Cell::new(run.created_at.format("%Y-%m-%d %H:%M").to_string()).fg(Color::DarkGrey),
        ]);
    }

    println!("{table}");
    println!();
    Ok(())
}
