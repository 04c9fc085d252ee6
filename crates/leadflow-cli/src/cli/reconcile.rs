//! Run repair commands backed by the reconciler.

use anyhow::{anyhow, Result};
use console::style;

use leadflow_core::pipeline::reconciler::Insertion;
use leadflow_types::agent::AgentName;

use super::run::parse_run_id;
use crate::state::AppState;

fn parse_agent(raw: &str) -> Result<AgentName> {
    raw.parse::<AgentName>().map_err(|e| anyhow!(e))
}

/// Skip steps of disabled agents and requeue steps of re-enabled ones.
pub async fn reconcile(state: &AppState, run_id: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let summary = state.reconciler.reconcile_enablement(run_id).await?;

    if json {
        let value = serde_json::json!({
            "run_id": run_id,
            "skipped": summary.skipped,
            "requeued": summary.requeued,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Reconciled run {}: {} skipped, {} requeued",
        style("✓").green().bold(),
        style(run_id).cyan(),
        summary.skipped,
        summary.requeued
    );
    println!();
    Ok(())
}

/// Toggle one agent's queued steps within a run.
pub async fn set_agent(state: &AppState, run_id: &str, agent: &str, enable: bool, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let agent = parse_agent(agent)?;
    let changed = if enable {
        state.reconciler.enable_agent(run_id, agent).await?
    } else {
        state.reconciler.disable_agent(run_id, agent).await?
    };

    if json {
        let value = serde_json::json!({
            "run_id": run_id,
            "agent": agent,
            "action": if enable { "enable" } else { "disable" },
            "changed": changed,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let verb = if enable { "Requeued" } else { "Skipped" };
    println!();
    if changed == 0 {
        println!("  {}", style(format!("No {agent} steps to change.")).dim());
    } else {
        println!(
            "  {} {verb} {changed} {agent} step(s) in run {}",
            style("✓").green().bold(),
            style(run_id).cyan()
        );
    }
    println!();
    Ok(())
}

/// Insert a DESIGN step before SENDER when one is missing.
pub async fn ensure_design(state: &AppState, run_id: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let insertion = state.reconciler.ensure_design_step(run_id).await?;

    let (label, step_id) = match insertion {
        Insertion::AlreadyPresent(id) => ("already_present", Some(id)),
        Insertion::InsertedBefore { step_id, .. } => ("inserted", Some(step_id)),
        Insertion::Appended(id) => ("appended", Some(id)),
        Insertion::RunTerminal => ("run_terminal", None),
    };

    if json {
        let value = serde_json::json!({
            "run_id": run_id,
            "result": label,
            "step_id": step_id,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!();
    match insertion {
        Insertion::AlreadyPresent(id) => {
            println!("  DESIGN step {} already present", style(id).cyan());
        }
        Insertion::InsertedBefore { step_id, anchor } => {
            println!(
                "  {} Inserted DESIGN step {} before SENDER step {}",
                style("✓").green().bold(),
                style(step_id).cyan(),
                anchor
            );
        }
        Insertion::Appended(id) => {
            println!(
                "  {} Appended DESIGN step {} (no SENDER step)",
                style("✓").green().bold(),
                style(id).cyan()
            );
        }
        Insertion::RunTerminal => {
            println!("  {}", style("Run is finished; nothing to do.").dim());
        }
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agent_is_case_insensitive() {
        assert_eq!(parse_agent("design").unwrap(), AgentName::Design);
        assert_eq!(parse_agent("SENDER").unwrap(), AgentName::Sender);
        assert!(parse_agent("mailer").is_err());
    }
}
