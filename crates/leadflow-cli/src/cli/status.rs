//! Engine status command.

use anyhow::Result;
use console::style;

use crate::state::AppState;

/// Display the data directory, database and effective engine configuration.
pub async fn status(state: &AppState, json: bool) -> Result<()> {
    let config = &state.config;

    if json {
        let status = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "data_dir": state.data_dir.display().to_string(),
            "config": config,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Leadflow v{}",
        style("⚡").bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!();

    println!("  {}", style("── Engine ──").dim());
    if config.paused {
        println!("  State:            {}", style("paused").yellow().bold());
    } else {
        println!("  State:            {}", style("running").green());
    }
    println!("  Stale step after: {}s", config.stale_step_timeout_secs);
    println!("  Stale SENDER:     {}s", config.sender_stale_timeout_secs);
    println!(
        "  Leases:           ttl {}s, wait {}ms",
        config.lease_ttl_secs, config.lease_wait_ms
    );
    println!();

    println!("  {}", style("── System ──").dim());
    println!(
        "  Data dir: {}",
        style(state.data_dir.display()).dim()
    );
    println!(
        "  Database: {}",
        style("SQLite (WAL mode)").dim()
    );
    println!();

    Ok(())
}
