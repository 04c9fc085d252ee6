//! Leadflow operator CLI entry point.
//!
//! Binary name: `lflow`
//!
//! Parses CLI arguments, initializes tracing, the database and the pipeline
//! services, then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use console::style;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    leadflow_observe::tracing_setup::init_tracing(cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    // Opening the pool applies migrations.
    let state = AppState::init().await?;

    let result = match cli.command {
        Commands::Migrate => {
            if cli.json {
                println!("{}", serde_json::json!({ "migrated": true }));
            } else {
                println!(
                    "  {} Database at {} is up to date",
                    style("✓").green().bold(),
                    style(state.data_dir.display()).dim()
                );
            }
            Ok(())
        }
        Commands::Status => cli::status::status(&state, cli.json).await,
        Commands::Inspect { run_id, outputs } => {
            cli::run::inspect(&state, &run_id, outputs, cli.json).await
        }
        Commands::Lead { lead_id } => cli::lead::show_lead(&state, &lead_id, cli.json).await,
        Commands::ResumeCheck { run_id } => {
            cli::run::resume_check(&state, &run_id, cli.json).await
        }
        Commands::Reconcile { run_id } => {
            cli::reconcile::reconcile(&state, &run_id, cli.json).await
        }
        Commands::Disable { run_id, agent } => {
            cli::reconcile::set_agent(&state, &run_id, &agent, false, cli.json).await
        }
        Commands::Enable { run_id, agent } => {
            cli::reconcile::set_agent(&state, &run_id, &agent, true, cli.json).await
        }
        Commands::EnsureDesign { run_id } => {
            cli::reconcile::ensure_design(&state, &run_id, cli.json).await
        }
    };

    state.db_pool.writer.close().await;
    state.db_pool.reader.close().await;
    leadflow_observe::tracing_setup::shutdown_tracing();

    result
}
