//! CLI command definitions for the `lflow` binary.
//!
//! Operator commands for inspecting and repairing lead pipeline runs. Agent
//! execution itself is driven by the dispatcher, not from here.

pub mod lead;
pub mod reconcile;
pub mod run;
pub mod status;

use clap::{Parser, Subcommand};

/// Inspect and repair lead pipeline runs.
#[derive(Parser)]
#[command(name = "lflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Also print OpenTelemetry spans to stdout (cannot be combined with --json).
    #[arg(long, global = true, env = "LEADFLOW_OTEL", conflicts_with = "json")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply pending database migrations and exit.
    Migrate,

    /// Engine configuration and database location.
    Status,

    /// Show a run and its steps.
    #[command(alias = "show")]
    Inspect {
        /// Run id.
        run_id: String,

        /// Include each step's output payload.
        #[arg(long)]
        outputs: bool,
    },

    /// Show a lead and its run history.
    Lead {
        /// Lead id.
        lead_id: String,
    },

    /// Decide whether a run needs another dispatcher turn.
    #[command(name = "resume-check")]
    ResumeCheck {
        /// Run id.
        run_id: String,
    },

    /// Align a run's steps with the live agent enablement.
    Reconcile {
        /// Run id.
        run_id: String,
    },

    /// Skip the queued steps of an agent in a run.
    Disable {
        /// Run id.
        run_id: String,
        /// Agent name (e.g. `design`).
        agent: String,
    },

    /// Requeue an agent's steps previously skipped as disabled.
    Enable {
        /// Run id.
        run_id: String,
        /// Agent name (e.g. `design`).
        agent: String,
    },

    /// Make sure a run has a DESIGN step ahead of its SENDER step.
    #[command(name = "ensure-design")]
    EnsureDesign {
        /// Run id.
        run_id: String,
    },
}
