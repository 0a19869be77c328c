//! CLI command definitions for the `sagaflow` binary.
//!
//! Uses clap derive macros for argument parsing. Commands follow a
//! noun-verb pattern (e.g., `sagaflow workflow plan`, `sagaflow runs list`).

pub mod config;
pub mod runs;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Operate the sagaflow orchestration engine.
#[derive(Parser)]
#[command(name = "sagaflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed logs (-v info, -vv debug, -vvv trace). `RUST_LOG` overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Engine config file (defaults to `<data dir>/sagaflow.toml`).
    #[arg(long, global = true, env = "SAGAFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Run store database URL (defaults to `<data dir>/sagaflow.db`).
    #[arg(long, global = true, env = "SAGAFLOW_DATABASE_URL")]
    pub database: Option<String>,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate, plan and run workflow definitions.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Inspect runs recorded in the run store.
    Runs {
        #[command(subcommand)]
        action: runs::RunsCommand,
    },

    /// Show the effective engine configuration.
    Config,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
