//! sagaflow CLI entry point.
//!
//! Binary name: `sagaflow`
//!
//! Parses CLI arguments, sets up tracing, loads the engine config, then
//! dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use sagaflow_observe::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions need neither logging nor state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "sagaflow", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing(&TracingOptions {
        verbosity: cli.verbose,
        format: if cli.json { LogFormat::Json } else { LogFormat::Pretty },
        otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let state = AppState::init(cli.config, cli.database).await?;

    let result = match cli.command {
        Commands::Workflow { action } => cli::workflow::handle_workflow_command(action, &state, cli.json).await,
        Commands::Runs { action } => cli::runs::handle_runs_command(action, &state, cli.json).await,
        Commands::Config => cli::config::show_config(&state, cli.json),
        Commands::Completions { .. } => Ok(()),
    };

    shutdown_tracing();
    result
}
