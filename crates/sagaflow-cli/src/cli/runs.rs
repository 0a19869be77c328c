//! `sagaflow runs`: inspect runs recorded in the run store.

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use sagaflow_core::workflow::CheckpointManager;
use sagaflow_types::workflow::{CompensationOutcome, RunInstance, RunStatus, StepStatus};

use crate::state::AppState;

#[derive(Subcommand)]
pub enum RunsCommand {
    /// List runs, newest first.
    #[command(alias = "ls")]
    List {
        /// Only runs in this status (queued, running, compensating, completed, failed, expired).
        #[arg(long)]
        status: Option<RunStatus>,

        /// Only runs of this tenant.
        #[arg(long)]
        tenant: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show one run with its steps and compensations.
    Show {
        /// Run UUID.
        run_id: String,
    },
}

pub async fn handle_runs_command(cmd: RunsCommand, state: &AppState, json: bool) -> Result<()> {
    let checkpoints = CheckpointManager::new(state.open_store().await?);

    match cmd {
        RunsCommand::List {
            status,
            tenant,
            limit,
        } => {
            let mut runs = checkpoints
                .list_runs()
                .await
                .context("failed to list runs")?;
            runs.retain(|run| {
                status.is_none_or(|s| run.status == s)
                    && tenant.as_deref().is_none_or(|t| run.tenant == t)
            });
            runs.reverse();
            runs.truncate(limit);
            list_runs(&runs, json)
        }
        RunsCommand::Show { run_id } => {
            let run_id: Uuid = run_id
                .parse()
                .with_context(|| format!("'{run_id}' is not a run ID"))?;
            let run = checkpoints
                .load_run(run_id)
                .await
                .with_context(|| format!("failed to load run {run_id}"))?;
            show_run(&run, json)
        }
    }
}

fn status_color(status: RunStatus) -> Color {
    match status {
        RunStatus::Completed => Color::Green,
        RunStatus::Failed | RunStatus::Expired => Color::Red,
        RunStatus::Compensating => Color::Yellow,
        RunStatus::Queued | RunStatus::Running => Color::Cyan,
    }
}

fn list_runs(runs: &[RunInstance], json: bool) -> Result<()> {
    if json {
        let out: Vec<_> = runs.iter().map(RunInstance::summary).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs recorded.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Tenant"),
            Cell::new("Priority"),
            Cell::new("Status"),
            Cell::new("Steps"),
            Cell::new("Updated"),
        ]);

    for run in runs {
        table.add_row(vec![
            Cell::new(run.id),
            Cell::new(&run.workflow),
            Cell::new(&run.tenant),
            Cell::new(run.priority),
            Cell::new(run.status).fg(status_color(run.status)),
            Cell::new(run.steps.len()),
            Cell::new(run.updated_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn show_run(run: &RunInstance, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} ({})",
        style("Run").bold(),
        style(run.id).cyan(),
        run.workflow
    );
    println!("  Status:   {}", run.status);
    if let Some(reason) = &run.reason {
        println!("  Reason:   {reason}");
    }
    println!("  Tenant:   {}", run.tenant);
    println!("  Priority: {}", run.priority);
    if let Some(deadline) = run.deadline {
        println!("  Deadline: {}", deadline.to_rfc3339());
    }
    println!("  Created:  {}", run.created_at.to_rfc3339());

    if !run.steps.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("#"),
                Cell::new("Step").fg(Color::Cyan),
                Cell::new("Status"),
                Cell::new("Retries"),
                Cell::new("Error"),
            ]);
        for record in &run.steps {
            let color = match record.status {
                StepStatus::Completed => Color::Green,
                StepStatus::Failed => Color::Red,
                StepStatus::Skipped => Color::DarkGrey,
                StepStatus::Running => Color::Cyan,
            };
            table.add_row(vec![
                Cell::new(record.seq),
                Cell::new(&record.step_id),
                Cell::new(record.status.as_str()).fg(color),
                Cell::new(record.retry_count),
                Cell::new(record.error.as_ref().map(ToString::to_string).unwrap_or_default()),
            ]);
        }
        println!();
        println!("{table}");
    }

    if !run.compensations.is_empty() {
        println!();
        println!("  {}", style("Compensations").bold());
        for record in &run.compensations {
            let outcome = match &record.outcome {
                CompensationOutcome::Compensated => style("compensated".to_string()).green(),
                CompensationOutcome::Irreversible => style("irreversible".to_string()).dim(),
                CompensationOutcome::Failed { error } => style(format!("failed: {error}")).red(),
            };
            println!("    {} {outcome}", record.step_id);
        }
    }

    if !run.compensation_failures.is_empty() {
        println!();
        println!(
            "  {} manual remediation needed for: {}",
            style("!").red().bold(),
            run.compensation_failures.join(", ")
        );
    }
    println!();
    Ok(())
}
