//! `sagaflow workflow`: validate, plan and run workflow definitions.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;

use sagaflow_core::capability::box_executor::BoxStepExecutor;
use sagaflow_core::capability::executor::{StepExecutor, StepRequest};
use sagaflow_core::workflow::catalog::plan;
use sagaflow_core::workflow::dag::PlanUnit;
use sagaflow_core::workflow::definition::{
    KnownReferences, discover_workflows, load_workflow_file,
};
use sagaflow_core::workflow::WorkflowCatalog;
use sagaflow_core::{Orchestrator, RunRequest};
use sagaflow_types::error::StepFailure;
use sagaflow_types::event::OrchestratorEvent;
use sagaflow_types::workflow::{Criticality, ExecutionMode, RunStatus, WorkflowDefinition};

use crate::state::AppState;

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Validate a workflow file, or every workflow file under a directory.
    Validate {
        /// YAML file or directory.
        path: PathBuf,
    },

    /// Show the execution levels of a workflow.
    Plan {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Run a workflow against simulated capabilities that echo their input.
    ///
    /// The run is recorded in the run store like any other.
    Run {
        /// YAML file or directory to load workflows from.
        path: PathBuf,

        /// Intent to run (defaults to the single workflow in `path`).
        #[arg(long)]
        intent: Option<String>,

        /// Pin a workflow version.
        #[arg(long)]
        version: Option<u32>,

        /// JSON payload handed to every step.
        #[arg(long)]
        payload: Option<String>,

        #[arg(long, default_value = "default")]
        tenant: String,

        /// Lower is more urgent.
        #[arg(long)]
        priority: Option<u8>,

        /// Capabilities that fail permanently (repeatable).
        #[arg(long = "fail", value_name = "CAPABILITY")]
        fail: Vec<String>,
    },
}

pub async fn handle_workflow_command(cmd: WorkflowCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        WorkflowCommand::Validate { path } => handle_validate(&path, state, json),
        WorkflowCommand::Plan { file } => handle_plan(&file, state, json),
        WorkflowCommand::Run {
            path,
            intent,
            version,
            payload,
            tenant,
            priority,
            fail,
        } => {
            let mut request = RunRequest::new(String::new(), tenant);
            request.version = version;
            request.priority = priority;
            if let Some(raw) = payload {
                request.payload = serde_json::from_str::<Value>(&raw).context("invalid JSON payload")?;
            }
            handle_run(&path, intent, request, fail, state, json).await
        }
    }
}

fn catalog_for(state: &AppState) -> WorkflowCatalog {
    WorkflowCatalog::new(KnownReferences::from_config(&state.config))
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

fn handle_validate(path: &Path, state: &AppState, json: bool) -> Result<()> {
    let catalog = catalog_for(state);
    let files = if path.is_file() {
        vec![(path.to_path_buf(), load_workflow_file(path).map_err(|e| anyhow::anyhow!("{e}")))]
    } else {
        discover_workflows(path)
            .with_context(|| format!("failed to read {}", path.display()))?
            .into_iter()
            .map(|(file, def)| (file, Ok(def)))
            .collect()
    };

    let mut results = Vec::with_capacity(files.len());
    for (file, parsed) in files {
        let outcome = parsed.and_then(|def| catalog.register(def).map_err(|e| anyhow::anyhow!("{e}")));
        results.push((file, outcome));
    }
    let invalid = results.iter().filter(|(_, r)| r.is_err()).count();

    if json {
        let out: Vec<_> = results
            .iter()
            .map(|(file, outcome)| match outcome {
                Ok(def) => json!({
                    "file": file.display().to_string(),
                    "intent": def.intent,
                    "version": def.version,
                    "steps": def.steps.len(),
                    "valid": true,
                }),
                Err(e) => json!({
                    "file": file.display().to_string(),
                    "valid": false,
                    "error": e.to_string(),
                }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if results.is_empty() {
        println!();
        println!("  No workflow files found under {}.", path.display());
        println!();
    } else {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("File").fg(Color::Cyan),
                Cell::new("Workflow"),
                Cell::new("Steps"),
                Cell::new("Result"),
            ]);
        for (file, outcome) in &results {
            let row = match outcome {
                Ok(def) => vec![
                    Cell::new(file.display()),
                    Cell::new(def.reference()),
                    Cell::new(def.steps.len()),
                    Cell::new("valid").fg(Color::Green),
                ],
                Err(e) => vec![
                    Cell::new(file.display()),
                    Cell::new("-"),
                    Cell::new("-"),
                    Cell::new(e).fg(Color::Red),
                ],
            };
            table.add_row(row);
        }
        println!();
        println!("{table}");
        println!();
    }

    if invalid > 0 {
        bail!("{invalid} invalid workflow file(s)");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

fn handle_plan(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let def = load_workflow_file(file).map_err(|e| anyhow::anyhow!("failed to load workflow: {e}"))?;
    let def = catalog_for(state)
        .register(def)
        .map_err(|e| anyhow::anyhow!("workflow validation failed: {e}"))?;
    let execution = plan(&def).map_err(|e| anyhow::anyhow!("{e}"))?;

    if json {
        let levels: Vec<Vec<Vec<&str>>> = execution
            .levels
            .iter()
            .map(|level| level.iter().map(PlanUnit::step_ids).collect())
            .collect();
        let out = json!({
            "workflow": def.reference().to_string(),
            "steps": execution.step_count(),
            "levels": levels,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Level").fg(Color::Cyan),
            Cell::new("Step"),
            Cell::new("Mode"),
            Cell::new("Capability"),
            Cell::new("Compensation"),
            Cell::new("Condition"),
        ]);

    for (idx, level) in execution.levels.iter().enumerate() {
        for unit in level {
            let steps = match unit {
                PlanUnit::Step(step) => vec![*step],
                PlanUnit::Group { members, .. } => members.clone(),
            };
            for step in steps {
                let mode = match &step.mode {
                    ExecutionMode::Sequential => "sequential".to_string(),
                    ExecutionMode::ParallelMember { group } => format!("member of {group}"),
                    ExecutionMode::ParallelBarrier { group } => format!("barrier of {group}"),
                };
                let mode = if step.criticality == Criticality::BestEffort {
                    format!("{mode}, best effort")
                } else {
                    mode
                };
                table.add_row(vec![
                    Cell::new(idx),
                    Cell::new(&step.id),
                    Cell::new(mode),
                    Cell::new(&step.capability),
                    Cell::new(step.compensating_capability().unwrap_or("irreversible")),
                    Cell::new(step.condition.as_deref().unwrap_or("")),
                ]);
            }
        }
    }

    println!();
    println!(
        "  {} {} ({} steps, {} levels)",
        style("Plan for").bold(),
        style(def.reference()).cyan(),
        execution.step_count(),
        execution.levels.len()
    );
    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Capability stand-in: echoes its request, or fails permanently when listed.
struct SimulatedExecutor {
    failing: HashSet<String>,
}

impl StepExecutor for SimulatedExecutor {
    async fn invoke(&self, request: &StepRequest) -> Result<Value, StepFailure> {
        if self.failing.contains(&request.capability) {
            return Err(StepFailure::permanent(format!(
                "simulated failure of '{}'",
                request.capability
            )));
        }
        Ok(json!({
            "capability": request.capability,
            "step": request.step_id,
            "input": request.input,
        }))
    }
}

fn pick_intent(defs: &[WorkflowDefinition], intent: Option<String>) -> Result<String> {
    if let Some(intent) = intent {
        return Ok(intent);
    }
    let intents: HashSet<&str> = defs.iter().map(|d| d.intent.as_str()).collect();
    match intents.len() {
        1 => Ok(defs[0].intent.clone()),
        0 => bail!("no workflows loaded"),
        _ => bail!("several workflows loaded; pick one with --intent"),
    }
}

async fn handle_run(
    path: &Path,
    intent: Option<String>,
    mut request: RunRequest,
    fail: Vec<String>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let catalog = Arc::new(catalog_for(state));
    let loaded = catalog
        .load_path(path)
        .map_err(|e| anyhow::anyhow!("failed to load workflows: {e}"))?;
    let defs: Vec<WorkflowDefinition> = loaded
        .iter()
        .filter_map(|r| catalog.get(r).ok())
        .map(|def| (*def).clone())
        .collect();
    request.intent = pick_intent(&defs, intent)?;

    let executor = SimulatedExecutor {
        failing: fail.into_iter().collect(),
    };
    let engine = Orchestrator::builder(
        state.config.clone(),
        catalog,
        state.open_store().await?,
        BoxStepExecutor::new(executor),
    )
    .build();
    engine.start();

    let mut events = engine.events();
    let recovered = engine.recover().await?;
    if recovered.resumed + recovered.requeued > 0 {
        tracing::info!(
            resumed = recovered.resumed,
            requeued = recovered.requeued,
            "picked up unfinished runs"
        );
    }

    let run_id = engine.submit_run(request).await?;
    if !json {
        println!();
        println!("  {} run {}", style("Started").green().bold(), style(run_id).cyan());
    }

    loop {
        match events.recv().await {
            Ok(event) if event.run_id() == Some(run_id) => {
                if !json {
                    print_event(&event);
                }
                if matches!(event, OrchestratorEvent::RunFinished { .. }) {
                    break;
                }
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
    engine.shutdown(Duration::from_secs(5)).await;

    let summary = engine.get_run_status(run_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        let status = match summary.status {
            RunStatus::Completed => style(summary.status.to_string()).green().bold(),
            _ => style(summary.status.to_string()).red().bold(),
        };
        println!();
        println!("  Status: {status}");
        if let Some(reason) = &summary.reason {
            println!("  Reason: {reason}");
        }
        println!();
    }
    Ok(())
}

fn print_event(event: &OrchestratorEvent) {
    match event {
        OrchestratorEvent::StepStarted { step_id, capability, .. } => {
            println!("  {} {step_id} ({capability})", style("->").dim());
        }
        OrchestratorEvent::StepCompleted { step_id, retries, .. } => {
            println!("  {} {step_id} (retries: {retries})", style("ok").green());
        }
        OrchestratorEvent::StepFailed { step_id, class, message, .. } => {
            println!("  {} {step_id} [{class}] {message}", style("!!").red());
        }
        OrchestratorEvent::StepSkipped { step_id, .. } => {
            println!("  {} {step_id}", style("skip").dim());
        }
        OrchestratorEvent::CompensationStarted { steps, .. } => {
            println!("  {} unwinding {steps} step(s)", style("<-").yellow());
        }
        OrchestratorEvent::CompensationFinished { compensated, failed, .. } => {
            println!(
                "  {} compensated [{}], failed [{}]",
                style("<-").yellow(),
                compensated.join(", "),
                failed.join(", ")
            );
        }
        _ => {}
    }
}
