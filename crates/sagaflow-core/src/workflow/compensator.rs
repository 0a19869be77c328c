//! Saga compensator: best-effort reverse unwind of completed steps.
//!
//! Completed records are walked in reverse sequence order. Each outcome is
//! checkpointed before the next step is touched, so an unwind interrupted by
//! a crash or shutdown resumes without compensating any step twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sagaflow_types::error::{ErrorClass, StepError};
use sagaflow_types::event::OrchestratorEvent;
use sagaflow_types::workflow::{
    CompensationOutcome, CompensationRecord, StepRecord, WorkflowDefinition,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::checkpoint::{CheckpointError, CheckpointManager, compensation_idempotency_key};
use crate::capability::box_executor::BoxStepExecutor;
use crate::capability::collaborator::SharedContextProvider;
use crate::capability::executor::StepRequest;
use crate::event::EventBus;
use crate::isolation::FaultIsolator;
use crate::storage::PersistentStore;

/// What an unwind pass did, including outcomes recorded by earlier passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationReport {
    pub compensated: Vec<String>,
    pub irreversible: Vec<String>,
    /// Steps whose compensating action failed; surfaced for manual remediation.
    pub failed: Vec<String>,
    /// The pass stopped early because the engine is shutting down.
    pub suspended: bool,
}

pub struct Compensator<S: PersistentStore> {
    checkpoints: Arc<CheckpointManager<S>>,
    isolator: Arc<FaultIsolator>,
    executor: BoxStepExecutor,
    context: SharedContextProvider,
    events: EventBus,
    default_timeout: Duration,
}

impl<S: PersistentStore> Compensator<S> {
    pub fn new(
        checkpoints: Arc<CheckpointManager<S>>,
        isolator: Arc<FaultIsolator>,
        executor: BoxStepExecutor,
        context: SharedContextProvider,
        events: EventBus,
        default_timeout: Duration,
    ) -> Self {
        Self {
            checkpoints,
            isolator,
            executor,
            context,
            events,
            default_timeout,
        }
    }

    /// Unwind every completed step of the run, newest first.
    ///
    /// Compensation calls are not tied to the run's cancellation token:
    /// cancelling a run is what starts the unwind. `suspend` is checked
    /// between steps only.
    pub async fn compensate(
        &self,
        def: &WorkflowDefinition,
        run_id: Uuid,
        reason: &str,
        suspend: &CancellationToken,
    ) -> Result<CompensationReport, CheckpointError> {
        let run = self.checkpoints.load_run(run_id).await?;
        let completed = run.completed_steps();
        let prior: HashMap<&str, &CompensationOutcome> = run
            .compensations
            .iter()
            .map(|c| (c.step_id.as_str(), &c.outcome))
            .collect();

        tracing::info!(
            run_id = %run_id,
            reason,
            steps = completed.len(),
            already_unwound = prior.len(),
            "starting compensation"
        );
        self.events.publish(OrchestratorEvent::CompensationStarted {
            run_id,
            reason: reason.to_string(),
            steps: completed.len(),
        });

        let mut report = CompensationReport::default();
        let never = CancellationToken::new();

        for record in completed.into_iter().rev() {
            let step_id = record.step_id.clone();
            if let Some(outcome) = prior.get(step_id.as_str()) {
                tally(&mut report, step_id, outcome);
                continue;
            }
            if suspend.is_cancelled() {
                tracing::info!(run_id = %run_id, "compensation suspended for shutdown");
                report.suspended = true;
                return Ok(report);
            }

            let compensation = self.unwind_step(def, run_id, record, &never).await;
            self.checkpoints.record_compensation(run_id, &compensation).await?;
            tally(&mut report, step_id, &compensation.outcome);
        }

        if report.failed.is_empty() {
            tracing::info!(
                run_id = %run_id,
                compensated = report.compensated.len(),
                irreversible = report.irreversible.len(),
                "compensation finished"
            );
        } else {
            tracing::warn!(
                run_id = %run_id,
                failed = ?report.failed,
                "compensation finished with failures"
            );
        }
        self.events.publish(OrchestratorEvent::CompensationFinished {
            run_id,
            compensated: report.compensated.clone(),
            failed: report.failed.clone(),
        });
        Ok(report)
    }

    async fn unwind_step(
        &self,
        def: &WorkflowDefinition,
        run_id: Uuid,
        record: &StepRecord,
        never: &CancellationToken,
    ) -> CompensationRecord {
        let step_id = record.step_id.as_str();
        let Some(spec) = def.step(step_id) else {
            tracing::warn!(run_id = %run_id, step_id, "completed step missing from definition");
            return compensation_record(
                step_id,
                None,
                CompensationOutcome::Failed {
                    error: StepError::new(
                        ErrorClass::CompensationFailure,
                        format!("step '{step_id}' not found in {}", def.reference()),
                    ),
                },
            );
        };

        let Some(capability) = spec.compensating_capability() else {
            tracing::debug!(run_id = %run_id, step_id, "step declared irreversible");
            return compensation_record(step_id, None, CompensationOutcome::Irreversible);
        };

        let timeout = spec
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let request = StepRequest {
            run_id,
            step_id: step_id.to_string(),
            capability: capability.to_string(),
            payload: self.context.context_for(capability, run_id).await,
            input: record.result.clone().unwrap_or(Value::Null),
            upstream: HashMap::new(),
            idempotency_key: compensation_idempotency_key(run_id, step_id),
            timeout,
        };
        let policy = self.isolator.policy(spec.retry_policy.as_deref());

        let result = self
            .isolator
            .call(capability, &policy, timeout, never, |_| {
                let executor = self.executor.clone();
                let request = request.clone();
                async move { executor.invoke(&request).await }
            })
            .await;

        let outcome = match result {
            Ok(_) => {
                tracing::debug!(run_id = %run_id, step_id, capability, "step compensated");
                CompensationOutcome::Compensated
            }
            Err(failure) => {
                tracing::warn!(
                    run_id = %run_id,
                    step_id,
                    capability,
                    error = %failure,
                    "compensation failed"
                );
                CompensationOutcome::Failed {
                    error: StepError::new(
                        ErrorClass::CompensationFailure,
                        format!("{capability}: {failure}"),
                    ),
                }
            }
        };
        compensation_record(step_id, Some(capability), outcome)
    }
}

fn compensation_record(
    step_id: &str,
    capability: Option<&str>,
    outcome: CompensationOutcome,
) -> CompensationRecord {
    CompensationRecord {
        step_id: step_id.to_string(),
        capability: capability.map(str::to_string),
        outcome,
        recorded_at: Utc::now(),
    }
}

fn tally(report: &mut CompensationReport, step_id: String, outcome: &CompensationOutcome) {
    match outcome {
        CompensationOutcome::Compensated => report.compensated.push(step_id),
        CompensationOutcome::Irreversible => report.irreversible.push(step_id),
        CompensationOutcome::Failed { .. } => report.failed.push(step_id),
    }
}
