//! Execution scheduler: walks a run's plan level by level.
//!
//! Sequential steps and barriers run one at a time; the members of a parallel
//! group run as sibling tasks in a `JoinSet` and are joined before the
//! barrier. Every step outcome is checkpointed before the scheduler moves on,
//! and a critical failure, missed deadline or cancellation hands the run to
//! the compensator before it is finalized `failed`.
//!
//! # Run state machine
//!
//! ```text
//! queued -> running -> completed
//!                   \-> compensating -> failed
//! ```
//!
//! Resuming a run replays its checkpointed records into a `RunContext` and
//! skips every step that already settled.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sagaflow_types::error::{ErrorClass, StepError};
use sagaflow_types::event::OrchestratorEvent;
use sagaflow_types::workflow::{
    Criticality, ExecutionMode, RunInstance, RunStatus, StepSpec, StepStatus, WorkflowDefinition,
};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::compensator::{CompensationReport, Compensator};
use super::context::RunContext;
use super::dag::{PlanUnit, build_execution_plan};
use super::expression::evaluate_condition;
use crate::capability::box_executor::BoxStepExecutor;
use crate::capability::collaborator::SharedContextProvider;
use crate::capability::executor::StepRequest;
use crate::event::EventBus;
use crate::isolation::FaultIsolator;
use crate::storage::PersistentStore;

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

/// Infrastructure failures that stop the scheduler itself.
///
/// Step failures are not errors here; they become `HaltReason`s.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("run {run_id} is pinned to a plan that no longer validates: {detail}")]
    InvalidPlan { run_id: Uuid, detail: String },

    #[error("task join error: {0}")]
    Join(String),
}

/// Why a running run stopped and must be unwound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    StepFailed { step_id: String, error: StepError },
    BarrierFailure { group: String, failed: Vec<String> },
    DeadlineExceeded,
    Cancelled,
}

impl HaltReason {
    pub fn class(&self) -> ErrorClass {
        match self {
            HaltReason::StepFailed { error, .. } => error.class,
            HaltReason::BarrierFailure { .. } => ErrorClass::BarrierFailure,
            HaltReason::DeadlineExceeded => ErrorClass::DeadlineExceeded,
            HaltReason::Cancelled => ErrorClass::Cancelled,
        }
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::StepFailed { step_id, error } => {
                write!(f, "{}: step '{step_id}' failed: {}", error.class, error.message)
            }
            HaltReason::BarrierFailure { group, failed } => write!(
                f,
                "{}: group '{group}' members [{}] failed",
                ErrorClass::BarrierFailure,
                failed.join(", ")
            ),
            HaltReason::DeadlineExceeded => {
                write!(f, "{}: deadline passed before the next step", ErrorClass::DeadlineExceeded)
            }
            HaltReason::Cancelled => write!(f, "{}: run cancelled", ErrorClass::Cancelled),
        }
    }
}

/// How a call to `Scheduler::run` ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed {
        reason: String,
        compensation_failures: Vec<String>,
    },
    /// Stopped between steps for shutdown; checkpoints let recovery resume it.
    Suspended,
}

/// Signals a run observes between steps.
#[derive(Debug, Clone, Default)]
pub struct RunSignals {
    /// Cancels in-flight calls and unwinds the run.
    pub cancel: CancellationToken,
    /// Stops the run between steps without unwinding.
    pub suspend: CancellationToken,
}

/// Result of executing a single step.
#[derive(Debug, Clone)]
enum StepResult {
    Completed(Value),
    Skipped,
    Failed(StepError),
}

enum Walk {
    Finished,
    Halted(HaltReason),
    Suspended,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler<S: PersistentStore> {
    checkpoints: Arc<CheckpointManager<S>>,
    isolator: Arc<FaultIsolator>,
    executor: BoxStepExecutor,
    context: SharedContextProvider,
    events: EventBus,
    compensator: Compensator<S>,
    default_timeout: Duration,
}

impl<S: PersistentStore + 'static> Scheduler<S> {
    pub fn new(
        checkpoints: Arc<CheckpointManager<S>>,
        isolator: Arc<FaultIsolator>,
        executor: BoxStepExecutor,
        context: SharedContextProvider,
        events: EventBus,
        default_timeout: Duration,
    ) -> Self {
        let compensator = Compensator::new(
            Arc::clone(&checkpoints),
            Arc::clone(&isolator),
            executor.clone(),
            Arc::clone(&context),
            events.clone(),
            default_timeout,
        );
        Self {
            checkpoints,
            isolator,
            executor,
            context,
            events,
            compensator,
            default_timeout,
        }
    }

    /// Drive a run from its checkpointed state to a terminal status (or suspension).
    ///
    /// `queued` and `running` runs are walked, `compensating` runs go straight
    /// to the compensator, terminal runs are reported as they are.
    pub async fn run(
        self: &Arc<Self>,
        def: &WorkflowDefinition,
        run_id: Uuid,
        signals: &RunSignals,
    ) -> Result<RunOutcome, SchedulerError> {
        let mut run = self.checkpoints.load_run(run_id).await?;

        if run.status == RunStatus::Queued
            && self
                .checkpoints
                .transition(run_id, RunStatus::Queued, RunStatus::Running, None)
                .await?
        {
            run.status = RunStatus::Running;
        }

        match run.status {
            RunStatus::Running => {}
            RunStatus::Compensating => {
                let reason = run
                    .reason
                    .clone()
                    .unwrap_or_else(|| "resumed compensation".to_string());
                return self.unwind(def, run_id, reason, signals).await;
            }
            RunStatus::Completed => return Ok(RunOutcome::Completed),
            RunStatus::Failed | RunStatus::Expired | RunStatus::Queued => {
                return Ok(RunOutcome::Failed {
                    reason: run.reason.unwrap_or_else(|| run.status.to_string()),
                    compensation_failures: run.compensation_failures,
                });
            }
        }

        tracing::info!(
            run_id = %run_id,
            workflow = %def.reference(),
            resumed_steps = run.steps.len(),
            "executing run"
        );
        let started = tokio::time::Instant::now();

        match self.walk(def, &run, signals).await? {
            Walk::Finished => {
                self.checkpoints
                    .finalize(run_id, RunStatus::Completed, None, Vec::new())
                    .await?;
                tracing::info!(
                    run_id = %run_id,
                    duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "run completed"
                );
                self.events.publish(OrchestratorEvent::RunFinished {
                    run_id,
                    status: RunStatus::Completed,
                    reason: None,
                });
                Ok(RunOutcome::Completed)
            }
            Walk::Halted(halt) => {
                let reason = halt.to_string();
                tracing::warn!(run_id = %run_id, class = %halt.class(), reason = %reason, "run halted");
                if !self
                    .checkpoints
                    .transition(run_id, RunStatus::Running, RunStatus::Compensating, Some(&reason))
                    .await?
                {
                    tracing::warn!(run_id = %run_id, "run left running state during halt");
                }
                self.unwind(def, run_id, reason, signals).await
            }
            Walk::Suspended => {
                tracing::info!(run_id = %run_id, "run suspended between steps");
                Ok(RunOutcome::Suspended)
            }
        }
    }

    async fn unwind(
        &self,
        def: &WorkflowDefinition,
        run_id: Uuid,
        reason: String,
        signals: &RunSignals,
    ) -> Result<RunOutcome, SchedulerError> {
        let CompensationReport {
            failed, suspended, ..
        } = self
            .compensator
            .compensate(def, run_id, &reason, &signals.suspend)
            .await?;
        if suspended {
            return Ok(RunOutcome::Suspended);
        }

        self.checkpoints
            .finalize(run_id, RunStatus::Failed, Some(&reason), failed.clone())
            .await?;
        self.events.publish(OrchestratorEvent::RunFinished {
            run_id,
            status: RunStatus::Failed,
            reason: Some(reason.clone()),
        });
        Ok(RunOutcome::Failed {
            reason,
            compensation_failures: failed,
        })
    }

    // -----------------------------------------------------------------------
    // Plan walk
    // -----------------------------------------------------------------------

    async fn walk(
        self: &Arc<Self>,
        def: &WorkflowDefinition,
        run: &RunInstance,
        signals: &RunSignals,
    ) -> Result<Walk, SchedulerError> {
        let plan = build_execution_plan(&def.steps).map_err(|v| SchedulerError::InvalidPlan {
            run_id: run.id,
            detail: v.to_string(),
        })?;
        let mut ctx = RunContext::from_run(run);

        for (level_idx, level) in plan.levels.iter().enumerate() {
            tracing::debug!(run_id = %run.id, level = level_idx, units = level.len(), "processing level");

            for unit in level {
                match unit {
                    PlanUnit::Step(spec) => {
                        if let Some(status) = ctx.status(&spec.id) {
                            if status == StepStatus::Failed && spec.criticality == Criticality::Critical {
                                return Ok(Walk::Halted(recorded_failure(run, &spec.id)));
                            }
                            tracing::debug!(run_id = %run.id, step_id = %spec.id, "skipping settled step");
                            continue;
                        }
                        if let Some(stop) = gate(run, signals) {
                            return Ok(stop);
                        }

                        let upstream_ids = upstream_ids(def, spec);
                        let result = self
                            .execute_step(run.id, spec, &ctx, &upstream_ids, &signals.cancel)
                            .await?;
                        if let Some(halt) = apply(&mut ctx, spec, result) {
                            return Ok(Walk::Halted(halt));
                        }
                    }
                    PlanUnit::Group { name, members } => {
                        if let Some(stop) = self.run_group(def, run, name, members, &mut ctx, signals).await? {
                            return Ok(stop);
                        }
                    }
                }
            }
        }

        Ok(Walk::Finished)
    }

    /// Run the unsettled members of a group concurrently and join them.
    ///
    /// Once a critical member fails, each remaining member is cancelled when
    /// its own timeout, counted from the group start, runs out.
    async fn run_group(
        self: &Arc<Self>,
        def: &WorkflowDefinition,
        run: &RunInstance,
        group: &str,
        members: &[&StepSpec],
        ctx: &mut RunContext,
        signals: &RunSignals,
    ) -> Result<Option<Walk>, SchedulerError> {
        let mut failed: Vec<String> = members
            .iter()
            .filter(|m| {
                m.criticality == Criticality::Critical && ctx.status(&m.id) == Some(StepStatus::Failed)
            })
            .map(|m| m.id.clone())
            .collect();
        let pending: Vec<&StepSpec> = members
            .iter()
            .copied()
            .filter(|m| ctx.status(&m.id).is_none())
            .collect();

        if !pending.is_empty() && failed.is_empty() {
            if let Some(stop) = gate(run, signals) {
                return Ok(Some(stop));
            }
            tracing::debug!(run_id = %run.id, group, members = pending.len(), "starting parallel group");

            let started = tokio::time::Instant::now();
            let mut in_flight: HashMap<String, (CancellationToken, tokio::time::Instant)> =
                HashMap::new();
            let mut join_set = JoinSet::new();
            for spec in &pending {
                let this = Arc::clone(self);
                let spec = (*spec).clone();
                let member_ctx = ctx.clone();
                let upstream_ids = upstream_ids(def, &spec);
                let token = signals.cancel.child_token();
                in_flight.insert(spec.id.clone(), (token.clone(), started + self.timeout_for(&spec)));
                let run_id = run.id;
                join_set.spawn(async move {
                    let result = this
                        .execute_step(run_id, &spec, &member_ctx, &upstream_ids, &token)
                        .await?;
                    Ok::<_, SchedulerError>((spec, result))
                });
            }

            loop {
                let cutoff = if failed.is_empty() {
                    None
                } else {
                    in_flight.values().map(|(_, at)| *at).min()
                };
                let joined = match cutoff {
                    None => join_set.join_next().await,
                    Some(at) => match tokio::time::timeout_at(at, join_set.join_next()).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            let now = tokio::time::Instant::now();
                            in_flight.retain(|step_id, (token, at)| {
                                if *at > now {
                                    return true;
                                }
                                tracing::warn!(run_id = %run.id, group, step_id = %step_id, "cancelling straggling group member");
                                token.cancel();
                                false
                            });
                            continue;
                        }
                    },
                };
                let Some(joined) = joined else {
                    break;
                };
                let (spec, result) = joined.map_err(|e| SchedulerError::Join(e.to_string()))??;
                in_flight.remove(&spec.id);
                if apply(ctx, &spec, result).is_some() {
                    failed.push(spec.id.clone());
                }
            }
        }

        if failed.is_empty() {
            return Ok(None);
        }
        if signals.cancel.is_cancelled() {
            return Ok(Some(Walk::Halted(HaltReason::Cancelled)));
        }

        failed.sort();
        let halt = HaltReason::BarrierFailure {
            group: group.to_string(),
            failed,
        };
        if let Some(barrier) = def
            .steps
            .iter()
            .find(|s| matches!(&s.mode, ExecutionMode::ParallelBarrier { group: g } if g == group))
        {
            let error = StepError::new(ErrorClass::BarrierFailure, halt.to_string());
            self.checkpoints.fail(run.id, &barrier.id, error, 0).await?;
            ctx.record(&barrier.id, StepStatus::Failed, None);
        }
        Ok(Some(Walk::Halted(halt)))
    }

    // -----------------------------------------------------------------------
    // Single step
    // -----------------------------------------------------------------------

    async fn execute_step(
        &self,
        run_id: Uuid,
        spec: &StepSpec,
        ctx: &RunContext,
        upstream_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<StepResult, SchedulerError> {
        let step_id = spec.id.as_str();

        if let Some(condition) = &spec.condition {
            match evaluate_condition(condition, &ctx.to_expression_context()) {
                Ok(true) => {}
                Ok(false) => {
                    self.checkpoints.skip(run_id, step_id).await?;
                    tracing::debug!(run_id = %run_id, step_id, condition = %condition, "condition false, step skipped");
                    self.events.publish(OrchestratorEvent::StepSkipped {
                        run_id,
                        step_id: step_id.to_string(),
                    });
                    return Ok(StepResult::Skipped);
                }
                Err(e) => {
                    let error = StepError::new(ErrorClass::Validation, e.to_string());
                    return self.record_failure(run_id, step_id, error, 0).await;
                }
            }
        }

        let start = self.checkpoints.step_start(run_id, step_id).await?;
        self.events.publish(OrchestratorEvent::StepStarted {
            run_id,
            step_id: step_id.to_string(),
            capability: spec.capability.clone(),
            idempotency_key: start.idempotency_key.clone(),
        });

        let timeout = self.timeout_for(spec);
        let request = StepRequest {
            run_id,
            step_id: step_id.to_string(),
            capability: spec.capability.clone(),
            payload: self.context.context_for(&spec.capability, run_id).await,
            input: ctx.input().clone(),
            upstream: ctx.upstream(upstream_ids),
            idempotency_key: start.idempotency_key,
            timeout,
        };
        let policy = self.isolator.policy(spec.retry_policy.as_deref());
        let began = tokio::time::Instant::now();

        let result = self
            .isolator
            .call(spec.dependency_name(), &policy, timeout, cancel, |_| {
                let executor = self.executor.clone();
                let request = request.clone();
                async move { executor.invoke(&request).await }
            })
            .await;

        match result {
            Ok(success) => {
                self.checkpoints
                    .complete(run_id, step_id, success.output.clone(), success.retries)
                    .await?;
                let duration_ms = u64::try_from(began.elapsed().as_millis()).unwrap_or(u64::MAX);
                tracing::debug!(run_id = %run_id, step_id, retries = success.retries, duration_ms, "step completed");
                self.events.publish(OrchestratorEvent::StepCompleted {
                    run_id,
                    step_id: step_id.to_string(),
                    retries: success.retries,
                    duration_ms,
                });
                Ok(StepResult::Completed(success.output))
            }
            Err(failure) => {
                let error = StepError::new(failure.class, failure.message);
                self.record_failure(run_id, step_id, error, failure.retries).await
            }
        }
    }

    async fn record_failure(
        &self,
        run_id: Uuid,
        step_id: &str,
        error: StepError,
        retries: u32,
    ) -> Result<StepResult, SchedulerError> {
        self.checkpoints.fail(run_id, step_id, error.clone(), retries).await?;
        tracing::warn!(run_id = %run_id, step_id, class = %error.class, error = %error.message, retries, "step failed");
        self.events.publish(OrchestratorEvent::StepFailed {
            run_id,
            step_id: step_id.to_string(),
            class: error.class,
            message: error.message.clone(),
            retries,
        });
        Ok(StepResult::Failed(error))
    }

    fn timeout_for(&self, spec: &StepSpec) -> Duration {
        spec.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout)
    }
}

impl<S: PersistentStore> fmt::Debug for Scheduler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Checks made before starting any step, in precedence order.
fn gate(run: &RunInstance, signals: &RunSignals) -> Option<Walk> {
    if signals.cancel.is_cancelled() {
        return Some(Walk::Halted(HaltReason::Cancelled));
    }
    if run.deadline.is_some_and(|deadline| Utc::now() > deadline) {
        return Some(Walk::Halted(HaltReason::DeadlineExceeded));
    }
    if signals.suspend.is_cancelled() {
        return Some(Walk::Suspended);
    }
    None
}

/// Fold a step result into the context. Returns the halt a critical failure causes.
fn apply(ctx: &mut RunContext, spec: &StepSpec, result: StepResult) -> Option<HaltReason> {
    match result {
        StepResult::Completed(output) => {
            ctx.record(&spec.id, StepStatus::Completed, Some(output));
            None
        }
        StepResult::Skipped => {
            ctx.record(&spec.id, StepStatus::Skipped, None);
            None
        }
        StepResult::Failed(error) => {
            ctx.record(&spec.id, StepStatus::Failed, None);
            if error.class == ErrorClass::Cancelled {
                return Some(HaltReason::Cancelled);
            }
            match spec.criticality {
                Criticality::Critical => Some(HaltReason::StepFailed {
                    step_id: spec.id.clone(),
                    error,
                }),
                Criticality::BestEffort => {
                    tracing::info!(step_id = %spec.id, "best-effort step failed, continuing");
                    None
                }
            }
        }
    }
}

/// Steps whose outputs a step receives: its dependencies, plus the members
/// of the group it closes when it is a barrier.
fn upstream_ids(def: &WorkflowDefinition, spec: &StepSpec) -> Vec<String> {
    let mut ids = spec.depends_on.clone();
    if let ExecutionMode::ParallelBarrier { group } = &spec.mode {
        ids.extend(
            def.steps
                .iter()
                .filter(|s| matches!(&s.mode, ExecutionMode::ParallelMember { group: g } if g == group))
                .map(|s| s.id.clone()),
        );
    }
    ids
}

/// Halt reason for a critical step that already failed before a resume.
fn recorded_failure(run: &RunInstance, step_id: &str) -> HaltReason {
    let error = run
        .step(step_id)
        .and_then(|r| r.error.clone())
        .unwrap_or_else(|| StepError::new(ErrorClass::Permanent, "failed before resume"));
    HaltReason::StepFailed {
        step_id: step_id.to_string(),
        error,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_types::error::StepFailure;
    use sagaflow_types::workflow::{Compensation, RunHeader};
    use serde_json::json;

    use crate::capability::collaborator::NullContextProvider;
    use crate::storage::InMemoryStore;
    use crate::workflow::testing::{
        Script, ScriptedExecutor, barrier, distinct, member, step, test_config, workflow,
    };

    struct Fixture {
        checkpoints: Arc<CheckpointManager<InMemoryStore>>,
        executor: ScriptedExecutor,
        scheduler: Arc<Scheduler<InMemoryStore>>,
        events: EventBus,
    }

    fn fixture() -> Fixture {
        let checkpoints = Arc::new(CheckpointManager::new(InMemoryStore::new()));
        let events = EventBus::new(256);
        let isolator = Arc::new(FaultIsolator::new(Arc::new(test_config()), events.clone()));
        let executor = ScriptedExecutor::new();
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&checkpoints),
            isolator,
            BoxStepExecutor::new(executor.clone()),
            Arc::new(NullContextProvider),
            events.clone(),
            Duration::from_millis(500),
        ));
        Fixture {
            checkpoints,
            executor,
            scheduler,
            events,
        }
    }

    async fn create(fx: &Fixture, def: &WorkflowDefinition, payload: Value) -> Uuid {
        let header = RunHeader {
            id: Uuid::now_v7(),
            workflow: def.reference(),
            priority: 1,
            deadline: None,
            tenant: "acme".to_string(),
            payload,
            created_at: Utc::now(),
        };
        fx.checkpoints.create_run(&header).await.unwrap();
        header.id
    }

    fn linear(ids: &[&str]) -> WorkflowDefinition {
        let mut prev: Option<&str> = None;
        let steps = ids
            .iter()
            .map(|id| {
                let deps: Vec<&str> = prev.into_iter().collect();
                prev = Some(id);
                distinct(step(id, &deps))
            })
            .collect();
        workflow("linear", steps)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_run_completes_in_order() {
        let fx = fixture();
        let def = linear(&["a", "b", "c"]);
        let run_id = create(&fx, &def, json!({"user": 7})).await;

        let outcome = fx.scheduler.run(&def, run_id, &RunSignals::default()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(fx.executor.capabilities_called(), vec!["a-agent", "b-agent", "c-agent"]);

        let calls = fx.executor.calls();
        assert_eq!(calls[1].input, json!({"user": 7}));

        let run = fx.checkpoints.load_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let order: Vec<&str> = run.steps.iter().map(|r| r.step_id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(run.steps.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_unwinds_completed_steps() {
        let fx = fixture();
        let def = linear(&["a", "b", "c"]);
        fx.executor
            .always("b-agent", Script::Fail(StepFailure::permanent("card declined")));
        let run_id = create(&fx, &def, Value::Null).await;

        let outcome = fx.scheduler.run(&def, run_id, &RunSignals::default()).await.unwrap();
        let RunOutcome::Failed { reason, compensation_failures } = outcome else {
            panic!("expected failure");
        };
        assert!(reason.starts_with("permanent"), "{reason}");
        assert!(compensation_failures.is_empty());
        assert_eq!(fx.executor.calls_to("b-agent"), 1, "permanent errors are not retried");
        assert_eq!(fx.executor.calls_to("c-agent"), 0);
        assert_eq!(fx.executor.calls_to("a-undo"), 1);
        assert_eq!(fx.executor.calls_to("b-undo"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_false_condition_skips_without_blocking() {
        let fx = fixture();
        let mut upsell = distinct(step("upsell", &["quote"]));
        upsell.condition = Some("input.tier == 'gold'".to_string());
        let def = workflow(
            "w",
            vec![
                distinct(step("quote", &[])),
                upsell,
                distinct(step("confirm", &["upsell"])),
            ],
        );
        let run_id = create(&fx, &def, json!({"tier": "basic"})).await;

        let outcome = fx.scheduler.run(&def, run_id, &RunSignals::default()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(fx.executor.calls_to("upsell-agent"), 0);
        assert_eq!(fx.executor.calls_to("confirm-agent"), 1);

        let run = fx.checkpoints.load_run(run_id).await.unwrap();
        assert_eq!(run.step("upsell").unwrap().status, StepStatus::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_condition_reads_prior_outputs() {
        let fx = fixture();
        fx.executor
            .always("quote-agent", Script::Succeed(json!({"total": 120})));
        let mut discount = distinct(step("discount", &["quote"]));
        discount.condition = Some("steps.quote.output.total > 100".to_string());
        let def = workflow("w", vec![distinct(step("quote", &[])), discount]);
        let run_id = create(&fx, &def, Value::Null).await;

        fx.scheduler.run(&def, run_id, &RunSignals::default()).await.unwrap();
        assert_eq!(fx.executor.calls_to("discount-agent"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_failure_continues() {
        let fx = fixture();
        let mut notify = distinct(step("notify", &["a"]));
        notify.criticality = Criticality::BestEffort;
        let def = workflow(
            "w",
            vec![distinct(step("a", &[])), notify, distinct(step("b", &["notify"]))],
        );
        fx.executor
            .always("notify-agent", Script::Fail(StepFailure::rejected("mailbox full")));
        let run_id = create(&fx, &def, Value::Null).await;

        let outcome = fx.scheduler.run(&def, run_id, &RunSignals::default()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(fx.executor.calls_to("b-agent"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_barrier_failure_compensates_completed_members() {
        let fx = fixture();
        let mut rx = fx.events.subscribe();
        let def = workflow(
            "w",
            vec![
                distinct(member("m1", "g", &[])),
                distinct(member("m2", "g", &[])),
                distinct(member("m3", "g", &[])),
                distinct(barrier("join", "g", &[])),
            ],
        );
        fx.executor.always("m2-agent", Script::Hang);
        let run_id = create(&fx, &def, Value::Null).await;

        let outcome = fx.scheduler.run(&def, run_id, &RunSignals::default()).await.unwrap();
        let RunOutcome::Failed { reason, .. } = outcome else {
            panic!("expected failure");
        };
        assert!(reason.starts_with("barrier_failure"), "{reason}");
        assert_eq!(fx.executor.calls_to("m2-agent"), 2, "timeout retried once");
        assert_eq!(fx.executor.calls_to("join-agent"), 0);
        assert_eq!(fx.executor.calls_to("m1-undo"), 1);
        assert_eq!(fx.executor.calls_to("m3-undo"), 1);
        assert_eq!(fx.executor.calls_to("m2-undo"), 0);

        let run = fx.checkpoints.load_run(run_id).await.unwrap();
        let join = run.step("join").unwrap();
        assert_eq!(join.status, StepStatus::Failed);
        assert_eq!(join.error.as_ref().unwrap().class, ErrorClass::BarrierFailure);

        let mut saw_compensating = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, OrchestratorEvent::CompensationStarted { .. }) {
                saw_compensating = true;
            }
        }
        assert!(saw_compensating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_straggler_cut_off_at_its_own_timeout() {
        let fx = fixture();
        let mut slow = distinct(member("slow", "g", &[]));
        slow.timeout_ms = Some(100);
        let def = workflow(
            "w",
            vec![
                distinct(member("bad", "g", &[])),
                slow,
                distinct(member("quick", "g", &[])),
                distinct(barrier("join", "g", &[])),
            ],
        );
        fx.executor
            .always("bad-agent", Script::Fail(StepFailure::permanent("rejected")))
            .always("slow-agent", Script::Hang)
            .always("quick-agent", Script::Delay(Duration::from_millis(50), json!("ok")));
        let run_id = create(&fx, &def, Value::Null).await;

        let began = tokio::time::Instant::now();
        let outcome = fx.scheduler.run(&def, run_id, &RunSignals::default()).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert!(began.elapsed() < Duration::from_millis(500), "{:?}", began.elapsed());
        assert_eq!(fx.executor.calls_to("slow-agent"), 1, "no retry past its own timeout");
        assert_eq!(fx.executor.calls_to("quick-undo"), 1);
        assert_eq!(fx.executor.calls_to("slow-undo"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_barrier_receives_member_outputs() {
        let fx = fixture();
        let def = workflow(
            "w",
            vec![
                distinct(member("flight", "g", &[])),
                distinct(member("hotel", "g", &[])),
                distinct(barrier("join", "g", &[])),
            ],
        );
        let run_id = create(&fx, &def, Value::Null).await;

        fx.scheduler.run(&def, run_id, &RunSignals::default()).await.unwrap();
        let calls = fx.executor.calls();
        assert_eq!(calls.last().unwrap().capability, "join-agent");
        assert_eq!(calls.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_passed_before_step_compensates() {
        let fx = fixture();
        let def = linear(&["a", "b"]);
        let header = RunHeader {
            id: Uuid::now_v7(),
            workflow: def.reference(),
            priority: 1,
            deadline: Some(Utc::now() - chrono::Duration::milliseconds(1)),
            tenant: "acme".to_string(),
            payload: Value::Null,
            created_at: Utc::now(),
        };
        fx.checkpoints.create_run(&header).await.unwrap();

        let outcome = fx.scheduler.run(&def, header.id, &RunSignals::default()).await.unwrap();
        let RunOutcome::Failed { reason, .. } = outcome else {
            panic!("expected failure");
        };
        assert!(reason.starts_with("deadline_exceeded"), "{reason}");
        assert!(fx.executor.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_step_compensates() {
        let fx = fixture();
        let def = linear(&["a", "b", "c"]);
        fx.executor.always("b-agent", Script::Hang);
        let run_id = create(&fx, &def, Value::Null).await;

        let signals = RunSignals::default();
        let cancel = signals.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let outcome = fx.scheduler.run(&def, run_id, &signals).await.unwrap();
        let RunOutcome::Failed { reason, .. } = outcome else {
            panic!("expected failure");
        };
        assert!(reason.starts_with("cancelled"), "{reason}");
        assert_eq!(fx.executor.calls_to("a-undo"), 1);
        assert_eq!(fx.executor.calls_to("c-agent"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_leaves_run_running_and_resumes() {
        let fx = fixture();
        let def = linear(&["a", "b", "c", "d"]);
        let run_id = create(&fx, &def, Value::Null).await;
        fx.checkpoints
            .transition(run_id, RunStatus::Queued, RunStatus::Running, None)
            .await
            .unwrap();
        for id in ["a", "b"] {
            fx.checkpoints.step_start(run_id, id).await.unwrap();
            fx.checkpoints.complete(run_id, id, json!(id), 0).await.unwrap();
        }

        let suspended = RunSignals::default();
        suspended.suspend.cancel();
        let outcome = fx.scheduler.run(&def, run_id, &suspended).await.unwrap();
        assert_eq!(outcome, RunOutcome::Suspended);
        assert_eq!(fx.checkpoints.status(run_id).await.unwrap().status, RunStatus::Running);

        let outcome = fx.scheduler.run(&def, run_id, &RunSignals::default()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(fx.executor.capabilities_called(), vec!["c-agent", "d-agent"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_irreversible_step_is_not_compensated() {
        let fx = fixture();
        let mut a = distinct(step("a", &[]));
        a.compensation = Compensation::Irreversible;
        let def = workflow("w", vec![a, distinct(step("b", &["a"]))]);
        fx.executor
            .always("b-agent", Script::Fail(StepFailure::permanent("no")));
        let run_id = create(&fx, &def, Value::Null).await;

        fx.scheduler.run(&def, run_id, &RunSignals::default()).await.unwrap();
        assert_eq!(fx.executor.capabilities_called(), vec!["a-agent", "b-agent"]);
        let run = fx.checkpoints.load_run(run_id).await.unwrap();
        assert_eq!(run.compensations.len(), 1);
    }
}
