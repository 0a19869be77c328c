//! Orchestrator facade: the single entry point callers use.
//!
//! Ties the pieces together for the lifetime of the process:
//!
//! - admission through the `Distributor`, with statuses persisted by the
//!   `CheckpointManager`
//! - one tracked task per admitted run, driving the `Scheduler`
//! - a periodic sweep that ages queued runs and expires missed deadlines
//! - crash recovery from the store, and graceful shutdown that suspends
//!   in-flight runs between steps
//!
//! Every slot release triggers a dispatch pass, so queued runs start as soon
//! as capacity frees up; the sweep only covers aging and deadlines.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use sagaflow_types::circuit::CircuitSnapshot;
use sagaflow_types::config::EngineConfig;
use sagaflow_types::error::ErrorClass;
use sagaflow_types::event::OrchestratorEvent;
use sagaflow_types::workflow::{RunHeader, RunStatus, RunSummary, WorkflowDefinition};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::admission::{Admission, Distributor, DistributorStats, QueueEntry};
use crate::capability::box_executor::BoxStepExecutor;
use crate::capability::collaborator::{NullContextProvider, SharedClassifier, SharedContextProvider};
use crate::event::EventBus;
use crate::isolation::FaultIsolator;
use crate::storage::PersistentStore;
use crate::workflow::definition::CatalogError;
use crate::workflow::{
    CheckpointError, CheckpointManager, RunOutcome, RunSignals, Scheduler, WorkflowCatalog,
};

// ---------------------------------------------------------------------------
// Requests, acknowledgements and errors
// ---------------------------------------------------------------------------

/// A request to start a run of a registered workflow.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub intent: String,
    /// Pin a version; the latest registered one when `None`.
    pub version: Option<u32>,
    pub payload: Value,
    /// Lower is more urgent. The configured default when `None`.
    pub priority: Option<u8>,
    pub deadline: Option<DateTime<Utc>>,
    pub tenant: String,
}

impl RunRequest {
    pub fn new(intent: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            version: None,
            payload: Value::Null,
            priority: None,
            deadline: None,
            tenant: tenant.into(),
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// What `cancel_run` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    /// The run was still queued; it was removed and finalized `failed`.
    Dequeued,
    /// The run is executing; it will unwind and finalize `failed`.
    Cancelling,
    AlreadyFinished(RunStatus),
    /// The run exists but is not executing in this process.
    NotActive(RunStatus),
}

/// Counts from a `recover` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Queued runs put back on the queue.
    pub requeued: usize,
    /// Running or compensating runs restarted from their checkpoints.
    pub resumed: usize,
    /// Runs whose workflow is no longer registered; finalized `failed`.
    pub abandoned: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Checkpoint(CheckpointError),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

impl From<CheckpointError> for OrchestratorError {
    fn from(e: CheckpointError) -> Self {
        match e {
            CheckpointError::RunNotFound(id) => OrchestratorError::RunNotFound(id),
            other => OrchestratorError::Checkpoint(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct OrchestratorBuilder<S: PersistentStore> {
    config: EngineConfig,
    catalog: Arc<WorkflowCatalog>,
    store: S,
    executor: BoxStepExecutor,
    context: SharedContextProvider,
    classifier: Option<SharedClassifier>,
}

impl<S: PersistentStore + 'static> OrchestratorBuilder<S> {
    pub fn context_provider(mut self, provider: SharedContextProvider) -> Self {
        self.context = provider;
        self
    }

    pub fn classifier(mut self, classifier: SharedClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn build(self) -> Orchestrator<S> {
        let config = Arc::new(self.config.normalized());
        let events = EventBus::new(config.engine.event_capacity);
        let isolator = Arc::new(FaultIsolator::new(Arc::clone(&config), events.clone()));
        let checkpoints = Arc::new(CheckpointManager::new(self.store));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&checkpoints),
            Arc::clone(&isolator),
            self.executor,
            self.context,
            events.clone(),
            Duration::from_millis(config.engine.default_step_timeout_ms),
        ));
        let distributor = Distributor::new(config.distributor.clone());

        Orchestrator {
            inner: Arc::new(Inner {
                config,
                catalog: self.catalog,
                checkpoints,
                scheduler,
                distributor,
                isolator,
                events,
                classifier: self.classifier,
                active: DashMap::new(),
                tracker: TaskTracker::new(),
                stopping: CancellationToken::new(),
                suspend: CancellationToken::new(),
                sweeper_started: AtomicBool::new(false),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Cheap to clone; clones share one engine.
pub struct Orchestrator<S: PersistentStore + 'static> {
    inner: Arc<Inner<S>>,
}

impl<S: PersistentStore + 'static> Clone for Orchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S: PersistentStore + 'static> {
    config: Arc<EngineConfig>,
    catalog: Arc<WorkflowCatalog>,
    checkpoints: Arc<CheckpointManager<S>>,
    scheduler: Arc<Scheduler<S>>,
    distributor: Distributor,
    isolator: Arc<FaultIsolator>,
    events: EventBus,
    classifier: Option<SharedClassifier>,
    /// Cancel tokens of runs executing in this process.
    active: DashMap<Uuid, CancellationToken>,
    tracker: TaskTracker,
    /// Stops admission and the sweep.
    stopping: CancellationToken,
    /// Shared by every run; suspends them between steps.
    suspend: CancellationToken,
    sweeper_started: AtomicBool,
}

impl<S: PersistentStore + 'static> Orchestrator<S> {
    pub fn builder(
        config: EngineConfig,
        catalog: Arc<WorkflowCatalog>,
        store: S,
        executor: BoxStepExecutor,
    ) -> OrchestratorBuilder<S> {
        OrchestratorBuilder {
            config,
            catalog,
            store,
            executor,
            context: Arc::new(NullContextProvider),
            classifier: None,
        }
    }

    /// Start the periodic aging and deadline sweep. Idempotent.
    pub fn start(&self) {
        if self.inner.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.spawn_sweeper();
    }

    /// Submit a run of a registered workflow.
    ///
    /// The run is persisted `queued`, then admitted, queued, or failed right
    /// away when its deadline cannot be met. Returns the run ID in every case;
    /// `get_run_status` tells which.
    pub async fn submit_run(&self, request: RunRequest) -> Result<Uuid, OrchestratorError> {
        let inner = &self.inner;
        if inner.stopping.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        if request.tenant.trim().is_empty() {
            return Err(OrchestratorError::Validation("tenant must not be empty".to_string()));
        }
        let def = inner.catalog.resolve(&request.intent, request.version)?;

        let now = Utc::now();
        let header = RunHeader {
            id: Uuid::now_v7(),
            workflow: def.reference(),
            priority: request
                .priority
                .unwrap_or(inner.config.engine.default_priority),
            deadline: request.deadline,
            tenant: request.tenant,
            payload: request.payload,
            created_at: now,
        };
        let run_id = header.id;
        inner.checkpoints.create_run(&header).await?;

        let entry = QueueEntry::new(
            run_id,
            header.workflow.clone(),
            header.tenant.clone(),
            header.priority,
            header.deadline,
            now,
        );
        match inner.distributor.submit(entry.clone(), now) {
            Admission::Admitted => inner.admit(def, &entry).await?,
            Admission::Queued { position } => {
                tracing::info!(
                    run_id = %run_id,
                    tenant = %entry.tenant,
                    position,
                    "run queued"
                );
                inner.events.publish(OrchestratorEvent::RunQueued {
                    run_id,
                    tenant: entry.tenant,
                    position,
                });
            }
            Admission::Unreachable { estimate } => {
                let reason = unreachable_reason(estimate);
                tracing::warn!(run_id = %run_id, reason = %reason, "run rejected at submission");
                inner.finish_queued(run_id, RunStatus::Failed, reason).await?;
            }
        }
        Ok(run_id)
    }

    /// Classify free-form input into an intent, then submit it.
    pub async fn submit_raw(
        &self,
        raw: &str,
        tenant: &str,
        payload: Value,
    ) -> Result<Uuid, OrchestratorError> {
        let classifier = self
            .inner
            .classifier
            .as_ref()
            .ok_or_else(|| OrchestratorError::Validation("no intent classifier configured".to_string()))?;
        let classification = classifier
            .classify(raw)
            .await
            .map_err(|e| OrchestratorError::Validation(format!("classification failed: {e}")))?;

        let min = self.inner.config.engine.min_intent_confidence;
        if classification.confidence < min {
            return Err(OrchestratorError::Validation(format!(
                "intent '{}' classified with confidence {:.2}, below {:.2}",
                classification.intent, classification.confidence, min
            )));
        }
        tracing::debug!(
            intent = %classification.intent,
            confidence = classification.confidence,
            "classified raw submission"
        );
        self.submit_run(RunRequest::new(classification.intent, tenant).payload(payload))
            .await
    }

    pub async fn get_run_status(&self, run_id: Uuid) -> Result<RunSummary, OrchestratorError> {
        Ok(self.inner.checkpoints.load_run(run_id).await?.summary())
    }

    /// 1-based position in dispatch order, while queued.
    pub fn queue_position(&self, run_id: Uuid) -> Option<usize> {
        self.inner.distributor.position(run_id)
    }

    pub async fn list_runs(&self) -> Result<Vec<RunSummary>, OrchestratorError> {
        let runs = self.inner.checkpoints.list_runs().await?;
        Ok(runs.iter().map(|run| run.summary()).collect())
    }

    /// Request cancellation. Queued runs are dropped immediately; running
    /// runs have in-flight calls cancelled and are unwound.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<CancelAck, OrchestratorError> {
        let inner = &self.inner;
        if inner.distributor.remove(run_id).is_some() {
            inner
                .finish_queued(
                    run_id,
                    RunStatus::Failed,
                    format!("{}: run cancelled while queued", ErrorClass::Cancelled),
                )
                .await?;
            return Ok(CancelAck::Dequeued);
        }

        if let Some(token) = inner.active.get(&run_id) {
            tracing::info!(run_id = %run_id, "cancelling run");
            token.cancel();
            return Ok(CancelAck::Cancelling);
        }

        let status = inner.checkpoints.status(run_id).await?.status;
        if status.is_terminal() {
            Ok(CancelAck::AlreadyFinished(status))
        } else {
            Ok(CancelAck::NotActive(status))
        }
    }

    /// Rebuild engine state from the store after a restart.
    ///
    /// Queued runs return to the queue in their original order; running and
    /// compensating runs reclaim their slots and resume from the first
    /// unsettled step. Call once, before accepting submissions.
    pub async fn recover(&self) -> Result<RecoveryReport, OrchestratorError> {
        let inner = &self.inner;
        let mut report = RecoveryReport::default();

        for run in inner.checkpoints.list_recoverable().await? {
            let def = match inner.catalog.get(&run.workflow) {
                Ok(def) => def,
                Err(e) => {
                    tracing::error!(run_id = %run.id, error = %e, "cannot recover run");
                    inner
                        .finish_queued(
                            run.id,
                            RunStatus::Failed,
                            format!("{}: {e}", ErrorClass::Validation),
                        )
                        .await?;
                    report.abandoned += 1;
                    continue;
                }
            };

            match run.status {
                RunStatus::Queued => {
                    inner.distributor.enqueue_recovered(QueueEntry::new(
                        run.id,
                        run.workflow.clone(),
                        run.tenant.clone(),
                        run.priority,
                        run.deadline,
                        run.created_at,
                    ));
                    report.requeued += 1;
                }
                RunStatus::Running | RunStatus::Compensating => {
                    inner
                        .distributor
                        .restore_running(run.id, &run.tenant, &run.workflow);
                    let signals = inner.signals_for(run.id);
                    inner.launch(def, run.id, signals);
                    report.resumed += 1;
                }
                _ => {}
            }
        }

        tracing::info!(
            requeued = report.requeued,
            resumed = report.resumed,
            abandoned = report.abandoned,
            "recovery complete"
        );
        inner.pump().await;
        Ok(report)
    }

    /// Stop admitting, let in-flight runs finish for up to `grace`, then
    /// suspend the rest between steps and wait for them to checkpoint.
    pub async fn shutdown(&self, grace: Duration) {
        let inner = &self.inner;
        tracing::info!(active = inner.active.len(), "orchestrator shutting down");
        inner.stopping.cancel();
        inner.tracker.close();

        if tokio::time::timeout(grace, inner.tracker.wait()).await.is_err() {
            tracing::warn!(
                active = inner.active.len(),
                "grace period elapsed, suspending active runs"
            );
            inner.suspend.cancel();
            inner.tracker.wait().await;
        }
        tracing::info!("orchestrator stopped");
    }

    pub fn events(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    pub fn circuits(&self) -> Vec<CircuitSnapshot> {
        self.inner.isolator.snapshot()
    }

    pub fn stats(&self) -> DistributorStats {
        self.inner.distributor.stats()
    }

    pub fn catalog(&self) -> &Arc<WorkflowCatalog> {
        &self.inner.catalog
    }
}

impl<S: PersistentStore + 'static> Inner<S> {
    fn signals_for(&self, run_id: Uuid) -> RunSignals {
        let signals = RunSignals {
            cancel: CancellationToken::new(),
            suspend: self.suspend.clone(),
        };
        self.active.insert(run_id, signals.cancel.clone());
        signals
    }

    /// Move a freshly admitted run to `running` and start it.
    async fn admit(
        self: &Arc<Self>,
        def: Arc<WorkflowDefinition>,
        entry: &QueueEntry,
    ) -> Result<(), CheckpointError> {
        let run_id = entry.run_id;
        let signals = self.signals_for(run_id);
        let moved = match self
            .checkpoints
            .transition(run_id, RunStatus::Queued, RunStatus::Running, None)
            .await
        {
            Ok(moved) => moved,
            Err(e) => {
                self.abandon_admission(run_id, &e).await;
                return Err(e);
            }
        };
        if !moved {
            tracing::warn!(run_id = %run_id, "run left queued state before admission");
            self.active.remove(&run_id);
            self.distributor.release(run_id, None);
            return Ok(());
        }

        tracing::info!(
            run_id = %run_id,
            workflow = %entry.workflow,
            tenant = %entry.tenant,
            priority = entry.priority,
            "run admitted"
        );
        self.events.publish(OrchestratorEvent::RunAdmitted {
            run_id,
            workflow: entry.workflow.clone(),
            tenant: entry.tenant.clone(),
            priority: entry.priority,
        });
        self.launch(def, run_id, signals);
        Ok(())
    }

    fn launch(self: &Arc<Self>, def: Arc<WorkflowDefinition>, run_id: Uuid, signals: RunSignals) {
        let inner = Arc::clone(self);
        self.tracker.spawn(inner.drive(def, run_id, signals));
    }

    /// One run's task: execute it, free its slot, let the next one in.
    ///
    /// Boxed so the future type does not refer to itself through `launch`.
    fn drive(
        self: Arc<Self>,
        def: Arc<WorkflowDefinition>,
        run_id: Uuid,
        signals: RunSignals,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let started = Instant::now();
            let result = self.scheduler.run(&def, run_id, &signals).await;
            self.active.remove(&run_id);

            let duration = match result {
                Ok(RunOutcome::Completed) => Some(started.elapsed()),
                Ok(RunOutcome::Failed { .. }) => None,
                Ok(RunOutcome::Suspended) => {
                    tracing::info!(run_id = %run_id, "run suspended, will resume on recovery");
                    None
                }
                Err(e) => {
                    tracing::error!(run_id = %run_id, error = %e, "run driver failed");
                    None
                }
            };
            self.distributor.release(run_id, duration);
            self.pump().await;
        })
    }

    /// Run one dispatch pass and act on its decisions.
    async fn pump(self: &Arc<Self>) {
        if self.stopping.is_cancelled() {
            return;
        }
        let dispatch = self.distributor.dispatch(Utc::now());
        if dispatch.is_empty() {
            return;
        }

        for promotion in dispatch.promoted {
            tracing::debug!(
                run_id = %promotion.run_id,
                from = promotion.from,
                to = promotion.to,
                "queued run promoted"
            );
            self.events.publish(OrchestratorEvent::RunPromoted {
                run_id: promotion.run_id,
                from_priority: promotion.from,
                to_priority: promotion.to,
            });
        }

        for entry in dispatch.expired {
            let reason = format!("{}: deadline passed while queued", ErrorClass::DeadlineExceeded);
            if let Err(e) = self.finish_queued(entry.run_id, RunStatus::Expired, reason).await {
                tracing::error!(run_id = %entry.run_id, error = %e, "failed to expire run");
            }
        }

        for entry in dispatch.unreachable {
            let reason = unreachable_reason(self.distributor.estimate(&entry.workflow));
            if let Err(e) = self.finish_queued(entry.run_id, RunStatus::Failed, reason).await {
                tracing::error!(run_id = %entry.run_id, error = %e, "failed to fail unreachable run");
            }
        }

        for entry in dispatch.admitted {
            let def = match self.catalog.get(&entry.workflow) {
                Ok(def) => def,
                Err(e) => {
                    self.distributor.release(entry.run_id, None);
                    let reason = format!("{}: {e}", ErrorClass::Validation);
                    if let Err(e) = self.finish_queued(entry.run_id, RunStatus::Failed, reason).await {
                        tracing::error!(run_id = %entry.run_id, error = %e, "failed to fail run");
                    }
                    continue;
                }
            };
            if let Err(e) = self.admit(def, &entry).await {
                tracing::error!(run_id = %entry.run_id, error = %e, "failed to admit run");
            }
        }
    }

    /// Give back the slot of a run whose start could not be recorded, then
    /// fail it. If failing it is not recorded either, recovery requeues it.
    async fn abandon_admission(&self, run_id: Uuid, error: &CheckpointError) {
        self.active.remove(&run_id);
        self.distributor.release(run_id, None);
        let reason = format!("{}: admission failed: {error}", ErrorClass::Transient);
        if let Err(e) = self.finish_queued(run_id, RunStatus::Failed, reason).await {
            tracing::error!(run_id = %run_id, error = %e, "failed to fail unadmitted run");
        }
    }

    /// Finalize a run that never started executing.
    async fn finish_queued(
        &self,
        run_id: Uuid,
        status: RunStatus,
        reason: String,
    ) -> Result<(), CheckpointError> {
        self.checkpoints
            .finalize(run_id, status, Some(&reason), Vec::new())
            .await?;
        tracing::info!(run_id = %run_id, status = %status, reason = %reason, "run finished without executing");
        self.events.publish(OrchestratorEvent::RunFinished {
            run_id,
            status,
            reason: Some(reason),
        });
        Ok(())
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let period = Duration::from_millis(self.config.distributor.sweep_interval_ms.max(1));
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = inner.stopping.cancelled() => break,
                    _ = ticker.tick() => inner.pump().await,
                }
            }
            tracing::debug!("distributor sweep stopped");
        });
    }
}

fn unreachable_reason(estimate: Option<Duration>) -> String {
    match estimate {
        Some(estimate) => format!(
            "{}: estimated duration {}ms exceeds the time left before the deadline",
            ErrorClass::DeadlineUnreachable,
            estimate.as_millis()
        ),
        None => format!("{}: deadline already passed", ErrorClass::DeadlineUnreachable),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
