//! Durable run-state adapter.
//!
//! Wraps a `PersistentStore` with the run-level API the scheduler and
//! compensator use. Step records are append-only: once a step has a terminal
//! record, further checkpoints for it are ignored. The run status lives in a
//! single cell mutated only by compare-and-swap.
//!
//! Store layout per run:
//! - `run:{id}:header` -- immutable `RunHeader`
//! - `run:{id}:status` -- `StatusCell` (CAS)
//! - `run:{id}:steps` -- `StepRecord` log
//! - `run:{id}:compensations` -- `CompensationRecord` log
//!
//! plus a global `runs` log indexing every run id.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sagaflow_types::error::{RepositoryError, StepError};
use sagaflow_types::workflow::{
    CompensationRecord, RunHeader, RunInstance, RunStatus, StepRecord, StepStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::storage::PersistentStore;

const RUN_INDEX_KEY: &str = "runs";

fn header_key(run_id: Uuid) -> String {
    format!("run:{run_id}:header")
}

fn status_key(run_id: Uuid) -> String {
    format!("run:{run_id}:status")
}

fn steps_key(run_id: Uuid) -> String {
    format!("run:{run_id}:steps")
}

fn compensations_key(run_id: Uuid) -> String {
    format!("run:{run_id}:compensations")
}

/// Idempotency key for a forward step call.
pub fn step_idempotency_key(run_id: Uuid, step_id: &str, seq: u64) -> String {
    format!("{run_id}:{step_id}:{seq}")
}

/// Idempotency key for a step's compensating call.
pub fn compensation_idempotency_key(run_id: Uuid, step_id: &str) -> String {
    format!("{run_id}:{step_id}:compensate")
}

// ---------------------------------------------------------------------------
// Errors and records
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("repository error: {0}")]
    Repository(String),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("run already exists: {0}")]
    RunExists(Uuid),

    #[error("step '{step_id}' already has a terminal record")]
    StepSettled { step_id: String },

    #[error("run {run_id} already finalized as {current}")]
    AlreadyFinalized { run_id: Uuid, current: RunStatus },

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<RepositoryError> for CheckpointError {
    fn from(e: RepositoryError) -> Self {
        CheckpointError::Repository(e.to_string())
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(e: serde_json::Error) -> Self {
        CheckpointError::Corrupt(e.to_string())
    }
}

/// The mutable run-status cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusCell {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensation_failures: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a `checkpoint` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Appended with this sequence number.
    Recorded(u64),
    /// The step already had a terminal record; nothing changed.
    Ignored,
}

/// What `step_start` hands back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepStart {
    pub seq: u64,
    pub idempotency_key: String,
    /// True when an open `running` record from before a restart was reused.
    pub resumed: bool,
}

/// Per-run ordering state, rebuilt lazily from the step log.
#[derive(Debug, Default)]
struct RunCursor {
    loaded: bool,
    next_seq: u64,
    latest: HashMap<String, StepRecord>,
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable run state.
///
/// Generic over `S: PersistentStore` so it works with any backend. Records of
/// one run are serialized through that run's cursor lock, giving them a
/// total order; different runs never contend.
pub struct CheckpointManager<S: PersistentStore> {
    store: S,
    cursors: DashMap<Uuid, Arc<Mutex<RunCursor>>>,
}

impl<S: PersistentStore> CheckpointManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: DashMap::new(),
        }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Run creation
    // -----------------------------------------------------------------------

    /// Persist a new run's header and `queued` status.
    pub async fn create_run(&self, header: &RunHeader) -> Result<(), CheckpointError> {
        let run_id = header.id;
        let header_value = serde_json::to_value(header)?;
        if !self
            .store
            .compare_and_swap(&header_key(run_id), None, &header_value)
            .await?
        {
            return Err(CheckpointError::RunExists(run_id));
        }

        let cell = StatusCell {
            status: RunStatus::Queued,
            reason: None,
            compensation_failures: Vec::new(),
            updated_at: header.created_at,
        };
        self.store
            .compare_and_swap(&status_key(run_id), None, &serde_json::to_value(&cell)?)
            .await?;
        self.store
            .append(RUN_INDEX_KEY, &serde_json::json!({ "run_id": run_id }))
            .await?;

        tracing::debug!(run_id = %run_id, workflow = %header.workflow, "checkpointed run creation");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step-level checkpoints
    // -----------------------------------------------------------------------

    /// Checkpoint a step as running and hand out its idempotency key.
    ///
    /// If the step already has an open `running` record (a restart happened
    /// mid-call), that record's key is reused so the capability sees the
    /// same key again.
    pub async fn step_start(&self, run_id: Uuid, step_id: &str) -> Result<StepStart, CheckpointError> {
        let cursor = self.cursor(run_id).await?;
        let mut cursor = cursor.lock().await;

        if let Some(existing) = cursor.latest.get(step_id) {
            if existing.status.is_terminal() {
                return Err(CheckpointError::StepSettled {
                    step_id: step_id.to_string(),
                });
            }
            if let Some(key) = &existing.idempotency_key {
                tracing::debug!(run_id = %run_id, step_id, key, "resuming open step record");
                return Ok(StepStart {
                    seq: existing.seq,
                    idempotency_key: key.clone(),
                    resumed: true,
                });
            }
        }

        let seq = cursor.next_seq;
        let key = step_idempotency_key(run_id, step_id, seq);
        let mut record = StepRecord::new(step_id, StepStatus::Running);
        record.started_at = Some(Utc::now());
        record.idempotency_key = Some(key.clone());
        record.seq = seq;

        self.store
            .append(&steps_key(run_id), &serde_json::to_value(&record)?)
            .await?;
        cursor.next_seq = seq + 1;
        cursor.latest.insert(step_id.to_string(), record);

        tracing::debug!(run_id = %run_id, step_id, seq, "checkpointed step start");
        Ok(StepStart {
            seq,
            idempotency_key: key,
            resumed: false,
        })
    }

    /// Append a step record unless the step already has a terminal record.
    ///
    /// The record's `seq` is assigned here. Start time and idempotency key
    /// carry over from the step's open `running` record when not set.
    pub async fn checkpoint(
        &self,
        run_id: Uuid,
        mut record: StepRecord,
    ) -> Result<CheckpointOutcome, CheckpointError> {
        let cursor = self.cursor(run_id).await?;
        let mut cursor = cursor.lock().await;

        if let Some(existing) = cursor.latest.get(&record.step_id) {
            if existing.status.is_terminal() {
                tracing::debug!(
                    run_id = %run_id,
                    step_id = %record.step_id,
                    status = existing.status.as_str(),
                    "ignoring checkpoint for settled step"
                );
                return Ok(CheckpointOutcome::Ignored);
            }
            if record.started_at.is_none() {
                record.started_at = existing.started_at;
            }
            if record.idempotency_key.is_none() {
                record.idempotency_key = existing.idempotency_key.clone();
            }
        }

        let seq = cursor.next_seq;
        record.seq = seq;
        self.store
            .append(&steps_key(run_id), &serde_json::to_value(&record)?)
            .await?;
        cursor.next_seq = seq + 1;

        tracing::debug!(
            run_id = %run_id,
            step_id = %record.step_id,
            status = record.status.as_str(),
            seq,
            "checkpointed step"
        );
        cursor.latest.insert(record.step_id.clone(), record);
        Ok(CheckpointOutcome::Recorded(seq))
    }

    /// Checkpoint a step as completed with its result.
    pub async fn complete(
        &self,
        run_id: Uuid,
        step_id: &str,
        result: Value,
        retries: u32,
    ) -> Result<CheckpointOutcome, CheckpointError> {
        let mut record = StepRecord::new(step_id, StepStatus::Completed);
        record.ended_at = Some(Utc::now());
        record.result = Some(result);
        record.retry_count = retries;
        self.checkpoint(run_id, record).await
    }

    /// Checkpoint a step as failed.
    pub async fn fail(
        &self,
        run_id: Uuid,
        step_id: &str,
        error: StepError,
        retries: u32,
    ) -> Result<CheckpointOutcome, CheckpointError> {
        let mut record = StepRecord::new(step_id, StepStatus::Failed);
        record.ended_at = Some(Utc::now());
        record.error = Some(error);
        record.retry_count = retries;
        self.checkpoint(run_id, record).await
    }

    /// Checkpoint a step as skipped (condition false or best-effort bypass).
    pub async fn skip(&self, run_id: Uuid, step_id: &str) -> Result<CheckpointOutcome, CheckpointError> {
        let now = Utc::now();
        let mut record = StepRecord::new(step_id, StepStatus::Skipped);
        record.started_at = Some(now);
        record.ended_at = Some(now);
        self.checkpoint(run_id, record).await
    }

    /// Persist the outcome of compensating one step.
    pub async fn record_compensation(
        &self,
        run_id: Uuid,
        record: &CompensationRecord,
    ) -> Result<(), CheckpointError> {
        self.store
            .append(&compensations_key(run_id), &serde_json::to_value(record)?)
            .await?;
        tracing::debug!(run_id = %run_id, step_id = %record.step_id, "checkpointed compensation");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run-level status
    // -----------------------------------------------------------------------

    /// Read the run's status cell.
    pub async fn status(&self, run_id: Uuid) -> Result<StatusCell, CheckpointError> {
        self.read_status(run_id).await.map(|(cell, _)| cell)
    }

    /// Move the run from `from` to `to`. Returns `false` if the run was not in `from`.
    pub async fn transition(
        &self,
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
        reason: Option<&str>,
    ) -> Result<bool, CheckpointError> {
        let (cell, raw) = self.read_status(run_id).await?;
        if cell.status != from {
            return Ok(false);
        }
        let next = StatusCell {
            status: to,
            reason: reason.map(str::to_string).or(cell.reason),
            compensation_failures: cell.compensation_failures,
            updated_at: Utc::now(),
        };
        let swapped = self
            .store
            .compare_and_swap(&status_key(run_id), Some(&raw), &serde_json::to_value(&next)?)
            .await?;
        if swapped {
            tracing::debug!(run_id = %run_id, from = %from, to = %to, "checkpointed run transition");
        }
        Ok(swapped)
    }

    /// Move the run to a terminal status.
    ///
    /// Finalizing again with the same status is a no-op; a different
    /// terminal status is an error.
    pub async fn finalize(
        &self,
        run_id: Uuid,
        status: RunStatus,
        reason: Option<&str>,
        compensation_failures: Vec<String>,
    ) -> Result<(), CheckpointError> {
        debug_assert!(status.is_terminal());
        loop {
            let (cell, raw) = self.read_status(run_id).await?;
            if cell.status == status {
                return Ok(());
            }
            if cell.status.is_terminal() {
                return Err(CheckpointError::AlreadyFinalized {
                    run_id,
                    current: cell.status,
                });
            }
            let next = StatusCell {
                status,
                reason: reason.map(str::to_string).or(cell.reason),
                compensation_failures: compensation_failures.clone(),
                updated_at: Utc::now(),
            };
            if self
                .store
                .compare_and_swap(&status_key(run_id), Some(&raw), &serde_json::to_value(&next)?)
                .await?
            {
                self.cursors.remove(&run_id);
                tracing::debug!(run_id = %run_id, status = %status, "checkpointed run finalized");
                return Ok(());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reconstruction
    // -----------------------------------------------------------------------

    /// Rebuild the full run from the store.
    pub async fn load_run(&self, run_id: Uuid) -> Result<RunInstance, CheckpointError> {
        let header: RunHeader = match self.store.read(&header_key(run_id)).await? {
            Some(value) => serde_json::from_value(value)?,
            None => return Err(CheckpointError::RunNotFound(run_id)),
        };
        let (cell, _) = self.read_status(run_id).await?;

        let mut latest: HashMap<String, StepRecord> = HashMap::new();
        let mut sequence = 0;
        for value in self.store.read_all(&steps_key(run_id)).await? {
            let record: StepRecord = serde_json::from_value(value)?;
            sequence = sequence.max(record.seq);
            let settled = latest
                .get(&record.step_id)
                .is_some_and(|existing| existing.status.is_terminal());
            if !settled {
                latest.insert(record.step_id.clone(), record);
            }
        }
        let mut steps: Vec<StepRecord> = latest.into_values().collect();
        steps.sort_by_key(|r| r.seq);

        let compensations = self
            .store
            .read_all(&compensations_key(run_id))
            .await?
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<CompensationRecord>, _>>()?;

        Ok(RunInstance {
            id: header.id,
            workflow: header.workflow,
            priority: header.priority,
            deadline: header.deadline,
            tenant: header.tenant,
            payload: header.payload,
            status: cell.status,
            reason: cell.reason,
            steps,
            compensations,
            compensation_failures: cell.compensation_failures,
            sequence,
            created_at: header.created_at,
            updated_at: cell.updated_at,
        })
    }

    /// Every run id ever created, in creation order.
    pub async fn list_run_ids(&self) -> Result<Vec<Uuid>, CheckpointError> {
        let mut ids = Vec::new();
        for entry in self.store.read_all(RUN_INDEX_KEY).await? {
            let id = entry
                .get("run_id")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| CheckpointError::Corrupt(format!("bad run index entry: {entry}")))?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Every run, in creation order.
    pub async fn list_runs(&self) -> Result<Vec<RunInstance>, CheckpointError> {
        let mut runs = Vec::new();
        for id in self.list_run_ids().await? {
            runs.push(self.load_run(id).await?);
        }
        Ok(runs)
    }

    /// Runs a restarted process must pick back up: `queued`, `running`, `compensating`.
    pub async fn list_recoverable(&self) -> Result<Vec<RunInstance>, CheckpointError> {
        let mut runs = Vec::new();
        for id in self.list_run_ids().await? {
            let (cell, _) = self.read_status(id).await?;
            if !cell.status.is_terminal() {
                runs.push(self.load_run(id).await?);
            }
        }
        Ok(runs)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn read_status(&self, run_id: Uuid) -> Result<(StatusCell, Value), CheckpointError> {
        let raw = self
            .store
            .read(&status_key(run_id))
            .await?
            .ok_or(CheckpointError::RunNotFound(run_id))?;
        let cell: StatusCell = serde_json::from_value(raw.clone())?;
        Ok((cell, raw))
    }

    /// The run's cursor, loading it from the step log on first use.
    async fn cursor(&self, run_id: Uuid) -> Result<Arc<Mutex<RunCursor>>, CheckpointError> {
        let cursor = self
            .cursors
            .entry(run_id)
            .or_insert_with(|| Arc::new(Mutex::new(RunCursor::default())))
            .clone();

        {
            let mut guard = cursor.lock().await;
            if !guard.loaded {
                for value in self.store.read_all(&steps_key(run_id)).await? {
                    let record: StepRecord = serde_json::from_value(value)?;
                    guard.next_seq = guard.next_seq.max(record.seq + 1);
                    let settled = guard
                        .latest
                        .get(&record.step_id)
                        .is_some_and(|existing| existing.status.is_terminal());
                    if !settled {
                        guard.latest.insert(record.step_id.clone(), record);
                    }
                }
                guard.next_seq = guard.next_seq.max(1);
                guard.loaded = true;
            }
        }
        Ok(cursor)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_types::error::ErrorClass;
    use sagaflow_types::workflow::WorkflowRef;
    use serde_json::json;

    use crate::storage::InMemoryStore;

    fn header() -> RunHeader {
        RunHeader {
            id: Uuid::now_v7(),
            workflow: WorkflowRef {
                intent: "book-trip".to_string(),
                version: 1,
            },
            priority: 3,
            deadline: None,
            tenant: "acme".to_string(),
            payload: json!({"city": "Lisbon"}),
            created_at: Utc::now(),
        }
    }

    async fn manager_with_run() -> (CheckpointManager<InMemoryStore>, Uuid) {
        let mgr = CheckpointManager::new(InMemoryStore::new());
        let h = header();
        mgr.create_run(&h).await.unwrap();
        (mgr, h.id)
    }

    #[tokio::test]
    async fn test_create_run_starts_queued() {
        let (mgr, run_id) = manager_with_run().await;
        let run = mgr.load_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.tenant, "acme");
        assert!(run.steps.is_empty());
        assert_eq!(mgr.list_run_ids().await.unwrap(), vec![run_id]);
    }

    #[tokio::test]
    async fn test_create_run_twice_conflicts() {
        let mgr = CheckpointManager::new(InMemoryStore::new());
        let h = header();
        mgr.create_run(&h).await.unwrap();
        assert!(matches!(
            mgr.create_run(&h).await,
            Err(CheckpointError::RunExists(_))
        ));
    }

    #[tokio::test]
    async fn test_step_start_assigns_sequence_and_key() {
        let (mgr, run_id) = manager_with_run().await;
        let a = mgr.step_start(run_id, "a").await.unwrap();
        mgr.complete(run_id, "a", json!(1), 0).await.unwrap();
        let b = mgr.step_start(run_id, "b").await.unwrap();

        assert_eq!(a.seq, 1);
        assert_eq!(a.idempotency_key, format!("{run_id}:a:1"));
        assert_eq!(b.seq, 3, "completion of a consumed seq 2");
        assert!(!a.resumed);
    }

    #[tokio::test]
    async fn test_checkpoint_replay_of_terminal_record_is_noop() {
        let (mgr, run_id) = manager_with_run().await;
        mgr.step_start(run_id, "a").await.unwrap();
        let first = mgr.complete(run_id, "a", json!({"ok": true}), 1).await.unwrap();
        assert!(matches!(first, CheckpointOutcome::Recorded(_)));

        let before = mgr.load_run(run_id).await.unwrap();
        let replay = mgr.load_run(run_id).await.unwrap().steps[0].clone();
        assert_eq!(mgr.checkpoint(run_id, replay).await.unwrap(), CheckpointOutcome::Ignored);
        assert_eq!(
            mgr.fail(run_id, "a", StepError::new(ErrorClass::Permanent, "late"), 0)
                .await
                .unwrap(),
            CheckpointOutcome::Ignored
        );

        let after = mgr.load_run(run_id).await.unwrap();
        assert_eq!(before.steps, after.steps);
        assert_eq!(before.sequence, after.sequence);
        assert_eq!(after.steps[0].status, StepStatus::Completed);
        assert_eq!(after.steps[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_completed_record_inherits_key_and_start() {
        let (mgr, run_id) = manager_with_run().await;
        let start = mgr.step_start(run_id, "a").await.unwrap();
        mgr.complete(run_id, "a", json!("done"), 0).await.unwrap();

        let run = mgr.load_run(run_id).await.unwrap();
        let rec = run.step("a").unwrap();
        assert_eq!(rec.idempotency_key.as_deref(), Some(start.idempotency_key.as_str()));
        assert!(rec.started_at.is_some());
        assert!(rec.ended_at.is_some());
        assert_eq!(rec.result, Some(json!("done")));
    }

    #[tokio::test]
    async fn test_restart_reuses_open_record_key() {
        let store = InMemoryStore::new();
        let h = header();
        let first = CheckpointManager::new(store.clone());
        first.create_run(&h).await.unwrap();
        first.step_start(h.id, "a").await.unwrap();
        first.complete(h.id, "a", json!(1), 0).await.unwrap();
        let open = first.step_start(h.id, "b").await.unwrap();
        drop(first);

        // Fresh manager over the same store simulates a process restart.
        let second = CheckpointManager::new(store);
        let resumed = second.step_start(h.id, "b").await.unwrap();
        assert!(resumed.resumed);
        assert_eq!(resumed.idempotency_key, open.idempotency_key);

        let next = second.step_start(h.id, "c").await.unwrap();
        assert_eq!(next.seq, open.seq + 1);
        assert!(matches!(
            second.step_start(h.id, "a").await,
            Err(CheckpointError::StepSettled { .. })
        ));
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_swap() {
        let (mgr, run_id) = manager_with_run().await;
        assert!(mgr.transition(run_id, RunStatus::Queued, RunStatus::Running, None).await.unwrap());
        assert!(!mgr.transition(run_id, RunStatus::Queued, RunStatus::Running, None).await.unwrap());
        assert!(mgr
            .transition(run_id, RunStatus::Running, RunStatus::Compensating, Some("step 'b' failed"))
            .await
            .unwrap());
        let cell = mgr.status(run_id).await.unwrap();
        assert_eq!(cell.status, RunStatus::Compensating);
        assert_eq!(cell.reason.as_deref(), Some("step 'b' failed"));
    }

    #[tokio::test]
    async fn test_finalize_idempotent_and_immutable() {
        let (mgr, run_id) = manager_with_run().await;
        mgr.finalize(run_id, RunStatus::Failed, Some("boom"), vec!["a".to_string()])
            .await
            .unwrap();
        mgr.finalize(run_id, RunStatus::Failed, Some("again"), vec![])
            .await
            .unwrap();
        assert!(matches!(
            mgr.finalize(run_id, RunStatus::Completed, None, vec![]).await,
            Err(CheckpointError::AlreadyFinalized {
                current: RunStatus::Failed,
                ..
            })
        ));

        let run = mgr.load_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.reason.as_deref(), Some("boom"));
        assert_eq!(run.compensation_failures, vec!["a".to_string()]);
        assert!(!mgr.transition(run_id, RunStatus::Running, RunStatus::Compensating, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_recoverable_filters_terminal() {
        let mgr = CheckpointManager::new(InMemoryStore::new());
        let (a, b, c) = (header(), header(), header());
        for h in [&a, &b, &c] {
            mgr.create_run(h).await.unwrap();
        }
        mgr.transition(b.id, RunStatus::Queued, RunStatus::Running, None).await.unwrap();
        mgr.finalize(c.id, RunStatus::Completed, None, vec![]).await.unwrap();

        let recoverable: Vec<Uuid> = mgr
            .list_recoverable()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(recoverable, vec![a.id, b.id]);
        assert_eq!(mgr.list_runs().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_load_unknown_run() {
        let mgr = CheckpointManager::new(InMemoryStore::new());
        assert!(matches!(
            mgr.load_run(Uuid::now_v7()).await,
            Err(CheckpointError::RunNotFound(_))
        ));
    }
}
