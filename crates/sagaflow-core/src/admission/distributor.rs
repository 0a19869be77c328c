//! Priority distributor: admission control for runs.
//!
//! One structure behind one mutex holds the running set, the queue and the
//! timing history, so every admission decision sees a consistent view of
//! current concurrency. The distributor only decides; persisting the
//! resulting status changes is the orchestrator's job.
//!
//! Ordering: lowest effective priority first, ties by enqueue order. A queued
//! run's effective priority improves by one per starvation threshold waited,
//! down to 0, so an old run eventually outranks any newcomer.
//!
//! Methods take `now` explicitly so aging and deadline checks are
//! deterministic under test.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sagaflow_types::config::DistributorConfig;
use sagaflow_types::workflow::WorkflowRef;
use serde::Serialize;
use uuid::Uuid;

use super::timing::TimingEstimator;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A pending run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub run_id: Uuid,
    pub workflow: WorkflowRef,
    pub tenant: String,
    /// Priority the run was submitted with.
    pub priority: u8,
    /// Priority after aging; what ordering uses.
    pub effective_priority: u8,
    pub deadline: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    seq: u64,
}

impl QueueEntry {
    pub fn new(
        run_id: Uuid,
        workflow: WorkflowRef,
        tenant: impl Into<String>,
        priority: u8,
        deadline: Option<DateTime<Utc>>,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            workflow,
            tenant: tenant.into(),
            priority,
            effective_priority: priority,
            deadline,
            enqueued_at,
            seq: 0,
        }
    }

    fn order_key(&self) -> (u8, DateTime<Utc>, u64) {
        (self.effective_priority, self.enqueued_at, self.seq)
    }
}

/// Outcome of `submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A slot was taken; the run may start now.
    Admitted,
    /// Queued at this 1-based position in dispatch order.
    Queued { position: usize },
    /// The deadline cannot be met even if the run started now.
    Unreachable { estimate: Option<Duration> },
}

/// A queued run whose effective priority improved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub run_id: Uuid,
    pub from: u8,
    pub to: u8,
}

/// Everything one `dispatch` pass decided. Removed entries are returned so
/// the caller can persist their new status.
#[derive(Debug, Clone, Default)]
pub struct Dispatch {
    pub admitted: Vec<QueueEntry>,
    /// Deadline passed while queued.
    pub expired: Vec<QueueEntry>,
    /// Deadline can no longer be met given the workflow's historical duration.
    pub unreachable: Vec<QueueEntry>,
    pub promoted: Vec<Promotion>,
}

impl Dispatch {
    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty()
            && self.expired.is_empty()
            && self.unreachable.is_empty()
            && self.promoted.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TenantStats {
    pub running: usize,
    pub queued: usize,
    pub quota: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DistributorStats {
    pub running: usize,
    pub queued: usize,
    pub max_concurrent_runs: usize,
    pub tenants: BTreeMap<String, TenantStats>,
}

#[derive(Debug, Clone)]
struct Slot {
    tenant: String,
    workflow: WorkflowRef,
}

#[derive(Debug)]
struct QueueState {
    running: HashMap<Uuid, Slot>,
    running_per_tenant: HashMap<String, usize>,
    queue: Vec<QueueEntry>,
    next_seq: u64,
    timing: TimingEstimator,
}

// ---------------------------------------------------------------------------
// Distributor
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Distributor {
    config: DistributorConfig,
    state: Mutex<QueueState>,
}

impl Distributor {
    pub fn new(config: DistributorConfig) -> Self {
        let timing = TimingEstimator::new(config.timing_window);
        Self {
            config,
            state: Mutex::new(QueueState {
                running: HashMap::new(),
                running_per_tenant: HashMap::new(),
                queue: Vec::new(),
                next_seq: 0,
                timing,
            }),
        }
    }

    /// Admit the run if the global limit and its tenant quota allow, else queue it.
    pub fn submit(&self, mut entry: QueueEntry, now: DateTime<Utc>) -> Admission {
        let mut state = self.state.lock().expect("distributor lock poisoned");

        if let Some(deadline) = entry.deadline {
            let estimate = state.timing.estimate(&entry.workflow);
            if !reachable(deadline, estimate, now) {
                tracing::info!(run_id = %entry.run_id, %deadline, ?estimate, "deadline unreachable at submission");
                return Admission::Unreachable { estimate };
            }
        }

        if self.has_capacity(&state, &entry.tenant) {
            occupy(&mut state, entry.run_id, &entry.tenant, &entry.workflow);
            tracing::debug!(run_id = %entry.run_id, tenant = %entry.tenant, "admitted immediately");
            return Admission::Admitted;
        }

        entry.seq = state.next_seq;
        state.next_seq += 1;
        let run_id = entry.run_id;
        state.queue.push(entry);
        sort_queue(&mut state.queue);
        let position = position_of(&state.queue, run_id).unwrap_or(state.queue.len());
        tracing::debug!(run_id = %run_id, position, queued = state.queue.len(), "queued");
        Admission::Queued { position }
    }

    /// Free a run's slot. `duration` feeds the timing history when the run completed.
    pub fn release(&self, run_id: Uuid, duration: Option<Duration>) -> bool {
        let mut state = self.state.lock().expect("distributor lock poisoned");
        let Some(slot) = state.running.remove(&run_id) else {
            return false;
        };
        if let Some(count) = state.running_per_tenant.get_mut(&slot.tenant) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.running_per_tenant.remove(&slot.tenant);
            }
        }
        if let Some(duration) = duration {
            state.timing.record(&slot.workflow, duration);
        }
        true
    }

    /// Age the queue, drop runs whose deadline passed or became unreachable,
    /// then admit as many runs as capacity allows, in order.
    pub fn dispatch(&self, now: DateTime<Utc>) -> Dispatch {
        let mut state = self.state.lock().expect("distributor lock poisoned");
        let mut out = Dispatch::default();
        let threshold = self.config.starvation_threshold_secs.max(1) as i64;

        let queue = std::mem::take(&mut state.queue);
        let mut kept = Vec::with_capacity(queue.len());
        for mut entry in queue {
            let waited = (now - entry.enqueued_at).num_seconds().max(0);
            let steps = u8::try_from(waited / threshold).unwrap_or(u8::MAX);
            let aged = entry.priority.saturating_sub(steps);
            if aged < entry.effective_priority {
                out.promoted.push(Promotion {
                    run_id: entry.run_id,
                    from: entry.effective_priority,
                    to: aged,
                });
                entry.effective_priority = aged;
            }

            let deadline = entry.deadline;
            match deadline {
                Some(deadline) if deadline <= now => out.expired.push(entry),
                Some(deadline) if !reachable(deadline, state.timing.estimate(&entry.workflow), now) => {
                    out.unreachable.push(entry)
                }
                _ => kept.push(entry),
            }
        }
        sort_queue(&mut kept);

        let mut waiting = Vec::with_capacity(kept.len());
        for entry in kept {
            if self.has_capacity(&state, &entry.tenant) {
                occupy(&mut state, entry.run_id, &entry.tenant, &entry.workflow);
                out.admitted.push(entry);
            } else {
                waiting.push(entry);
            }
        }
        state.queue = waiting;

        if !out.is_empty() {
            tracing::debug!(
                admitted = out.admitted.len(),
                expired = out.expired.len(),
                unreachable = out.unreachable.len(),
                promoted = out.promoted.len(),
                queued = state.queue.len(),
                "dispatch pass"
            );
        }
        out
    }

    /// Take a queued run out of the queue (cancellation).
    pub fn remove(&self, run_id: Uuid) -> Option<QueueEntry> {
        let mut state = self.state.lock().expect("distributor lock poisoned");
        let idx = state.queue.iter().position(|e| e.run_id == run_id)?;
        Some(state.queue.remove(idx))
    }

    /// Re-occupy a slot for a run recovered in `running`/`compensating`.
    ///
    /// Recovered runs already hold side effects, so they are never refused.
    pub fn restore_running(&self, run_id: Uuid, tenant: &str, workflow: &WorkflowRef) {
        let mut state = self.state.lock().expect("distributor lock poisoned");
        if !state.running.contains_key(&run_id) {
            occupy(&mut state, run_id, tenant, workflow);
        }
    }

    /// Queue a recovered `queued` run with its original enqueue time.
    pub fn enqueue_recovered(&self, mut entry: QueueEntry) {
        let mut state = self.state.lock().expect("distributor lock poisoned");
        entry.seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(entry);
        sort_queue(&mut state.queue);
    }

    /// 1-based position of a queued run in dispatch order.
    pub fn position(&self, run_id: Uuid) -> Option<usize> {
        let state = self.state.lock().expect("distributor lock poisoned");
        position_of(&state.queue, run_id)
    }

    pub fn is_running(&self, run_id: Uuid) -> bool {
        let state = self.state.lock().expect("distributor lock poisoned");
        state.running.contains_key(&run_id)
    }

    pub fn estimate(&self, workflow: &WorkflowRef) -> Option<Duration> {
        let state = self.state.lock().expect("distributor lock poisoned");
        state.timing.estimate(workflow)
    }

    pub fn stats(&self) -> DistributorStats {
        let state = self.state.lock().expect("distributor lock poisoned");
        let mut tenants: BTreeMap<String, TenantStats> = BTreeMap::new();
        for slot in state.running.values() {
            tenants.entry(slot.tenant.clone()).or_default().running += 1;
        }
        for entry in &state.queue {
            tenants.entry(entry.tenant.clone()).or_default().queued += 1;
        }
        for (tenant, stats) in tenants.iter_mut() {
            stats.quota = self.quota(tenant);
        }
        DistributorStats {
            running: state.running.len(),
            queued: state.queue.len(),
            max_concurrent_runs: self.config.max_concurrent_runs,
            tenants,
        }
    }

    fn quota(&self, tenant: &str) -> usize {
        self.config
            .tenant_quotas
            .get(tenant)
            .copied()
            .unwrap_or(self.config.default_tenant_quota)
    }

    fn has_capacity(&self, state: &QueueState, tenant: &str) -> bool {
        let tenant_running = state.running_per_tenant.get(tenant).copied().unwrap_or(0);
        state.running.len() < self.config.max_concurrent_runs && tenant_running < self.quota(tenant)
    }
}

fn occupy(state: &mut QueueState, run_id: Uuid, tenant: &str, workflow: &WorkflowRef) {
    state.running.insert(
        run_id,
        Slot {
            tenant: tenant.to_string(),
            workflow: workflow.clone(),
        },
    );
    *state.running_per_tenant.entry(tenant.to_string()).or_default() += 1;
}

fn sort_queue(queue: &mut [QueueEntry]) {
    queue.sort_by_key(QueueEntry::order_key);
}

fn position_of(queue: &[QueueEntry], run_id: Uuid) -> Option<usize> {
    queue.iter().position(|e| e.run_id == run_id).map(|i| i + 1)
}

/// Whether a run started at `now` can finish by `deadline`.
fn reachable(deadline: DateTime<Utc>, estimate: Option<Duration>, now: DateTime<Utc>) -> bool {
    if deadline <= now {
        return false;
    }
    match estimate.and_then(|e| chrono::Duration::from_std(e).ok()) {
        Some(estimate) => now + estimate <= deadline,
        None => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
