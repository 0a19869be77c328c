//! Shared fixtures for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sagaflow_types::config::{DEFAULT_RETRY_POLICY, EngineConfig, RetryPolicyConfig};
use sagaflow_types::error::StepFailure;
use sagaflow_types::workflow::{
    Compensation, Criticality, ExecutionMode, StepSpec, WorkflowDefinition,
};
use serde_json::{Value, json};

use crate::capability::executor::{StepExecutor, StepRequest};

pub(crate) fn step(id: &str, deps: &[&str]) -> StepSpec {
    StepSpec {
        id: id.to_string(),
        capability: "agent".to_string(),
        mode: ExecutionMode::Sequential,
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        compensation: Compensation::Capability("undo".to_string()),
        timeout_ms: None,
        retry_policy: None,
        condition: None,
        criticality: Criticality::Critical,
        dependency: None,
    }
}

pub(crate) fn member(id: &str, group: &str, deps: &[&str]) -> StepSpec {
    StepSpec {
        mode: ExecutionMode::ParallelMember {
            group: group.to_string(),
        },
        ..step(id, deps)
    }
}

pub(crate) fn barrier(id: &str, group: &str, deps: &[&str]) -> StepSpec {
    StepSpec {
        mode: ExecutionMode::ParallelBarrier {
            group: group.to_string(),
        },
        ..step(id, deps)
    }
}

pub(crate) fn workflow(intent: &str, steps: Vec<StepSpec>) -> WorkflowDefinition {
    WorkflowDefinition {
        intent: intent.to_string(),
        version: 1,
        description: None,
        steps,
        metadata: HashMap::new(),
    }
}

/// Each step gets its own capability `<id>-agent` and compensation `<id>-undo`,
/// so scripted executors can target steps individually.
pub(crate) fn distinct(mut spec: StepSpec) -> StepSpec {
    spec.capability = format!("{}-agent", spec.id);
    spec.compensation = Compensation::Capability(format!("{}-undo", spec.id));
    spec
}

/// Fast, jitter-free config: two attempts, 10 ms backoff, 1 s step timeout.
pub(crate) fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.engine.default_step_timeout_ms = 1_000;
    config.retry_policies.insert(
        DEFAULT_RETRY_POLICY.to_string(),
        RetryPolicyConfig {
            max_attempts: 2,
            initial_backoff_ms: 10,
            max_backoff_ms: 10,
            multiplier: 1.0,
            jitter: 0.0,
        },
    );
    config.normalized()
}

// ---------------------------------------------------------------------------
// Scripted executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) enum Script {
    Succeed(Value),
    Fail(StepFailure),
    /// Succeeds after sleeping.
    Delay(Duration, Value),
    /// Never returns; the engine's timeout has to cut it off.
    Hang,
}

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub capability: String,
    pub step_id: String,
    pub idempotency_key: String,
    pub input: Value,
}

/// Executor whose outcomes are scripted per capability.
///
/// Queued outcomes are consumed first, then the capability's standing
/// outcome, then a default success echoing the step ID. Clones share state.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedExecutor {
    queued: Arc<Mutex<HashMap<String, VecDeque<Script>>>>,
    standing: Arc<Mutex<HashMap<String, Script>>>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot outcome for the next call to `capability`.
    pub fn then(&self, capability: &str, script: Script) -> &Self {
        self.queued
            .lock()
            .unwrap()
            .entry(capability.to_string())
            .or_default()
            .push_back(script);
        self
    }

    /// Outcome for every call to `capability` once queued outcomes run out.
    pub fn always(&self, capability: &str, script: Script) -> &Self {
        self.standing
            .lock()
            .unwrap()
            .insert(capability.to_string(), script);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, capability: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.capability == capability)
            .count()
    }

    /// Capabilities invoked, in call order.
    pub fn capabilities_called(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.capability.clone())
            .collect()
    }

    fn next_script(&self, capability: &str) -> Option<Script> {
        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(capability)
            .and_then(VecDeque::pop_front);
        queued.or_else(|| self.standing.lock().unwrap().get(capability).cloned())
    }
}

impl StepExecutor for ScriptedExecutor {
    async fn invoke(&self, request: &StepRequest) -> Result<Value, StepFailure> {
        self.calls.lock().unwrap().push(Call {
            capability: request.capability.clone(),
            step_id: request.step_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            input: request.input.clone(),
        });
        match self.next_script(&request.capability) {
            Some(Script::Succeed(value)) => Ok(value),
            Some(Script::Fail(failure)) => Err(failure),
            Some(Script::Delay(delay, value)) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Some(Script::Hang) => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Ok(Value::Null)
            }
            None => Ok(json!({ "step": request.step_id })),
        }
    }
}
