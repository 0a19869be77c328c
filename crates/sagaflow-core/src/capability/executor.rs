//! StepExecutor trait definition.
//!
//! This is the seam between the engine and the capability units ("agents").
//! Uses native async fn in traits (RPITIT, Rust 2024 edition); see
//! `BoxStepExecutor` for dynamic dispatch.

use std::collections::HashMap;
use std::time::Duration;

use sagaflow_types::error::StepFailure;
use serde_json::Value;
use uuid::Uuid;

/// Everything a capability receives for one invocation.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub run_id: Uuid,
    pub step_id: String,
    /// Capability to invoke (the step's, or its compensating capability).
    pub capability: String,
    /// Context payload from the context provider, passed through unmodified.
    pub payload: Value,
    /// Run request payload for forward steps, original step result for compensations.
    pub input: Value,
    /// Outputs of completed upstream steps keyed by step ID.
    pub upstream: HashMap<String, Value>,
    /// Stable across retries and resumes. Honouring it is the capability's job.
    pub idempotency_key: String,
    /// Hard per-call timeout the engine enforces.
    pub timeout: Duration,
}

/// Trait for invoking capability units.
///
/// Implementations must be safe to call more than once with the same
/// `idempotency_key`; the engine guarantees at-least-once delivery only.
pub trait StepExecutor: Send + Sync {
    /// Invoke one capability and return its result payload or a classified failure.
    fn invoke(
        &self,
        request: &StepRequest,
    ) -> impl std::future::Future<Output = Result<Value, StepFailure>> + Send;
}
