//! Event types for the sagaflow observability bus.
//!
//! `OrchestratorEvent` is the one-way event type broadcast while runs execute.
//! Nothing in control flow reads these back; they exist for logs, dashboards
//! and tests. All variants are Clone + Send + Sync for tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorClass;
use crate::workflow::{RunStatus, WorkflowRef};

/// Events emitted during run admission, execution and unwind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// A run was admitted and moved to `running`.
    RunAdmitted {
        run_id: Uuid,
        workflow: WorkflowRef,
        tenant: String,
        priority: u8,
    },

    /// A run could not be admitted immediately and was queued.
    RunQueued {
        run_id: Uuid,
        tenant: String,
        position: usize,
    },

    /// A queued run's effective priority improved through aging.
    RunPromoted {
        run_id: Uuid,
        from_priority: u8,
        to_priority: u8,
    },

    /// A run reached a terminal status.
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
        reason: Option<String>,
    },

    StepStarted {
        run_id: Uuid,
        step_id: String,
        capability: String,
        idempotency_key: String,
    },

    StepCompleted {
        run_id: Uuid,
        step_id: String,
        retries: u32,
        duration_ms: u64,
    },

    StepFailed {
        run_id: Uuid,
        step_id: String,
        class: ErrorClass,
        message: String,
        retries: u32,
    },

    /// A step's condition evaluated false, or its group was skipped.
    StepSkipped { run_id: Uuid, step_id: String },

    /// A dependency's breaker tripped open.
    CircuitOpened {
        dependency: String,
        consecutive_failures: u32,
    },

    /// A dependency's cool-down elapsed and trial calls are allowed.
    CircuitHalfOpened { dependency: String },

    /// A dependency recovered.
    CircuitClosed { dependency: String },

    CompensationStarted {
        run_id: Uuid,
        reason: String,
        steps: usize,
    },

    CompensationFinished {
        run_id: Uuid,
        compensated: Vec<String>,
        failed: Vec<String>,
    },
}

impl OrchestratorEvent {
    /// Extract the run_id from any run-scoped event variant.
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            Self::RunAdmitted { run_id, .. }
            | Self::RunQueued { run_id, .. }
            | Self::RunPromoted { run_id, .. }
            | Self::RunFinished { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::StepFailed { run_id, .. }
            | Self::StepSkipped { run_id, .. }
            | Self::CompensationStarted { run_id, .. }
            | Self::CompensationFinished { run_id, .. } => Some(*run_id),
            Self::CircuitOpened { .. }
            | Self::CircuitHalfOpened { .. }
            | Self::CircuitClosed { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_failed_serde_tag() {
        let run_id = Uuid::now_v7();
        let event = OrchestratorEvent::StepFailed {
            run_id,
            step_id: "charge".to_string(),
            class: ErrorClass::Timeout,
            message: "capability call timed out".to_string(),
            retries: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_failed");
        assert_eq!(json["class"], "timeout");
        assert_eq!(json["retries"], 2);

        let parsed: OrchestratorEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.run_id(), Some(run_id));
    }

    #[test]
    fn test_run_finished_serde() {
        let event = OrchestratorEvent::RunFinished {
            run_id: Uuid::now_v7(),
            status: RunStatus::Failed,
            reason: Some("step 'charge' failed".to_string()),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"run_finished\""));
        assert!(json.contains("\"status\":\"failed\""));
    }

    #[test]
    fn test_circuit_events_have_no_run_id() {
        let opened = OrchestratorEvent::CircuitOpened {
            dependency: "payments".to_string(),
            consecutive_failures: 3,
        };
        assert_eq!(opened.run_id(), None);
        assert_eq!(
            OrchestratorEvent::CircuitClosed {
                dependency: "payments".to_string()
            }
            .run_id(),
            None
        );
    }
}
