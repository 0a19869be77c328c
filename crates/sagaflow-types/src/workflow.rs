//! Workflow domain types for sagaflow.
//!
//! Defines the canonical workflow shape (`WorkflowDefinition` / `StepSpec`)
//! that YAML files and programmatic builders convert into, plus the execution
//! tracking types (`RunInstance`, `StepRecord`, `CompensationRecord`) that the
//! run-state store persists.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StepError;

// ---------------------------------------------------------------------------
// Workflow Definition (canonical IR)
// ---------------------------------------------------------------------------

/// An immutable, versioned workflow for one intent.
///
/// Identified by `(intent, version)`. Once registered in the catalog a
/// definition is never mutated; a changed plan is a new version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Intent tag this workflow serves (e.g. "book-trip").
    pub intent: String,
    /// Monotonic version number within the intent.
    pub version: u32,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered list of step specs forming the workflow DAG.
    pub steps: Vec<StepSpec>,
    /// Extensible metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl WorkflowDefinition {
    /// The `(intent, version)` reference a run pins itself to.
    pub fn reference(&self) -> WorkflowRef {
        WorkflowRef {
            intent: self.intent.clone(),
            version: self.version,
        }
    }

    /// Look up a step by ID.
    pub fn step(&self, step_id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}

/// Reference to one exact workflow version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowRef {
    pub intent: String,
    pub version: u32,
}

impl fmt::Display for WorkflowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.intent, self.version)
    }
}

// ---------------------------------------------------------------------------
// Step Spec
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step ID, unique within a workflow (e.g. "reserve-hotel").
    pub id: String,
    /// Capability (agent) invoked by this step.
    pub capability: String,
    /// How the step is scheduled relative to its siblings.
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Step IDs this step depends on (DAG edges).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Compensation declaration. Required: irreversibility must be explicit.
    pub compensation: Compensation,
    /// Step-level timeout in milliseconds (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Named retry policy (engine `default` policy when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<String>,
    /// Optional JEXL branch predicate over prior step outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Whether a failure of this step unwinds the run.
    #[serde(default)]
    pub criticality: Criticality,
    /// External dependency name for circuit breaking (defaults to the capability).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,
}

impl StepSpec {
    /// The dependency name the fault isolator tracks for this step.
    pub fn dependency_name(&self) -> &str {
        self.dependency.as_deref().unwrap_or(&self.capability)
    }

    /// The compensating capability, if one is declared.
    pub fn compensating_capability(&self) -> Option<&str> {
        match &self.compensation {
            Compensation::Capability(name) => Some(name.as_str()),
            Compensation::Irreversible => None,
        }
    }

    /// The barrier group this step belongs to or closes, if any.
    pub fn group(&self) -> Option<&str> {
        match &self.mode {
            ExecutionMode::Sequential => None,
            ExecutionMode::ParallelMember { group } | ExecutionMode::ParallelBarrier { group } => {
                Some(group.as_str())
            }
        }
    }

    pub fn is_parallel_member(&self) -> bool {
        matches!(self.mode, ExecutionMode::ParallelMember { .. })
    }

    pub fn is_barrier(&self) -> bool {
        matches!(self.mode, ExecutionMode::ParallelBarrier { .. })
    }
}

/// Scheduling mode of a step.
///
/// Internally tagged by `type` to match YAML structure:
/// ```yaml
/// mode:
///   type: parallel_member
///   group: research
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Runs alone, one at a time within its level.
    #[default]
    Sequential,
    /// Runs concurrently with the other members of `group`.
    ParallelMember { group: String },
    /// Closes `group`: runs only once every member has settled.
    ParallelBarrier { group: String },
}

/// Compensation declared for a step.
///
/// ```yaml
/// compensation: irreversible
/// # or
/// compensation:
///   capability: release-seat
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "CompensationRepr", into = "CompensationRepr")]
pub enum Compensation {
    /// The side effect is accepted as irreversible; nothing runs on unwind.
    Irreversible,
    /// Invoke this capability with the step's result to undo it.
    Capability(String),
}

/// Wire shape of `Compensation`: a bare keyword or a `capability` map.
#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum CompensationRepr {
    Keyword(CompensationKeyword),
    Capability { capability: String },
}

#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum CompensationKeyword {
    Irreversible,
}

impl From<CompensationRepr> for Compensation {
    fn from(repr: CompensationRepr) -> Self {
        match repr {
            CompensationRepr::Keyword(CompensationKeyword::Irreversible) => Compensation::Irreversible,
            CompensationRepr::Capability { capability } => Compensation::Capability(capability),
        }
    }
}

impl From<Compensation> for CompensationRepr {
    fn from(compensation: Compensation) -> Self {
        match compensation {
            Compensation::Irreversible => CompensationRepr::Keyword(CompensationKeyword::Irreversible),
            Compensation::Capability(capability) => CompensationRepr::Capability { capability },
        }
    }
}

/// Failure policy of a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// A failure unwinds the whole run.
    #[default]
    Critical,
    /// A failure is recorded and the run continues.
    BestEffort,
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Compensating,
    Completed,
    Failed,
    Expired,
}

impl RunStatus {
    /// Terminal states are immutable once reached.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Compensating => "compensating",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "compensating" => Ok(RunStatus::Compensating),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "expired" => Ok(RunStatus::Expired),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Status of one step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

// ---------------------------------------------------------------------------
// Step records
// ---------------------------------------------------------------------------

/// Execution record of one step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step ID matching `StepSpec.id`.
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Result payload produced by the capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Classified failure, if the step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Retries consumed (0 when the first attempt settled the step).
    #[serde(default)]
    pub retry_count: u32,
    /// Idempotency key handed to the capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Run-wide sequence number assigned when checkpointed.
    #[serde(default)]
    pub seq: u64,
}

impl StepRecord {
    /// A fresh record in the given status with no timing information.
    pub fn new(step_id: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step_id: step_id.into(),
            status,
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
            retry_count: 0,
            idempotency_key: None,
            seq: 0,
        }
    }
}

/// Outcome of compensating one completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompensationOutcome {
    /// The compensating capability succeeded.
    Compensated,
    /// The step was declared irreversible; nothing ran.
    Irreversible,
    /// The compensating capability itself failed.
    Failed { error: StepError },
}

/// Persisted result of unwinding one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    pub outcome: CompensationOutcome,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Run instance
// ---------------------------------------------------------------------------

/// Immutable facts about a run, fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHeader {
    pub id: Uuid,
    pub workflow: WorkflowRef,
    /// Lower is more urgent; 0 is the highest urgency.
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub tenant: String,
    /// Request payload handed to every step as `input`.
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One execution of a workflow definition, reconstructed from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInstance {
    pub id: Uuid,
    pub workflow: WorkflowRef,
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub tenant: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub status: RunStatus,
    /// Terminal (or compensation-triggering) reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// One record per executed or attempted step, in sequence order.
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub compensations: Vec<CompensationRecord>,
    /// Steps whose compensation failed, for manual remediation.
    #[serde(default)]
    pub compensation_failures: Vec<String>,
    /// Highest sequence number assigned so far.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunInstance {
    /// Latest record for a step, if the step was ever attempted.
    pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|r| r.step_id == step_id)
    }

    /// Completed records ordered by completion (most recent last).
    pub fn completed_steps(&self) -> Vec<&StepRecord> {
        let mut completed: Vec<&StepRecord> = self
            .steps
            .iter()
            .filter(|r| r.status == StepStatus::Completed)
            .collect();
        completed.sort_by_key(|r| r.seq);
        completed
    }

    /// Whether an unwind outcome was already recorded for a step.
    pub fn is_compensation_recorded(&self, step_id: &str) -> bool {
        self.compensations.iter().any(|c| c.step_id == step_id)
    }

    /// Caller-facing summary.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id,
            workflow: self.workflow.clone(),
            tenant: self.tenant.clone(),
            priority: self.priority,
            deadline: self.deadline,
            status: self.status,
            reason: self.reason.clone(),
            steps: self
                .steps
                .iter()
                .map(|r| StepSummary {
                    step_id: r.step_id.clone(),
                    status: r.status,
                    retry_count: r.retry_count,
                })
                .collect(),
            compensation_failures: self.compensation_failures.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// What callers see of a run: status, reason and per-step progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub workflow: WorkflowRef,
    pub tenant: String,
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub steps: Vec<StepSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensation_failures: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_id: String,
    pub status: StepStatus,
    pub retry_count: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TRIP_YAML: &str = r#"
intent: book-trip
version: 2
description: Reserve flight and hotel in parallel, then charge
steps:
  - id: quote
    capability: pricing-agent
    compensation: irreversible
  - id: flight
    capability: flight-agent
    depends_on: [quote]
    mode:
      type: parallel_member
      group: reserve
    compensation:
      capability: flight-cancel
    timeout_ms: 5000
  - id: hotel
    capability: hotel-agent
    depends_on: [quote]
    mode:
      type: parallel_member
      group: reserve
    compensation:
      capability: hotel-cancel
    retry_policy: patient
  - id: join
    capability: itinerary-agent
    mode:
      type: parallel_barrier
      group: reserve
    compensation: irreversible
  - id: upsell
    capability: upsell-agent
    depends_on: [join]
    condition: "input.tier == 'gold'"
    criticality: best_effort
    compensation: irreversible
"#;

    #[test]
    fn test_definition_yaml_parse() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(TRIP_YAML).expect("parse");
        assert_eq!(def.intent, "book-trip");
        assert_eq!(def.version, 2);
        assert_eq!(def.steps.len(), 5);

        let quote = def.step("quote").unwrap();
        assert_eq!(quote.mode, ExecutionMode::Sequential);
        assert_eq!(quote.compensation, Compensation::Irreversible);
        assert_eq!(quote.criticality, Criticality::Critical);

        let flight = def.step("flight").unwrap();
        assert!(flight.is_parallel_member());
        assert_eq!(flight.group(), Some("reserve"));
        assert_eq!(flight.compensating_capability(), Some("flight-cancel"));
        assert_eq!(flight.timeout_ms, Some(5000));

        let join = def.step("join").unwrap();
        assert!(join.is_barrier());

        let upsell = def.step("upsell").unwrap();
        assert_eq!(upsell.criticality, Criticality::BestEffort);
        assert!(upsell.condition.is_some());
    }

    #[test]
    fn test_compensation_is_required() {
        let yaml = r#"
intent: x
version: 1
steps:
  - id: a
    capability: agent
"#;
        let parsed: Result<WorkflowDefinition, _> = serde_yaml_ng::from_str(yaml);
        assert!(parsed.is_err(), "missing compensation must not parse");
    }

    #[test]
    fn test_compensation_wire_shape() {
        assert_eq!(
            serde_json::to_value(Compensation::Capability("flight-cancel".to_string())).unwrap(),
            json!({"capability": "flight-cancel"})
        );
        assert_eq!(serde_json::to_value(Compensation::Irreversible).unwrap(), json!("irreversible"));

        let parsed: Compensation = serde_yaml_ng::from_str("capability: hotel-cancel").unwrap();
        assert_eq!(parsed, Compensation::Capability("hotel-cancel".to_string()));
        let parsed: Compensation = serde_yaml_ng::from_str("irreversible").unwrap();
        assert_eq!(parsed, Compensation::Irreversible);

        assert!(serde_yaml_ng::from_str::<Compensation>("reversible").is_err());
        assert!(serde_yaml_ng::from_str::<Compensation>("undo: hotel-cancel").is_err());
    }

    #[test]
    fn test_dependency_name_defaults_to_capability() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(TRIP_YAML).unwrap();
        assert_eq!(def.step("quote").unwrap().dependency_name(), "pricing-agent");

        let mut step = def.step("quote").unwrap().clone();
        step.dependency = Some("pricing-api".to_string());
        assert_eq!(step.dependency_name(), "pricing-api");
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Compensating.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Expired.is_terminal());
    }

    #[test]
    fn test_run_status_from_str() {
        assert_eq!("compensating".parse::<RunStatus>().unwrap(), RunStatus::Compensating);
        assert!("paused".parse::<RunStatus>().is_err());
        assert_eq!(RunStatus::Expired.to_string(), "expired");
    }

    #[test]
    fn test_step_status_serde() {
        let json = serde_json::to_string(&StepStatus::Skipped).unwrap();
        assert_eq!(json, "\"skipped\"");
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
    }

    #[test]
    fn test_completed_steps_ordered_by_seq() {
        let now = Utc::now();
        let mut a = StepRecord::new("a", StepStatus::Completed);
        a.seq = 4;
        let mut b = StepRecord::new("b", StepStatus::Completed);
        b.seq = 2;
        let c = StepRecord::new("c", StepStatus::Skipped);
        let run = RunInstance {
            id: Uuid::now_v7(),
            workflow: WorkflowRef {
                intent: "x".to_string(),
                version: 1,
            },
            priority: 3,
            deadline: None,
            tenant: "acme".to_string(),
            payload: json!({}),
            status: RunStatus::Running,
            reason: None,
            steps: vec![a, b, c],
            compensations: vec![],
            compensation_failures: vec![],
            sequence: 4,
            created_at: now,
            updated_at: now,
        };

        let ids: Vec<&str> = run.completed_steps().iter().map(|r| r.step_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        let summary = run.summary();
        assert_eq!(summary.steps.len(), 3);
        assert_eq!(summary.status, RunStatus::Running);
    }

    #[test]
    fn test_workflow_ref_display() {
        let r = WorkflowRef {
            intent: "book-trip".to_string(),
            version: 3,
        };
        assert_eq!(r.to_string(), "book-trip@v3");
    }
}
