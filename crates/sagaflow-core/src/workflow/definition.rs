//! Workflow definition parsing, validation, and filesystem loading.
//!
//! Converts YAML files into the canonical `WorkflowDefinition` IR and checks
//! every structural constraint a definition must satisfy before the catalog
//! accepts it: unique step IDs, known dependencies, well-formed parallel
//! groups, declared capabilities and retry policies, and acyclicity.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use sagaflow_types::config::EngineConfig;
use sagaflow_types::workflow::{ExecutionMode, WorkflowDefinition};
use thiserror::Error;

use super::dag;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// A structural defect that makes a definition unregistrable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphViolation {
    MissingIntent,
    EmptyWorkflow,
    DuplicateStep(String),
    UnknownDependency { step: String, dependency: String },
    Cycle(String),
    /// A parallel member whose group has no barrier.
    OrphanMember { step: String, group: String },
    /// A barrier whose group has no members.
    UnreachableBarrier { step: String, group: String },
    DuplicateBarrier { group: String },
    /// Members of one group must share the same upstream set.
    DivergentMembers { group: String },
    UndefinedCapability { step: String, capability: String },
    UndefinedCompensation { step: String, capability: String },
    UnknownRetryPolicy { step: String, policy: String },
}

impl fmt::Display for GraphViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingIntent => write!(f, "workflow intent must not be empty"),
            Self::EmptyWorkflow => write!(f, "workflow must have at least one step"),
            Self::DuplicateStep(id) => write!(f, "duplicate step ID: '{id}'"),
            Self::UnknownDependency { step, dependency } => {
                write!(f, "step '{step}' depends on unknown step '{dependency}'")
            }
            Self::Cycle(id) => write!(f, "cycle detected involving step '{id}'"),
            Self::OrphanMember { step, group } => {
                write!(f, "parallel member '{step}' belongs to group '{group}' which has no barrier")
            }
            Self::UnreachableBarrier { step, group } => {
                write!(f, "barrier '{step}' closes group '{group}' which has no members")
            }
            Self::DuplicateBarrier { group } => {
                write!(f, "group '{group}' is closed by more than one barrier")
            }
            Self::DivergentMembers { group } => {
                write!(f, "members of group '{group}' have different upstream steps")
            }
            Self::UndefinedCapability { step, capability } => {
                write!(f, "step '{step}' invokes undeclared capability '{capability}'")
            }
            Self::UndefinedCompensation { step, capability } => {
                write!(f, "step '{step}' compensates with undeclared capability '{capability}'")
            }
            Self::UnknownRetryPolicy { step, policy } => {
                write!(f, "step '{step}' references unknown retry policy '{policy}'")
            }
        }
    }
}

/// Errors that can occur during catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The step graph violates a structural constraint.
    #[error("invalid graph: {0}")]
    InvalidGraph(GraphViolation),

    /// `(intent, version)` is already registered; registration is append-only.
    #[error("workflow '{intent}' version {version} already exists")]
    VersionExists { intent: String, version: u32 },

    #[error("workflow '{intent}' not found (requested version: {version:?})")]
    NotFound { intent: String, version: Option<u32> },

    /// YAML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<GraphViolation> for CatalogError {
    fn from(v: GraphViolation) -> Self {
        CatalogError::InvalidGraph(v)
    }
}

// ---------------------------------------------------------------------------
// Known references
// ---------------------------------------------------------------------------

/// Names a definition is allowed to reference.
#[derive(Debug, Clone, Default)]
pub struct KnownReferences {
    /// Declared capabilities. `None` disables the capability check.
    pub capabilities: Option<HashSet<String>>,
    pub retry_policies: HashSet<String>,
}

impl KnownReferences {
    pub fn new<C, P>(capabilities: C, retry_policies: P) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Self {
            capabilities: Some(capabilities.into_iter().map(Into::into).collect()),
            retry_policies: retry_policies.into_iter().map(Into::into).collect(),
        }
    }

    /// Derive references from engine config.
    ///
    /// An empty `engine.capabilities` list leaves capability names unchecked.
    pub fn from_config(config: &EngineConfig) -> Self {
        let capabilities = if config.engine.capabilities.is_empty() {
            None
        } else {
            Some(config.engine.capabilities.iter().cloned().collect())
        };
        let mut retry_policies: HashSet<String> = config.retry_policies.keys().cloned().collect();
        retry_policies.insert(sagaflow_types::config::DEFAULT_RETRY_POLICY.to_string());
        Self {
            capabilities,
            retry_policies,
        }
    }

    fn has_capability(&self, name: &str) -> bool {
        self.capabilities.as_ref().is_none_or(|caps| caps.contains(name))
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a `WorkflowDefinition` (structure only, not validated).
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, CatalogError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| CatalogError::ParseError(e.to_string()))
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, CatalogError> {
    serde_yaml_ng::to_string(def).map_err(|e| CatalogError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate every structural constraint on a `WorkflowDefinition`.
///
/// Checks, in order:
/// - Intent is non-empty and at least one step exists
/// - Step IDs are unique and every `depends_on` entry names a step
/// - Every parallel group has members and exactly one barrier
/// - Members of one group share an identical upstream set
/// - Capabilities, compensations and retry policies are declared
/// - The graph (including implicit member -> barrier edges) is acyclic
pub fn validate_definition(
    def: &WorkflowDefinition,
    known: &KnownReferences,
) -> Result<(), GraphViolation> {
    if def.intent.trim().is_empty() {
        return Err(GraphViolation::MissingIntent);
    }
    if def.steps.is_empty() {
        return Err(GraphViolation::EmptyWorkflow);
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if !seen_ids.insert(step.id.as_str()) {
            return Err(GraphViolation::DuplicateStep(step.id.clone()));
        }
    }

    for step in &def.steps {
        for dep in &step.depends_on {
            if !seen_ids.contains(dep.as_str()) {
                return Err(GraphViolation::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    validate_groups(def)?;

    for step in &def.steps {
        if !known.has_capability(&step.capability) {
            return Err(GraphViolation::UndefinedCapability {
                step: step.id.clone(),
                capability: step.capability.clone(),
            });
        }
        if let Some(comp) = step.compensating_capability() {
            if !known.has_capability(comp) {
                return Err(GraphViolation::UndefinedCompensation {
                    step: step.id.clone(),
                    capability: comp.to_string(),
                });
            }
        }
        if let Some(policy) = &step.retry_policy {
            if !known.retry_policies.contains(policy) {
                return Err(GraphViolation::UnknownRetryPolicy {
                    step: step.id.clone(),
                    policy: policy.clone(),
                });
            }
        }
    }

    dag::build_execution_plan(&def.steps).map(|_| ())
}

fn validate_groups(def: &WorkflowDefinition) -> Result<(), GraphViolation> {
    let mut members: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut barriers: HashMap<&str, &str> = HashMap::new();
    let mut upstream: HashMap<&str, HashSet<&str>> = HashMap::new();

    for step in &def.steps {
        match &step.mode {
            ExecutionMode::Sequential => {}
            ExecutionMode::ParallelMember { group } => {
                members.entry(group.as_str()).or_default().push(step.id.as_str());
                let deps: HashSet<&str> = step.depends_on.iter().map(String::as_str).collect();
                match upstream.get(group.as_str()) {
                    Some(first) if *first != deps => {
                        return Err(GraphViolation::DivergentMembers {
                            group: group.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        upstream.insert(group.as_str(), deps);
                    }
                }
            }
            ExecutionMode::ParallelBarrier { group } => {
                if barriers.insert(group.as_str(), step.id.as_str()).is_some() {
                    return Err(GraphViolation::DuplicateBarrier {
                        group: group.clone(),
                    });
                }
            }
        }
    }

    for (group, ids) in &members {
        if !barriers.contains_key(group) {
            return Err(GraphViolation::OrphanMember {
                step: ids[0].to_string(),
                group: group.to_string(),
            });
        }
    }
    for (group, step) in &barriers {
        if !members.contains_key(group) {
            return Err(GraphViolation::UnreachableBarrier {
                step: step.to_string(),
                group: group.to_string(),
            });
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file (structure only, not validated).
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, CatalogError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Discover all workflow YAML files under `base_dir`, recursively.
///
/// Files that fail to parse are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, CatalogError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), CatalogError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            match load_workflow_file(&path) {
                Ok(def) => results.push((path, def)),
                Err(e) => {
                    tracing::warn!(?path, error = %e, "skipping unparseable workflow file");
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::{barrier, member, step, workflow};
    use sagaflow_types::workflow::Compensation;

    fn known() -> KnownReferences {
        KnownReferences::new(
            ["agent", "undo", "flight-agent", "hotel-agent", "join-agent"],
            ["default", "patient"],
        )
    }

    fn violation(def: &WorkflowDefinition) -> GraphViolation {
        validate_definition(def, &known()).unwrap_err()
    }

    // -----------------------------------------------------------------------
    // Valid shapes
    // -----------------------------------------------------------------------

    #[test]
    fn test_valid_sequential_workflow() {
        let def = workflow("seq", vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])]);
        assert!(validate_definition(&def, &known()).is_ok());
    }

    #[test]
    fn test_valid_parallel_group() {
        let def = workflow(
            "par",
            vec![
                step("start", &[]),
                member("m1", "g", &["start"]),
                member("m2", "g", &["start"]),
                barrier("join", "g", &[]),
            ],
        );
        assert!(validate_definition(&def, &known()).is_ok());
    }

    // -----------------------------------------------------------------------
    // Violations
    // -----------------------------------------------------------------------

    #[test]
    fn test_empty_workflow() {
        let def = workflow("empty", vec![]);
        assert_eq!(violation(&def), GraphViolation::EmptyWorkflow);
    }

    #[test]
    fn test_missing_intent() {
        let def = workflow(" ", vec![step("a", &[])]);
        assert_eq!(violation(&def), GraphViolation::MissingIntent);
    }

    #[test]
    fn test_duplicate_step() {
        let def = workflow("dup", vec![step("a", &[]), step("a", &[])]);
        assert_eq!(violation(&def), GraphViolation::DuplicateStep("a".to_string()));
    }

    #[test]
    fn test_unknown_dependency() {
        let def = workflow("unk", vec![step("a", &["ghost"])]);
        assert!(matches!(violation(&def), GraphViolation::UnknownDependency { .. }));
    }

    #[test]
    fn test_cycle_rejected() {
        let def = workflow(
            "cyc",
            vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])],
        );
        assert!(matches!(violation(&def), GraphViolation::Cycle(_)));
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let def = workflow("self", vec![step("a", &["a"])]);
        assert!(matches!(violation(&def), GraphViolation::Cycle(_)));
    }

    #[test]
    fn test_cycle_through_barrier() {
        // The barrier implicitly depends on m1; m1 depending on the barrier closes a loop.
        let def = workflow(
            "bcyc",
            vec![member("m1", "g", &["join"]), barrier("join", "g", &[])],
        );
        assert!(matches!(violation(&def), GraphViolation::Cycle(_)));
    }

    #[test]
    fn test_orphan_member() {
        let def = workflow("orphan", vec![member("m1", "g", &[])]);
        assert!(matches!(violation(&def), GraphViolation::OrphanMember { .. }));
    }

    #[test]
    fn test_unreachable_barrier() {
        let def = workflow("unreach", vec![step("a", &[]), barrier("join", "g", &["a"])]);
        assert!(matches!(violation(&def), GraphViolation::UnreachableBarrier { .. }));
    }

    #[test]
    fn test_duplicate_barrier() {
        let def = workflow(
            "twobar",
            vec![
                member("m1", "g", &[]),
                barrier("j1", "g", &[]),
                barrier("j2", "g", &[]),
            ],
        );
        assert_eq!(
            violation(&def),
            GraphViolation::DuplicateBarrier {
                group: "g".to_string()
            }
        );
    }

    #[test]
    fn test_divergent_members() {
        let def = workflow(
            "div",
            vec![
                step("a", &[]),
                member("m1", "g", &["a"]),
                member("m2", "g", &[]),
                barrier("join", "g", &[]),
            ],
        );
        assert!(matches!(violation(&def), GraphViolation::DivergentMembers { .. }));
    }

    #[test]
    fn test_undefined_compensation_capability() {
        let mut s = step("a", &[]);
        s.compensation = Compensation::Capability("refund-agent".to_string());
        let def = workflow("comp", vec![s]);
        assert_eq!(
            violation(&def),
            GraphViolation::UndefinedCompensation {
                step: "a".to_string(),
                capability: "refund-agent".to_string()
            }
        );
    }

    #[test]
    fn test_undefined_capability() {
        let mut s = step("a", &[]);
        s.capability = "mystery".to_string();
        let def = workflow("cap", vec![s]);
        assert!(matches!(violation(&def), GraphViolation::UndefinedCapability { .. }));
    }

    #[test]
    fn test_capability_check_disabled_without_declarations() {
        let mut s = step("a", &[]);
        s.capability = "mystery".to_string();
        let def = workflow("cap", vec![s]);
        let open = KnownReferences::from_config(&EngineConfig::default());
        assert!(validate_definition(&def, &open).is_ok());
    }

    #[test]
    fn test_unknown_retry_policy() {
        let mut s = step("a", &[]);
        s.retry_policy = Some("aggressive".to_string());
        let def = workflow("pol", vec![s]);
        assert!(matches!(violation(&def), GraphViolation::UnknownRetryPolicy { .. }));
    }

    // -----------------------------------------------------------------------
    // Filesystem
    // -----------------------------------------------------------------------

    #[test]
    fn test_discover_workflows_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let good = r#"
intent: refund
version: 1
steps:
  - id: lookup
    capability: agent
    compensation: irreversible
"#;
        std::fs::write(dir.path().join("refund.yaml"), good).unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/other.yml"), good.replace("refund", "other"))
            .unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "steps: [[[").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let found = discover_workflows(dir.path()).unwrap();
        let intents: Vec<&str> = found.iter().map(|(_, d)| d.intent.as_str()).collect();
        assert_eq!(intents.len(), 2);
        assert!(intents.contains(&"refund"));
        assert!(intents.contains(&"other"));
    }

    #[test]
    fn test_parse_capability_compensation() {
        let yaml = r#"
intent: refund
version: 3
steps:
  - id: charge
    capability: agent
    compensation:
      capability: undo
  - id: notify
    capability: agent
    depends_on: [charge]
    compensation: irreversible
"#;
        let def = parse_workflow_yaml(yaml).unwrap();
        assert_eq!(
            def.step("charge").unwrap().compensation,
            Compensation::Capability("undo".to_string())
        );
        assert_eq!(def.step("notify").unwrap().compensation, Compensation::Irreversible);
        validate_definition(&def, &known()).unwrap();

        let reparsed = parse_workflow_yaml(&serialize_workflow_yaml(&def).unwrap()).unwrap();
        assert_eq!(reparsed.steps[0].compensation, def.steps[0].compensation);
        assert_eq!(reparsed.steps[1].compensation, def.steps[1].compensation);
    }

    #[test]
    fn test_load_workflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trip.yaml");
        std::fs::write(
            &path,
            "intent: trip\nversion: 1\nsteps:\n  - id: a\n    capability: agent\n    compensation:\n      capability: undo\n",
        )
        .unwrap();

        let def = load_workflow_file(&path).unwrap();
        assert_eq!(def.intent, "trip");
        assert_eq!(def.steps[0].compensating_capability(), Some("undo"));
        assert!(load_workflow_file(&dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_discover_missing_dir_is_empty() {
        let found = discover_workflows(Path::new("/nonexistent/sagaflow/workflows")).unwrap();
        assert!(found.is_empty());
    }
}
