//! Versioned workflow catalog.
//!
//! Definitions are validated once at registration and then shared as
//! `Arc<WorkflowDefinition>`. Registration is append-only per
//! `(intent, version)`, so a run pinned to a version always sees the exact
//! plan it was admitted with.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};

use sagaflow_types::workflow::{WorkflowDefinition, WorkflowRef};

use super::dag::{ExecutionPlan, build_execution_plan};
use super::definition::{
    CatalogError, KnownReferences, discover_workflows, load_workflow_file, validate_definition,
};

type Versions = BTreeMap<u32, Arc<WorkflowDefinition>>;

#[derive(Debug)]
pub struct WorkflowCatalog {
    known: KnownReferences,
    entries: RwLock<HashMap<String, Versions>>,
}

impl WorkflowCatalog {
    pub fn new(known: KnownReferences) -> Self {
        Self {
            known,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Validate and register a definition.
    pub fn register(&self, def: WorkflowDefinition) -> Result<Arc<WorkflowDefinition>, CatalogError> {
        validate_definition(&def, &self.known)?;

        let mut entries = self.entries.write().expect("catalog lock poisoned");
        let versions = entries.entry(def.intent.clone()).or_default();
        if versions.contains_key(&def.version) {
            return Err(CatalogError::VersionExists {
                intent: def.intent,
                version: def.version,
            });
        }

        tracing::info!(
            intent = %def.intent,
            version = def.version,
            steps = def.steps.len(),
            "registered workflow"
        );
        let def = Arc::new(def);
        versions.insert(def.version, Arc::clone(&def));
        Ok(def)
    }

    /// The exact version, or the highest registered one when `version` is `None`.
    pub fn resolve(
        &self,
        intent: &str,
        version: Option<u32>,
    ) -> Result<Arc<WorkflowDefinition>, CatalogError> {
        let entries = self.entries.read().expect("catalog lock poisoned");
        let found = entries.get(intent).and_then(|versions| match version {
            Some(v) => versions.get(&v),
            None => versions.values().next_back(),
        });
        found.cloned().ok_or_else(|| CatalogError::NotFound {
            intent: intent.to_string(),
            version,
        })
    }

    /// Resolve a pinned reference.
    pub fn get(&self, reference: &WorkflowRef) -> Result<Arc<WorkflowDefinition>, CatalogError> {
        self.resolve(&reference.intent, Some(reference.version))
    }

    /// Every registered `(intent, version)`, sorted.
    pub fn list(&self) -> Vec<WorkflowRef> {
        let entries = self.entries.read().expect("catalog lock poisoned");
        let mut refs: Vec<WorkflowRef> = entries
            .iter()
            .flat_map(|(intent, versions)| {
                versions.keys().map(move |version| WorkflowRef {
                    intent: intent.clone(),
                    version: *version,
                })
            })
            .collect();
        refs.sort_by(|a, b| a.intent.cmp(&b.intent).then(a.version.cmp(&b.version)));
        refs
    }

    /// Register a single YAML file, or every workflow file under a directory.
    ///
    /// A single file must register cleanly. In directory mode, definitions
    /// that fail validation are logged and skipped.
    pub fn load_path(&self, path: &Path) -> Result<Vec<WorkflowRef>, CatalogError> {
        if path.is_file() {
            let def = self.register(load_workflow_file(path)?)?;
            return Ok(vec![def.reference()]);
        }

        let mut loaded = Vec::new();
        for (file, def) in discover_workflows(path)? {
            match self.register(def) {
                Ok(def) => loaded.push(def.reference()),
                Err(e) => {
                    tracing::warn!(path = ?file, error = %e, "skipping invalid workflow");
                }
            }
        }
        Ok(loaded)
    }
}

/// Topological levels of a definition.
pub fn plan(def: &WorkflowDefinition) -> Result<ExecutionPlan<'_>, CatalogError> {
    Ok(build_execution_plan(&def.steps)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::GraphViolation;
    use crate::workflow::testing::{barrier, member, step, workflow};
    use sagaflow_types::config::EngineConfig;

    fn catalog() -> WorkflowCatalog {
        WorkflowCatalog::new(KnownReferences::new(["agent", "undo"], ["default"]))
    }

    #[test]
    fn test_register_and_resolve_latest() {
        let catalog = catalog();
        let mut v1 = workflow("book-trip", vec![step("a", &[])]);
        v1.version = 1;
        let mut v3 = workflow("book-trip", vec![step("a", &[]), step("b", &["a"])]);
        v3.version = 3;
        catalog.register(v3).unwrap();
        catalog.register(v1).unwrap();

        assert_eq!(catalog.resolve("book-trip", None).unwrap().version, 3);
        assert_eq!(catalog.resolve("book-trip", Some(1)).unwrap().steps.len(), 1);
        assert!(matches!(
            catalog.resolve("book-trip", Some(2)),
            Err(CatalogError::NotFound { version: Some(2), .. })
        ));
        assert!(matches!(
            catalog.resolve("refund", None),
            Err(CatalogError::NotFound { .. })
        ));
    }

    #[test]
    fn test_register_is_append_only() {
        let catalog = catalog();
        catalog.register(workflow("w", vec![step("a", &[])])).unwrap();
        let err = catalog
            .register(workflow("w", vec![step("a", &[]), step("b", &["a"])]))
            .unwrap_err();
        assert!(matches!(err, CatalogError::VersionExists { version: 1, .. }));
        assert_eq!(catalog.resolve("w", None).unwrap().steps.len(), 1);
    }

    #[test]
    fn test_register_rejects_cycle() {
        let catalog = catalog();
        let err = catalog
            .register(workflow("w", vec![step("a", &["b"]), step("b", &["a"])]))
            .unwrap_err();
        assert!(matches!(
            err,
            CatalogError::InvalidGraph(GraphViolation::Cycle(_))
        ));
        assert!(catalog.list().is_empty());
    }

    #[test]
    fn test_register_rejects_undeclared_compensation() {
        let catalog = catalog();
        let mut s = step("a", &[]);
        s.compensation = sagaflow_types::workflow::Compensation::Capability("refund".into());
        let err = catalog.register(workflow("w", vec![s])).unwrap_err();
        assert!(matches!(
            err,
            CatalogError::InvalidGraph(GraphViolation::UndefinedCompensation { .. })
        ));
    }

    #[test]
    fn test_plan_levels() {
        let def = workflow(
            "w",
            vec![
                step("a", &[]),
                member("m1", "g", &["a"]),
                member("m2", "g", &["a"]),
                barrier("join", "g", &[]),
            ],
        );
        let plan = plan(&def).unwrap();
        assert_eq!(plan.levels.len(), 3);
        assert_eq!(plan.levels[1][0].step_ids(), vec!["m1", "m2"]);
        assert_eq!(plan.step_count(), 4);
    }

    #[test]
    fn test_load_path_registers_bundled_workflows() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../workflows");
        let catalog =
            WorkflowCatalog::new(KnownReferences::from_config(&EngineConfig::default().normalized()));

        let mut intents: Vec<String> = catalog
            .load_path(&dir)
            .unwrap()
            .into_iter()
            .map(|r| r.intent)
            .collect();
        intents.sort();
        assert_eq!(intents, vec!["book-trip", "refund", "research-report"]);

        let trip = catalog.resolve("book-trip", None).unwrap();
        assert_eq!(trip.step("flight").unwrap().compensating_capability(), Some("flight-cancel"));
        assert_eq!(plan(&trip).unwrap().step_count(), 6);
    }

    #[test]
    fn test_load_path_directory_skips_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("ok.yaml"),
            "intent: refund\nversion: 1\nsteps:\n  - id: a\n    capability: agent\n    compensation: irreversible\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("bad.yaml"),
            "intent: broken\nversion: 1\nsteps:\n  - id: a\n    capability: agent\n    depends_on: [ghost]\n    compensation: irreversible\n",
        )
        .unwrap();

        let catalog = catalog();
        let loaded = catalog.load_path(dir.path()).unwrap();
        assert_eq!(
            loaded,
            vec![WorkflowRef {
                intent: "refund".to_string(),
                version: 1
            }]
        );

        let err = catalog.load_path(&dir.path().join("bad.yaml")).unwrap_err();
        assert!(matches!(
            err,
            CatalogError::InvalidGraph(GraphViolation::UnknownDependency { .. })
        ));
    }
}
