//! Accumulated step outputs for one run.
//!
//! `RunContext` is what branch conditions evaluate against and what each step
//! receives as its upstream map. It is rebuilt from checkpointed records when
//! a run resumes, so it never holds anything the store does not.

use std::collections::HashMap;

use sagaflow_types::workflow::{RunInstance, StepStatus};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Default)]
pub struct RunContext {
    input: Value,
    outputs: HashMap<String, Value>,
    statuses: HashMap<String, StepStatus>,
}

impl RunContext {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            outputs: HashMap::new(),
            statuses: HashMap::new(),
        }
    }

    /// Rebuild from a loaded run: every settled record contributes its status,
    /// completed records their result.
    pub fn from_run(run: &RunInstance) -> Self {
        let mut ctx = Self::new(run.payload.clone());
        for record in &run.steps {
            if record.status.is_terminal() {
                ctx.record(&record.step_id, record.status, record.result.clone());
            }
        }
        ctx
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn record(&mut self, step_id: &str, status: StepStatus, output: Option<Value>) {
        self.statuses.insert(step_id.to_string(), status);
        if let Some(output) = output {
            self.outputs.insert(step_id.to_string(), output);
        }
    }

    pub fn status(&self, step_id: &str) -> Option<StepStatus> {
        self.statuses.get(step_id).copied()
    }

    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.outputs.get(step_id)
    }

    /// Outputs of the given upstream steps. Skipped or failed upstreams are absent.
    pub fn upstream(&self, depends_on: &[String]) -> HashMap<String, Value> {
        depends_on
            .iter()
            .filter_map(|id| self.outputs.get(id).map(|v| (id.clone(), v.clone())))
            .collect()
    }

    /// JSON object conditions evaluate against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "input": <request payload>,
    ///   "steps": { "<step_id>": { "status": "completed", "output": <value> }, ... }
    /// }
    /// ```
    pub fn to_expression_context(&self) -> Value {
        let mut steps = Map::new();
        for (id, status) in &self.statuses {
            steps.insert(
                id.clone(),
                json!({
                    "status": status.as_str(),
                    "output": self.outputs.get(id).cloned().unwrap_or(Value::Null),
                }),
            );
        }
        json!({
            "input": self.input,
            "steps": steps,
        })
    }
}
