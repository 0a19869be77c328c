//! DAG builder, cycle detection, and topological level computation.
//!
//! Uses `petgraph` to model step dependencies as a directed graph. Barriers get
//! an implicit edge from every member of their group. Topological sort detects
//! cycles, and depth-based grouping produces levels; within a level, the
//! members of one parallel group are folded into a single `PlanUnit::Group`.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use sagaflow_types::workflow::{ExecutionMode, StepSpec};

use super::definition::GraphViolation;

// ---------------------------------------------------------------------------
// Execution plan
// ---------------------------------------------------------------------------

/// One schedulable unit within a level.
#[derive(Debug, Clone)]
pub enum PlanUnit<'a> {
    /// A sequential step or a barrier, run alone.
    Step(&'a StepSpec),
    /// All members of a parallel group, run concurrently.
    Group {
        name: &'a str,
        members: Vec<&'a StepSpec>,
    },
}

impl PlanUnit<'_> {
    /// Step IDs covered by this unit.
    pub fn step_ids(&self) -> Vec<&str> {
        match self {
            PlanUnit::Step(step) => vec![step.id.as_str()],
            PlanUnit::Group { members, .. } => members.iter().map(|s| s.id.as_str()).collect(),
        }
    }
}

/// Topologically levelled plan: level `i` only depends on levels `< i`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan<'a> {
    pub levels: Vec<Vec<PlanUnit<'a>>>,
}

impl ExecutionPlan<'_> {
    /// Total number of steps across all levels.
    pub fn step_count(&self) -> usize {
        self.levels
            .iter()
            .flat_map(|level| level.iter())
            .map(|unit| unit.step_ids().len())
            .sum()
    }
}

/// Build an execution plan from workflow steps, grouping them into levels.
///
/// The algorithm:
///
/// 1. Build a `DiGraph` with step IDs as nodes, `depends_on` edges, and an
///    edge from each parallel member to its group's barrier.
/// 2. Run `petgraph::algo::toposort` to verify acyclicity.
/// 3. Compute each node's depth (max predecessor depth + 1).
/// 4. Group steps by depth, keeping definition order within a level and
///    folding members of one group into a single unit.
pub fn build_execution_plan(steps: &[StepSpec]) -> Result<ExecutionPlan<'_>, GraphViolation> {
    if steps.is_empty() {
        return Ok(ExecutionPlan::default());
    }

    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    // Edge from dependency -> dependent
    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<NodeIndex> = (0..steps.len()).map(|i| graph.add_node(i)).collect();

    for (to, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            let from = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                GraphViolation::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                }
            })?;
            graph.add_edge(nodes[*from], nodes[to], ());
        }
    }

    let barriers: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .filter_map(|(i, s)| match &s.mode {
            ExecutionMode::ParallelBarrier { group } => Some((group.as_str(), i)),
            _ => None,
        })
        .collect();
    for (from, step) in steps.iter().enumerate() {
        if let ExecutionMode::ParallelMember { group } = &step.mode {
            if let Some(&to) = barriers.get(group.as_str()) {
                graph.add_edge(nodes[from], nodes[to], ());
            }
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        let idx = graph[cycle.node_id()];
        GraphViolation::Cycle(steps[idx].id.clone())
    })?;

    // Root nodes have depth 0
    let mut depths = vec![0usize; steps.len()];
    for node in sorted {
        let depth = graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|pred| depths[graph[pred]] + 1)
            .max()
            .unwrap_or(0);
        depths[graph[node]] = depth;
    }

    let max_depth = depths.iter().copied().max().unwrap_or(0);
    let mut levels: Vec<Vec<PlanUnit<'_>>> = vec![Vec::new(); max_depth + 1];
    for (i, step) in steps.iter().enumerate() {
        let level = &mut levels[depths[i]];
        match &step.mode {
            ExecutionMode::ParallelMember { group } => {
                let existing = level.iter_mut().find_map(|unit| match unit {
                    PlanUnit::Group { name, members } if *name == group.as_str() => Some(members),
                    _ => None,
                });
                match existing {
                    Some(members) => members.push(step),
                    None => level.push(PlanUnit::Group {
                        name: group.as_str(),
                        members: vec![step],
                    }),
                }
            }
            _ => level.push(PlanUnit::Step(step)),
        }
    }

    Ok(ExecutionPlan { levels })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
