//! Workflow engine core: definitions, planning, durable run state and execution.
//!
//! - `definition` -- YAML parsing and validation
//! - `dag` -- level planning and structural checks
//! - `catalog` -- versioned, append-only definition registry
//! - `context` -- step outputs visible to conditions and downstream inputs
//! - `expression` -- JEXL condition evaluation
//! - `checkpoint` -- durable run state on a `PersistentStore`
//! - `scheduler` -- level-by-level execution of one run
//! - `compensator` -- reverse-order unwind of completed steps

pub mod catalog;
pub mod checkpoint;
pub mod compensator;
pub mod context;
pub mod dag;
pub mod definition;
pub mod expression;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::WorkflowCatalog;
pub use checkpoint::{CheckpointError, CheckpointManager};
pub use scheduler::{RunOutcome, RunSignals, Scheduler, SchedulerError};
