//! Capability invocation seams.
//!
//! - `StepExecutor`: RPITIT trait for invoking capability units
//! - `BoxStepExecutor`: object-safe wrapper for dynamic dispatch
//! - `IntentClassifier` / `ContextProvider`: consumed collaborators

pub mod box_executor;
pub mod collaborator;
pub mod executor;
