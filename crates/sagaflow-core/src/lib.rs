//! Orchestration engine for sagaflow.
//!
//! This crate holds the engine and the "ports" (store, executor and
//! collaborator traits) the infrastructure layer implements. It depends only
//! on `sagaflow-types` -- never on `sagaflow-infra` or any database crate.

pub mod admission;
pub mod capability;
pub mod event;
pub mod isolation;
pub mod orchestrator;
pub mod storage;
pub mod workflow;

pub use orchestrator::{CancelAck, Orchestrator, OrchestratorBuilder, OrchestratorError, RunRequest};
