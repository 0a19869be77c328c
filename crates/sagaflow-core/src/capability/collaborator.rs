//! External collaborators the engine consumes: intent classification and
//! per-step context assembly.
//!
//! Both are object-safe (boxed futures) because the orchestrator stores them
//! as trait objects chosen at startup.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

/// Result of classifying free-form input.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub intent: String,
    /// 0.0..=1.0
    pub confidence: f64,
}

/// Maps raw user input to an intent tag.
pub trait IntentClassifier: Send + Sync {
    fn classify<'a>(&'a self, raw: &'a str) -> BoxFuture<'a, Result<Classification, String>>;
}

/// Supplies the precomputed context payload for one step.
///
/// The engine never inspects or modifies the payload.
pub trait ContextProvider: Send + Sync {
    fn context_for<'a>(&'a self, capability: &'a str, run_id: Uuid) -> BoxFuture<'a, Value>;
}

/// Context provider that supplies nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullContextProvider;

impl ContextProvider for NullContextProvider {
    fn context_for<'a>(&'a self, _capability: &'a str, _run_id: Uuid) -> BoxFuture<'a, Value> {
        Box::pin(async { Value::Null })
    }
}

pub type SharedContextProvider = Arc<dyn ContextProvider>;
pub type SharedClassifier = Arc<dyn IntentClassifier>;
