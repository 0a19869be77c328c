//! BoxStepExecutor -- object-safe dynamic dispatch wrapper for StepExecutor.
//!
//! 1. Define an object-safe `StepExecutorDyn` trait with boxed futures
//! 2. Blanket-impl `StepExecutorDyn` for all `T: StepExecutor`
//! 3. `BoxStepExecutor` wraps `Arc<dyn StepExecutorDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use sagaflow_types::error::StepFailure;
use serde_json::Value;

use super::executor::{StepExecutor, StepRequest};

/// Object-safe version of [`StepExecutor`] with boxed futures.
pub trait StepExecutorDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        request: &'a StepRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepFailure>> + Send + 'a>>;
}

impl<T: StepExecutor> StepExecutorDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        request: &'a StepRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepFailure>> + Send + 'a>> {
        Box::pin(self.invoke(request))
    }
}

/// Type-erased, cheaply clonable step executor.
///
/// Parallel group members run on sibling tasks, so the executor is shared
/// behind an `Arc` rather than a `Box`.
#[derive(Clone)]
pub struct BoxStepExecutor {
    inner: Arc<dyn StepExecutorDyn>,
}

impl BoxStepExecutor {
    pub fn new<T: StepExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Arc::new(executor),
        }
    }

    pub async fn invoke(&self, request: &StepRequest) -> Result<Value, StepFailure> {
        self.inner.invoke_boxed(request).await
    }
}

impl std::fmt::Debug for BoxStepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepExecutor").finish_non_exhaustive()
    }
}
