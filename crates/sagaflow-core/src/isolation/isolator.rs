//! Fault isolator: circuit breaking, hard timeouts and retries around every
//! capability call.
//!
//! Breakers are keyed by dependency name in a `DashMap`, so unrelated
//! dependencies never contend on the same lock. Shard guards are only held
//! inside synchronous helpers and never across an `.await`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sagaflow_types::circuit::CircuitSnapshot;
use sagaflow_types::config::{DEFAULT_RETRY_POLICY, EngineConfig};
use sagaflow_types::error::{ErrorClass, StepFailure};
use sagaflow_types::event::OrchestratorEvent;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::breaker::{CircuitBreaker, Transition};
use super::retry::RetryPolicy;
use crate::event::EventBus;

/// A call that eventually succeeded.
#[derive(Debug, Clone)]
pub struct CallSuccess {
    pub output: Value,
    /// Attempts beyond the first.
    pub retries: u32,
}

/// A call that failed for good: not retryable, retries exhausted, breaker
/// open, or cancelled.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{class}: {message}")]
pub struct CallFailure {
    pub class: ErrorClass,
    pub message: String,
    pub retries: u32,
}

impl CallFailure {
    fn new(class: ErrorClass, message: impl Into<String>, retries: u32) -> Self {
        Self {
            class,
            message: message.into(),
            retries,
        }
    }
}

/// How a single attempt ended, as far as the breaker is concerned.
enum AttemptOutcome {
    Success,
    Failure,
    Neutral,
}

pub struct FaultIsolator {
    config: Arc<EngineConfig>,
    breakers: DashMap<String, CircuitBreaker>,
    policies: HashMap<String, RetryPolicy>,
    events: EventBus,
}

impl FaultIsolator {
    pub fn new(config: Arc<EngineConfig>, events: EventBus) -> Self {
        let mut policies: HashMap<String, RetryPolicy> = config
            .retry_policies
            .iter()
            .map(|(name, cfg)| (name.clone(), RetryPolicy::from(cfg)))
            .collect();
        policies
            .entry(DEFAULT_RETRY_POLICY.to_string())
            .or_default();
        Self {
            config,
            breakers: DashMap::new(),
            policies,
            events,
        }
    }

    /// Resolve a named retry policy, falling back to `default`.
    pub fn policy(&self, name: Option<&str>) -> RetryPolicy {
        let name = name.unwrap_or(DEFAULT_RETRY_POLICY);
        match self.policies.get(name) {
            Some(policy) => policy.clone(),
            None => {
                tracing::warn!(policy = name, "unknown retry policy, using default");
                self.policies
                    .get(DEFAULT_RETRY_POLICY)
                    .cloned()
                    .unwrap_or_default()
            }
        }
    }

    /// Run `attempt_fn` under the dependency's breaker, a hard per-attempt
    /// timeout, and the retry policy.
    ///
    /// `attempt_fn` receives the 1-based attempt number. The breaker is
    /// consulted before every attempt; an open breaker fails the call with
    /// `CircuitOpen` without invoking `attempt_fn`. Cancelling `cancel`
    /// aborts the in-flight attempt or backoff sleep.
    pub async fn call<F, Fut>(
        &self,
        dependency: &str,
        policy: &RetryPolicy,
        timeout: Duration,
        cancel: &CancellationToken,
        mut attempt_fn: F,
    ) -> Result<CallSuccess, CallFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Value, StepFailure>>,
    {
        let mut attempt: u32 = 1;
        loop {
            let retries = attempt - 1;
            if cancel.is_cancelled() {
                return Err(CallFailure::new(ErrorClass::Cancelled, "cancelled", retries));
            }
            if !self.acquire(dependency) {
                return Err(CallFailure::new(
                    ErrorClass::CircuitOpen,
                    format!("circuit open for dependency '{dependency}'"),
                    retries,
                ));
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.settle(dependency, AttemptOutcome::Neutral);
                    return Err(CallFailure::new(ErrorClass::Cancelled, "cancelled", retries));
                }
                r = tokio::time::timeout(timeout, attempt_fn(attempt)) => r,
            };

            let failure = match result {
                Ok(Ok(output)) => {
                    self.settle(dependency, AttemptOutcome::Success);
                    return Ok(CallSuccess { output, retries });
                }
                Ok(Err(failure)) => failure,
                Err(_) => StepFailure::Timeout,
            };

            let class = failure.class();
            let outcome = if class.counts_as_breaker_failure() {
                AttemptOutcome::Failure
            } else {
                AttemptOutcome::Neutral
            };
            self.settle(dependency, outcome);

            if !class.is_retryable() || !policy.should_retry(attempt) {
                tracing::warn!(
                    dependency,
                    attempt,
                    class = %class,
                    error = %failure,
                    "call failed, not retrying"
                );
                return Err(CallFailure::new(class, failure.to_string(), retries));
            }

            let delay = policy.delay_for(attempt);
            tracing::debug!(
                dependency,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %failure,
                "retrying after backoff"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(CallFailure::new(ErrorClass::Cancelled, "cancelled during backoff", attempt));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Current state of every breaker seen so far, sorted by dependency.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut snaps: Vec<CircuitSnapshot> =
            self.breakers.iter().map(|entry| entry.value().snapshot()).collect();
        snaps.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        snaps
    }

    fn acquire(&self, dependency: &str) -> bool {
        let result = {
            let mut breaker = self
                .breakers
                .entry(dependency.to_string())
                .or_insert_with(|| {
                    CircuitBreaker::new(dependency, self.config.breaker_for(dependency))
                });
            breaker.try_acquire()
        };
        match result {
            Ok(transition) => {
                self.announce(dependency, transition);
                true
            }
            Err(()) => {
                tracing::debug!(dependency, "circuit open, rejecting call");
                false
            }
        }
    }

    fn settle(&self, dependency: &str, outcome: AttemptOutcome) {
        let transition = match self.breakers.get_mut(dependency) {
            Some(mut breaker) => match outcome {
                AttemptOutcome::Success => breaker.record_success(),
                AttemptOutcome::Failure => breaker.record_failure(),
                AttemptOutcome::Neutral => {
                    breaker.record_neutral();
                    None
                }
            },
            None => None,
        };
        self.announce(dependency, transition);
    }

    fn announce(&self, dependency: &str, transition: Option<Transition>) {
        let Some(transition) = transition else {
            return;
        };
        let event = match transition {
            Transition::Opened {
                consecutive_failures,
            } => {
                tracing::warn!(dependency, consecutive_failures, "circuit opened");
                OrchestratorEvent::CircuitOpened {
                    dependency: dependency.to_string(),
                    consecutive_failures,
                }
            }
            Transition::HalfOpened => {
                tracing::info!(dependency, "circuit half-open, allowing trial calls");
                OrchestratorEvent::CircuitHalfOpened {
                    dependency: dependency.to_string(),
                }
            }
            Transition::Closed => {
                tracing::info!(dependency, "circuit closed");
                OrchestratorEvent::CircuitClosed {
                    dependency: dependency.to_string(),
                }
            }
        };
        self.events.publish(event);
    }
}

impl std::fmt::Debug for FaultIsolator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultIsolator")
            .field("breakers", &self.breakers.len())
            .field("policies", &self.policies.len())
            .finish()
    }
}
