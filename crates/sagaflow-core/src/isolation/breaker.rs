//! Per-dependency circuit breaker.
//!
//! Tracks consecutive failures for one dependency and decides whether a call
//! may proceed. Time is read from `tokio::time::Instant` so cool-downs follow
//! the runtime clock (and paused time in tests).

use std::time::Duration;

use chrono::{DateTime, Utc};
use sagaflow_types::circuit::{CircuitPhase, CircuitSnapshot};
use sagaflow_types::config::BreakerSettings;
use tokio::time::Instant;

/// Circuit breaker state for a dependency.
#[derive(Debug, Clone)]
pub enum CircuitState {
    /// Normal operation. Tracks consecutive failures toward the threshold.
    Closed { consecutive_failures: u32 },
    /// Rejecting calls until `cool_down` has elapsed since `opened_at`.
    Open {
        opened_at: Instant,
        consecutive_failures: u32,
    },
    /// Trial calls allowed, bounded by `half_open_max_calls`.
    HalfOpen {
        consecutive_successes: u32,
        in_flight: u32,
    },
}

/// A state change worth announcing on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened { consecutive_failures: u32 },
    HalfOpened,
    Closed,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    pub dependency: String,
    pub settings: BreakerSettings,
    pub state: CircuitState,
    last_transition_at: DateTime<Utc>,
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            dependency: dependency.into(),
            settings,
            state: CircuitState::Closed {
                consecutive_failures: 0,
            },
            last_transition_at: Utc::now(),
        }
    }

    fn cool_down(&self) -> Duration {
        Duration::from_millis(self.settings.cool_down_ms)
    }

    fn set_state(&mut self, state: CircuitState) {
        self.state = state;
        self.last_transition_at = Utc::now();
    }

    /// Ask for permission to call the dependency.
    ///
    /// Returns `Err(())` when the call must be rejected. On success, the
    /// transition (if the cool-down just elapsed) is returned for emission.
    /// Every granted permit must be settled with `record_success`,
    /// `record_failure` or `record_neutral`.
    #[allow(clippy::result_unit_err)]
    pub fn try_acquire(&mut self) -> Result<Option<Transition>, ()> {
        let mut transition = None;
        if let CircuitState::Open { opened_at, .. } = &self.state {
            if opened_at.elapsed() < self.cool_down() {
                return Err(());
            }
            self.set_state(CircuitState::HalfOpen {
                consecutive_successes: 0,
                in_flight: 0,
            });
            transition = Some(Transition::HalfOpened);
        }

        let max_trials = self.settings.half_open_max_calls.max(1);
        match &mut self.state {
            CircuitState::Closed { .. } => Ok(transition),
            CircuitState::HalfOpen { in_flight, .. } => {
                if *in_flight >= max_trials {
                    Err(())
                } else {
                    *in_flight += 1;
                    Ok(transition)
                }
            }
            CircuitState::Open { .. } => Err(()),
        }
    }

    /// Record a successful call.
    pub fn record_success(&mut self) -> Option<Transition> {
        match &mut self.state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen {
                consecutive_successes,
                in_flight,
            } => {
                *in_flight = in_flight.saturating_sub(1);
                *consecutive_successes += 1;
                if *consecutive_successes >= self.settings.success_threshold {
                    self.set_state(CircuitState::Closed {
                        consecutive_failures: 0,
                    });
                    Some(Transition::Closed)
                } else {
                    None
                }
            }
            // A straggler admitted before the breaker tripped.
            CircuitState::Open { .. } => None,
        }
    }

    /// Record a failure that counts against the dependency (timeout or transient).
    pub fn record_failure(&mut self) -> Option<Transition> {
        match &self.state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let count = consecutive_failures + 1;
                if count >= self.settings.failure_threshold {
                    self.set_state(CircuitState::Open {
                        opened_at: Instant::now(),
                        consecutive_failures: count,
                    });
                    Some(Transition::Opened {
                        consecutive_failures: count,
                    })
                } else {
                    self.state = CircuitState::Closed {
                        consecutive_failures: count,
                    };
                    None
                }
            }
            CircuitState::HalfOpen { .. } => {
                // Trial failed: reopen and restart the cool-down
                self.set_state(CircuitState::Open {
                    opened_at: Instant::now(),
                    consecutive_failures: 1,
                });
                Some(Transition::Opened {
                    consecutive_failures: 1,
                })
            }
            CircuitState::Open { .. } => None,
        }
    }

    /// Settle a permit whose outcome says nothing about dependency health
    /// (rejection, permanent error, cancellation).
    pub fn record_neutral(&mut self) {
        if let CircuitState::HalfOpen { in_flight, .. } = &mut self.state {
            *in_flight = in_flight.saturating_sub(1);
        }
    }

    pub fn phase(&self) -> CircuitPhase {
        match self.state {
            CircuitState::Closed { .. } => CircuitPhase::Closed,
            CircuitState::Open { .. } => CircuitPhase::Open,
            CircuitState::HalfOpen { .. } => CircuitPhase::HalfOpen,
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let (consecutive_failures, consecutive_successes) = match self.state {
            CircuitState::Closed {
                consecutive_failures,
            }
            | CircuitState::Open {
                consecutive_failures,
                ..
            } => (consecutive_failures, 0),
            CircuitState::HalfOpen {
                consecutive_successes,
                ..
            } => (0, consecutive_successes),
        };
        CircuitSnapshot {
            dependency: self.dependency.clone(),
            phase: self.phase(),
            consecutive_failures,
            consecutive_successes,
            last_transition_at: self.last_transition_at,
        }
    }
}
