//! Circuit breaker snapshot types, shared between the isolator and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Public state of one dependency's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitPhase::Closed => write!(f, "closed"),
            CircuitPhase::Open => write!(f, "open"),
            CircuitPhase::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of a dependency's circuit state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub dependency: String,
    pub phase: CircuitPhase,
    pub consecutive_failures: u32,
    /// Only meaningful while half-open.
    pub consecutive_successes: u32,
    pub last_transition_at: DateTime<Utc>,
}
