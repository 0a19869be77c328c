use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of every failure the engine can surface.
///
/// Callers only ever see a run status plus a reason string; the class is what
/// drives retry, breaker accounting and compensation decisions internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed workflow or request. Fails fast, never retried.
    Validation,
    /// Dependency temporarily unavailable.
    Transient,
    /// The per-call hard timeout elapsed.
    Timeout,
    /// The capability refused the request.
    Rejected,
    /// The capability failed in a way retrying cannot fix.
    Permanent,
    /// Fast-failed because the dependency's breaker is open.
    CircuitOpen,
    DeadlineExceeded,
    DeadlineUnreachable,
    /// One or more members of a parallel group failed.
    BarrierFailure,
    /// A compensating action itself failed.
    CompensationFailure,
    Cancelled,
}

impl ErrorClass {
    /// Only timeouts and transient errors are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Timeout | ErrorClass::Transient)
    }

    /// Whether this outcome counts against a dependency's breaker.
    pub fn counts_as_breaker_failure(self) -> bool {
        matches!(self, ErrorClass::Timeout | ErrorClass::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Transient => "transient",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Rejected => "rejected",
            ErrorClass::Permanent => "permanent",
            ErrorClass::CircuitOpen => "circuit_open",
            ErrorClass::DeadlineExceeded => "deadline_exceeded",
            ErrorClass::DeadlineUnreachable => "deadline_unreachable",
            ErrorClass::BarrierFailure => "barrier_failure",
            ErrorClass::CompensationFailure => "compensation_failure",
            ErrorClass::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure attached to a step or compensation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub class: ErrorClass,
    pub message: String,
}

impl StepError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

/// Failure returned by a capability invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepFailure {
    #[error("capability call timed out")]
    Timeout,

    #[error("capability rejected the request: {reason}")]
    Rejected { reason: String },

    #[error("transient error: {cause}")]
    Transient { cause: String },

    #[error("permanent error: {cause}")]
    Permanent { cause: String },
}

impl StepFailure {
    pub fn class(&self) -> ErrorClass {
        match self {
            StepFailure::Timeout => ErrorClass::Timeout,
            StepFailure::Rejected { .. } => ErrorClass::Rejected,
            StepFailure::Transient { .. } => ErrorClass::Transient,
            StepFailure::Permanent { .. } => ErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        StepFailure::Rejected {
            reason: reason.into(),
        }
    }

    pub fn transient(cause: impl Into<String>) -> Self {
        StepFailure::Transient {
            cause: cause.into(),
        }
    }

    pub fn permanent(cause: impl Into<String>) -> Self {
        StepFailure::Permanent {
            cause: cause.into(),
        }
    }
}

impl From<StepFailure> for StepError {
    fn from(failure: StepFailure) -> Self {
        StepError::new(failure.class(), failure.to_string())
    }
}

/// Errors from persistent store operations (used by trait definitions in sagaflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(e: serde_json::Error) -> Self {
        RepositoryError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(ErrorClass::Timeout.is_retryable());
        assert!(ErrorClass::Transient.is_retryable());
        assert!(!ErrorClass::Permanent.is_retryable());
        assert!(!ErrorClass::Rejected.is_retryable());
        assert!(!ErrorClass::CircuitOpen.is_retryable());
        assert!(!ErrorClass::Validation.is_retryable());
    }

    #[test]
    fn test_rejections_are_breaker_neutral() {
        assert!(ErrorClass::Timeout.counts_as_breaker_failure());
        assert!(ErrorClass::Transient.counts_as_breaker_failure());
        assert!(!ErrorClass::Rejected.counts_as_breaker_failure());
        assert!(!ErrorClass::Permanent.counts_as_breaker_failure());
    }

    #[test]
    fn test_step_failure_into_step_error() {
        let err: StepError = StepFailure::permanent("card declined").into();
        assert_eq!(err.class, ErrorClass::Permanent);
        assert_eq!(err.message, "permanent error: card declined");
        assert_eq!(err.to_string(), "permanent: permanent error: card declined");
    }

    #[test]
    fn test_step_failure_serde_tagged() {
        let json = serde_json::to_value(StepFailure::rejected("quota")).unwrap();
        assert_eq!(json["type"], "rejected");
        assert_eq!(json["reason"], "quota");
        let back: StepFailure = serde_json::from_value(json).unwrap();
        assert_eq!(back, StepFailure::rejected("quota"));
    }

    #[test]
    fn test_error_class_serde_snake_case() {
        let json = serde_json::to_string(&ErrorClass::DeadlineUnreachable).unwrap();
        assert_eq!(json, "\"deadline_unreachable\"");
    }

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }
}
