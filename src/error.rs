//! Error types for the handoff orchestrator

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower::BoxError;

use crate::registry::HandlerId;

/// Result type alias for the orchestrator
pub type Result<T> = std::result::Result<T, HandoffError>;

/// Main error type for the orchestrator
#[derive(Debug, Error)]
pub enum HandoffError {
    /// A handler identifier is not present in the capability registry
    #[error("Unknown handler: {0}")]
    UnknownHandler(HandlerId),

    /// Bad registry or configuration at load time
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Handler output matched neither the terminal nor the transfer shape
    #[error("Malformed handoff from {handler}: {message}")]
    MalformedHandoff { handler: HandlerId, message: String },

    /// Transfer target already acted as a source earlier in the chain
    #[error("Cycle detected: {from} -> {to}")]
    CycleDetected { from: HandlerId, to: HandlerId },

    /// Chain reached its configured length limit
    #[error("Maximum handoff depth exceeded: {max_depth}")]
    MaxDepthExceeded { max_depth: usize },

    /// Target is known but not among the source's transfer targets
    #[error("Transfer not permitted: {from} -> {to}")]
    TransferNotPermitted { from: HandlerId, to: HandlerId },

    /// Chain append from a handler that is not the active one
    #[error("Invalid transition: expected source {expected}, got {found}")]
    InvalidTransition { expected: HandlerId, found: HandlerId },

    /// Handler did not answer within the per-step timeout
    #[error("Handler {handler} timed out after {timeout_ms}ms")]
    HandlerTimeout { handler: HandlerId, timeout_ms: u64 },

    /// Handler raised an error while processing the task
    #[error("Handler {handler} failed: {message}")]
    HandlerInvocation { handler: HandlerId, message: String },

    /// Task payload alone does not fit the context budget
    #[error("Task payload is {size} bytes, context budget is {budget}")]
    PayloadTooLarge { size: usize, budget: usize },

    /// Task was cancelled between steps
    #[error("Task cancelled")]
    Cancelled,

    /// Session store failure
    #[error("Session error: {0}")]
    Session(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl HandoffError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownHandler(_) => ErrorKind::UnknownHandler,
            Self::Configuration { .. } => ErrorKind::ConfigurationError,
            Self::MalformedHandoff { .. } => ErrorKind::MalformedHandoff,
            Self::CycleDetected { .. } => ErrorKind::CycleDetected,
            Self::MaxDepthExceeded { .. } => ErrorKind::MaxDepthExceeded,
            Self::TransferNotPermitted { .. } => ErrorKind::TransferNotPermitted,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::HandlerTimeout { .. } => ErrorKind::HandlerTimeout,
            Self::HandlerInvocation { .. } => ErrorKind::HandlerInvocationError,
            Self::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Session(_) | Self::Serialization(_) | Self::Io(_) | Self::Database(_) => {
                ErrorKind::Storage
            }
        }
    }

    /// Guard violations recover by falling back to the originating handler.
    pub fn is_guard_violation(&self) -> bool {
        matches!(
            self,
            Self::UnknownHandler(_)
                | Self::CycleDetected { .. }
                | Self::MaxDepthExceeded { .. }
                | Self::TransferNotPermitted { .. }
        )
    }

    /// Recover a typed error from a boxed service error.
    ///
    /// Errors that did not originate in this crate are attributed to `handler`
    /// as invocation failures.
    pub fn from_boxed(err: BoxError, handler: &HandlerId) -> Self {
        match err.downcast::<HandoffError>() {
            Ok(typed) => *typed,
            Err(other) => Self::HandlerInvocation {
                handler: handler.clone(),
                message: other.to_string(),
            },
        }
    }
}

/// Serializable classification of an error, reported alongside terminal statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownHandler,
    ConfigurationError,
    MalformedHandoff,
    CycleDetected,
    MaxDepthExceeded,
    TransferNotPermitted,
    InvalidTransition,
    HandlerTimeout,
    HandlerInvocationError,
    PayloadTooLarge,
    Cancelled,
    Storage,
}

/// An error kind together with its rendered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&HandoffError> for ErrorReport {
    fn from(err: &HandoffError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HandoffError::MaxDepthExceeded { max_depth: 5 };
        assert_eq!(err.to_string(), "Maximum handoff depth exceeded: 5");

        let err = HandoffError::CycleDetected {
            from: HandlerId::from("billing"),
            to: HandlerId::from("triage"),
        };
        assert_eq!(err.to_string(), "Cycle detected: billing -> triage");
    }

    #[test]
    fn test_guard_violations() {
        assert!(HandoffError::UnknownHandler(HandlerId::from("x")).is_guard_violation());
        assert!(HandoffError::MaxDepthExceeded { max_depth: 1 }.is_guard_violation());
        assert!(!HandoffError::Cancelled.is_guard_violation());
        assert!(!HandoffError::HandlerTimeout {
            handler: HandlerId::from("x"),
            timeout_ms: 10
        }
        .is_guard_violation());
    }

    #[test]
    fn test_from_boxed_roundtrips_typed_errors() {
        let handler = HandlerId::from("research");
        let boxed: BoxError = Box::new(HandoffError::HandlerTimeout {
            handler: handler.clone(),
            timeout_ms: 5,
        });
        let err = HandoffError::from_boxed(boxed, &handler);
        assert_eq!(err.kind(), ErrorKind::HandlerTimeout);

        let foreign: BoxError = "connection reset".into();
        let err = HandoffError::from_boxed(foreign, &handler);
        assert!(matches!(
            err,
            HandoffError::HandlerInvocation { ref message, .. } if message == "connection reset"
        ));
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::MaxDepthExceeded).unwrap();
        assert_eq!(json, "\"max_depth_exceeded\"");
    }
}
