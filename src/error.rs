use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Error Taxonomy
// ============================================================================
//
// - HandlerError: what a handler reports; drives the retry decision
// - TerminalFailure: a retry chain that gave up, handed to the dead-letter sink
// - PolicyError / SequenceError / DispatchError: caller mistakes, raised
//   synchronously
//
// Ordering anomalies are not errors; see `sequence::SequenceStatus`.
//
// ============================================================================

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure reported by an event handler
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Transient failure, the policy may schedule another attempt
    #[error("{0}")]
    Retryable(#[source] BoxError),

    /// Failure that will not go away by trying again
    #[error("non-retryable: {0}")]
    NonRetryable(#[source] BoxError),
}

impl HandlerError {
    pub fn retryable(err: impl Into<BoxError>) -> Self {
        HandlerError::Retryable(err.into())
    }

    pub fn non_retryable(err: impl Into<BoxError>) -> Self {
        HandlerError::NonRetryable(err.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }

    /// Message of the innermost error in the source chain
    pub fn root_cause(&self) -> String {
        let mut current: &(dyn std::error::Error + 'static) = match self {
            HandlerError::Retryable(e) | HandlerError::NonRetryable(e) => &**e,
        };
        while let Some(next) = current.source() {
            current = next;
        }
        current.to_string()
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::Retryable(err.into())
    }
}

/// Why a retry chain stopped without delivering
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum TerminalReason {
    /// Every attempt allowed by the policy failed
    Exhausted,
    /// The policy refused to retry the error
    NonRetryable,
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalReason::Exhausted => write!(f, "retries exhausted"),
            TerminalReason::NonRetryable => write!(f, "non-retryable failure"),
        }
    }
}

/// A handler that gave up on an event, with the full attempt history
#[derive(Debug, thiserror::Error)]
#[error(
    "handler '{handler_name}' gave up on {event_type} event {event_id} (aggregate {aggregate_id}) after {attempts} attempt(s): {reason}"
)]
pub struct TerminalFailure {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_id: String,
    pub handler_name: String,
    pub attempts: u32,
    pub reason: TerminalReason,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    #[source]
    pub cause: HandlerError,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("max_delay ({max_delay:?}) must not be shorter than initial_delay ({initial_delay:?})")]
    DelayRange {
        initial_delay: Duration,
        max_delay: Duration,
    },

    #[error("backoff multiplier must be a finite value >= 1.0, got {0}")]
    InvalidMultiplier(f64),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    #[error("event {event_id} for aggregate {aggregate_id} carries no sequence number")]
    MissingSequence { event_id: Uuid, aggregate_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid event: {reason}")]
    InvalidEvent { reason: String },

    #[error("no handlers registered for event type '{0}'")]
    UnknownEventType(String),

    #[error("handler '{handler_name}' is already registered for '{event_type}'")]
    DuplicateHandler {
        event_type: String,
        handler_name: String,
    },

    #[error(transparent)]
    Sequence(#[from] SequenceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("connection reset")]
    struct ConnectionReset;

    #[derive(Debug, thiserror::Error)]
    #[error("inventory service unavailable")]
    struct Unavailable(#[source] ConnectionReset);

    #[test]
    fn test_handler_error_kinds() {
        assert!(HandlerError::retryable("timeout").is_retryable());
        assert!(!HandlerError::non_retryable("bad payload").is_retryable());
    }

    #[test]
    fn test_anyhow_errors_are_retryable() {
        let err: HandlerError = anyhow::anyhow!("socket closed").into();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "socket closed");
    }

    #[test]
    fn test_root_cause_walks_source_chain() {
        let err = HandlerError::retryable(Unavailable(ConnectionReset));
        assert_eq!(err.root_cause(), "connection reset");

        let flat = HandlerError::non_retryable("bad payload");
        assert_eq!(flat.root_cause(), "bad payload");
    }
}
