//! Fault taxonomy and failure classification.
//!
//! Errors carry an explicit kind from their origin instead of being
//! classified by matching type hierarchies: handlers fail with a
//! `HandlerError`, the dispatch engine records where the failure happened
//! (`FailureOrigin`), and `classify_handler_failure` is the single place
//! that maps both onto the `Fault` a caller sees.

use crate::bus::BusError;
use crate::message::MessageKind;
use crate::queue::QueueError;
use crate::uow::FlushError;

/// A declared business-rule failure.
///
/// This is the one channel through which handler-side validation talks to
/// the dispatch engine; anything else a handler raises is unexpected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rule '{rule}' violated: {message}")]
pub struct RuleViolation {
    /// Identifier of the violated rule.
    pub rule: String,
    /// Human-readable description of the violation.
    pub message: String,
}

impl RuleViolation {
    pub fn new(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            message: message.into(),
        }
    }
}

/// Failure raised by a message or query handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Business-rule failure via the declared channel.
    #[error(transparent)]
    Rule(#[from] RuleViolation),

    /// The handler observed cancellation and stopped.
    #[error("handler observed cancellation")]
    Cancelled,

    /// Transactional queue failure inside the handler.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Bus controller failure inside the handler.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// Discriminant carried by every `Fault`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Caller,
    Server,
    Timeout,
    Cancelled,
    Configuration,
}

/// Failure of a dispatch, as seen by the caller.
#[derive(Debug, thiserror::Error)]
pub enum Fault {
    /// The caller's own input was rejected by a business rule; remediable
    /// by the caller. Never re-wrapped.
    #[error("rejected: {source}")]
    Caller {
        #[source]
        source: RuleViolation,
    },

    /// Unexpected failure, or a failure in a cascade step the caller
    /// cannot remedy. Always wraps its original cause.
    #[error("dispatch failed in {component}")]
    Server {
        /// Component the failure originated in.
        component: String,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A deadline or lock wait expired; distinct from cancellation so the
    /// caller can retry later.
    #[error("timed out: {what}")]
    Timeout { what: String },

    /// The caller's own cancellation token fired. Never re-wrapped.
    #[error("dispatch cancelled by caller")]
    Cancelled,

    /// Invalid mode/strategy/lifetime configuration; fatal, never retried.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl Fault {
    pub fn kind(&self) -> FaultKind {
        match self {
            Fault::Caller { .. } => FaultKind::Caller,
            Fault::Server { .. } => FaultKind::Server,
            Fault::Timeout { .. } => FaultKind::Timeout,
            Fault::Cancelled => FaultKind::Cancelled,
            Fault::Configuration(_) => FaultKind::Configuration,
        }
    }

    pub(crate) fn server(
        component: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Fault::Server {
            component: component.into(),
            cause: Box::new(cause),
        }
    }
}

/// Where, relative to the dispatch, a handler failure originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureOrigin {
    /// The root operation of a command/event dispatch.
    Root(MessageKind),
    /// A branch operation created by cascading dispatch.
    Cascade,
    /// The root operation of a query dispatch.
    Query,
}

/// Map a handler failure onto the caller-visible fault taxonomy.
///
/// A `RuleViolation` is a caller-fault only from the root of a command or
/// query dispatch; from any cascade step the direct caller cannot remedy
/// it, so the identical violation becomes a server-fault. Cancellation is
/// the caller's only when their own token fired.
pub(crate) fn classify_handler_failure(
    origin: FailureOrigin,
    component: &str,
    caller_cancelled: bool,
    error: HandlerError,
) -> Fault {
    match error {
        HandlerError::Rule(violation) => match origin {
            FailureOrigin::Root(MessageKind::Command) | FailureOrigin::Query => {
                Fault::Caller { source: violation }
            }
            _ => Fault::server(component, violation),
        },
        HandlerError::Cancelled if caller_cancelled => match origin {
            // An expired caller token on a query surfaces as its deadline.
            FailureOrigin::Query => Fault::Timeout {
                what: "caller token expired".to_string(),
            },
            _ => Fault::Cancelled,
        },
        HandlerError::Cancelled => Fault::server(
            component,
            HandlerError::Other("cancellation not owned by the caller".to_string()),
        ),
        HandlerError::Queue(QueueError::LockTimeout { sequence, waited_ms })
        | HandlerError::Bus(BusError::Queue(QueueError::LockTimeout { sequence, waited_ms })) => {
            Fault::Timeout {
                what: format!("lock on queue entry {sequence} after {waited_ms}ms"),
            }
        }
        other => Fault::server(component, other),
    }
}

/// Map a unit-of-work flush failure onto the fault taxonomy.
///
/// Aggregated multi-threaded failures surface as one server-fault wrapping
/// the aggregate; the first failure is named in the component.
pub(crate) fn classify_flush(error: FlushError) -> Fault {
    let component = match &error {
        FlushError::Resource { resource, .. } => format!("unit-of-work:{resource}"),
        FlushError::Aggregate { failures, .. } => match failures.first() {
            Some(FlushError::Resource { resource, .. }) => format!("unit-of-work:{resource}"),
            _ => "unit-of-work".to_string(),
        },
        _ => "unit-of-work".to_string(),
    };
    Fault::Server {
        component,
        cause: Box::new(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation() -> HandlerError {
        RuleViolation::new("qty-positive", "quantity must be positive").into()
    }

    #[test]
    fn test_rule_from_root_command_is_caller_fault() {
        let fault = classify_handler_failure(
            FailureOrigin::Root(MessageKind::Command),
            "orders",
            false,
            violation(),
        );
        assert_eq!(fault.kind(), FaultKind::Caller);
    }

    #[test]
    fn test_same_rule_from_cascade_is_server_fault() {
        let fault = classify_handler_failure(FailureOrigin::Cascade, "billing", false, violation());
        assert_eq!(fault.kind(), FaultKind::Server);
        // The original cause is preserved, not replaced
        let source = std::error::Error::source(&fault).expect("wrapped cause");
        assert!(source.to_string().contains("qty-positive"));
    }

    #[test]
    fn test_caller_cancellation_propagates_unwrapped() {
        let fault = classify_handler_failure(
            FailureOrigin::Root(MessageKind::Command),
            "orders",
            true,
            HandlerError::Cancelled,
        );
        assert_eq!(fault.kind(), FaultKind::Cancelled);
    }

    #[test]
    fn test_foreign_cancellation_is_server_fault() {
        let fault = classify_handler_failure(
            FailureOrigin::Cascade,
            "billing",
            false,
            HandlerError::Cancelled,
        );
        assert_eq!(fault.kind(), FaultKind::Server);
    }

    #[test]
    fn test_expired_caller_token_on_query_is_timeout() {
        let fault = classify_handler_failure(
            FailureOrigin::Query,
            "orders.by-id",
            true,
            HandlerError::Cancelled,
        );
        assert_eq!(fault.kind(), FaultKind::Timeout);
    }

    #[test]
    fn test_lock_timeout_is_distinct_from_server_fault() {
        let fault = classify_handler_failure(
            FailureOrigin::Cascade,
            "outbox",
            false,
            HandlerError::Queue(QueueError::LockTimeout {
                sequence: 4,
                waited_ms: 50,
            }),
        );
        assert_eq!(fault.kind(), FaultKind::Timeout);
    }
}
