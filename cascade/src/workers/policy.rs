use std::fmt;

use crate::error::{CascadeError, ErrorKind};

/// Retry behavior for a classified error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryDirective {
    /// The batch is retried after the configured delay, forever.
    Timed,
    /// The worker stops; an operator has to finish or repair something first.
    Manual,
    /// The worker stops; the condition is a protocol violation.
    NoRetry,
}

impl fmt::Display for RetryDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetryDirective::Timed => "timed_retry",
            RetryDirective::Manual => "manual_retry",
            RetryDirective::NoRetry => "no_retry",
        };
        f.write_str(name)
    }
}

/// Policy describing how a [`CascadeError`] is handled by workers.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ErrorHandlingPolicy {
    retry_directive: RetryDirective,
    solution: Option<&'static str>,
}

impl ErrorHandlingPolicy {
    const fn new(retry_directive: RetryDirective, solution: Option<&'static str>) -> Self {
        Self {
            retry_directive,
            solution,
        }
    }

    pub fn retry_directive(&self) -> RetryDirective {
        self.retry_directive
    }

    /// Returns an optional operator-facing solution message.
    pub fn solution(&self) -> Option<&'static str> {
        self.solution
    }

    pub fn should_retry(&self) -> bool {
        self.retry_directive == RetryDirective::Timed
    }
}

/// Builds the [`ErrorHandlingPolicy`] of an error from its kind.
pub fn build_error_handling_policy(error: &CascadeError) -> ErrorHandlingPolicy {
    match error.kind() {
        // Nothing of the batch was committed, so it is replayed from scratch.
        ErrorKind::SourceConnectionFailed
        | ErrorKind::TargetConnectionFailed
        | ErrorKind::PeerUnreachable
        | ErrorKind::ConnectionFailed
        | ErrorKind::Timeout
        | ErrorKind::QueryRetryable
        | ErrorKind::IoError => ErrorHandlingPolicy::new(RetryDirective::Timed, None),

        ErrorKind::UnknownControlEvent => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Upgrade the worker to a version that understands the control event."),
        ),
        ErrorKind::LostPosition => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("The consumer position does not match its provider. Repair the completed tick of the consumer."),
        ),
        ErrorKind::RetryEventInCascade => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Events must not be retried on a cascaded queue. Remove the consumer that retried them."),
        ),
        ErrorKind::InvalidEventFormat
        | ErrorKind::InvalidTableTransition
        | ErrorKind::InvalidSnapshot
        | ErrorKind::InvalidNodeType
        | ErrorKind::InvalidHandler => ErrorHandlingPolicy::new(RetryDirective::NoRetry, None),

        ErrorKind::MissingConsumerState
        | ErrorKind::MissingTableState
        | ErrorKind::StateOwnershipViolation
        | ErrorKind::CopyAlreadyRunning => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Check the node and table registry; another process may have changed them."),
        ),

        ErrorKind::TopologyChangeIncomplete => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Finish the interrupted topology change by re-running the remaining steps."),
        ),
        ErrorKind::NodeCommandFailed | ErrorKind::NodeCallFailed => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Inspect the node function reply and fix the node state."),
        ),
        ErrorKind::DumpFileExists => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Move the previous dump file away before resurrecting again."),
        ),

        // Special handling for fault injection tests.
        #[cfg(feature = "failpoints")]
        ErrorKind::WithNoRetry => {
            ErrorHandlingPolicy::new(RetryDirective::NoRetry, Some("Cannot retry this error."))
        }
        #[cfg(feature = "failpoints")]
        ErrorKind::WithManualRetry => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Manually trigger retry after resolving the issue."),
        ),
        #[cfg(feature = "failpoints")]
        ErrorKind::WithTimedRetry => ErrorHandlingPolicy::new(
            RetryDirective::Timed,
            Some("Will automatically retry after the configured delay."),
        ),

        _ => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("There is no single prescribed solution for this error. Inspect the consumer error and the worker logs."),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: ErrorKind) -> CascadeError {
        CascadeError::from((kind, "test error"))
    }

    #[test]
    fn classifies_connection_failures_as_timed_retry() {
        for kind in [
            ErrorKind::SourceConnectionFailed,
            ErrorKind::TargetConnectionFailed,
            ErrorKind::ConnectionFailed,
            ErrorKind::QueryRetryable,
        ] {
            let policy = build_error_handling_policy(&err(kind));
            assert_eq!(policy.retry_directive(), RetryDirective::Timed);
            assert!(policy.should_retry());
        }
    }

    #[test]
    fn classifies_protocol_violations_as_fatal() {
        for kind in [
            ErrorKind::UnknownControlEvent,
            ErrorKind::LostPosition,
            ErrorKind::RetryEventInCascade,
            ErrorKind::InvalidTableTransition,
        ] {
            let policy = build_error_handling_policy(&err(kind));
            assert_eq!(policy.retry_directive(), RetryDirective::NoRetry);
        }
    }

    #[test]
    fn classifies_incomplete_topology_change_as_manual() {
        let policy = build_error_handling_policy(&err(ErrorKind::TopologyChangeIncomplete));
        assert_eq!(policy.retry_directive(), RetryDirective::Manual);
        assert!(policy.solution().is_some());
    }

    #[test]
    fn classifies_plain_query_failure_as_manual() {
        let policy = build_error_handling_policy(&err(ErrorKind::QueryFailed));
        assert_eq!(policy.retry_directive(), RetryDirective::Manual);
    }

    #[test]
    fn directive_renders_as_metric_label() {
        assert_eq!(RetryDirective::Timed.to_string(), "timed_retry");
        assert_eq!(RetryDirective::NoRetry.to_string(), "no_retry");
    }
}
