use std::time::Duration;

/// Boxed error type carried by protected operations.
///
/// Operations hand their failures to the breaker and retry layers as trait
/// objects; the failure classifiers receive them by reference and decide
/// whether they count against the breaker or are worth retrying.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Terminal errors surfaced to the caller of a guarded operation.
///
/// Everything recoverable stays internal: a single failed attempt is
/// retried, an open breaker or exhausted retry budget flows into
/// compensation. Only the cases where no automatic path remains, or where
/// no work was attempted at all, reach the caller.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// The admission gate rejected the request before any work was done.
    /// The client may retry later; nothing was attempted downstream.
    #[error("too many requests")]
    RateLimited,

    /// The breaker is open and no fallback dispatcher is configured, so the
    /// call was skipped without an equivalent effect being recorded.
    #[error("dependency '{0}' unavailable")]
    DependencyUnavailable(String),

    /// All attempts failed and no fallback dispatcher is configured.
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: BoxError,
    },

    /// The synchronous path failed *and* publishing the compensation record
    /// failed. There is no further automatic recovery; the caller must see
    /// this rather than a silent success.
    #[error("compensation publish failed for operation '{operation_id}'")]
    CompensationFailed {
        operation_id: String,
        #[source]
        source: PublishError,
    },
}

/// Failure to hand a [`CompensationRecord`](crate::fallback::CompensationRecord)
/// to the asynchronous channel.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("compensation channel closed")]
    ChannelClosed,

    #[error("compensation record could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Other(BoxError),
}

/// Error returned by the retry executor to the guard layer.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// The breaker rejected the call without invoking the operation. An open
    /// breaker is not a reason to keep retrying, so the executor stops
    /// immediately and no retry attempt is consumed.
    #[error("breaker open for dependency '{0}'")]
    Open(String),

    /// Every permitted attempt failed (or the classifier ruled the error
    /// non-retryable). Carries the last failure and the per-attempt log.
    #[error("retries exhausted after {} attempts", attempts.len())]
    Exhausted {
        last: BoxError,
        attempts: Vec<crate::retry::Attempt>,
    },
}

/// Distinguished error produced when a single attempt exceeds its timeout.
///
/// Wrapped in [`BoxError`] so the injectable classifiers can downcast and
/// treat hung calls explicitly; the default classifiers count it as a plain
/// failure, which is what the breaker contract requires.
#[derive(Debug, thiserror::Error)]
#[error("attempt timed out after {timeout:?}")]
pub struct AttemptTimeout {
    pub timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_timeout_downcasts_through_box_error() {
        let err: BoxError = Box::new(AttemptTimeout {
            timeout: Duration::from_millis(250),
        });
        assert!(err.downcast_ref::<AttemptTimeout>().is_some());
    }

    #[test]
    fn guard_error_preserves_publish_failure_source() {
        let err = GuardError::CompensationFailed {
            operation_id: "P1:provision".to_string(),
            source: PublishError::ChannelClosed,
        };
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "compensation channel closed");
    }
}
