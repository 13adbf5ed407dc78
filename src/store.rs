use std::future::Future;

use crate::error::PublishError;
use crate::fallback::CompensationRecord;

/// Backend storage for the token-bucket admission gate.
///
/// Each call to [`admit`](Self::admit) should refill tokens for the key
/// based on elapsed time, then consume one token and return `true` if at
/// least one whole token was available, or return `false` without consuming
/// anything. Configuration (rate, capacity) is provided to the store at
/// construction time.
pub trait AdmissionStore: Send + Sync + Clone + 'static {
    fn admit(&self, key: &str) -> impl Future<Output = bool> + Send;
}

/// The result of checking a circuit breaker for a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitAction {
    /// The call is allowed (circuit closed or half-open probe).
    Allow,
    /// The call is rejected without being attempted (circuit open).
    Reject,
}

/// Backend storage for the circuit breaker.
///
/// The store manages one Closed/Open/HalfOpen state machine per dependency
/// identifier and the transitions between them. Configuration (failure
/// threshold, open duration, half-open trial count) is provided at
/// construction time.
pub trait BreakerStore: Send + Sync + Clone + 'static {
    /// Check whether a call to `dependency` is allowed.
    ///
    /// May transition Open → HalfOpen if the open duration has elapsed.
    fn check(&self, dependency: &str) -> impl Future<Output = CircuitAction> + Send;

    /// Record the outcome of a call to `dependency`.
    ///
    /// `success = true` resets the failure count (Closed) or counts toward
    /// closing (HalfOpen). `success = false` increments failures (Closed,
    /// may trip to Open) or reopens with a fresh timer (HalfOpen → Open).
    fn record(&self, dependency: &str, success: bool) -> impl Future<Output = ()> + Send;

    /// Release a half-open trial slot whose outcome will never be counted:
    /// the probe was cancelled before completing, or its error was ruled a
    /// non-failure by the classifier. Must not be charged as a failure.
    ///
    /// Synchronous so it can run from a drop guard when the caller's future
    /// is cancelled mid-flight.
    fn release(&self, dependency: &str);
}

/// The asynchronous channel compensation records are published to.
///
/// Delivery is at-least-once: the consumer on the far side must dedupe by
/// `operation_id`. Acknowledgement of `publish` is the commit point: once
/// it returns `Ok`, the dispatcher retains no reference to the record and
/// will never re-publish it.
pub trait CompensationChannel: Send + Sync + Clone + 'static {
    fn publish(
        &self,
        record: &CompensationRecord,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;
}
