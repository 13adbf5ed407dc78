//! Resilient remote-call protection for synchronous dependencies.
//!
//! A [`Guard`] composes three layers around one protected operation, as
//! explicit nested strategies rather than ambient interception:
//!
//! - a per-dependency [`CircuitBreaker`](breaker::CircuitBreaker) that fails
//!   fast while the dependency is down,
//! - a [`Retry`](retry::Retry) executor with bounded attempts, per-attempt
//!   timeouts, and exponential backoff,
//! - a fallback [`Dispatcher`](fallback::Dispatcher) that durably publishes
//!   a [`CompensationRecord`](fallback::CompensationRecord) to an
//!   asynchronous channel when the call path is exhausted, so the business
//!   operation still completes eventually.
//!
//! The system edge is gated separately by the per-key token-bucket
//! [`RateLimiter`](limiter::RateLimiter).

pub mod breaker;
pub mod config;
pub mod error;
pub mod fallback;
pub mod limiter;
pub mod remote;
pub mod retry;
pub mod store;

use serde::Serialize;

use crate::breaker::{CircuitBreaker, InMemoryBreakerStore};
use crate::error::GuardError;
use crate::fallback::{Dispatcher, FailureReason, InMemoryChannel};
use crate::retry::{Attempt, Retry, RetryPolicy};
use crate::store::{BreakerStore, CompensationChannel};

/// How a guarded operation concluded.
#[derive(Debug)]
pub enum Dispatch<T> {
    /// The dependency call succeeded synchronously.
    Completed { value: T, attempts: Vec<Attempt> },
    /// The synchronous path failed, and an equivalent effect was durably
    /// handed to the compensation channel. The business operation may
    /// proceed; the dependent effect completes out of band. This is a
    /// deliberate eventual-consistency trade-off, distinct from plain
    /// success.
    Pending { operation_id: String },
}

impl<T> Dispatch<T> {
    /// `true` when the effect is deferred to the compensation consumer.
    pub fn is_pending(&self) -> bool {
        matches!(self, Dispatch::Pending { .. })
    }
}

/// Builder for a [`Guard`].
pub struct GuardBuilder<
    B: BreakerStore = InMemoryBreakerStore,
    C: CompensationChannel = InMemoryChannel,
> {
    dependency: String,
    breaker: CircuitBreaker<B>,
    retry: Retry,
    dispatcher: Option<Dispatcher<C>>,
}

impl<B: BreakerStore, C: CompensationChannel> GuardBuilder<B, C> {
    /// Replace the circuit breaker (and with it the backing store type).
    pub fn breaker<B2: BreakerStore>(self, breaker: CircuitBreaker<B2>) -> GuardBuilder<B2, C> {
        GuardBuilder {
            dependency: self.dependency,
            breaker,
            retry: self.retry,
            dispatcher: self.dispatcher,
        }
    }

    /// Replace the retry executor.
    pub fn retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    /// Attach the fallback dispatcher. Without one, breaker-open and
    /// retry-exhausted outcomes surface as errors instead of `Pending`.
    pub fn dispatcher<C2: CompensationChannel>(
        self,
        dispatcher: Dispatcher<C2>,
    ) -> GuardBuilder<B, C2> {
        GuardBuilder {
            dependency: self.dependency,
            breaker: self.breaker,
            retry: self.retry,
            dispatcher: Some(dispatcher),
        }
    }

    pub fn build(self) -> Guard<B, C> {
        Guard {
            dependency: self.dependency,
            breaker: self.breaker,
            retry: self.retry,
            dispatcher: self.dispatcher,
        }
    }
}

/// Protects one synchronous dependency: retry over breaker over the call,
/// with durable compensation on exhaustion.
///
/// State machine for one logical operation:
///
/// ```text
/// Attempting(n) → Success                           (terminal)
///               → Attempting(n+1)                   (after backoff)
///               → Exhausted → Compensating → Accepted / PublishFailed
/// BreakerOpen   → Compensating                      (no attempt consumed)
/// ```
///
/// Cloning is cheap; clones share breaker state and the dispatch guard.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use stanchion::{Dispatch, Guard};
/// use stanchion::breaker::CircuitBreaker;
/// use stanchion::error::BoxError;
/// use stanchion::fallback::{Dispatcher, InMemoryChannel};
/// use stanchion::remote::{AccountStatus, ProvisionRequest, ProvisionResponse};
/// use stanchion::retry::{Retry, RetryPolicy};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), stanchion::error::GuardError> {
/// let (channel, _records) = InMemoryChannel::new();
/// let guard = Guard::builder("billing")
///     .breaker(CircuitBreaker::new(3, Duration::from_secs(30)))
///     .retry(Retry::new(RetryPolicy::default()))
///     .dispatcher(Dispatcher::new(channel))
///     .build();
///
/// let request = ProvisionRequest {
///     operation_id: "P1:provision".to_string(),
///     name: "John Doe".to_string(),
///     email: "john@example.com".to_string(),
/// };
///
/// let outcome = guard
///     .call("P1:provision", &request, || async {
///         Ok::<_, BoxError>(ProvisionResponse {
///             account_id: "acct-1".to_string(),
///             status: AccountStatus::Active,
///         })
///     })
///     .await?;
/// assert!(!outcome.is_pending());
/// # Ok(())
/// # }
/// ```
pub struct Guard<B: BreakerStore = InMemoryBreakerStore, C: CompensationChannel = InMemoryChannel> {
    dependency: String,
    breaker: CircuitBreaker<B>,
    retry: Retry,
    dispatcher: Option<Dispatcher<C>>,
}

impl<B: BreakerStore, C: CompensationChannel> Clone for Guard<B, C> {
    fn clone(&self) -> Self {
        Self {
            dependency: self.dependency.clone(),
            breaker: self.breaker.clone(),
            retry: self.retry.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl Guard {
    /// Start building a guard for the named dependency, with a default
    /// breaker (5 failures, 30s open) and retry policy.
    pub fn builder(dependency: impl Into<String>) -> GuardBuilder {
        GuardBuilder {
            dependency: dependency.into(),
            breaker: CircuitBreaker::new(5, std::time::Duration::from_secs(30)),
            retry: Retry::new(RetryPolicy::default()),
            dispatcher: None,
        }
    }
}

impl<B: BreakerStore, C: CompensationChannel> Guard<B, C> {
    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    /// Run one logical operation through the protected call path.
    ///
    /// `operation_id` must be unique per logical operation (e.g. the patient
    /// id plus operation kind): it is both the compensation dedupe key and
    /// the contract that makes re-invoking `op` safe: the remote side must
    /// dedupe by it. That consumer-side dedupe is relied upon here, not
    /// enforced. `payload` is serialized into the compensation record only
    /// when the fallback path is taken.
    ///
    /// `op` is invoked once per attempt. Dropping the returned future stops
    /// in-flight retries and backoff promptly; an attempt cancelled
    /// mid-flight is not charged to the breaker as a failure.
    pub async fn call<T, P, F, Fut>(
        &self,
        operation_id: &str,
        payload: &P,
        op: F,
    ) -> Result<Dispatch<T>, GuardError>
    where
        P: Serialize,
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, error::BoxError>>,
    {
        match self.retry.run(&self.breaker, &self.dependency, op).await {
            Ok(completed) => Ok(Dispatch::Completed {
                value: completed.value,
                attempts: completed.attempts,
            }),
            Err(error::RetryError::Open(_)) => {
                self.fall_back(operation_id, payload, FailureReason::DependencyUnavailable, None)
                    .await
            }
            Err(error::RetryError::Exhausted { last, attempts }) => {
                let reason = FailureReason::RetriesExhausted {
                    attempts: attempts.len() as u32,
                    last_error: last.to_string(),
                };
                self.fall_back(operation_id, payload, reason, Some(last)).await
            }
        }
    }

    async fn fall_back<T, P: Serialize>(
        &self,
        operation_id: &str,
        payload: &P,
        reason: FailureReason,
        last: Option<error::BoxError>,
    ) -> Result<Dispatch<T>, GuardError> {
        let Some(dispatcher) = &self.dispatcher else {
            return Err(match (reason, last) {
                (FailureReason::RetriesExhausted { attempts, .. }, Some(last)) => {
                    GuardError::RetriesExhausted { attempts, last }
                }
                _ => GuardError::DependencyUnavailable(self.dependency.clone()),
            });
        };

        let payload = serde_json::to_value(payload).map_err(|e| GuardError::CompensationFailed {
            operation_id: operation_id.to_string(),
            source: error::PublishError::Serialize(e),
        })?;

        dispatcher
            .compensate(operation_id, payload, reason)
            .await
            .map_err(|source| GuardError::CompensationFailed {
                operation_id: operation_id.to_string(),
                source,
            })?;

        Ok(Dispatch::Pending {
            operation_id: operation_id.to_string(),
        })
    }
}
