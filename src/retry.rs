use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::breaker::{CircuitBreaker, ExecuteError};
use crate::error::{AttemptTimeout, BoxError, RetryError};
use crate::store::BreakerStore;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Decides whether an attempt error is worth retrying.
/// Return `false` to stop immediately and report the error as final.
pub type RetryClassifier = Arc<dyn Fn(&BoxError) -> bool + Send + Sync>;

/// Bounded-retry configuration for one protected operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_backoff: Duration,
    /// Growth factor applied per subsequent attempt:
    /// `base_backoff * backoff_multiplier^(attempt - 1)`, capped at 30s.
    pub backoff_multiplier: f64,
    /// Budget for a single attempt. A hung call is cut off and classified
    /// as a failure so it cannot hold a breaker trial slot indefinitely.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure,
    Timeout,
}

/// Record of one execution attempt. Lives only for the duration of the
/// logical operation; nothing here is persisted.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    pub started_at: Instant,
    pub outcome: AttemptOutcome,
    /// Backoff slept after this attempt; zero for the final attempt and for
    /// successes.
    pub backoff_applied: Duration,
}

/// A successful protected call together with its attempt log.
#[derive(Debug)]
pub struct Completed<T> {
    pub value: T,
    pub attempts: Vec<Attempt>,
}

/// Retry executor: wraps a breaker-guarded operation with bounded retry and
/// exponential backoff.
///
/// The operation closure is invoked once per attempt; the remote side is
/// expected to dedupe by operation id, which is what makes re-invocation
/// safe (see [`Guard::call`](crate::Guard::call)). The backoff wait
/// suspends only the calling task, never other operations sharing the same
/// breaker.
///
/// Retrying stops early in two cases: the breaker reports open state (an
/// open breaker is not a reason to keep retrying), or the injectable
/// classifier rules the error non-retryable.
pub struct Retry {
    policy: RetryPolicy,
    retryable: RetryClassifier,
}

impl Clone for Retry {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy,
            retryable: self.retryable.clone(),
        }
    }
}

impl Retry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retryable: Arc::new(|_| true),
        }
    }

    /// Install a retry classifier. Return `false` for errors that retrying
    /// cannot fix (e.g. rejected input); the executor then stops without
    /// consuming further attempts.
    pub fn retryable(mut self, f: impl Fn(&BoxError) -> bool + Send + Sync + 'static) -> Self {
        self.retryable = Arc::new(f);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `op` through `breaker` up to `max_attempts` times.
    ///
    /// Each attempt runs under the per-attempt timeout; an elapsed timeout
    /// surfaces as [`AttemptTimeout`] and counts as a failure for both the
    /// breaker and the retry budget. Returns the value and attempt log on
    /// the first success, [`RetryError::Open`] as soon as the breaker
    /// rejects, or [`RetryError::Exhausted`] with the last failure.
    pub async fn run<T, S, F, Fut>(
        &self,
        breaker: &CircuitBreaker<S>,
        dependency: &str,
        mut op: F,
    ) -> Result<Completed<T>, RetryError>
    where
        S: BreakerStore,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        // A zero-attempt policy still runs the operation once.
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts: Vec<Attempt> = Vec::with_capacity(max_attempts as usize);

        for attempt in 1..=max_attempts {
            let started_at = Instant::now();
            let timeout = self.policy.attempt_timeout;
            let guarded = async {
                match tokio::time::timeout(timeout, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(Box::new(AttemptTimeout { timeout }) as BoxError),
                }
            };

            match breaker.execute(dependency, guarded).await {
                Ok(value) => {
                    attempts.push(Attempt {
                        number: attempt,
                        started_at,
                        outcome: AttemptOutcome::Success,
                        backoff_applied: Duration::ZERO,
                    });
                    return Ok(Completed { value, attempts });
                }
                Err(ExecuteError::Rejected(dep)) => {
                    return Err(RetryError::Open(dep));
                }
                Err(ExecuteError::Operation(err)) => {
                    let outcome = if err.downcast_ref::<AttemptTimeout>().is_some() {
                        AttemptOutcome::Timeout
                    } else {
                        AttemptOutcome::Failure
                    };

                    if attempt == max_attempts || !(self.retryable)(&err) {
                        attempts.push(Attempt {
                            number: attempt,
                            started_at,
                            outcome,
                            backoff_applied: Duration::ZERO,
                        });
                        return Err(RetryError::Exhausted {
                            last: err,
                            attempts,
                        });
                    }

                    let delay = backoff_delay(&self.policy, attempt);
                    attempts.push(Attempt {
                        number: attempt,
                        started_at,
                        outcome,
                        backoff_applied: delay,
                    });
                    tracing::debug!(
                        dependency,
                        error = %err,
                        attempt,
                        max = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "retrying operation"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        unreachable!()
    }
}

fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = policy.backoff_multiplier.powi(attempt as i32 - 1);
    if !factor.is_finite() || factor <= 0.0 {
        return policy.base_backoff.min(MAX_BACKOFF);
    }
    let delay = policy.base_backoff.mul_f64(factor.min(1e9));
    delay.min(MAX_BACKOFF)
}
