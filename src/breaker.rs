use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::BoxError;
use crate::store::{BreakerStore, CircuitAction};

/// Decides whether an operation error counts against the breaker.
/// Return `true` to charge the error as a failure.
pub type FailureClassifier = Arc<dyn Fn(&BoxError) -> bool + Send + Sync>;

const DEFAULT_MAX_KEYS: usize = 10_000;
const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(600);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

enum State {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen { in_flight: u32, successes: u32 },
}

struct Circuit {
    state: State,
    last_seen: Instant,
}

impl Circuit {
    fn closed(now: Instant) -> Self {
        Self {
            state: State::Closed {
                consecutive_failures: 0,
            },
            last_seen: now,
        }
    }
}

#[derive(Clone, Copy)]
struct Params {
    threshold: u32,
    open_for: Duration,
    trials: u32,
    max_keys: usize,
    idle_ttl: Duration,
}

struct Inner {
    circuits: DashMap<String, Circuit>,
    params: RwLock<Params>,
    next_cleanup: Mutex<Instant>,
}

impl Inner {
    fn maybe_cleanup(&self, params: &Params, now: Instant) {
        let Ok(mut next) = self.next_cleanup.try_lock() else {
            return;
        };
        if now < *next {
            return;
        }
        let idle_ttl = params.idle_ttl;
        self.circuits.retain(|_, circuit| {
            let idle_ok = now.saturating_duration_since(circuit.last_seen) <= idle_ttl;
            match circuit.state {
                // An open circuit holds information the next caller needs;
                // never drop it before its recovery deadline.
                State::Open { until } => idle_ok || now < until,
                _ => idle_ok,
            }
        });
        *next = now + CLEANUP_INTERVAL;
    }

    fn can_evict(&self, params: &Params, circuit: &Circuit, now: Instant) -> bool {
        if now.saturating_duration_since(circuit.last_seen) <= params.idle_ttl {
            return false;
        }
        match circuit.state {
            State::Open { until } => now >= until,
            _ => true,
        }
    }

    fn evict_if_needed(&self, params: &Params, key: &str, now: Instant) {
        if self.circuits.contains_key(key) || self.circuits.len() < params.max_keys {
            return;
        }
        let oldest = self
            .circuits
            .iter()
            .filter(|entry| self.can_evict(params, entry.value(), now))
            .min_by_key(|entry| entry.last_seen)
            .map(|entry| entry.key().clone());
        if let Some(oldest_key) = oldest {
            self.circuits.remove(&oldest_key);
        }
    }

    fn check(&self, key: &str) -> CircuitAction {
        let params = *self.params.read().unwrap();
        let now = Instant::now();
        self.maybe_cleanup(&params, now);
        self.evict_if_needed(&params, key, now);

        let mut circuit = self
            .circuits
            .entry(key.to_string())
            .or_insert_with(|| Circuit::closed(now));
        let circuit = circuit.value_mut();
        circuit.last_seen = now;

        match circuit.state {
            State::Closed { .. } => CircuitAction::Allow,
            State::Open { until } => {
                if now >= until {
                    tracing::info!(dependency = key, "circuit half-open, probing");
                    circuit.state = State::HalfOpen {
                        in_flight: 1,
                        successes: 0,
                    };
                    CircuitAction::Allow
                } else {
                    CircuitAction::Reject
                }
            }
            State::HalfOpen {
                ref mut in_flight,
                successes,
            } => {
                if *in_flight + successes < params.trials {
                    *in_flight += 1;
                    CircuitAction::Allow
                } else {
                    CircuitAction::Reject
                }
            }
        }
    }

    fn record(&self, key: &str, success: bool) {
        let params = *self.params.read().unwrap();
        let now = Instant::now();
        self.maybe_cleanup(&params, now);
        self.evict_if_needed(&params, key, now);

        let mut circuit = self
            .circuits
            .entry(key.to_string())
            .or_insert_with(|| Circuit::closed(now));
        let circuit = circuit.value_mut();
        circuit.last_seen = now;

        match circuit.state {
            State::Closed {
                ref mut consecutive_failures,
            } => {
                if success {
                    *consecutive_failures = 0;
                } else {
                    *consecutive_failures += 1;
                    if *consecutive_failures >= params.threshold {
                        tracing::warn!(
                            dependency = key,
                            failures = *consecutive_failures,
                            open_for_ms = params.open_for.as_millis() as u64,
                            "circuit opened"
                        );
                        circuit.state = State::Open {
                            until: now + params.open_for,
                        };
                    }
                }
            }
            State::HalfOpen {
                ref mut in_flight,
                ref mut successes,
            } => {
                if success {
                    *in_flight = in_flight.saturating_sub(1);
                    *successes += 1;
                    if *successes >= params.trials {
                        tracing::info!(dependency = key, "circuit closed");
                        circuit.state = State::Closed {
                            consecutive_failures: 0,
                        };
                    }
                } else {
                    tracing::warn!(dependency = key, "probe failed, circuit reopened");
                    circuit.state = State::Open {
                        until: now + params.open_for,
                    };
                }
            }
            // A late outcome from an attempt that was in flight when the
            // circuit tripped; the timer already restarted.
            State::Open { .. } => {}
        }
    }

    fn release(&self, key: &str) {
        if let Some(mut circuit) = self.circuits.get_mut(key) {
            if let State::HalfOpen {
                ref mut in_flight, ..
            } = circuit.value_mut().state
            {
                *in_flight = in_flight.saturating_sub(1);
            }
        }
    }
}

/// In-memory breaker store keyed by dependency identifier.
///
/// This is the default store used by [`CircuitBreaker`]. One state machine
/// per dependency, held in a sharded map so breakers for unrelated
/// dependencies never contend.
#[derive(Clone)]
pub struct InMemoryBreakerStore {
    inner: Arc<Inner>,
}

impl InMemoryBreakerStore {
    fn new(threshold: u32, open_for: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                circuits: DashMap::new(),
                params: RwLock::new(Params {
                    threshold,
                    open_for,
                    trials: 1,
                    max_keys: DEFAULT_MAX_KEYS,
                    idle_ttl: DEFAULT_IDLE_TTL,
                }),
                next_cleanup: Mutex::new(Instant::now() + CLEANUP_INTERVAL),
            }),
        }
    }

    fn set_trials(&self, n: u32) {
        self.inner.params.write().unwrap().trials = n.max(1);
    }

    fn set_max_keys(&self, max: usize) {
        self.inner.params.write().unwrap().max_keys = max.max(1);
    }

    fn set_idle_ttl(&self, ttl: Duration) {
        self.inner.params.write().unwrap().idle_ttl = ttl;
    }
}

impl BreakerStore for InMemoryBreakerStore {
    fn check(&self, dependency: &str) -> impl Future<Output = CircuitAction> + Send {
        std::future::ready(self.inner.check(dependency))
    }

    fn record(&self, dependency: &str, success: bool) -> impl Future<Output = ()> + Send {
        self.inner.record(dependency, success);
        std::future::ready(())
    }

    fn release(&self, dependency: &str) {
        self.inner.release(dependency);
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// The circuit is open; the operation was never invoked.
    #[error("breaker open for dependency '{0}'")]
    Rejected(String),

    /// The operation ran and failed. Whether the failure was charged to the
    /// breaker depends on the configured classifier.
    #[error(transparent)]
    Operation(BoxError),
}

/// Circuit breaker guarding one or more downstream dependencies.
///
/// Tracks consecutive failures per dependency and trips when a threshold is
/// reached, rejecting calls immediately instead of invoking them. After the
/// open duration elapses the circuit goes half-open and allows a bounded
/// number of probe calls; if they all succeed the circuit closes, and a
/// single probe failure reopens it with a fresh timer.
///
/// Failure classification is injectable via [`classify`](Self::classify):
/// by default every operation error is charged as a failure, but a caller
/// distinguishing e.g. timeouts and server errors from client input errors
/// should install a classifier so only genuine dependency failures trip the
/// circuit. Errors ruled non-failures leave the breaker state untouched.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use stanchion::breaker::CircuitBreaker;
/// use stanchion::error::BoxError;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
/// let result: Result<&str, _> = breaker
///     .execute("billing", async { Ok::<_, BoxError>("account-1") })
///     .await;
/// assert!(result.is_ok());
/// # }
/// ```
pub struct CircuitBreaker<S: BreakerStore = InMemoryBreakerStore> {
    store: S,
    classify: FailureClassifier,
}

impl<S: BreakerStore> Clone for CircuitBreaker<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            classify: self.classify.clone(),
        }
    }
}

impl<S: BreakerStore> CircuitBreaker<S> {
    /// Create a circuit breaker with a custom backend store.
    pub fn with_store(store: S) -> Self {
        Self {
            store,
            classify: Arc::new(|_| true),
        }
    }

    /// Install a failure classifier. Return `true` to count the error as a
    /// dependency failure; errors ruled out (e.g. invalid client input) do
    /// not move the state machine.
    pub fn classify(mut self, f: impl Fn(&BoxError) -> bool + Send + Sync + 'static) -> Self {
        self.classify = Arc::new(f);
        self
    }

    /// Run `op` against `dependency` if the circuit allows it, recording the
    /// outcome. Returns [`ExecuteError::Rejected`] without invoking `op`
    /// when the circuit is open.
    ///
    /// If the returned future is dropped while `op` is in flight, any
    /// half-open trial slot it holds is released without being charged as a
    /// failure.
    pub async fn execute<T, Fut>(&self, dependency: &str, op: Fut) -> Result<T, ExecuteError>
    where
        Fut: Future<Output = Result<T, BoxError>>,
    {
        match self.store.check(dependency).await {
            CircuitAction::Reject => Err(ExecuteError::Rejected(dependency.to_string())),
            CircuitAction::Allow => {
                let mut slot = SlotGuard {
                    store: &self.store,
                    dependency,
                    armed: true,
                };
                let result = op.await;
                slot.armed = false;

                match result {
                    Ok(value) => {
                        self.store.record(dependency, true).await;
                        Ok(value)
                    }
                    Err(err) => {
                        if (self.classify)(&err) {
                            self.store.record(dependency, false).await;
                        } else {
                            self.store.release(dependency);
                        }
                        Err(ExecuteError::Operation(err))
                    }
                }
            }
        }
    }
}

impl CircuitBreaker {
    /// Circuit breaker with in-memory state. Trips a dependency's circuit
    /// after `threshold` consecutive failures; stays open for `open_for`.
    pub fn new(threshold: u32, open_for: Duration) -> Self {
        Self::with_store(InMemoryBreakerStore::new(threshold, open_for))
    }

    /// Number of probe calls allowed through in the half-open state before
    /// the circuit closes. Defaults to 1.
    pub fn half_open_trials(self, n: u32) -> Self {
        self.store.set_trials(n);
        self
    }

    /// Soft cap for distinct dependencies tracked in memory.
    pub fn max_keys(self, max: usize) -> Self {
        self.store.set_max_keys(max);
        self
    }

    /// Drop circuit state that has been idle longer than this duration.
    /// Open circuits are kept until their recovery deadline regardless.
    pub fn idle_ttl(self, ttl: Duration) -> Self {
        self.store.set_idle_ttl(ttl);
        self
    }
}

struct SlotGuard<'a, S: BreakerStore> {
    store: &'a S,
    dependency: &'a str,
    armed: bool,
}

impl<S: BreakerStore> Drop for SlotGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.store.release(self.dependency);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner(threshold: u32, open_for: Duration) -> Inner {
        Inner {
            circuits: DashMap::new(),
            params: RwLock::new(Params {
                threshold,
                open_for,
                trials: 1,
                max_keys: 10,
                idle_ttl: Duration::from_secs(600),
            }),
            next_cleanup: Mutex::new(Instant::now() + CLEANUP_INTERVAL),
        }
    }

    fn state_of(inner: &Inner, key: &str) -> &'static str {
        match inner.circuits.get(key).unwrap().state {
            State::Closed { .. } => "closed",
            State::Open { .. } => "open",
            State::HalfOpen { .. } => "half-open",
        }
    }

    #[test]
    fn trips_after_threshold_consecutive_failures() {
        let inner = inner(3, Duration::from_secs(30));

        inner.record("dep", false);
        inner.record("dep", false);
        assert_eq!(state_of(&inner, "dep"), "closed");
        assert_eq!(inner.check("dep"), CircuitAction::Allow);

        inner.record("dep", false);
        assert_eq!(state_of(&inner, "dep"), "open");
        assert_eq!(inner.check("dep"), CircuitAction::Reject);
    }

    #[test]
    fn success_resets_failure_count() {
        let inner = inner(3, Duration::from_secs(30));

        inner.record("dep", false);
        inner.record("dep", false);
        inner.record("dep", true);
        inner.record("dep", false);
        inner.record("dep", false);
        assert_eq!(state_of(&inner, "dep"), "closed");
    }

    #[test]
    fn open_transitions_to_half_open_after_deadline() {
        let inner = inner(1, Duration::from_secs(30));

        inner.record("dep", false);
        assert_eq!(inner.check("dep"), CircuitAction::Reject);

        // Move the deadline into the past instead of sleeping.
        inner.circuits.get_mut("dep").unwrap().state = State::Open {
            until: Instant::now() - Duration::from_millis(1),
        };
        assert_eq!(inner.check("dep"), CircuitAction::Allow);
        assert_eq!(state_of(&inner, "dep"), "half-open");
    }

    #[test]
    fn half_open_probe_failure_reopens_with_fresh_timer() {
        let inner = inner(1, Duration::from_secs(30));

        inner.record("dep", false);
        inner.circuits.get_mut("dep").unwrap().state = State::Open {
            until: Instant::now() - Duration::from_millis(1),
        };
        assert_eq!(inner.check("dep"), CircuitAction::Allow);

        inner.record("dep", false);
        assert_eq!(state_of(&inner, "dep"), "open");
        match inner.circuits.get("dep").unwrap().state {
            State::Open { until } => assert!(until > Instant::now()),
            _ => unreachable!(),
        };
    }

    #[test]
    fn half_open_probe_success_closes_and_resets_failures() {
        let inner = inner(2, Duration::from_secs(30));

        inner.record("dep", false);
        inner.record("dep", false);
        inner.circuits.get_mut("dep").unwrap().state = State::Open {
            until: Instant::now() - Duration::from_millis(1),
        };
        assert_eq!(inner.check("dep"), CircuitAction::Allow);
        inner.record("dep", true);

        assert_eq!(state_of(&inner, "dep"), "closed");
        match inner.circuits.get("dep").unwrap().state {
            State::Closed {
                consecutive_failures,
            } => assert_eq!(consecutive_failures, 0),
            _ => unreachable!(),
        };
    }

    #[test]
    fn half_open_rejects_beyond_trial_budget() {
        let inner = inner(1, Duration::from_secs(30));

        inner.record("dep", false);
        inner.circuits.get_mut("dep").unwrap().state = State::Open {
            until: Instant::now() - Duration::from_millis(1),
        };
        assert_eq!(inner.check("dep"), CircuitAction::Allow);
        assert_eq!(inner.check("dep"), CircuitAction::Reject);
    }

    #[test]
    fn release_frees_a_trial_slot_without_state_change() {
        let inner = inner(1, Duration::from_secs(30));

        inner.record("dep", false);
        inner.circuits.get_mut("dep").unwrap().state = State::Open {
            until: Instant::now() - Duration::from_millis(1),
        };
        assert_eq!(inner.check("dep"), CircuitAction::Allow);
        assert_eq!(inner.check("dep"), CircuitAction::Reject);

        inner.release("dep");
        assert_eq!(state_of(&inner, "dep"), "half-open");
        assert_eq!(inner.check("dep"), CircuitAction::Allow);
    }

    #[test]
    fn late_outcome_while_open_does_not_restart_timer() {
        let inner = inner(1, Duration::from_secs(30));

        inner.record("dep", false);
        let until_before = match inner.circuits.get("dep").unwrap().state {
            State::Open { until } => until,
            _ => unreachable!(),
        };

        inner.record("dep", false);
        match inner.circuits.get("dep").unwrap().state {
            State::Open { until } => assert_eq!(until, until_before),
            _ => unreachable!(),
        };
    }

    #[test]
    fn cleanup_keeps_open_circuit_until_recovery_deadline() {
        let inner = inner(1, Duration::from_secs(30));
        inner.params.write().unwrap().idle_ttl = Duration::from_millis(1);

        inner.record("a", false);
        {
            let mut circuit = inner.circuits.get_mut("a").unwrap();
            circuit.state = State::Open {
                until: Instant::now() + Duration::from_secs(20),
            };
            circuit.last_seen = Instant::now() - Duration::from_secs(10);
        }
        *inner.next_cleanup.lock().unwrap() = Instant::now();
        let _ = inner.check("b");

        assert!(inner.circuits.contains_key("a"));
    }
}
