use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::GuardError;
use crate::store::AdmissionStore;

const DEFAULT_MAX_KEYS: usize = 10_000;
const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(600);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl Bucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_seen: now,
        }
    }

    /// Lazy refill, then take one whole token if available. Never goes
    /// negative: a rejected request does not consume anything.
    fn admit(&mut self, rate: f64, capacity: f64, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * rate).min(capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Copy)]
struct Params {
    rate: f64,
    capacity: f64,
    max_keys: usize,
    idle_ttl: Duration,
}

struct Inner {
    buckets: DashMap<String, Bucket>,
    params: RwLock<Params>,
    next_cleanup: Mutex<Instant>,
}

impl Inner {
    fn refill_horizon(&self, params: &Params) -> Duration {
        let secs = params.capacity / params.rate;
        if !secs.is_finite() || secs <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// A bucket still inside its refill horizon may be below capacity, and
    /// dropping it would hand the key a fresh full bucket. Idle means idle
    /// past both the configured TTL and the horizon.
    fn effective_ttl(&self, params: &Params) -> Duration {
        params.idle_ttl.max(self.refill_horizon(params))
    }

    fn maybe_cleanup(&self, params: &Params, now: Instant) {
        let Ok(mut next) = self.next_cleanup.try_lock() else {
            return;
        };
        if now < *next {
            return;
        }
        let ttl = self.effective_ttl(params);
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) <= ttl);
        *next = now + CLEANUP_INTERVAL;
    }

    fn evict_if_needed(&self, params: &Params, key: &str, now: Instant) {
        if self.buckets.contains_key(key) || self.buckets.len() < params.max_keys {
            return;
        }
        let ttl = self.effective_ttl(params);
        let oldest = self
            .buckets
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_seen) > ttl)
            .min_by_key(|entry| entry.last_seen)
            .map(|entry| entry.key().clone());
        if let Some(oldest_key) = oldest {
            self.buckets.remove(&oldest_key);
        }
    }

    fn admit(&self, key: &str) -> bool {
        let params = *self.params.read().unwrap();
        let now = Instant::now();
        self.maybe_cleanup(&params, now);
        self.evict_if_needed(&params, key, now);

        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(params.capacity, now));
        bucket.last_seen = now;
        bucket.admit(params.rate, params.capacity, now)
    }
}

/// In-memory token-bucket store keyed by client identity.
///
/// This is the default store used by [`RateLimiter`]. Buckets live in a
/// sharded map so unrelated keys never contend on a common lock; all state
/// is in-process.
#[derive(Clone)]
pub struct InMemoryAdmissionStore {
    inner: Arc<Inner>,
}

impl InMemoryAdmissionStore {
    fn new(rate: f64, capacity: f64) -> Self {
        Self {
            inner: Arc::new(Inner {
                buckets: DashMap::new(),
                params: RwLock::new(Params {
                    rate,
                    capacity,
                    max_keys: DEFAULT_MAX_KEYS,
                    idle_ttl: DEFAULT_IDLE_TTL,
                }),
                next_cleanup: Mutex::new(Instant::now() + CLEANUP_INTERVAL),
            }),
        }
    }

    fn set_capacity(&self, capacity: f64) {
        self.inner.params.write().unwrap().capacity = capacity;
    }

    fn set_max_keys(&self, max: usize) {
        self.inner.params.write().unwrap().max_keys = max.max(1);
    }

    fn set_idle_ttl(&self, ttl: Duration) {
        self.inner.params.write().unwrap().idle_ttl = ttl;
    }
}

impl AdmissionStore for InMemoryAdmissionStore {
    fn admit(&self, key: &str) -> impl Future<Output = bool> + Send {
        std::future::ready(self.inner.admit(key))
    }
}

/// Per-key token-bucket admission control for the system edge.
///
/// Each distinct key (typically the normalized client address supplied by
/// the ingress layer) gets its own bucket, created at full capacity on
/// first sight and refilled lazily on access. A request from a key with
/// less than one token is rejected immediately; admission never blocks or
/// queues; the caller surfaces the rejection as a "too many requests"
/// outcome and the client recovers by trying again later.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use stanchion::limiter::RateLimiter;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let limiter = RateLimiter::per_key(10, Duration::from_secs(1));
/// assert!(limiter.admit("203.0.113.7").await);
/// # }
/// ```
pub struct RateLimiter<S: AdmissionStore = InMemoryAdmissionStore> {
    store: S,
}

impl<S: AdmissionStore> Clone for RateLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: AdmissionStore> RateLimiter<S> {
    /// Create a rate limiter with a custom backend store.
    pub fn with_store(store: S) -> Self {
        Self { store }
    }

    /// Admit or reject one request for `key`. Returns `true` when a token
    /// was consumed. Keys are fully independent.
    pub async fn admit(&self, key: &str) -> bool {
        self.store.admit(key).await
    }

    /// [`admit`](Self::admit) mapped to the outcome the ingress layer
    /// surfaces: a rejected request becomes [`GuardError::RateLimited`],
    /// distinct from any downstream failure.
    pub async fn check(&self, key: &str) -> Result<(), GuardError> {
        if self.store.admit(key).await {
            Ok(())
        } else {
            Err(GuardError::RateLimited)
        }
    }
}

impl RateLimiter {
    /// Allow `count` requests per `window` for each distinct key. Bucket
    /// capacity defaults to `count`; unknown keys start at full capacity.
    pub fn per_key(count: u64, window: Duration) -> Self {
        let rate = count as f64 / window.as_secs_f64();
        Self {
            store: InMemoryAdmissionStore::new(rate, count as f64),
        }
    }

    /// Set the bucket capacity (max accumulated tokens). Defaults to `count`.
    pub fn capacity(self, capacity: u64) -> Self {
        self.store.set_capacity(capacity as f64);
        self
    }

    /// Soft cap for distinct keys tracked in memory.
    /// Idle buckets are evicted first; if all tracked buckets are active,
    /// the map may temporarily exceed this value so active keys keep their
    /// token debt.
    pub fn max_keys(self, max: usize) -> Self {
        self.store.set_max_keys(max);
        self
    }

    /// Drop key state that has been idle longer than this duration.
    pub fn idle_ttl(self, ttl: Duration) -> Self {
        self.store.set_idle_ttl(ttl);
        self
    }
}
