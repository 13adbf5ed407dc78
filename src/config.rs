use std::time::Duration;

use serde::Deserialize;

use crate::breaker::CircuitBreaker;
use crate::limiter::RateLimiter;
use crate::retry::{Retry, RetryPolicy};
use crate::{Guard, GuardBuilder};

/// Top-level policy configuration. Format-agnostic (TOML, JSON, YAML via
/// serde); the crate ships TOML loading.
///
/// ```toml
/// dependency = "billing"
///
/// [limiter]
/// count = 100
/// window = "1s"
///
/// [breaker]
/// threshold = 5
/// open_for = "30s"
///
/// [retry]
/// max_attempts = 3
/// base_backoff = "100ms"
/// attempt_timeout = "5s"
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct GuardConfig {
    /// Identifier of the protected downstream dependency.
    pub dependency: Option<String>,

    /// Ingress admission gate. Optional: the limiter sits at the system
    /// edge and is built independently of the guard.
    pub limiter: Option<LimiterConfig>,

    pub breaker: Option<BreakerConfig>,

    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Deserialize)]
pub struct LimiterConfig {
    /// Requests allowed per `window` for each distinct key.
    pub count: u64,
    pub window: DurationValue,
    /// Max accumulated tokens. Defaults to `count`.
    pub capacity: Option<u64>,
    pub max_keys: Option<usize>,
    pub idle_ttl: Option<DurationValue>,
}

#[derive(Debug, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub threshold: u32,
    /// How long the circuit stays open before probing.
    pub open_for: DurationValue,
    pub half_open_trials: Option<u32>,
    pub max_keys: Option<usize>,
    pub idle_ttl: Option<DurationValue>,
}

#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub base_backoff: Option<DurationValue>,
    pub backoff_multiplier: Option<f64>,
    pub attempt_timeout: Option<DurationValue>,
}

/// A single duration, deserialized from a string like `"10s"` or `"200ms"`.
#[derive(Debug, Clone, Copy)]
pub struct DurationValue(pub Duration);

impl<'de> Deserialize<'de> for DurationValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s)
            .map(DurationValue)
            .map_err(serde::de::Error::custom)
    }
}

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        let n: u64 = ms.parse().map_err(|e| format!("invalid duration: {e}"))?;
        Ok(Duration::from_millis(n))
    } else if let Some(secs) = s.strip_suffix('s') {
        let n: f64 = secs.parse().map_err(|e| format!("invalid duration: {e}"))?;
        Duration::try_from_secs_f64(n).map_err(|e| format!("invalid duration: {e}"))
    } else {
        Err(format!("expected duration like '200ms' or '1s', got '{s}'"))
    }
}

impl LimiterConfig {
    pub fn build(&self) -> RateLimiter {
        let mut limiter = RateLimiter::per_key(self.count, self.window.0);
        if let Some(capacity) = self.capacity {
            limiter = limiter.capacity(capacity);
        }
        if let Some(max) = self.max_keys {
            limiter = limiter.max_keys(max);
        }
        if let Some(ttl) = self.idle_ttl {
            limiter = limiter.idle_ttl(ttl.0);
        }
        limiter
    }
}

impl BreakerConfig {
    pub fn build(&self) -> CircuitBreaker {
        let mut breaker = CircuitBreaker::new(self.threshold, self.open_for.0);
        if let Some(trials) = self.half_open_trials {
            breaker = breaker.half_open_trials(trials);
        }
        if let Some(max) = self.max_keys {
            breaker = breaker.max_keys(max);
        }
        if let Some(ttl) = self.idle_ttl {
            breaker = breaker.idle_ttl(ttl.0);
        }
        breaker
    }
}

impl RetryConfig {
    pub fn build(&self) -> Retry {
        let defaults = RetryPolicy::default();
        Retry::new(RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            base_backoff: self
                .base_backoff
                .map(|d| d.0)
                .unwrap_or(defaults.base_backoff),
            backoff_multiplier: self
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
            attempt_timeout: self
                .attempt_timeout
                .map(|d| d.0)
                .unwrap_or(defaults.attempt_timeout),
        })
    }
}

impl GuardConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load config from a TOML file.
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Build the ingress rate limiter, if one is configured.
    pub fn build_limiter(&self) -> Option<RateLimiter> {
        self.limiter.as_ref().map(LimiterConfig::build)
    }

    /// Build a [`GuardBuilder`] from this config. The caller attaches the
    /// compensation dispatcher (the channel is an external collaborator)
    /// and any failure/retry classifiers before calling `build()`.
    pub fn into_builder(self) -> GuardBuilder {
        let mut builder = Guard::builder(self.dependency.unwrap_or_else(|| "default".to_string()));
        if let Some(breaker) = &self.breaker {
            builder = builder.breaker(breaker.build());
        }
        if let Some(retry) = &self.retry {
            builder = builder.retry(retry.build());
        }
        builder
    }
}
