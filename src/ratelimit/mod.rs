//! Token-bucket rate limiting for external services.
//!
//! Each named service gets one [`TokenBucket`]. Buckets refill continuously
//! at `capacity / period` tokens per second and never hold more than
//! `capacity`. Refill and admission happen under one lock per bucket.
//!
//! Buckets are process-local: they provide advisory backpressure for a single
//! worker process and are not shared across processes.
//!
//! # Example
//!
//! ```rust,ignore
//! use patchforge::ratelimit::{BucketConfig, RateLimiterRegistry};
//! use std::time::Duration;
//!
//! let registry = RateLimiterRegistry::new(BucketConfig::default());
//! registry
//!     .acquire("openrouter", 1, true, Duration::from_secs(30))
//!     .await?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::MetricsCollector;

/// Longest single sleep while waiting for tokens.
const MAX_WAIT_STEP: Duration = Duration::from_millis(50);

/// Errors returned by [`TokenBucket::acquire`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RateLimitError {
    /// Not enough tokens and the caller asked not to wait.
    #[error("Rate limit exhausted for '{service}': requested {requested}, available {available:.2}")]
    Exhausted {
        service: String,
        requested: u32,
        available: f64,
    },

    /// Tokens did not become available before the timeout.
    #[error("Timed out after {waited:?} waiting for {requested} tokens from '{service}'")]
    Timeout {
        service: String,
        requested: u32,
        waited: Duration,
    },

    /// The request can never be satisfied by this bucket.
    #[error("Requested {requested} tokens from '{service}' but capacity is {capacity}")]
    ExceedsCapacity {
        service: String,
        requested: u32,
        capacity: f64,
    },
}

/// Capacity and refill period of one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    /// Maximum tokens the bucket can hold.
    pub capacity: f64,
    /// Time for an empty bucket to refill completely, in seconds.
    pub period_secs: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 60.0,
            period_secs: 60.0,
        }
    }
}

impl BucketConfig {
    pub fn new(capacity: f64, period: Duration) -> Self {
        Self {
            capacity,
            period_secs: period.as_secs_f64(),
        }
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        if self.period_secs > 0.0 {
            self.capacity / self.period_secs
        } else {
            0.0
        }
    }
}

/// Rate-limit configuration for all services.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket used for services without an explicit entry.
    pub default: BucketConfig,
    /// Per-service overrides.
    pub services: HashMap<String, BucketConfig>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A thread-safe token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    name: String,
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(name: impl Into<String>, config: &BucketConfig) -> Self {
        let capacity = config.capacity.max(0.0);
        Self {
            name: name.into(),
            capacity,
            refill_per_sec: config.refill_rate().max(0.0),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    /// Returns the tokens currently available after refilling.
    pub fn available(&self) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Takes `tokens` if available right now.
    pub fn try_acquire(&self, tokens: u32) -> Result<(), RateLimitError> {
        self.try_acquire_at(tokens, Instant::now())
    }

    /// Takes `tokens`, waiting up to `timeout` when `blocking` is set.
    ///
    /// Returns how long the call waited.
    pub async fn acquire(
        &self,
        tokens: u32,
        blocking: bool,
        timeout: Duration,
    ) -> Result<Duration, RateLimitError> {
        let start = Instant::now();

        loop {
            let wait = match self.take(tokens, Instant::now()) {
                Ok(()) => {
                    let waited = start.elapsed();
                    MetricsCollector::new().record_rate_limit_wait(&self.name, waited.as_secs_f64());
                    return Ok(waited);
                }
                Err(TakeError::ExceedsCapacity) => {
                    return Err(self.exceeds_capacity(tokens));
                }
                Err(TakeError::Short { available, .. }) if !blocking => {
                    return Err(RateLimitError::Exhausted {
                        service: self.name.clone(),
                        requested: tokens,
                        available,
                    });
                }
                Err(TakeError::Short { wait, .. }) => wait,
            };

            let waited = start.elapsed();
            if waited >= timeout {
                tracing::debug!(
                    service = %self.name,
                    requested = tokens,
                    waited_ms = waited.as_millis() as u64,
                    "Rate limiter wait timed out"
                );
                return Err(RateLimitError::Timeout {
                    service: self.name.clone(),
                    requested: tokens,
                    waited,
                });
            }

            let step = wait.min(MAX_WAIT_STEP).min(timeout - waited);
            tokio::time::sleep(step.max(Duration::from_millis(1))).await;
        }
    }

    /// Non-blocking admission decision at an explicit instant.
    pub(crate) fn try_acquire_at(&self, tokens: u32, now: Instant) -> Result<(), RateLimitError> {
        match self.take(tokens, now) {
            Ok(()) => Ok(()),
            Err(TakeError::ExceedsCapacity) => Err(self.exceeds_capacity(tokens)),
            Err(TakeError::Short { available, .. }) => Err(RateLimitError::Exhausted {
                service: self.name.clone(),
                requested: tokens,
                available,
            }),
        }
    }

    /// Refills, then takes `tokens` if the bucket holds enough.
    fn take(&self, tokens: u32, now: Instant) -> Result<(), TakeError> {
        let requested = f64::from(tokens);
        if requested > self.capacity {
            return Err(TakeError::ExceedsCapacity);
        }

        let mut state = self.lock();
        self.refill(&mut state, now);

        if state.tokens >= requested {
            state.tokens -= requested;
            return Ok(());
        }

        let missing = requested - state.tokens;
        let wait = if self.refill_per_sec > 0.0 {
            Duration::from_secs_f64(missing / self.refill_per_sec)
        } else {
            MAX_WAIT_STEP
        };
        Err(TakeError::Short {
            available: state.tokens,
            wait,
        })
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        // Instants from other threads may arrive slightly out of order.
        if now <= state.last_refill {
            return;
        }
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        // The state is two plain numbers, valid even after a panic elsewhere.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn exceeds_capacity(&self, tokens: u32) -> RateLimitError {
        RateLimitError::ExceedsCapacity {
            service: self.name.clone(),
            requested: tokens,
            capacity: self.capacity,
        }
    }
}

enum TakeError {
    ExceedsCapacity,
    Short { available: f64, wait: Duration },
}

/// Named buckets, created on first use.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl RateLimiterRegistry {
    /// Creates a registry where every service uses `default`.
    pub fn new(default: BucketConfig) -> Self {
        Self::from_config(RateLimitConfig {
            default,
            services: HashMap::new(),
        })
    }

    pub fn from_config(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the bucket for `service`, creating it on first use.
    pub fn bucket(&self, service: &str) -> Arc<TokenBucket> {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        buckets
            .entry(service.to_string())
            .or_insert_with(|| {
                let config = self
                    .config
                    .services
                    .get(service)
                    .unwrap_or(&self.config.default);
                tracing::debug!(
                    service = service,
                    capacity = config.capacity,
                    period_secs = config.period_secs,
                    "Created rate limiter bucket"
                );
                Arc::new(TokenBucket::new(service, config))
            })
            .clone()
    }

    /// Acquires tokens from the bucket for `service`.
    pub async fn acquire(
        &self,
        service: &str,
        tokens: u32,
        blocking: bool,
        timeout: Duration,
    ) -> Result<Duration, RateLimitError> {
        self.bucket(service).acquire(tokens, blocking, timeout).await
    }

    /// Returns the names of buckets created so far, sorted.
    pub fn services(&self) -> Vec<String> {
        let buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<String> = buckets.keys().cloned().collect();
        names.sort();
        names
    }
}
