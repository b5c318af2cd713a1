//! Token bucket rate limiting.
//!
//! Each key holds a capped counter that refills continuously at a fixed
//! rate. An admission consumes one token.

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace};

use super::{or_default, Limiter};
use crate::clock::{Clock, SystemClock};
use crate::config::LimiterConfig;
use crate::error::{Result, TurnstileError};
use crate::registry::Registry;
use crate::store::{MemoryStore, Store};

/// Registry name of this algorithm.
pub const NAME: &str = "token_bucket";

const DEFAULT_CAPACITY: u64 = 5;
const DEFAULT_REFILL_RATE: f64 = 1.0;
const DEFAULT_TOKENS: u64 = 5;

/// Configuration for a token bucket. Zero fields take their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TokenBucketConfig {
    /// Maximum tokens a bucket can hold (default 5)
    pub capacity: u64,
    /// Tokens added per second (default 1)
    pub refill_rate: f64,
    /// Tokens in a newly created bucket (default 5)
    pub tokens: u64,
}

impl TokenBucketConfig {
    /// Extract the configuration from loosely typed parameters.
    pub fn from_params(params: &LimiterConfig) -> Result<Self> {
        Ok(Self {
            capacity: params.unsigned("capacity")?.unwrap_or_default(),
            refill_rate: params.real("refill_rate")?.unwrap_or_default(),
            tokens: params.unsigned("tokens")?.unwrap_or_default(),
        })
    }
}

/// Per-key token bucket state.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucketState {
    pub capacity: u64,
    pub refill_rate: f64,
    pub tokens: u64,
    /// Only advances when at least one whole token was added.
    pub last_refill: DateTime<Utc>,
}

impl TokenBucketState {
    fn new(capacity: u64, refill_rate: f64, tokens: u64, now: DateTime<Utc>) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens,
            last_refill: now,
        }
    }

    /// Add the whole tokens earned since the last refill.
    ///
    /// Sub-token progress is kept by leaving `last_refill` alone until a
    /// whole token is due.
    fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed = match (now - self.last_refill).to_std() {
            Ok(elapsed) => elapsed.as_secs_f64(),
            // Clock went backwards
            Err(_) => return,
        };

        let added = (elapsed * self.refill_rate).floor();
        if added < 1.0 {
            return;
        }

        self.tokens = self.capacity.min(self.tokens.saturating_add(added as u64));
        self.last_refill = now;
    }

    fn take(&mut self) -> bool {
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

/// A token bucket limiter.
pub struct TokenBucketLimiter<S = MemoryStore<TokenBucketState>, C = SystemClock> {
    store: S,
    clock: C,
    capacity: u64,
    refill_rate: f64,
    tokens: u64,
}

impl TokenBucketLimiter {
    /// Create a limiter backed by an in-memory store and the system clock.
    pub fn new(config: TokenBucketConfig) -> Result<Self> {
        Self::with_store(MemoryStore::new(), SystemClock, config)
    }
}

impl<S, C> TokenBucketLimiter<S, C>
where
    S: Store<TokenBucketState>,
    C: Clock,
{
    /// Create a limiter over an explicit store and clock.
    pub fn with_store(store: S, clock: C, config: TokenBucketConfig) -> Result<Self> {
        if !config.refill_rate.is_finite() || config.refill_rate < 0.0 {
            return Err(TurnstileError::Config(format!(
                "refill_rate must be a positive number, got {}",
                config.refill_rate
            )));
        }

        let capacity = or_default("capacity", config.capacity, DEFAULT_CAPACITY);
        let refill_rate = or_default("refill_rate", config.refill_rate, DEFAULT_REFILL_RATE);
        let mut tokens = or_default("tokens", config.tokens, DEFAULT_TOKENS);

        if tokens > capacity {
            info!(tokens, capacity, "Initial tokens exceed capacity, clamping");
            tokens = capacity;
        }

        Ok(Self {
            store,
            clock,
            capacity,
            refill_rate,
            tokens,
        })
    }

    /// The backing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Effective capacity after defaulting.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Effective refill rate after defaulting.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Effective initial tokens after defaulting and clamping.
    pub fn initial_tokens(&self) -> u64 {
        self.tokens
    }
}

impl<S, C> Limiter for TokenBucketLimiter<S, C>
where
    S: Store<TokenBucketState>,
    C: Clock,
{
    fn allow(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();

        let admitted = self.store.update(
            key,
            || {
                debug!(key = %key, tokens = self.tokens, "Creating token bucket");
                TokenBucketState::new(self.capacity, self.refill_rate, self.tokens, now)
            },
            |bucket| {
                bucket.refill(now);
                let admitted = bucket.take();
                trace!(key = %key, tokens = bucket.tokens, admitted, "Token bucket checked");
                admitted
            },
        )?;

        if !admitted {
            debug!(key = %key, "Rate limit exceeded");
        }
        Ok(admitted)
    }
}

/// Register the token bucket factory.
pub fn register(registry: &Registry) -> Result<()> {
    registry.register(NAME, |params: &LimiterConfig| {
        let config = TokenBucketConfig::from_params(params)?;
        Ok(Box::new(TokenBucketLimiter::new(config)?) as Box<dyn Limiter>)
    })
}
