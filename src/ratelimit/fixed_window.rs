//! Fixed window rate limiting.
//!
//! Time is cut into windows aligned to the Unix epoch, so every key sees the
//! same window boundaries. Each window carries its own quota.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::{or_default, Limiter};
use crate::clock::{Clock, SystemClock};
use crate::config::LimiterConfig;
use crate::error::{Result, TurnstileError};
use crate::registry::Registry;
use crate::store::{MemoryStore, Store};

/// Registry name of this algorithm.
pub const NAME: &str = "fixed_window";

const DEFAULT_WINDOW_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_WINDOW_SIZE: u32 = 1;
const DEFAULT_WINDOW_TOKENS: u64 = 5;

/// Configuration for a fixed window limiter. Zero fields take their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FixedWindowConfig {
    /// Base window length (default 1 second)
    pub window_duration: Duration,
    /// Multiplier applied to `window_duration` (default 1)
    pub window_size: u32,
    /// Quota per window (default 5)
    pub window_tokens: u64,
}

impl FixedWindowConfig {
    /// Extract the configuration from loosely typed parameters.
    pub fn from_params(params: &LimiterConfig) -> Result<Self> {
        let window_size = match params.unsigned("window_size")? {
            Some(size) => u32::try_from(size).map_err(|_| {
                TurnstileError::Config(format!("window_size is too large: {}", size))
            })?,
            None => 0,
        };

        Ok(Self {
            window_duration: params.duration("window_duration")?.unwrap_or_default(),
            window_size,
            window_tokens: params.unsigned("window_tokens")?.unwrap_or_default(),
        })
    }
}

/// Per-key fixed window state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedWindowState {
    /// Index of the window this record belongs to; never moves backwards.
    pub current_window: i64,
    /// Quota left in `current_window`.
    pub window_tokens: u64,
    pub capacity: u64,
}

impl FixedWindowState {
    fn new(current_window: i64, capacity: u64) -> Self {
        Self {
            current_window,
            window_tokens: capacity,
            capacity,
        }
    }

    fn admit(&mut self, window: i64) -> bool {
        if window > self.current_window {
            // Rolled over: fresh quota, minus this admission
            self.current_window = window;
            self.window_tokens = self.capacity.saturating_sub(1);
            return true;
        }

        if self.window_tokens > 0 {
            self.window_tokens -= 1;
            true
        } else {
            false
        }
    }
}

/// A fixed window limiter.
pub struct FixedWindowLimiter<S = MemoryStore<FixedWindowState>, C = SystemClock> {
    store: S,
    clock: C,
    /// Effective window length in milliseconds, always positive.
    window_millis: i64,
    window_tokens: u64,
}

impl FixedWindowLimiter {
    /// Create a limiter backed by an in-memory store and the system clock.
    pub fn new(config: FixedWindowConfig) -> Result<Self> {
        Self::with_store(MemoryStore::new(), SystemClock, config)
    }
}

impl<S, C> FixedWindowLimiter<S, C>
where
    S: Store<FixedWindowState>,
    C: Clock,
{
    /// Create a limiter over an explicit store and clock.
    pub fn with_store(store: S, clock: C, config: FixedWindowConfig) -> Result<Self> {
        let window_duration =
            or_default("window_duration", config.window_duration, DEFAULT_WINDOW_DURATION);
        let window_size = or_default("window_size", config.window_size, DEFAULT_WINDOW_SIZE);
        let window_tokens =
            or_default("window_tokens", config.window_tokens, DEFAULT_WINDOW_TOKENS);

        let window = window_duration
            .checked_mul(window_size)
            .ok_or_else(|| TurnstileError::Config("window is too long".to_string()))?;
        let window_millis = i64::try_from(window.as_millis())
            .map_err(|_| TurnstileError::Config("window is too long".to_string()))?;
        if window_millis == 0 {
            return Err(TurnstileError::Config(format!(
                "window must be at least 1ms, got {:?}",
                window
            )));
        }

        Ok(Self {
            store,
            clock,
            window_millis,
            window_tokens,
        })
    }

    /// The backing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Effective window length.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_millis as u64)
    }

    /// Effective quota per window.
    pub fn window_tokens(&self) -> u64 {
        self.window_tokens
    }

    /// Index of the epoch-aligned window containing `at`.
    pub fn window_index(&self, at: DateTime<Utc>) -> i64 {
        at.timestamp_millis().div_euclid(self.window_millis)
    }
}

impl<S, C> Limiter for FixedWindowLimiter<S, C>
where
    S: Store<FixedWindowState>,
    C: Clock,
{
    fn allow(&self, key: &str) -> Result<bool> {
        let window = self.window_index(self.clock.now());

        let admitted = self.store.update(
            key,
            || {
                debug!(key = %key, window, "Creating fixed window");
                FixedWindowState::new(window, self.window_tokens)
            },
            |state| {
                let admitted = state.admit(window);
                trace!(
                    key = %key,
                    window,
                    remaining = state.window_tokens,
                    admitted,
                    "Fixed window checked"
                );
                admitted
            },
        )?;

        if !admitted {
            debug!(key = %key, window, "Rate limit exceeded");
        }
        Ok(admitted)
    }
}

/// Register the fixed window factory.
pub fn register(registry: &Registry) -> Result<()> {
    registry.register(NAME, |params: &LimiterConfig| {
        let config = FixedWindowConfig::from_params(params)?;
        Ok(Box::new(FixedWindowLimiter::new(config)?) as Box<dyn Limiter>)
    })
}
