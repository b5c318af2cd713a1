//! Sliding window log rate limiting.
//!
//! Keeps the exact timestamp of every admission still inside the trailing
//! window. Memory per key is bounded by the capacity.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, trace};

use super::{or_default, Limiter};
use crate::clock::{Clock, SystemClock};
use crate::config::LimiterConfig;
use crate::error::{Result, TurnstileError};
use crate::registry::Registry;
use crate::store::{MemoryStore, Store};

/// Registry name of this algorithm.
pub const NAME: &str = "sliding_window_log";

const DEFAULT_CAPACITY: u64 = 5;
const DEFAULT_WINDOW_SIZE: u32 = 1;
const DEFAULT_WINDOW_DURATION: Duration = Duration::from_secs(60);

/// Configuration for a sliding window log limiter. Zero fields take their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlidingWindowLogConfig {
    /// Admissions allowed per trailing window (default 5)
    pub capacity: u64,
    /// Multiplier applied to `window_duration` (default 1)
    pub window_size: u32,
    /// Base window length (default 1 minute)
    pub window_duration: Duration,
}

impl SlidingWindowLogConfig {
    /// Extract the configuration from loosely typed parameters.
    pub fn from_params(params: &LimiterConfig) -> Result<Self> {
        let window_size = match params.unsigned("window_size")? {
            Some(size) => u32::try_from(size).map_err(|_| {
                TurnstileError::Config(format!("window_size is too large: {}", size))
            })?,
            None => 0,
        };

        Ok(Self {
            capacity: params.unsigned("capacity")?.unwrap_or_default(),
            window_size,
            window_duration: params.duration("window_duration")?.unwrap_or_default(),
        })
    }
}

/// Per-key admission log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindowLogState {
    /// Admission timestamps, oldest first.
    pub log: VecDeque<DateTime<Utc>>,
    pub capacity: u64,
}

impl SlidingWindowLogState {
    fn new(capacity: u64) -> Self {
        Self {
            log: VecDeque::new(),
            capacity,
        }
    }

    /// Drop every entry that is no longer inside `window` ending at `now`.
    fn prune(&mut self, now: DateTime<Utc>, window: TimeDelta) {
        self.log.retain(|admitted| {
            admitted
                .checked_add_signed(window)
                .map_or(true, |expires| expires > now)
        });
    }

    fn admit(&mut self, now: DateTime<Utc>, window: TimeDelta) -> bool {
        self.prune(now, window);

        if (self.log.len() as u64) < self.capacity {
            // Keep the log ascending if the clock stepped back.
            let stamp = self.log.back().map_or(now, |last| (*last).max(now));
            self.log.push_back(stamp);
            true
        } else {
            false
        }
    }
}

/// A sliding window log limiter.
pub struct SlidingWindowLogLimiter<S = MemoryStore<SlidingWindowLogState>, C = SystemClock> {
    store: S,
    clock: C,
    capacity: u64,
    window: TimeDelta,
}

impl SlidingWindowLogLimiter {
    /// Create a limiter backed by an in-memory store and the system clock.
    pub fn new(config: SlidingWindowLogConfig) -> Result<Self> {
        Self::with_store(MemoryStore::new(), SystemClock, config)
    }
}

impl<S, C> SlidingWindowLogLimiter<S, C>
where
    S: Store<SlidingWindowLogState>,
    C: Clock,
{
    /// Create a limiter over an explicit store and clock.
    pub fn with_store(store: S, clock: C, config: SlidingWindowLogConfig) -> Result<Self> {
        let capacity = or_default("capacity", config.capacity, DEFAULT_CAPACITY);
        let window_size = or_default("window_size", config.window_size, DEFAULT_WINDOW_SIZE);
        let window_duration =
            or_default("window_duration", config.window_duration, DEFAULT_WINDOW_DURATION);

        let window = window_duration
            .checked_mul(window_size)
            .and_then(|window| TimeDelta::from_std(window).ok())
            .ok_or_else(|| TurnstileError::Config("window is too long".to_string()))?;

        Ok(Self {
            store,
            clock,
            capacity,
            window,
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

    /// Effective trailing window.
    pub fn window(&self) -> TimeDelta {
        self.window
    }
}

impl<S, C> Limiter for SlidingWindowLogLimiter<S, C>
where
    S: Store<SlidingWindowLogState>,
    C: Clock,
{
    fn allow(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();

        let admitted = self.store.update(
            key,
            || {
                debug!(key = %key, capacity = self.capacity, "Creating sliding window log");
                SlidingWindowLogState::new(self.capacity)
            },
            |state| {
                let admitted = state.admit(now, self.window);
                trace!(
                    key = %key,
                    logged = state.log.len(),
                    admitted,
                    "Sliding window log checked"
                );
                admitted
            },
        )?;

        if !admitted {
            debug!(key = %key, "Rate limit exceeded");
        }
        Ok(admitted)
    }
}

/// Register the sliding window log factory.
pub fn register(registry: &Registry) -> Result<()> {
    registry.register(NAME, |params: &LimiterConfig| {
        let config = SlidingWindowLogConfig::from_params(params)?;
        Ok(Box::new(SlidingWindowLogLimiter::new(config)?) as Box<dyn Limiter>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::StoreError;
    use crate::store::testing::FailingStore;
    use chrono::TimeZone;

    type TestLimiter = SlidingWindowLogLimiter<MemoryStore<SlidingWindowLogState>, ManualClock>;

    fn start() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn test_limiter(config: SlidingWindowLogConfig) -> (TestLimiter, ManualClock) {
        let clock = ManualClock::new(start());
        let limiter =
            SlidingWindowLogLimiter::with_store(MemoryStore::new(), clock.clone(), config).unwrap();
        (limiter, clock)
    }

    fn log_len(limiter: &TestLimiter, key: &str) -> usize {
        limiter.store().get(key).unwrap().unwrap().log.len()
    }

    #[test]
    fn test_defaults_for_zero_config() {
        let limiter = SlidingWindowLogLimiter::new(SlidingWindowLogConfig::default()).unwrap();
        assert_eq!(limiter.capacity(), 5);
        assert_eq!(limiter.window(), TimeDelta::minutes(1));
    }

    #[test]
    fn test_window_is_duration_times_size() {
        let (limiter, _) = test_limiter(SlidingWindowLogConfig {
            capacity: 1,
            window_size: 3,
            window_duration: Duration::from_secs(10),
        });
        assert_eq!(limiter.window(), TimeDelta::seconds(30));
    }

    #[test]
    fn test_capacity_per_minute() {
        let (limiter, clock) = test_limiter(SlidingWindowLogConfig::default());

        for i in 1..=5 {
            assert!(limiter.allow("client").unwrap(), "call {} should be admitted", i);
        }
        assert!(!limiter.allow("client").unwrap());

        clock.advance(TimeDelta::seconds(59));
        assert!(!limiter.allow("client").unwrap());

        // Everything logged at the start has aged out
        clock.advance(TimeDelta::seconds(1));
        assert!(limiter.allow("client").unwrap());
        assert_eq!(log_len(&limiter, "client"), 1);
    }

    #[test]
    fn test_denial_prunes_without_appending() {
        let (limiter, clock) = test_limiter(SlidingWindowLogConfig {
            capacity: 2,
            ..SlidingWindowLogConfig::default()
        });

        limiter.allow("k").unwrap();
        clock.advance(TimeDelta::seconds(30));
        limiter.allow("k").unwrap();
        assert!(!limiter.allow("k").unwrap());
        assert_eq!(log_len(&limiter, "k"), 2);

        // The first entry expires; the second is still inside the window
        clock.advance(TimeDelta::seconds(30));
        assert!(limiter.allow("k").unwrap());
        assert!(!limiter.allow("k").unwrap());
        assert_eq!(log_len(&limiter, "k"), 2);
    }

    #[test]
    fn test_log_is_ascending_and_inside_window() {
        let (limiter, clock) = test_limiter(SlidingWindowLogConfig {
            capacity: 10,
            window_size: 1,
            window_duration: Duration::from_secs(5),
        });

        for _ in 0..20 {
            clock.advance(TimeDelta::milliseconds(700));
            limiter.allow("steady").unwrap();

            let state = limiter.store().get("steady").unwrap().unwrap();
            let now = clock.now();
            assert!(state.log.iter().zip(state.log.iter().skip(1)).all(|(a, b)| a <= b));
            assert!(state.log.iter().all(|t| *t + limiter.window() > now));
        }
    }

    #[test]
    fn test_log_stays_ascending_when_clock_steps_back() {
        let (limiter, clock) = test_limiter(SlidingWindowLogConfig::default());

        assert!(limiter.allow("k").unwrap());
        clock.advance(TimeDelta::seconds(-2));
        assert!(limiter.allow("k").unwrap());
        clock.advance(TimeDelta::seconds(1));
        assert!(limiter.allow("k").unwrap());

        let state = limiter.store().get("k").unwrap().unwrap();
        assert_eq!(state.log.len(), 3);
        assert!(state.log.iter().zip(state.log.iter().skip(1)).all(|(a, b)| a <= b));
        assert!(state.log.iter().all(|t| *t == start()));
    }

    #[test]
    fn test_store_fault_is_an_error() {
        let limiter = SlidingWindowLogLimiter::with_store(
            FailingStore,
            SystemClock,
            SlidingWindowLogConfig::default(),
        )
        .unwrap();

        match limiter.allow("k") {
            Err(TurnstileError::Store(err)) => {
                assert_eq!(err, StoreError::Unavailable("down".to_string()))
            }
            other => panic!("expected a store fault, got {:?}", other),
        }
    }

    #[test]
    fn test_keys_are_independent() {
        let (limiter, _) = test_limiter(SlidingWindowLogConfig {
            capacity: 1,
            ..SlidingWindowLogConfig::default()
        });

        assert!(limiter.allow("a").unwrap());
        assert!(!limiter.allow("a").unwrap());
        assert!(limiter.allow("b").unwrap());
    }

    #[test]
    fn test_from_params() {
        let params = LimiterConfig::new()
            .with("capacity", 7)
            .with("window_size", 2)
            .with("window_duration", Duration::from_secs(30));
        let config = SlidingWindowLogConfig::from_params(&params).unwrap();
        assert_eq!(config.capacity, 7);
        assert_eq!(config.window_size, 2);
        assert_eq!(config.window_duration, Duration::from_secs(30));
    }

    #[test]
    fn test_from_params_wrong_type() {
        let params = LimiterConfig::new().with("capacity", "lots");
        assert!(matches!(
            SlidingWindowLogConfig::from_params(&params),
            Err(TurnstileError::WrongType { .. })
        ));
    }
}
