//! Rate limiting algorithms.
//!
//! Every algorithm implements [`Limiter`] and keeps its per-key state in a
//! [`Store`](crate::store::Store) parameterized over its own state type.

mod fixed_window;
mod sliding_window_log;
mod token_bucket;

pub use fixed_window::{FixedWindowConfig, FixedWindowLimiter, FixedWindowState};
pub use sliding_window_log::{
    SlidingWindowLogConfig, SlidingWindowLogLimiter, SlidingWindowLogState,
};
pub use token_bucket::{TokenBucketConfig, TokenBucketLimiter, TokenBucketState};

pub(crate) use fixed_window::register as register_fixed_window;
pub(crate) use sliding_window_log::register as register_sliding_window_log;
pub(crate) use token_bucket::register as register_token_bucket;

use std::fmt::Debug;
use tracing::info;

use crate::error::Result;

/// The admission decision shared by every algorithm.
///
/// `Ok(true)` admits the work item, `Ok(false)` denies it. An `Err` is a
/// store fault and never stands in for a denial.
pub trait Limiter: Send + Sync {
    /// Decide whether the next unit of work for `key` may proceed.
    fn allow(&self, key: &str) -> Result<bool>;
}

/// Replace a zero-valued setting with its documented default.
fn or_default<T>(setting: &'static str, value: T, default: T) -> T
where
    T: Default + PartialEq + Debug,
{
    if value == T::default() {
        info!(setting, default = ?default, "Using default for unset rate limit setting");
        default
    } else {
        value
    }
}
