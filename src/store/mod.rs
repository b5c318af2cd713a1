//! Per-key state storage for the limiters.
//!
//! A store maps a key to one algorithm-specific state record. Each limiter
//! binds to a store parameterized over its own state type, so no store is
//! ever shared between algorithms.

mod memory;

pub use memory::MemoryStore;

use crate::error::StoreError;

/// Result of a store operation.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Trait for per-key state stores.
///
/// All operations must be safe to call concurrently for different keys, and
/// operations on the same key must be linearizable. An `Err` means a real
/// storage fault; a missing key is reported as `Ok(None)`.
///
/// Implementations backed by a remote medium must bound every call with a
/// timeout and report it as [`StoreError::Timeout`].
pub trait Store<S>: Send + Sync
where
    S: Clone + Send,
{
    /// Fetch a copy of the record for `key`.
    fn get(&self, key: &str) -> StoreResult<Option<S>>;

    /// Insert or replace the record for `key`.
    fn set(&self, key: &str, state: S) -> StoreResult<()>;

    /// Remove the record for `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// Remove every record.
    fn clear(&self) -> StoreResult<()>;

    /// Atomically read, modify and write the record for `key`.
    ///
    /// When the key is absent a record is created with `init` first. `f`
    /// runs against the record and its result is persisted before any other
    /// operation on the same key can observe it. A compare-and-swap backed
    /// store may call `init` and `f` again after losing a race.
    fn update<T, I, F>(&self, key: &str, init: I, f: F) -> StoreResult<T>
    where
        I: FnMut() -> S,
        F: FnMut(&mut S) -> T;
}
