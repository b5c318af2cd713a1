//! In-memory state store.

use dashmap::DashMap;
use tracing::trace;

use super::{Store, StoreResult};

/// A process-local store backed by a sharded concurrent map.
///
/// `update` holds the write guard of the key's shard for the whole
/// read-modify-write, so callers on the same key are serialized while keys
/// in other shards proceed in parallel.
pub struct MemoryStore<S> {
    states: DashMap<String, S>,
}

impl<S> MemoryStore<S> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Keep only the records for which `keep` returns true.
    ///
    /// Records are never expired by the limiters themselves; this is the hook
    /// for an external idle-key sweep.
    pub fn retain<F>(&self, mut keep: F)
    where
        F: FnMut(&str, &S) -> bool,
    {
        self.states.retain(|key, state| keep(key, state));
    }
}

impl<S> Default for MemoryStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Store<S> for MemoryStore<S>
where
    S: Clone + Send + Sync,
{
    fn get(&self, key: &str) -> StoreResult<Option<S>> {
        Ok(self.states.get(key).map(|state| state.value().clone()))
    }

    fn set(&self, key: &str, state: S) -> StoreResult<()> {
        self.states.insert(key.to_string(), state);
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.states.remove(key);
        Ok(())
    }

    fn clear(&self) -> StoreResult<()> {
        self.states.clear();
        Ok(())
    }

    fn update<T, I, F>(&self, key: &str, mut init: I, mut f: F) -> StoreResult<T>
    where
        I: FnMut() -> S,
        F: FnMut(&mut S) -> T,
    {
        let mut entry = self
            .states
            .entry(key.to_string())
            .or_insert_with(|| {
                trace!(key = %key, "Creating state record");
                init()
            });
        Ok(f(entry.value_mut()))
    }
}
