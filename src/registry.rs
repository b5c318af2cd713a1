//! Named limiter factories.
//!
//! A [`Registry`] is created once at startup, populated by each algorithm
//! module's `register` function, and handed to whatever needs to build a
//! limiter by name. There is no process-wide registry.

use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::LimiterConfig;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{self, Limiter};

/// Builds a limiter from loosely typed parameters.
pub type LimiterFactory = dyn Fn(&LimiterConfig) -> Result<Box<dyn Limiter>> + Send + Sync;

/// A name → factory table.
pub struct Registry {
    factories: RwLock<HashMap<String, Arc<LimiterFactory>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry holding the built-in algorithms:
    /// `token_bucket`, `fixed_window` and `sliding_window_log`.
    pub fn with_builtin() -> Result<Self> {
        let registry = Self::new();
        ratelimit::register_token_bucket(&registry)?;
        ratelimit::register_fixed_window(&registry)?;
        ratelimit::register_sliding_window_log(&registry)?;
        Ok(registry)
    }

    /// Register a factory under `name`.
    ///
    /// Fails if the name is taken; the existing factory is kept.
    pub fn register<N, F>(&self, name: N, factory: F) -> Result<()>
    where
        N: Into<String>,
        F: Fn(&LimiterConfig) -> Result<Box<dyn Limiter>> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut factories = self.factories.write();

        match factories.entry(name) {
            Entry::Occupied(occupied) => {
                warn!(name = %occupied.key(), "Limiter already registered");
                Err(TurnstileError::DuplicateRegistration(occupied.key().clone()))
            }
            Entry::Vacant(vacant) => {
                info!(name = %vacant.key(), "Registered limiter");
                vacant.insert(Arc::new(factory));
                Ok(())
            }
        }
    }

    /// Build the limiter registered under `name`.
    pub fn create(&self, name: &str, config: &LimiterConfig) -> Result<Box<dyn Limiter>> {
        // Release the lock before running the factory
        let factory = self
            .factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| TurnstileError::UnknownLimiter(name.to_string()))?;

        debug!(name = %name, config = ?config, "Creating limiter");
        factory(config)
    }

    /// Whether a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
