//! Name to constructor registry for adapters.

use std::{collections::BTreeMap, fmt, sync::Arc};

use runner_shell_core::{Adapter, AdapterError, RunnerContext};

use crate::claude::{self, ClaudeAdapter};

/// Builds an adapter for a session.
pub type AdapterFactory = fn(&RunnerContext) -> Arc<dyn Adapter>;

/// Adapters selectable by `RUNNER_ADAPTER`.
#[derive(Clone)]
pub struct AdapterRegistry {
    factories: BTreeMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    /// Registry with no adapters.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Register `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, factory: AdapterFactory) -> &mut Self {
        self.factories.insert(name.into(), factory);
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Construct the adapter registered as `name`.
    ///
    /// # Errors
    /// Returns [`AdapterError::Unknown`] if nothing is registered under `name`.
    pub fn select(&self, name: &str, ctx: &RunnerContext) -> Result<Arc<dyn Adapter>, AdapterError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| AdapterError::Unknown(name.to_string()))?;
        tracing::debug!(adapter = name, "Adapter selected");
        Ok(factory(ctx))
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

impl Default for AdapterRegistry {
    /// Registry with the built-in adapters.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(claude::NAME, |ctx| Arc::new(ClaudeAdapter::from_context(ctx)));
        registry
    }
}
