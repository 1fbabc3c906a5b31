//! Lookup registry for registered adapters, keyed by id.

use std::collections::HashMap;
use std::fmt;

use super::Adapter;

/// `HashMap<id, Box<dyn Adapter>>` with registration-order-independent
/// lookup. Mirrors the lineage orchestrator's harness registry.
pub struct AdapterRegistry {
    adapters: HashMap<String, Box<dyn Adapter>>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self { adapters: HashMap::new() }
    }

    /// Register an adapter, keyed by its own `id()`. Returns the adapter
    /// previously registered under that id, if any.
    pub fn register(&mut self, adapter: impl Adapter + 'static) -> Option<Box<dyn Adapter>> {
        self.adapters.insert(adapter.id().to_string(), Box::new(adapter))
    }

    pub fn get(&self, id: &str) -> Option<&dyn Adapter> {
        self.adapters.get(id).map(|b| b.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        self.adapters.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
