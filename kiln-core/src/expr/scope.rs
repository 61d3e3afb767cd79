//! Variable resolution for expression evaluation

use serde_json::Value;
use std::collections::HashMap;

/// Resolves root identifiers during expression evaluation.
///
/// The executor's scope implements this, layering loop bindings over
/// workflow fields over the `output` map view. Builtin functions are not
/// resolved here; the evaluator handles them directly.
pub trait VarResolver: Send + Sync {
    /// Resolve a root identifier to a value, or `None` if unbound.
    fn resolve(&self, name: &str) -> Option<Value>;
}

/// Simple map-backed resolver, used in tests and for static scopes.
#[derive(Debug, Clone, Default)]
pub struct MapResolver {
    vars: HashMap<String, Value>,
}

impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.vars.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }
}

impl VarResolver for MapResolver {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.vars.get(name).cloned()
    }
}
