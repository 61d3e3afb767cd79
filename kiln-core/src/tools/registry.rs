//! Tool registry: registration and lookup
//!
//! The executor is constructed with a registry; there is no process-wide
//! tool state. The workflow document's `tools:` list selects which
//! registered tools are offered to the model.

use std::collections::HashMap;
use std::sync::Arc;

use crate::chat::ToolSpec;
use crate::error::{KilnError, Result};

use super::tool::{spec_for, Tool};

/// Registry for tools available to a workflow run
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails if the name is already taken.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(KilnError::Config(format!(
                "tool '{}' is already registered",
                name
            )));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Register multiple tools at once.
    pub fn register_all(&mut self, tools: Vec<Arc<dyn Tool>>) -> Result<()> {
        for tool in tools {
            self.register(tool)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Wire specs for every registered tool.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|t| spec_for(t.as_ref())).collect()
    }

    /// Wire specs for the named subset, failing on unknown names.
    pub fn specs_for(&self, names: &[String]) -> Result<Vec<ToolSpec>> {
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .map(|t| spec_for(t.as_ref()))
                    .ok_or_else(|| {
                        KilnError::Config(format!("workflow enables unknown tool '{}'", name))
                    })
            })
            .collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::tool::ToolFailure;
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes its message argument"
        }

        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "message": { "type": "string" } },
                "required": ["message"]
            })
        }

        async fn invoke(&self, args: Value) -> std::result::Result<Value, ToolFailure> {
            Ok(args.get("message").cloned().unwrap_or(Value::Null))
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();

        assert!(registry.contains("echo"));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        assert!(registry.register(Arc::new(EchoTool)).is_err());
    }

    #[test]
    fn test_specs_for_subset() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();

        let specs = registry.specs_for(&["echo".to_string()]).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "echo");

        assert!(registry.specs_for(&["missing".to_string()]).is_err());
    }
}
