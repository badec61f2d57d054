use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::tool::Tool;

/// A name-keyed collection of tools, read-only after startup in the common
/// case but safe to mutate (e.g. hot-reloading an MCP server's tool list)
/// via an `RwLock` rather than requiring a restart.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.write().insert(tool.name().to_string(), tool);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        async fn call(&self, arguments: Value) -> Result<Value, String> {
            Ok(arguments)
        }
    }

    #[test]
    fn find_returns_none_for_unregistered_names() {
        let registry = ToolRegistry::new();
        assert!(registry.find("echo").is_none());
    }

    #[tokio::test]
    async fn register_then_find_round_trips_and_is_callable() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        let tool = registry.find("echo").expect("registered");
        let result = tool.call(json!({"a": 1})).await.unwrap();
        assert_eq!(result, json!({"a": 1}));
        assert_eq!(registry.len(), 1);
    }
}
