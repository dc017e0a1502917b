//! Tool registry: name → handle, last-writer-wins.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use maestro_domain::chat::ToolSchema;

use crate::tool::Tool;

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A tool with the same id replaces the old one.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let id = tool.id().to_owned();
        tracing::debug!(tool = %id, "registered tool");
        self.tools.write().insert(id, tool);
    }

    pub fn get(&self, tool_id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().get(tool_id).cloned()
    }

    /// All registered tools, sorted by id for stable schema export.
    pub fn list(&self) -> Vec<Arc<dyn Tool>> {
        let mut tools: Vec<Arc<dyn Tool>> = self.tools.read().values().cloned().collect();
        tools.sort_by(|a, b| a.id().cmp(b.id()));
        tools
    }

    /// Provider-facing schema of every registered tool.
    pub fn schema(&self) -> Vec<ToolSchema> {
        self.list()
            .iter()
            .map(|tool| ToolSchema {
                name: tool.id().to_owned(),
                description: tool.description().to_owned(),
                parameters: tool.parameters(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{ToolContext, ToolOutput};
    use maestro_domain::Result;
    use serde_json::Value;

    struct NamedTool {
        id: String,
        description: String,
    }

    impl NamedTool {
        fn new(id: &str, description: &str) -> Arc<dyn Tool> {
            Arc::new(Self {
                id: id.into(),
                description: description.into(),
            })
        }
    }

    #[async_trait::async_trait]
    impl Tool for NamedTool {
        fn id(&self) -> &str {
            &self.id
        }
        fn description(&self) -> &str {
            &self.description
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _args: Value, _ctx: ToolContext) -> Result<ToolOutput> {
            Ok(ToolOutput::new(&self.id, "ok"))
        }
    }

    #[test]
    fn register_and_get() {
        let registry = ToolRegistry::new();
        registry.register(NamedTool::new("echo", "echoes"));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn last_writer_wins() {
        let registry = ToolRegistry::new();
        registry.register(NamedTool::new("echo", "first"));
        registry.register(NamedTool::new("echo", "second"));
        assert_eq!(registry.get("echo").unwrap().description(), "second");
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn schema_exports_all_tools_sorted() {
        let registry = ToolRegistry::new();
        registry.register(NamedTool::new("zeta", "z"));
        registry.register(NamedTool::new("alpha", "a"));

        let schema = registry.schema();
        assert_eq!(schema.len(), 2);
        assert_eq!(schema[0].name, "alpha");
        assert_eq!(schema[1].name, "zeta");
        assert_eq!(schema[0].description, "a");
        assert!(schema[0].parameters.get("type").is_some());
    }
}
