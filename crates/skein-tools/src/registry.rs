use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use skein_core::error::{Result, SkeinError};
use skein_core::traits::{Tool, ToolExecutor};

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// List all registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// `(name, description)` pairs, sorted by name.
    pub fn describe(&self) -> Vec<(String, String)> {
        self.list()
            .into_iter()
            .filter_map(|name| {
                self.tools
                    .get(name)
                    .map(|t| (name.to_string(), t.description().to_string()))
            })
            .collect()
    }

    /// Keep only the named tools. An empty list keeps everything.
    pub fn retain(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        self.tools.retain(|name, _| names.contains(name));
    }

    /// Create a registry with all built-in tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::EchoTool);
        registry.register(crate::builtin::CurrentTimeTool);
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolExecutor for ToolRegistry {
    fn execute(
        &self,
        tool_name: &str,
        args: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        let tool = self.get(tool_name);
        let tool_name = tool_name.to_string();
        Box::pin(async move {
            let tool = tool.ok_or_else(|| SkeinError::ToolNotFound(tool_name.clone()))?;
            debug!(tool = %tool_name, "Executing tool");
            tool.execute(args).await
        })
    }
}
