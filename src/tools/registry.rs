use crate::tools::pipeline;
use crate::tools::types::{ToolContext, ToolDefinition, ToolOutput};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Trait that all tools must implement
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the tool definition for the model API
    fn definition(&self) -> ToolDefinition;

    /// Executes the tool with the given parameters
    async fn execute(&self, call_id: &str, params: Value, context: &ToolContext) -> ToolOutput;

    /// Returns the tool's name
    fn name(&self) -> String {
        self.definition().name.clone()
    }
}

/// Registry that holds all available tools.
///
/// Every execution path goes through [`ToolRegistry::execute`], which
/// validates params against the declared schema and then runs the result
/// pipeline (truncation + image normalization) over the output. Tool authors
/// never need to defend against oversized or malformed results themselves.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry {
            tools: HashMap::new(),
        }
    }

    /// Register a tool
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name.clone();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Get tool definitions for sending to the model
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|tool| tool.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool by name.
    ///
    /// Unknown tools and schema violations come back as structured error
    /// blocks, never as a crash. The returned output has always passed the
    /// result pipeline.
    pub async fn execute(
        &self,
        name: &str,
        call_id: &str,
        params: Value,
        context: &ToolContext,
    ) -> ToolOutput {
        let tool = match self.get(name) {
            Some(t) => t,
            None => return ToolOutput::error(format!("Tool '{}' not found", name)),
        };

        if let Err(e) = tool.definition().input_schema.validate(&params) {
            return ToolOutput::error(format!("Invalid parameters for '{}': {}", name, e));
        }

        let output = tool.execute(call_id, params, context).await;
        pipeline::process(output)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
