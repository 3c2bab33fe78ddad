pub mod builtin;
pub mod media;
pub mod pipeline;
pub mod registry;
pub mod types;

pub use registry::{Tool, ToolRegistry};
pub use types::{
    PropertySchema, ToolBlock, ToolContext, ToolDefinition, ToolInputSchema, ToolOutput,
};

/// Build the default tool registry with all builtin tools registered.
pub fn create_default_registry() -> ToolRegistry {
    use std::sync::Arc;

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(builtin::file::ReadFileTool));
    registry.register(Arc::new(builtin::file::WriteFileTool));
    registry.register(Arc::new(builtin::file::ListFilesTool));
    registry.register(Arc::new(builtin::exec::ExecTool::new()));
    registry.register(Arc::new(builtin::web_fetch::WebFetchTool::new()));
    registry.register(Arc::new(builtin::memory::MemoryTool));
    registry.register(Arc::new(builtin::schedule::ScheduleTool));
    registry.register(Arc::new(builtin::subagent::SubagentTool));
    registry
}
