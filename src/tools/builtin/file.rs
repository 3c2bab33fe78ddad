//! Workspace file tools: read, write, list.

use crate::tools::builtin::resolve_workspace_path;
use crate::tools::registry::Tool;
use crate::tools::types::{
    PropertySchema, ToolContext, ToolDefinition, ToolInputSchema, ToolOutput,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        let mut props = HashMap::new();
        props.insert(
            "path".to_string(),
            PropertySchema::string("Path relative to the workspace"),
        );
        ToolDefinition {
            name: "read_file".to_string(),
            label: "Read File".to_string(),
            description: "Read a text file from the workspace".to_string(),
            input_schema: ToolInputSchema::new(props, &["path"]),
        }
    }

    async fn execute(&self, _call_id: &str, params: Value, ctx: &ToolContext) -> ToolOutput {
        let path = params["path"].as_str().unwrap_or_default();
        let resolved = match resolve_workspace_path(&ctx.workspace_dir, path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::error(e),
        };
        match std::fs::read_to_string(&resolved) {
            Ok(content) => ToolOutput::text(content),
            Err(e) => ToolOutput::error(format!("could not read '{}': {}", path, e)),
        }
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn definition(&self) -> ToolDefinition {
        let mut props = HashMap::new();
        props.insert(
            "path".to_string(),
            PropertySchema::string("Path relative to the workspace"),
        );
        props.insert(
            "content".to_string(),
            PropertySchema::string("Full file contents to write"),
        );
        ToolDefinition {
            name: "write_file".to_string(),
            label: "Write File".to_string(),
            description: "Write a text file into the workspace, creating parent directories"
                .to_string(),
            input_schema: ToolInputSchema::new(props, &["path", "content"]),
        }
    }

    async fn execute(&self, _call_id: &str, params: Value, ctx: &ToolContext) -> ToolOutput {
        let path = params["path"].as_str().unwrap_or_default();
        let content = params["content"].as_str().unwrap_or_default();
        let resolved = match resolve_workspace_path(&ctx.workspace_dir, path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::error(e),
        };
        if let Some(parent) = resolved.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return ToolOutput::error(format!("could not create parent dirs: {}", e));
            }
        }
        match std::fs::write(&resolved, content) {
            Ok(()) => ToolOutput::text(format!("wrote {} bytes to {}", content.len(), path)),
            Err(e) => ToolOutput::error(format!("could not write '{}': {}", path, e)),
        }
    }
}

pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn definition(&self) -> ToolDefinition {
        let mut props = HashMap::new();
        props.insert(
            "path".to_string(),
            PropertySchema::string("Directory relative to the workspace (default: workspace root)")
                .with_default(Value::String(".".to_string())),
        );
        ToolDefinition {
            name: "list_files".to_string(),
            label: "List Files".to_string(),
            description: "List entries of a workspace directory".to_string(),
            input_schema: ToolInputSchema::new(props, &[]),
        }
    }

    async fn execute(&self, _call_id: &str, params: Value, ctx: &ToolContext) -> ToolOutput {
        let path = params["path"].as_str().unwrap_or(".");
        let resolved = match resolve_workspace_path(&ctx.workspace_dir, path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::error(e),
        };
        let entries = match std::fs::read_dir(&resolved) {
            Ok(entries) => entries,
            Err(e) => return ToolOutput::error(format!("could not list '{}': {}", path, e)),
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| {
                let suffix = if e.path().is_dir() { "/" } else { "" };
                format!("{}{}", e.file_name().to_string_lossy(), suffix)
            })
            .collect();
        names.sort();
        if names.is_empty() {
            ToolOutput::text("(empty directory)")
        } else {
            ToolOutput::text(names.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new("t:dm:1", dir.path());
        (dir, ctx)
    }

    #[tokio::test]
    async fn write_then_read_then_list() {
        let (_dir, ctx) = ctx();
        let write = WriteFileTool
            .execute(
                "c1",
                serde_json::json!({"path": "notes/today.md", "content": "buy milk"}),
                &ctx,
            )
            .await;
        assert!(write.joined_text().contains("wrote"));

        let read = ReadFileTool
            .execute("c2", serde_json::json!({"path": "notes/today.md"}), &ctx)
            .await;
        assert_eq!(read.joined_text(), "buy milk");

        let list = ListFilesTool
            .execute("c3", serde_json::json!({"path": "notes"}), &ctx)
            .await;
        assert_eq!(list.joined_text(), "today.md");
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let (_dir, ctx) = ctx();
        let out = ReadFileTool
            .execute("c1", serde_json::json!({"path": "../outside"}), &ctx)
            .await;
        assert!(out.joined_text().starts_with("Error:"));
    }

    #[tokio::test]
    async fn missing_file_is_a_tool_error_not_a_crash() {
        let (_dir, ctx) = ctx();
        let out = ReadFileTool
            .execute("c1", serde_json::json!({"path": "nope.txt"}), &ctx)
            .await;
        assert!(out.joined_text().starts_with("Error:"));
    }
}
