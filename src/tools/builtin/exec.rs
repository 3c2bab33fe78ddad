//! Shell execution through the sandbox primitive.

use crate::sandbox::{ExecRequest, DEFAULT_EXEC_TIMEOUT_MS};
use crate::tools::registry::Tool;
use crate::tools::types::{
    PropertySchema, ToolContext, ToolDefinition, ToolInputSchema, ToolOutput,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;

pub struct ExecTool;

impl ExecTool {
    pub fn new() -> Self {
        ExecTool
    }
}

impl Default for ExecTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn definition(&self) -> ToolDefinition {
        let mut props = HashMap::new();
        props.insert(
            "command".to_string(),
            PropertySchema::string("Shell command to run"),
        );
        props.insert(
            "workdir".to_string(),
            PropertySchema::string("Working directory (default: workspace root)"),
        );
        props.insert(
            "timeout_ms".to_string(),
            PropertySchema::integer("Timeout in milliseconds (default: 120000)")
                .with_default(json!(DEFAULT_EXEC_TIMEOUT_MS)),
        );
        ToolDefinition {
            name: "exec".to_string(),
            label: "Shell".to_string(),
            description: "Run a shell command in the sandbox and return stdout, stderr, and \
                          the exit code"
                .to_string(),
            input_schema: ToolInputSchema::new(props, &["command"]),
        }
    }

    async fn execute(&self, _call_id: &str, params: Value, ctx: &ToolContext) -> ToolOutput {
        let Some(sandbox) = ctx.sandbox.as_ref() else {
            return ToolOutput::error("no sandbox is available in this context");
        };
        let command = params["command"].as_str().unwrap_or_default();
        if command.trim().is_empty() {
            return ToolOutput::error("command must not be empty");
        }

        let mut request = ExecRequest::new(command);
        request.workdir = Some(
            params["workdir"]
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| ctx.workspace_dir.to_string_lossy().to_string()),
        );
        if let Some(timeout_ms) = params["timeout_ms"].as_u64() {
            request.timeout_ms = timeout_ms.clamp(100, DEFAULT_EXEC_TIMEOUT_MS);
        }

        match sandbox.exec(request, &ctx.cancel).await {
            Ok(outcome) => {
                let mut text = String::new();
                if !outcome.stdout.is_empty() {
                    text.push_str(&outcome.stdout);
                }
                if !outcome.stderr.is_empty() {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&format!("[stderr]\n{}", outcome.stderr));
                }
                if outcome.timed_out {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str("[command timed out]");
                }
                text.push_str(&format!("\n[exit code: {}]", outcome.exit_code));
                ToolOutput::text(text.trim_start().to_string())
            }
            Err(e) => ToolOutput::error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::HostSandbox;
    use std::sync::Arc;

    #[tokio::test]
    async fn runs_command_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hi").unwrap();
        let ctx = ToolContext::new("t:dm:1", dir.path()).with_sandbox(Arc::new(HostSandbox::new()));
        let out = ExecTool::new()
            .execute("c1", json!({"command": "ls"}), &ctx)
            .await;
        assert!(out.joined_text().contains("hello.txt"));
        assert!(out.joined_text().contains("[exit code: 0]"));
    }

    #[tokio::test]
    async fn missing_sandbox_is_a_structured_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new("t:dm:1", dir.path());
        let out = ExecTool::new()
            .execute("c1", json!({"command": "ls"}), &ctx)
            .await;
        assert!(out.joined_text().starts_with("Error:"));
    }
}
