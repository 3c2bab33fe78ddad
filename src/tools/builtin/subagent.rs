//! Subagent fan-out tool.

use crate::subagent::manager::SpawnRequest;
use crate::tools::registry::Tool;
use crate::tools::types::{
    PropertySchema, ToolContext, ToolDefinition, ToolInputSchema, ToolOutput,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum SubagentAction {
    Spawn {
        task: String,
        #[serde(default)]
        label: Option<String>,
    },
    List {},
    Kill {
        run_id: String,
    },
}

pub struct SubagentTool;

#[async_trait]
impl Tool for SubagentTool {
    fn definition(&self) -> ToolDefinition {
        let mut props = HashMap::new();
        props.insert(
            "action".to_string(),
            PropertySchema::string("What to do").with_enum(&["spawn", "list", "kill"]),
        );
        props.insert(
            "task".to_string(),
            PropertySchema::string("Task for the subagent to work on (spawn)"),
        );
        props.insert(
            "label".to_string(),
            PropertySchema::string("Short label for progress reporting (spawn)"),
        );
        props.insert(
            "run_id".to_string(),
            PropertySchema::string("Run id to kill (kill)"),
        );
        ToolDefinition {
            name: "subagent".to_string(),
            label: "Subagents".to_string(),
            description: "Spawn a background subagent for an independent task, list runs, \
                          or kill a running one. Results are announced back to this session."
                .to_string(),
            input_schema: ToolInputSchema::new(props, &["action"]),
        }
    }

    async fn execute(&self, _call_id: &str, params: Value, ctx: &ToolContext) -> ToolOutput {
        let Some(manager) = ctx.subagents.as_ref() else {
            return ToolOutput::error("no subagent manager is available in this context");
        };
        let action: SubagentAction = match serde_json::from_value(params) {
            Ok(action) => action,
            Err(e) => return ToolOutput::error(format!("unrecognized subagent action: {}", e)),
        };

        match action {
            SubagentAction::Spawn { task, label } => {
                let request = SpawnRequest {
                    task,
                    parent_session_key: ctx.session_key.clone(),
                    parent_channel_id: ctx
                        .channel_id
                        .clone()
                        .unwrap_or_else(|| "0".to_string()),
                    label,
                };
                match manager.spawn(request) {
                    Ok(receipt) => ToolOutput::text(format!(
                        "spawned subagent {} (session {}); its result will be announced here",
                        receipt.run_id, receipt.child_session_key
                    )),
                    Err(reason) => ToolOutput::error(reason),
                }
            }
            SubagentAction::List {} => {
                let runs = manager.list_runs();
                if runs.is_empty() {
                    return ToolOutput::text("no subagent runs");
                }
                let lines: Vec<String> = runs
                    .iter()
                    .map(|r| {
                        format!(
                            "{} '{}' [{}] depth {}",
                            r.run_id,
                            r.display_name(),
                            r.status.as_str(),
                            r.depth
                        )
                    })
                    .collect();
                ToolOutput::text(lines.join("\n"))
            }
            SubagentAction::Kill { run_id } => match manager.kill(&run_id) {
                Ok(run) => ToolOutput::text(format!("killed subagent '{}'", run.display_name())),
                Err(e) => ToolOutput::error(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subagent::{SubagentLimits, SubagentManager};
    use serde_json::json;

    #[tokio::test]
    async fn spawn_without_entry_still_registers_and_limits_apply() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SubagentManager::load(
            dir.path().join("subagent-registry.json"),
            SubagentLimits {
                max_depth: 2,
                max_children_per_session: 1,
                max_concurrent_total: 10,
            },
        );
        let ctx = ToolContext::new("t:dm:1", dir.path())
            .with_channel("7")
            .with_subagents(manager);
        let tool = SubagentTool;

        let first = tool
            .execute("c1", json!({"action": "spawn", "task": "research"}), &ctx)
            .await;
        assert!(first.joined_text().contains("spawned subagent"));

        let second = tool
            .execute("c2", json!({"action": "spawn", "task": "more"}), &ctx)
            .await;
        assert!(second.joined_text().contains("forbidden"));
    }
}
