//! Structured long-term memory tool.
//!
//! The opaque params object maps to a tagged action internally; unknown
//! actions come back as structured errors, never a crash.

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
enum MemoryAction {
    Store {
        content: String,
        #[serde(default)]
        tags: Vec<String>,
    },
    Search {
        query: String,
    },
    List {},
    Delete {
        id: String,
    },
    Update {
        id: String,
        content: String,
    },
}

pub struct MemoryTool;

#[async_trait]
impl Tool for MemoryTool {
    fn definition(&self) -> ToolDefinition {
        let mut props = HashMap::new();
        props.insert(
            "action".to_string(),
            PropertySchema::string("What to do")
                .with_enum(&["store", "search", "list", "delete", "update"]),
        );
        props.insert(
            "content".to_string(),
            PropertySchema::string("Memory content (store, update)"),
        );
        props.insert(
            "query".to_string(),
            PropertySchema::string("Search query (search)"),
        );
        props.insert(
            "id".to_string(),
            PropertySchema::string("Entry id (delete, update)"),
        );
        ToolDefinition {
            name: "memory".to_string(),
            label: "Memory".to_string(),
            description: "Store, search, list, update, or delete long-term memory entries"
                .to_string(),
            input_schema: ToolInputSchema::new(props, &["action"]),
        }
    }

    async fn execute(&self, _call_id: &str, params: Value, ctx: &ToolContext) -> ToolOutput {
        let Some(store) = ctx.memory.as_ref() else {
            return ToolOutput::error("no memory store is available in this context");
        };
        let action: MemoryAction = match serde_json::from_value(params) {
            Ok(action) => action,
            Err(e) => return ToolOutput::error(format!("unrecognized memory action: {}", e)),
        };

        match action {
            MemoryAction::Store { content, tags } => match store.store(&content, tags) {
                Ok(entry) => ToolOutput::text(format!("stored memory {}", entry.id)),
                Err(e) => ToolOutput::error(e),
            },
            MemoryAction::Search { query } => {
                let hits = store.search(&query);
                if hits.is_empty() {
                    ToolOutput::text("no matching memories")
                } else {
                    let lines: Vec<String> = hits
                        .iter()
                        .map(|e| format!("{} [{}]: {}", e.id, e.tags.join(","), e.content))
                        .collect();
                    ToolOutput::text(lines.join("\n"))
                }
            }
            MemoryAction::List {} => {
                let entries = store.list();
                if entries.is_empty() {
                    ToolOutput::text("no memories stored")
                } else {
                    let lines: Vec<String> = entries
                        .iter()
                        .map(|e| format!("{} [{}]: {}", e.id, e.tags.join(","), e.content))
                        .collect();
                    ToolOutput::text(lines.join("\n"))
                }
            }
            MemoryAction::Delete { id } => match store.delete(&id) {
                Ok(()) => ToolOutput::text(format!("deleted memory {}", id)),
                Err(e) => ToolOutput::error(e),
            },
            MemoryAction::Update { id, content } => match store.update(&id, &content) {
                Ok(entry) => ToolOutput::text(format!("updated memory {}", entry.id)),
                Err(e) => ToolOutput::error(e),
            },
        }
    }
}
