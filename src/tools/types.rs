use crate::agent::cancel::CancelToken;
use crate::memory::MemoryStore;
use crate::sandbox::Sandbox;
use crate::scheduler::Scheduler;
use crate::subagent::SubagentManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// JSON Schema property definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

impl PropertySchema {
    pub fn string(description: impl Into<String>) -> Self {
        PropertySchema {
            schema_type: "string".to_string(),
            description: description.into(),
            default: None,
            items: None,
            enum_values: None,
        }
    }

    pub fn integer(description: impl Into<String>) -> Self {
        PropertySchema {
            schema_type: "integer".to_string(),
            description: description.into(),
            default: None,
            items: None,
            enum_values: None,
        }
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        PropertySchema {
            schema_type: "boolean".to_string(),
            description: description.into(),
            default: None,
            items: None,
            enum_values: None,
        }
    }

    pub fn with_enum(mut self, values: &[&str]) -> Self {
        self.enum_values = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Tool input schema using JSON Schema format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInputSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    pub properties: HashMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl Default for ToolInputSchema {
    fn default() -> Self {
        ToolInputSchema {
            schema_type: "object".to_string(),
            properties: HashMap::new(),
            required: vec![],
        }
    }
}

impl ToolInputSchema {
    pub fn new(properties: HashMap<String, PropertySchema>, required: &[&str]) -> Self {
        ToolInputSchema {
            schema_type: "object".to_string(),
            properties,
            required: required.iter().map(|r| r.to_string()).collect(),
        }
    }

    /// Validate an opaque params object against this schema before dispatch.
    ///
    /// Checks that params is an object, that all required fields are present,
    /// and that declared properties carry the declared primitive type and (if
    /// any) one of the declared enum values.
    pub fn validate(&self, params: &Value) -> Result<(), String> {
        let obj = params
            .as_object()
            .ok_or_else(|| "parameters must be a JSON object".to_string())?;

        for req in &self.required {
            if !obj.contains_key(req) {
                return Err(format!("missing required parameter '{}'", req));
            }
        }

        for (key, value) in obj {
            let Some(prop) = self.properties.get(key) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let type_ok = match prop.schema_type.as_str() {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !type_ok {
                return Err(format!(
                    "parameter '{}' must be of type {}",
                    key, prop.schema_type
                ));
            }
            if let (Some(allowed), Some(s)) = (&prop.enum_values, value.as_str()) {
                if !allowed.iter().any(|a| a == s) {
                    return Err(format!(
                        "parameter '{}' must be one of {:?}, got '{}'",
                        key, allowed, s
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Tool definition sent to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub label: String,
    pub description: String,
    pub input_schema: ToolInputSchema,
}

/// A single block of tool output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolBlock {
    Text {
        text: String,
    },
    Image {
        /// Base64-encoded payload
        data: String,
        mime_type: String,
    },
}

/// Result of one tool execution: an ordered sequence of content blocks.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub content: Vec<ToolBlock>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        ToolOutput {
            content: vec![ToolBlock::Text { text: text.into() }],
        }
    }

    /// Structured tool error, returned to the model as a text block so it can
    /// self-correct. Never crashes the run.
    pub fn error(message: impl Into<String>) -> Self {
        ToolOutput {
            content: vec![ToolBlock::Text {
                text: format!("Error: {}", message.into()),
            }],
        }
    }

    pub fn with_image(mut self, data: String, mime_type: String) -> Self {
        self.content.push(ToolBlock::Image { data, mime_type });
        self
    }

    pub fn joined_text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ToolBlock::Text { text } = block {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }
}

/// Context provided to tools during execution
#[derive(Clone)]
pub struct ToolContext {
    pub session_key: String,
    /// Delivery channel of the owning conversation, if any
    pub channel_id: Option<String>,
    /// Base directory for file operations
    pub workspace_dir: PathBuf,
    /// Abort signal of the owning run; long-running tools must observe it
    pub cancel: CancelToken,
    pub sandbox: Option<Arc<dyn Sandbox>>,
    pub memory: Option<Arc<MemoryStore>>,
    pub scheduler: Option<Arc<Scheduler>>,
    pub subagents: Option<Arc<SubagentManager>>,
}

impl ToolContext {
    pub fn new(session_key: impl Into<String>, workspace_dir: impl Into<PathBuf>) -> Self {
        ToolContext {
            session_key: session_key.into(),
            channel_id: None,
            workspace_dir: workspace_dir.into(),
            cancel: CancelToken::unstoppable(),
            sandbox: None,
            memory: None,
            scheduler: None,
            subagents: None,
        }
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_subagents(mut self, subagents: Arc<SubagentManager>) -> Self {
        self.subagents = Some(subagents);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ToolInputSchema {
        let mut props = HashMap::new();
        props.insert("path".to_string(), PropertySchema::string("file path"));
        props.insert("limit".to_string(), PropertySchema::integer("max entries"));
        props.insert(
            "mode".to_string(),
            PropertySchema::string("mode").with_enum(&["read", "write"]),
        );
        ToolInputSchema::new(props, &["path"])
    }

    #[test]
    fn validate_accepts_well_formed_params() {
        let s = schema();
        assert!(s
            .validate(&json!({"path": "a.txt", "limit": 5, "mode": "read"}))
            .is_ok());
    }

    #[test]
    fn validate_rejects_missing_required() {
        let s = schema();
        let err = s.validate(&json!({"limit": 5})).unwrap_err();
        assert!(err.contains("path"));
    }

    #[test]
    fn validate_rejects_wrong_type_and_bad_enum() {
        let s = schema();
        assert!(s.validate(&json!({"path": 42})).is_err());
        assert!(s.validate(&json!({"path": "a", "mode": "append"})).is_err());
    }

    #[test]
    fn validate_rejects_non_object() {
        let s = schema();
        assert!(s.validate(&json!(["not", "an", "object"])).is_err());
    }
}
