pub mod sanitize;
pub mod store;

pub use sanitize::sanitize_history;
pub use store::SessionStore;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a session record.
///
/// `tool_use_owner` marks assistant turns whose only purpose is carrying
/// tool_use blocks; `tool_result_carrier` marks the answering record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolUseOwner,
    ToolResultCarrier,
    System,
}

impl Role {
    /// Assistant-side roles may carry tool_use blocks.
    pub fn is_assistant_side(&self) -> bool {
        matches!(self, Role::Assistant | Role::ToolUseOwner)
    }
}

/// A single content block inside a session message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        /// Base64-encoded payload
        data: String,
        mime_type: String,
    },
    ToolUse {
        call_id: String,
        name: String,
        params: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<ContentBlock>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        ContentBlock::Image {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }
}

/// One persisted turn of a session, stored as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default = "default_timestamp")]
    pub timestamp: String,
}

fn default_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl SessionMessage {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        SessionMessage {
            role,
            content,
            stop_reason: None,
            error_message: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)])
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::text(text)])
    }

    pub fn system_text(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentBlock::text(text)])
    }

    /// Concatenated text of all text blocks.
    pub fn joined_text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// Ids of tool_use blocks carried by this message.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Ids of tool_result blocks carried by this message.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Derive a filesystem-safe name from a session key by substituting any
/// character outside `[A-Za-z0-9_-]` with `_`.
pub fn safe_session_key(session_key: &str) -> String {
    session_key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_session_key_substitutes_non_alphanumerics() {
        assert_eq!(safe_session_key("telegram:dm:12345"), "telegram_dm_12345");
        assert_eq!(safe_session_key("a b/c.d"), "a_b_c_d");
        assert_eq!(safe_session_key("already_safe-1"), "already_safe-1");
    }

    #[test]
    fn message_roundtrips_through_json() {
        let msg = SessionMessage::new(
            Role::Assistant,
            vec![
                ContentBlock::text("hello"),
                ContentBlock::ToolUse {
                    call_id: "c1".to_string(),
                    name: "read_file".to_string(),
                    params: serde_json::json!({"path": "notes.md"}),
                },
            ],
        );
        let line = serde_json::to_string(&msg).unwrap();
        let back: SessionMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(back.role, Role::Assistant);
        assert_eq!(back.tool_use_ids(), vec!["c1"]);
    }

    #[test]
    fn tool_result_carrier_role_serializes_snake_case() {
        let msg = SessionMessage::new(Role::ToolResultCarrier, vec![]);
        let line = serde_json::to_string(&msg).unwrap();
        assert!(line.contains("tool_result_carrier"));
    }
}
