//! In-memory history sanitation applied before each model turn.

use crate::session::{ContentBlock, SessionMessage};

/// Default number of trailing user turns to retain.
pub const DEFAULT_RETAINED_USER_TURNS: usize = 100;

/// Sanitize a session history:
///
/// 1. Keep only the last `max_user_turns` user messages and everything after
///    the last retained one.
/// 2. Drop tool_use blocks whose matching tool_result is absent from the
///    immediately following non-assistant message, and orphan tool_result
///    blocks symmetrically.
/// 3. Remove messages that become empty after filtering.
pub fn sanitize_history(
    messages: &[SessionMessage],
    max_user_turns: usize,
) -> Vec<SessionMessage> {
    let trimmed = trim_to_recent_user_turns(messages, max_user_turns);
    let filtered = drop_orphan_tool_blocks(&trimmed);
    filtered
        .into_iter()
        .filter(|m| !m.content.is_empty())
        .collect()
}

fn trim_to_recent_user_turns(
    messages: &[SessionMessage],
    max_user_turns: usize,
) -> Vec<SessionMessage> {
    let user_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == crate::session::Role::User)
        .map(|(i, _)| i)
        .collect();
    if user_indices.len() <= max_user_turns {
        return messages.to_vec();
    }
    let start = user_indices[user_indices.len() - max_user_turns];
    messages[start..].to_vec()
}

fn drop_orphan_tool_blocks(messages: &[SessionMessage]) -> Vec<SessionMessage> {
    let mut out: Vec<SessionMessage> = Vec::with_capacity(messages.len());

    for (idx, msg) in messages.iter().enumerate() {
        let mut cleaned = msg.clone();

        if msg.role.is_assistant_side() {
            // tool_use must be answered by the immediately following
            // non-assistant message
            let answered_ids: Vec<String> = match messages.get(idx + 1) {
                Some(next) if !next.role.is_assistant_side() => next
                    .tool_result_ids()
                    .into_iter()
                    .map(|s| s.to_string())
                    .collect(),
                _ => Vec::new(),
            };
            cleaned.content.retain(|b| match b {
                ContentBlock::ToolUse { call_id, .. } => {
                    answered_ids.iter().any(|id| id == call_id)
                }
                _ => true,
            });
        } else {
            // tool_result must answer a tool_use in the immediately preceding
            // message
            let offered_ids: Vec<String> = match idx.checked_sub(1).and_then(|i| messages.get(i)) {
                Some(prev) if prev.role.is_assistant_side() => prev
                    .tool_use_ids()
                    .into_iter()
                    .map(|s| s.to_string())
                    .collect(),
                _ => Vec::new(),
            };
            cleaned.content.retain(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    offered_ids.iter().any(|id| id == tool_use_id)
                }
                _ => true,
            });
        }

        out.push(cleaned);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ContentBlock, Role, SessionMessage};

    fn tool_use(call_id: &str) -> ContentBlock {
        ContentBlock::ToolUse {
            call_id: call_id.to_string(),
            name: "exec".to_string(),
            params: serde_json::json!({}),
        }
    }

    fn tool_result(id: &str) -> ContentBlock {
        ContentBlock::ToolResult {
            tool_use_id: id.to_string(),
            content: vec![ContentBlock::text("done")],
        }
    }

    #[test]
    fn keeps_matched_tool_pairs() {
        let messages = vec![
            SessionMessage::user_text("run it"),
            SessionMessage::new(Role::Assistant, vec![tool_use("c1")]),
            SessionMessage::new(Role::ToolResultCarrier, vec![tool_result("c1")]),
            SessionMessage::assistant_text("done"),
        ];
        let out = sanitize_history(&messages, 100);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn drops_unanswered_tool_use_and_empty_message() {
        let messages = vec![
            SessionMessage::user_text("run it"),
            SessionMessage::new(Role::Assistant, vec![tool_use("c1")]),
            SessionMessage::user_text("actually never mind"),
        ];
        let out = sanitize_history(&messages, 100);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|m| m.tool_use_ids().is_empty()));
    }

    #[test]
    fn drops_orphan_tool_result_block_but_keeps_text() {
        let messages = vec![
            SessionMessage::user_text("hi"),
            SessionMessage::new(
                Role::ToolResultCarrier,
                vec![tool_result("ghost"), ContentBlock::text("note")],
            ),
        ];
        let out = sanitize_history(&messages, 100);
        assert_eq!(out.len(), 2);
        assert!(out[1].tool_result_ids().is_empty());
        assert_eq!(out[1].joined_text(), "note");
    }

    #[test]
    fn retains_only_recent_user_turns() {
        let mut messages = Vec::new();
        for i in 0..10 {
            messages.push(SessionMessage::user_text(format!("u{}", i)));
            messages.push(SessionMessage::assistant_text(format!("a{}", i)));
        }
        let out = sanitize_history(&messages, 3);
        assert_eq!(out.len(), 6);
        assert_eq!(out[0].joined_text(), "u7");
    }

    #[test]
    fn no_unmatched_ids_after_sanitation() {
        let messages = vec![
            SessionMessage::new(Role::Assistant, vec![tool_use("a"), tool_use("b")]),
            SessionMessage::new(Role::ToolResultCarrier, vec![tool_result("a")]),
        ];
        let out = sanitize_history(&messages, 100);
        for (idx, msg) in out.iter().enumerate() {
            for id in msg.tool_use_ids() {
                let answered = out
                    .get(idx + 1)
                    .map(|n| n.tool_result_ids().contains(&id))
                    .unwrap_or(false);
                assert!(answered, "tool_use {} unanswered", id);
            }
        }
    }
}
