//! Pre-compaction memory flush: when the session log nears the context
//! window, one silent system-framed turn asks the agent to save anything
//! important before compaction can destroy it.

use crate::session::{ContentBlock, SessionMessage};

/// Marker kept in the flush turn so it is injected at most once per
/// approach to the window.
pub const FLUSH_MARKER: &str = "[memory flush]";

/// Reserve the compactor needs to operate.
pub const RESERVE_TOKENS: usize = crate::config::defaults::COMPACTION_RESERVE_TOKENS;
/// Headroom before the reserve at which the flush fires.
pub const FLUSH_SOFT_BUDGET_TOKENS: usize = crate::config::defaults::FLUSH_SOFT_BUDGET_TOKENS;

/// Rough token estimate: total text chars / 4.
pub fn estimate_tokens(messages: &[SessionMessage]) -> usize {
    let chars: usize = messages
        .iter()
        .map(|m| {
            m.content
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.len(),
                    ContentBlock::ToolUse { params, .. } => params.to_string().len(),
                    ContentBlock::ToolResult { content, .. } => content
                        .iter()
                        .map(|inner| match inner {
                            ContentBlock::Text { text } => text.len(),
                            _ => 0,
                        })
                        .sum(),
                    ContentBlock::Image { .. } => 0,
                })
                .sum::<usize>()
        })
        .sum();
    chars / 4
}

/// Whether the flush turn should be injected before this turn.
pub fn should_flush(messages: &[SessionMessage], context_window_tokens: usize) -> bool {
    let threshold =
        context_window_tokens.saturating_sub(RESERVE_TOKENS + FLUSH_SOFT_BUDGET_TOKENS);
    if estimate_tokens(messages) < threshold {
        return false;
    }
    // Already asked recently
    !messages
        .iter()
        .rev()
        .take(10)
        .any(|m| m.joined_text().starts_with(FLUSH_MARKER))
}

pub fn flush_message() -> SessionMessage {
    SessionMessage::system_text(format!(
        "{} Context is nearly full and older history may soon be compacted away. \
         If this conversation contains anything worth keeping long-term, save it \
         now with the memory tool. Keep your reply brief.",
        FLUSH_MARKER
    ))
}
