//! Out-of-band long-term memory consolidation.
//!
//! After a session turn, if enough new messages accumulated, a secondary
//! model call distills them into `memory/MEMORY.md` (replaced wholesale) and
//! `memory/HISTORY.md` (appended). Consolidation never surfaces errors to the
//! user; the per-session watermark advances only on a successful parse and
//! write.

use crate::model::ModelClient;
use crate::session::{safe_session_key, SessionMessage};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_THRESHOLD: usize = 50;

const MEMORY_START: &str = "===MEMORY===";
const MEMORY_END: &str = "===END_MEMORY===";
const HISTORY_START: &str = "===HISTORY===";
const HISTORY_END: &str = "===END_HISTORY===";

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConsolidationState {
    #[serde(rename = "lastConsolidatedMessageCount", default)]
    last_consolidated_message_count: usize,
}

pub struct Consolidator {
    model: ModelClient,
    /// `workspace/memory`
    memory_dir: PathBuf,
    /// `<state>/consolidation`
    state_dir: PathBuf,
    threshold: usize,
    enabled: bool,
}

impl Consolidator {
    pub fn new(
        model: ModelClient,
        memory_dir: impl Into<PathBuf>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Consolidator {
            model,
            memory_dir: memory_dir.into(),
            state_dir: state_dir.into(),
            threshold: DEFAULT_THRESHOLD,
            enabled: true,
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn memory_doc_path(&self) -> PathBuf {
        self.memory_dir.join("MEMORY.md")
    }

    pub fn history_doc_path(&self) -> PathBuf {
        self.memory_dir.join("HISTORY.md")
    }

    fn state_path(&self, session_key: &str) -> PathBuf {
        self.state_dir
            .join(format!("{}.json", safe_session_key(session_key)))
    }

    /// Fire-and-forget entry point, called after each session turn.
    pub async fn maybe_consolidate(&self, session_key: &str, messages: &[SessionMessage]) {
        if !self.enabled {
            return;
        }
        let state = self.load_state(session_key);
        let total = messages.len();
        let new_messages = total.saturating_sub(state.last_consolidated_message_count);
        if new_messages < self.threshold {
            return;
        }

        log::info!(
            "[CONSOLIDATE] '{}': {} new messages, running consolidation",
            session_key,
            new_messages
        );
        let fresh = &messages[state.last_consolidated_message_count..];
        match self.consolidate(fresh).await {
            Ok(()) => {
                let new_state = ConsolidationState {
                    last_consolidated_message_count: total,
                };
                if let Err(e) = self.save_state(session_key, &new_state) {
                    log::error!("[CONSOLIDATE] Failed to save state for '{}': {}", session_key, e);
                }
            }
            Err(e) => {
                log::error!("[CONSOLIDATE] Failed for '{}': {}", session_key, e);
            }
        }
    }

    async fn consolidate(&self, fresh: &[SessionMessage]) -> Result<(), String> {
        let existing_memory = std::fs::read_to_string(self.memory_doc_path()).unwrap_or_default();
        let transcript = render_transcript(fresh);

        let prompt = format!(
            "Review the conversation transcript below and maintain the agent's long-term memory.\n\n\
             Current long-term memory document:\n{}\n\n\
             New transcript:\n{}\n\n\
             Reply with exactly two framed sections:\n\
             {}\n<the full updated long-term memory document, merged with the current one>\n{}\n\
             {}\n<one timestamped line per notable event, or nothing>\n{}",
            if existing_memory.is_empty() { "(empty)" } else { &existing_memory },
            transcript,
            MEMORY_START,
            MEMORY_END,
            HISTORY_START,
            HISTORY_END,
        );

        let reply = self
            .model
            .generate_text(
                "You are the memory consolidation pass of a personal assistant.",
                &prompt,
            )
            .await?;

        let memory = extract_section(&reply, MEMORY_START, MEMORY_END)
            .ok_or_else(|| "reply missing MEMORY markers".to_string())?;
        let history = extract_section(&reply, HISTORY_START, HISTORY_END)
            .ok_or_else(|| "reply missing HISTORY markers".to_string())?;

        std::fs::create_dir_all(&self.memory_dir)
            .map_err(|e| format!("Failed to create memory dir: {}", e))?;
        crate::config::write_atomic(&self.memory_doc_path(), memory.trim_end())?;

        let history = history.trim();
        if !history.is_empty() {
            let mut existing =
                std::fs::read_to_string(self.history_doc_path()).unwrap_or_default();
            if !existing.is_empty() && !existing.ends_with('\n') {
                existing.push('\n');
            }
            existing.push_str(history);
            existing.push('\n');
            crate::config::write_atomic(&self.history_doc_path(), &existing)?;
        }
        Ok(())
    }

    fn load_state(&self, session_key: &str) -> ConsolidationState {
        std::fs::read_to_string(self.state_path(session_key))
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn save_state(&self, session_key: &str, state: &ConsolidationState) -> Result<(), String> {
        std::fs::create_dir_all(&self.state_dir)
            .map_err(|e| format!("Failed to create consolidation dir: {}", e))?;
        let json = serde_json::to_string(state)
            .map_err(|e| format!("Failed to serialize consolidation state: {}", e))?;
        crate::config::write_atomic(&self.state_path(session_key), &json)
    }
}

fn render_transcript(messages: &[SessionMessage]) -> String {
    let mut out = String::new();
    for msg in messages {
        let text = msg.joined_text();
        if text.is_empty() {
            continue;
        }
        out.push_str(&format!("{:?}: {}\n", msg.role, text));
    }
    out
}

fn extract_section<'a>(reply: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let start_idx = reply.find(start)? + start.len();
    let end_idx = reply[start_idx..].find(end)? + start_idx;
    Some(&reply[start_idx..end_idx])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MockModelClient, ScriptedResponse};

    fn framed_reply(memory: &str, history: &str) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            MEMORY_START, memory, MEMORY_END, HISTORY_START, history, HISTORY_END
        )
    }

    fn messages(n: usize) -> Vec<SessionMessage> {
        (0..n)
            .map(|i| SessionMessage::user_text(format!("message {}", i)))
            .collect()
    }

    #[tokio::test]
    async fn consolidates_when_threshold_reached() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModelClient::new(vec![ScriptedResponse::Text(framed_reply(
            "# Memory\n- user likes tea",
            "2026-08-02 12:00 user asked about tea",
        ))]);
        let consolidator = Consolidator::new(
            crate::model::ModelClient::Mock(model),
            dir.path().join("memory"),
            dir.path().join("consolidation"),
        )
        .with_threshold(3);

        consolidator.maybe_consolidate("t:dm:1", &messages(5)).await;

        let memory = std::fs::read_to_string(consolidator.memory_doc_path()).unwrap();
        assert!(memory.contains("user likes tea"));
        let history = std::fs::read_to_string(consolidator.history_doc_path()).unwrap();
        assert!(history.contains("asked about tea"));
        assert!(history.ends_with('\n'));
    }

    #[tokio::test]
    async fn below_threshold_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModelClient::echo();
        let consolidator = Consolidator::new(
            crate::model::ModelClient::Mock(model.clone()),
            dir.path().join("memory"),
            dir.path().join("consolidation"),
        )
        .with_threshold(50);

        consolidator.maybe_consolidate("t:dm:1", &messages(5)).await;
        assert!(model.calls().is_empty());
        assert!(!consolidator.memory_doc_path().exists());
    }

    #[tokio::test]
    async fn watermark_only_advances_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModelClient::new(vec![
            ScriptedResponse::Text("no markers in this reply".to_string()),
            ScriptedResponse::Text(framed_reply("# Memory", "")),
        ]);
        let consolidator = Consolidator::new(
            crate::model::ModelClient::Mock(model),
            dir.path().join("memory"),
            dir.path().join("consolidation"),
        )
        .with_threshold(3);

        // First run fails to parse: watermark must not advance.
        consolidator.maybe_consolidate("t:dm:1", &messages(5)).await;
        assert!(!consolidator.memory_doc_path().exists());

        // Second run with the same messages still triggers and succeeds.
        consolidator.maybe_consolidate("t:dm:1", &messages(5)).await;
        assert!(consolidator.memory_doc_path().exists());

        // Now the watermark is at 5; same count is a no-op.
        consolidator.maybe_consolidate("t:dm:1", &messages(5)).await;
    }

    #[tokio::test]
    async fn history_is_appended_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let model = MockModelClient::new(vec![
            ScriptedResponse::Text(framed_reply("m1", "event one")),
            ScriptedResponse::Text(framed_reply("m2", "event two")),
        ]);
        let consolidator = Consolidator::new(
            crate::model::ModelClient::Mock(model),
            dir.path().join("memory"),
            dir.path().join("consolidation"),
        )
        .with_threshold(1);

        consolidator.maybe_consolidate("a", &messages(2)).await;
        consolidator.maybe_consolidate("b", &messages(2)).await;

        let history = std::fs::read_to_string(consolidator.history_doc_path()).unwrap();
        assert!(history.contains("event one"));
        assert!(history.contains("event two"));
        let memory = std::fs::read_to_string(consolidator.memory_doc_path()).unwrap();
        assert_eq!(memory.trim(), "m2");
    }
}
