//! Line-delimited session log store.
//!
//! One `.jsonl` file per session key under `<state>/sessions/`. Files are
//! append-mostly; repair and truncation rewrite them atomically via a `.tmp`
//! sibling. All writes for a given session happen inside that session's
//! serialized run, so no cross-process locking is needed.

use crate::session::{safe_session_key, SessionMessage};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

pub struct SessionStore {
    sessions_dir: PathBuf,
}

impl SessionStore {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        SessionStore {
            sessions_dir: sessions_dir.into(),
        }
    }

    pub fn path_for(&self, session_key: &str) -> PathBuf {
        self.sessions_dir
            .join(format!("{}.jsonl", safe_session_key(session_key)))
    }

    /// Load all messages for a session. Missing file yields an empty log.
    /// Unparseable lines are skipped (repair handles rewriting them away).
    pub fn load(&self, session_key: &str) -> Result<Vec<SessionMessage>, String> {
        let path = self.path_for(session_key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read session file {}: {}", path.display(), e))?;
        let mut messages = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionMessage>(line) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    log::warn!(
                        "[SESSION] Skipping unparseable record in {}: {}",
                        path.display(),
                        e
                    );
                }
            }
        }
        Ok(messages)
    }

    /// Append one message to the session log.
    pub fn append(&self, session_key: &str, message: &SessionMessage) -> Result<(), String> {
        let path = self.path_for(session_key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create sessions dir: {}", e))?;
        }
        let line = serde_json::to_string(message)
            .map_err(|e| format!("Failed to serialize session message: {}", e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;
        writeln!(file, "{}", line)
            .map_err(|e| format!("Failed to append to {}: {}", path.display(), e))
    }

    /// Replace the whole session log atomically.
    pub fn rewrite(&self, session_key: &str, messages: &[SessionMessage]) -> Result<(), String> {
        let path = self.path_for(session_key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create sessions dir: {}", e))?;
        }
        let mut out = String::new();
        for msg in messages {
            let line = serde_json::to_string(msg)
                .map_err(|e| format!("Failed to serialize session message: {}", e))?;
            out.push_str(&line);
            out.push('\n');
        }
        crate::config::write_atomic(&path, &out)
    }

    /// Empty the session log (context-overflow reset, `/reset` command).
    pub fn truncate(&self, session_key: &str) -> Result<(), String> {
        let path = self.path_for(session_key);
        if path.exists() {
            crate::config::write_atomic(&path, "")?;
        }
        Ok(())
    }

    /// Repair a session file in place before it is opened.
    ///
    /// Discards lines that do not parse as a record, then drops records whose
    /// tool_use/tool_result pairing dangles across the record boundary. The
    /// file is rewritten only if something was actually dropped, so repair of
    /// an already-clean file leaves it byte-identical.
    ///
    /// Best-effort: any error is logged and the unrepaired file is kept.
    pub fn repair(&self, session_key: &str) {
        if let Err(e) = self.repair_inner(session_key) {
            log::warn!("[SESSION] Repair of '{}' failed: {}", session_key, e);
        }
    }

    fn repair_inner(&self, session_key: &str) -> Result<(), String> {
        let path = self.path_for(session_key);
        if !path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

        let mut parsed: Vec<SessionMessage> = Vec::new();
        let mut dropped = 0usize;
        let mut total_lines = 0usize;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            total_lines += 1;
            match serde_json::from_str::<SessionMessage>(line) {
                Ok(msg) => parsed.push(msg),
                Err(_) => dropped += 1,
            }
        }

        let kept = drop_dangling_tool_records(parsed);
        let dangling_dropped = total_lines - dropped - kept.len();

        if dropped == 0 && dangling_dropped == 0 {
            return Ok(());
        }

        log::info!(
            "[SESSION] Repaired '{}': {} unparseable, {} dangling record(s) dropped",
            session_key,
            dropped,
            dangling_dropped
        );
        self.rewrite(session_key, &kept)
    }
}

/// Drop records whose tool pairing dangles: an assistant-side record with
/// tool_use ids that the immediately following record does not answer, or a
/// tool_result record whose preceding record carries no matching tool_use.
fn drop_dangling_tool_records(messages: Vec<SessionMessage>) -> Vec<SessionMessage> {
    let mut kept: Vec<SessionMessage> = Vec::with_capacity(messages.len());
    let mut skip_next_results_for: Vec<String> = Vec::new();

    for (idx, msg) in messages.iter().enumerate() {
        let use_ids = msg.tool_use_ids();
        if msg.role.is_assistant_side() && !use_ids.is_empty() {
            let answered = match messages.get(idx + 1) {
                Some(next) if !next.role.is_assistant_side() => {
                    let result_ids = next.tool_result_ids();
                    use_ids.iter().all(|id| result_ids.contains(id))
                }
                _ => false,
            };
            if !answered {
                skip_next_results_for.extend(use_ids.iter().map(|s| s.to_string()));
                continue;
            }
        }

        let result_ids = msg.tool_result_ids();
        if !result_ids.is_empty() {
            // A result record answering a dropped (or absent) tool_use dangles too.
            let orphan = result_ids
                .iter()
                .any(|id| skip_next_results_for.iter().any(|s| s == id))
                || match idx.checked_sub(1).and_then(|i| messages.get(i)) {
                    Some(prev) => {
                        let prev_uses = prev.tool_use_ids();
                        !result_ids.iter().all(|id| prev_uses.contains(id))
                    }
                    None => true,
                };
            if orphan {
                continue;
            }
        }

        kept.push(msg.clone());
    }
    kept
}
