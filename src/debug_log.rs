//! Rolling per-turn debug records, bounded to the last 100 turns.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

const MAX_RECORDS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDebugRecord {
    pub session_key: String,
    pub started_at: String,
    pub duration_ms: i64,
    /// "ok", "error: …", "cancelled", "timeout"
    pub outcome: String,
    pub attempts: u32,
}

pub struct DebugLog {
    path: PathBuf,
    records: Mutex<Vec<TurnDebugRecord>>,
}

impl DebugLog {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        DebugLog {
            path,
            records: Mutex::new(records),
        }
    }

    /// Append a record, trimming to the bound, and persist best-effort.
    pub fn record(&self, record: TurnDebugRecord) {
        let snapshot = {
            let mut records = self.records.lock().expect("debug log poisoned");
            records.push(record);
            let excess = records.len().saturating_sub(MAX_RECORDS);
            if excess > 0 {
                records.drain(..excess);
            }
            records.clone()
        };
        if let Ok(json) = serde_json::to_string_pretty(&snapshot) {
            if let Err(e) = crate::config::write_atomic(&self.path, &json) {
                log::warn!("[DEBUG_LOG] Failed to persist: {}", e);
            }
        }
    }

    pub fn list(&self) -> Vec<TurnDebugRecord> {
        self.records.lock().expect("debug log poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: usize) -> TurnDebugRecord {
        TurnDebugRecord {
            session_key: format!("t:dm:{}", n),
            started_at: chrono::Utc::now().to_rfc3339(),
            duration_ms: 10,
            outcome: "ok".to_string(),
            attempts: 1,
        }
    }

    #[test]
    fn keeps_only_the_last_hundred() {
        let dir = tempfile::tempdir().unwrap();
        let log = DebugLog::load(dir.path().join("debug.json"));
        for i in 0..130 {
            log.record(record(i));
        }
        let records = log.list();
        assert_eq!(records.len(), 100);
        assert_eq!(records[0].session_key, "t:dm:30");
    }

    #[test]
    fn records_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug.json");
        {
            let log = DebugLog::load(&path);
            log.record(record(1));
        }
        let log = DebugLog::load(&path);
        assert_eq!(log.list().len(), 1);
    }
}
