//! Structured long-term memory store.
//!
//! An ordered sequence of tagged entries persisted atomically at
//! `workspace/memory/memory.json`. Mutated only through the memory tool.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct MemoryStore {
    path: PathBuf,
    entries: Mutex<Vec<MemoryEntry>>,
}

impl MemoryStore {
    /// Load the store from disk, starting fresh if the file is missing or
    /// unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<MemoryEntry>>(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    log::warn!(
                        "[MEMORY] Corrupt store at {}, starting fresh: {}",
                        path.display(),
                        e
                    );
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        MemoryStore {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn store(&self, content: &str, tags: Vec<String>) -> Result<MemoryEntry, String> {
        let now = chrono::Utc::now().to_rfc3339();
        let entry = MemoryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.to_string(),
            tags,
            created_at: now.clone(),
            updated_at: now,
        };
        {
            let mut entries = self.entries.lock().expect("memory store poisoned");
            entries.push(entry.clone());
            self.persist(&entries)?;
        }
        Ok(entry)
    }

    pub fn update(&self, id: &str, content: &str) -> Result<MemoryEntry, String> {
        let mut entries = self.entries.lock().expect("memory store poisoned");
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| format!("no memory entry with id '{}'", id))?;
        entry.content = content.to_string();
        entry.updated_at = chrono::Utc::now().to_rfc3339();
        let updated = entry.clone();
        self.persist(&entries)?;
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<(), String> {
        let mut entries = self.entries.lock().expect("memory store poisoned");
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() == before {
            return Err(format!("no memory entry with id '{}'", id));
        }
        self.persist(&entries)
    }

    pub fn list(&self) -> Vec<MemoryEntry> {
        self.entries.lock().expect("memory store poisoned").clone()
    }

    /// Case-insensitive substring search over content and tags.
    pub fn search(&self, query: &str) -> Vec<MemoryEntry> {
        let needle = query.to_lowercase();
        self.entries
            .lock()
            .expect("memory store poisoned")
            .iter()
            .filter(|e| {
                e.content.to_lowercase().contains(&needle)
                    || e.tags.iter().any(|t| t.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect()
    }

    fn persist(&self, entries: &[MemoryEntry]) -> Result<(), String> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create memory dir: {}", e))?;
        }
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| format!("Failed to serialize memory store: {}", e))?;
        crate::config::write_atomic(&self.path, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::load(dir.path().join("memory.json"));
        (dir, store)
    }

    #[test]
    fn store_search_update_delete() {
        let (_dir, store) = store();
        let entry = store
            .store("User prefers metric units", vec!["prefs".to_string()])
            .unwrap();

        assert_eq!(store.search("metric").len(), 1);
        assert_eq!(store.search("prefs").len(), 1);
        assert!(store.search("imperial").is_empty());

        store.update(&entry.id, "User prefers imperial units").unwrap();
        assert_eq!(store.search("imperial").len(), 1);

        store.delete(&entry.id).unwrap();
        assert!(store.list().is_empty());
        assert!(store.delete(&entry.id).is_err());
    }

    #[test]
    fn entries_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        {
            let store = MemoryStore::load(&path);
            store.store("fact one", vec![]).unwrap();
            store.store("fact two", vec![]).unwrap();
        }
        let reloaded = MemoryStore::load(&path);
        assert_eq!(reloaded.list().len(), 2);
    }

    #[test]
    fn corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        std::fs::write(&path, "{{{{").unwrap();
        let store = MemoryStore::load(&path);
        assert!(store.list().is_empty());
    }
}
