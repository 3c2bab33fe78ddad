//! Durable job store: `<state>/cron-store.json`, store version 2.
//!
//! v1 records carried no `state` object; they migrate on load by defaulting
//! `consecutive_failures = 0`. Every mutation persists atomically.

use crate::scheduler::{JobState, ScheduledJob};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Mutex;

pub const STORE_VERSION: u32 = 2;

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    jobs: Vec<Value>,
}

pub struct CronStore {
    path: PathBuf,
    jobs: Mutex<Vec<ScheduledJob>>,
}

impl CronStore {
    /// Load the store, migrating v1 records. An unreadable file starts fresh.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let jobs = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<StoreFile>(&raw) {
                Ok(file) => {
                    let migrate = file.version < STORE_VERSION;
                    file.jobs
                        .into_iter()
                        .filter_map(|mut raw_job| {
                            if migrate || raw_job.get("state").is_none() {
                                if let Some(obj) = raw_job.as_object_mut() {
                                    obj.entry("state").or_insert_with(|| {
                                        serde_json::to_value(JobState::default())
                                            .unwrap_or(Value::Null)
                                    });
                                }
                            }
                            match serde_json::from_value::<ScheduledJob>(raw_job) {
                                Ok(job) => Some(job),
                                Err(e) => {
                                    log::warn!("[CRON] Dropping unreadable job record: {}", e);
                                    None
                                }
                            }
                        })
                        .collect()
                }
                Err(e) => {
                    log::warn!(
                        "[CRON] Corrupt store at {}, starting fresh: {}",
                        path.display(),
                        e
                    );
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        CronStore {
            path,
            jobs: Mutex::new(jobs),
        }
    }

    pub fn add(&self, job: ScheduledJob) -> Result<ScheduledJob, String> {
        let mut jobs = self.jobs.lock().expect("cron store poisoned");
        jobs.push(job.clone());
        self.persist(&jobs)?;
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Option<ScheduledJob> {
        self.jobs
            .lock()
            .expect("cron store poisoned")
            .iter()
            .find(|j| j.id == id)
            .cloned()
    }

    pub fn list(&self) -> Vec<ScheduledJob> {
        self.jobs.lock().expect("cron store poisoned").clone()
    }

    pub fn remove(&self, id: &str) -> Result<bool, String> {
        let mut jobs = self.jobs.lock().expect("cron store poisoned");
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        let removed = jobs.len() != before;
        if removed {
            self.persist(&jobs)?;
        }
        Ok(removed)
    }

    /// Apply a mutation to one job and persist. Returns the updated job.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<ScheduledJob, String>
    where
        F: FnOnce(&mut ScheduledJob),
    {
        let mut jobs = self.jobs.lock().expect("cron store poisoned");
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| format!("no job with id '{}'", id))?;
        mutate(job);
        let updated = job.clone();
        self.persist(&jobs)?;
        Ok(updated)
    }

    fn persist(&self, jobs: &[ScheduledJob]) -> Result<(), String> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create state dir: {}", e))?;
        }
        let file = StoreFile {
            version: STORE_VERSION,
            jobs: jobs
                .iter()
                .map(|j| serde_json::to_value(j).unwrap_or(Value::Null))
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| format!("Failed to serialize cron store: {}", e))?;
        crate::config::write_atomic(&self.path, &json)
    }
}
