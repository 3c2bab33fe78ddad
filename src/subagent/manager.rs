//! Bounded, depth-limited fan-out of background reasoning sessions.
//!
//! The manager owns the durable run registry, enforces the spawn limits, and
//! announces completed runs back into the parent session as synthetic
//! `system` inputs.

use crate::subagent::{SubagentLimits, SubagentRun, SubagentStatus};
use crate::transport::{InboundMessage, OutboundMessage};
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

/// How long completed runs are kept before `cleanup` may prune them.
const COMPLETED_RETENTION_SECS: i64 = 60 * 60;
/// Bound on serialized registry entries.
const MAX_PERSISTED_RUNS: usize = 100;
/// Announce result snippets are bounded to keep parent turns small.
const ANNOUNCE_RESULT_CHARS: usize = 1500;

/// Entry point back into the orchestrator. Implemented by the session
/// orchestrator; the manager never holds mutable agent state, linkage is
/// purely by session key.
#[async_trait]
pub trait AgentEntry: Send + Sync {
    async fn handle(&self, inbound: InboundMessage) -> Result<Option<OutboundMessage>, String>;

    /// Abort a session's in-flight run, if any.
    fn cancel_session(&self, session_key: &str);
}

/// Delivery hook for parent replies to announcements.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn deliver(&self, channel_id: &str, message: &OutboundMessage);
}

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task: String,
    pub parent_session_key: String,
    pub parent_channel_id: String,
    pub label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SpawnReceipt {
    pub run_id: String,
    pub child_session_key: String,
}

pub struct SubagentManager {
    registry_path: PathBuf,
    runs: Mutex<Vec<SubagentRun>>,
    limits: SubagentLimits,
    entry: OnceLock<Arc<dyn AgentEntry>>,
    announcer: OnceLock<Arc<dyn Announcer>>,
}

impl SubagentManager {
    /// Load the registry. Any persisted `running` record belongs to a dead
    /// process and is rewritten as an error before anything new spawns.
    pub fn load(registry_path: impl Into<PathBuf>, limits: SubagentLimits) -> Arc<Self> {
        let registry_path = registry_path.into();
        let mut runs: Vec<SubagentRun> = std::fs::read_to_string(&registry_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        let mut repaired = 0usize;
        for run in runs.iter_mut() {
            if run.status == SubagentStatus::Running {
                run.status = SubagentStatus::Error;
                run.error = Some("process restart".to_string());
                run.result = Some(String::new());
                run.ended_at = Some(Utc::now().to_rfc3339());
                repaired += 1;
            }
        }
        if repaired > 0 {
            log::info!(
                "[SUBAGENT] Rewrote {} stale running record(s) after restart",
                repaired
            );
        }

        let manager = Arc::new(SubagentManager {
            registry_path,
            runs: Mutex::new(runs),
            limits,
            entry: OnceLock::new(),
            announcer: OnceLock::new(),
        });
        if repaired > 0 {
            manager.persist();
        }
        manager
    }

    /// Late-bind the orchestrator entry (set once after construction).
    pub fn set_entry(&self, entry: Arc<dyn AgentEntry>) {
        let _ = self.entry.set(entry);
    }

    /// Late-bind the delivery hook for announce replies.
    pub fn set_announcer(&self, announcer: Arc<dyn Announcer>) {
        let _ = self.announcer.set(announcer);
    }

    /// Depth of a session: a session appearing as some run's child inherits
    /// that run's depth; top-level sessions are depth 0.
    pub fn depth_of(&self, session_key: &str) -> u32 {
        self.runs
            .lock()
            .expect("subagent registry poisoned")
            .iter()
            .filter(|r| r.child_session_key == session_key)
            .map(|r| r.depth)
            .max()
            .unwrap_or(0)
    }

    /// Whether this session key belongs to a subagent run.
    pub fn is_subagent_session(&self, session_key: &str) -> bool {
        session_key.starts_with("subagent:")
    }

    pub fn max_depth(&self) -> u32 {
        self.limits.max_depth
    }

    pub fn active_children(&self, parent_session_key: &str) -> usize {
        self.runs
            .lock()
            .expect("subagent registry poisoned")
            .iter()
            .filter(|r| {
                r.parent_session_key == parent_session_key && r.status == SubagentStatus::Running
            })
            .count()
    }

    pub fn active_total(&self) -> usize {
        self.runs
            .lock()
            .expect("subagent registry poisoned")
            .iter()
            .filter(|r| r.status == SubagentStatus::Running)
            .count()
    }

    pub fn list_runs(&self) -> Vec<SubagentRun> {
        self.runs.lock().expect("subagent registry poisoned").clone()
    }

    pub fn get_run(&self, run_id: &str) -> Option<SubagentRun> {
        self.runs
            .lock()
            .expect("subagent registry poisoned")
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned()
    }

    /// Spawn a background run. Registers it as `running`, starts the child
    /// task, and returns immediately. Limit violations come back as
    /// `Err("forbidden: ...")` with the registry unchanged.
    pub fn spawn(self: &Arc<Self>, request: SpawnRequest) -> Result<SpawnReceipt, String> {
        let parent_depth = self.depth_of(&request.parent_session_key);
        let child_depth = parent_depth + 1;
        if child_depth > self.limits.max_depth {
            return Err(format!(
                "forbidden: depth {} exceeds max depth {}",
                child_depth, self.limits.max_depth
            ));
        }
        if self.active_children(&request.parent_session_key) >= self.limits.max_children_per_session
        {
            return Err(format!(
                "forbidden: parent already has {} active children",
                self.limits.max_children_per_session
            ));
        }
        if self.active_total() >= self.limits.max_concurrent_total {
            return Err(format!(
                "forbidden: {} subagents already running",
                self.limits.max_concurrent_total
            ));
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let child_session_key =
            format!("subagent:{}:{}", request.parent_channel_id, run_id);
        let run = SubagentRun {
            run_id: run_id.clone(),
            child_session_key: child_session_key.clone(),
            parent_session_key: request.parent_session_key.clone(),
            parent_channel_id: request.parent_channel_id.clone(),
            task: request.task.clone(),
            label: request.label.clone(),
            depth: child_depth,
            status: SubagentStatus::Running,
            result: None,
            error: None,
            created_at: Utc::now().to_rfc3339(),
            ended_at: None,
        };

        {
            let mut runs = self.runs.lock().expect("subagent registry poisoned");
            runs.push(run);
        }
        self.persist();

        log::info!(
            "[SUBAGENT] Spawned '{}' (run {}, depth {})",
            request.label.as_deref().unwrap_or(&request.task),
            run_id,
            child_depth
        );

        let manager = Arc::clone(self);
        let receipt = SpawnReceipt {
            run_id: run_id.clone(),
            child_session_key: child_session_key.clone(),
        };
        tokio::spawn(async move {
            manager.run_child(run_id, child_session_key, request).await;
        });

        Ok(receipt)
    }

    async fn run_child(
        self: Arc<Self>,
        run_id: String,
        child_session_key: String,
        request: SpawnRequest,
    ) {
        let Some(entry) = self.entry.get().cloned() else {
            log::error!("[SUBAGENT] No agent entry bound; failing run {}", run_id);
            self.mark_complete(
                &run_id,
                SubagentStatus::Error,
                String::new(),
                Some("agent entry not configured".to_string()),
            );
            return;
        };

        let inbound = InboundMessage {
            text: request.task.clone(),
            session_key: child_session_key,
            channel_id: request.parent_channel_id.clone(),
            user_id: "system".to_string(),
            user_name: "system".to_string(),
            is_group: false,
            images: Vec::new(),
        };

        let outcome = entry.handle(inbound).await;

        // A kill that landed while we ran wins over the task outcome.
        if self
            .get_run(&run_id)
            .map(|r| r.status == SubagentStatus::Killed)
            .unwrap_or(false)
        {
            self.announce(&run_id).await;
            return;
        }

        match outcome {
            Ok(response) => {
                let text = response.map(|r| r.text).unwrap_or_default();
                self.mark_complete(&run_id, SubagentStatus::Ok, text, None);
            }
            Err(e) => {
                self.mark_complete(&run_id, SubagentStatus::Error, String::new(), Some(e));
            }
        }
        self.announce(&run_id).await;
    }

    /// Transition a run to a terminal status and persist.
    pub fn mark_complete(
        &self,
        run_id: &str,
        status: SubagentStatus,
        result: String,
        error: Option<String>,
    ) {
        {
            let mut runs = self.runs.lock().expect("subagent registry poisoned");
            if let Some(run) = runs.iter_mut().find(|r| r.run_id == run_id) {
                run.status = status;
                run.result = Some(result);
                run.error = error;
                run.ended_at = Some(Utc::now().to_rfc3339());
            }
        }
        self.persist();
    }

    /// Kill a running subagent: aborts the child session and records the
    /// transition.
    pub fn kill(&self, run_id: &str) -> Result<SubagentRun, String> {
        let child_key = {
            let mut runs = self.runs.lock().expect("subagent registry poisoned");
            let run = runs
                .iter_mut()
                .find(|r| r.run_id == run_id)
                .ok_or_else(|| format!("no subagent run '{}'", run_id))?;
            if run.status != SubagentStatus::Running {
                return Err(format!("run '{}' is not running", run_id));
            }
            run.status = SubagentStatus::Killed;
            run.result = Some(String::new());
            run.ended_at = Some(Utc::now().to_rfc3339());
            run.child_session_key.clone()
        };
        self.persist();
        if let Some(entry) = self.entry.get() {
            entry.cancel_session(&child_key);
        }
        self.get_run(run_id)
            .ok_or_else(|| format!("no subagent run '{}'", run_id))
    }

    /// Inject the run's outcome into the parent session as a synthetic
    /// `system` user turn, then deliver the parent's reply (unless NO_REPLY).
    async fn announce(&self, run_id: &str) {
        let Some(run) = self.get_run(run_id) else {
            return;
        };
        let Some(entry) = self.entry.get().cloned() else {
            return;
        };

        let duration = duration_line(&run);
        let remaining = self.active_children(&run.parent_session_key);
        let result = run.result.as_deref().unwrap_or("");
        let result = if result.chars().count() > ANNOUNCE_RESULT_CHARS {
            let kept: String = result.chars().take(ANNOUNCE_RESULT_CHARS).collect();
            format!("{}…", kept)
        } else {
            result.to_string()
        };

        let mut text = format!(
            "[subagent '{}' finished: {}]\n",
            run.display_name(),
            run.status.as_str()
        );
        if !result.is_empty() {
            text.push_str(&format!("Result: {}\n", result));
        }
        if let Some(ref error) = run.error {
            text.push_str(&format!("Error: {}\n", error));
        }
        text.push_str(&format!(
            "Duration: {}. Remaining active subagents: {}.\n\
             Relay anything useful to the user, or reply NO_REPLY if nothing needs saying.",
            duration, remaining
        ));

        let inbound = InboundMessage {
            text,
            session_key: run.parent_session_key.clone(),
            channel_id: run.parent_channel_id.clone(),
            user_id: "system".to_string(),
            user_name: "system".to_string(),
            is_group: false,
            images: Vec::new(),
        };

        match entry.handle(inbound).await {
            Ok(Some(reply)) if !reply.is_no_reply() => {
                if let Some(announcer) = self.announcer.get() {
                    announcer.deliver(&run.parent_channel_id, &reply).await;
                }
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("[SUBAGENT] Announce for run {} failed: {}", run_id, e);
            }
        }
    }

    /// Prune completed runs older than the retention window.
    pub fn cleanup(&self) {
        let cutoff = Utc::now() - chrono::Duration::seconds(COMPLETED_RETENTION_SECS);
        let removed = {
            let mut runs = self.runs.lock().expect("subagent registry poisoned");
            let before = runs.len();
            runs.retain(|r| {
                if !r.status.is_terminal() {
                    return true;
                }
                match r
                    .ended_at
                    .as_deref()
                    .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
                {
                    Some(ended) => ended.with_timezone(&Utc) > cutoff,
                    None => false,
                }
            });
            before - runs.len()
        };
        if removed > 0 {
            log::info!("[SUBAGENT] Pruned {} completed run(s)", removed);
            self.persist();
        }
    }

    fn persist(&self) {
        let snapshot: Vec<SubagentRun> = {
            let runs = self.runs.lock().expect("subagent registry poisoned");
            let skip = runs.len().saturating_sub(MAX_PERSISTED_RUNS);
            runs.iter().skip(skip).cloned().collect()
        };
        if let Some(parent) = self.registry_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = crate::config::write_atomic(&self.registry_path, &json) {
                    log::error!("[SUBAGENT] Failed to persist registry: {}", e);
                }
            }
            Err(e) => log::error!("[SUBAGENT] Failed to serialize registry: {}", e),
        }
    }
}

fn duration_line(run: &SubagentRun) -> String {
    let started = chrono::DateTime::parse_from_rfc3339(&run.created_at).ok();
    let ended = run
        .ended_at
        .as_deref()
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok());
    match (started, ended) {
        (Some(s), Some(e)) => {
            let ms = (e - s).num_milliseconds().max(0);
            if ms >= 1000 {
                format!("{:.1}s", ms as f64 / 1000.0)
            } else {
                format!("{}ms", ms)
            }
        }
        _ => "unknown".to_string(),
    }
}
