//! Proactive wake-up driver.
//!
//! Every `period` the heartbeat synthesizes a wake-up turn from workspace
//! context and runs it through the orchestrator under a `heartbeat:` session
//! key. A minimum interval between fires is enforced across process restarts
//! via persisted state, and concurrent fires are coalesced (skipped, never
//! queued).

use crate::agent::Orchestrator;
use crate::subagent::manager::Announcer;
use crate::transport::InboundMessage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

pub const DEFAULT_PERIOD_MINUTES: u64 = 30;
pub const MIN_INTERVAL_MINUTES: u64 = 10;

/// Lines taken from the head of MEMORY.md / tail of HISTORY.md.
const MEMORY_HEAD_LINES: usize = 40;
const HISTORY_TAIL_LINES: usize = 20;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct HeartbeatState {
    #[serde(default)]
    pub last_run_at_ms: Option<i64>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub struct Heartbeat {
    orchestrator: Arc<Orchestrator>,
    state_path: PathBuf,
    workspace_dir: PathBuf,
    transport_name: String,
    period: Duration,
    min_interval: Duration,
    in_flight: AtomicBool,
    delivery: OnceLock<Arc<dyn Announcer>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Heartbeat {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        state_path: impl Into<PathBuf>,
        workspace_dir: impl Into<PathBuf>,
        transport_name: impl Into<String>,
        period: Duration,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Heartbeat {
            orchestrator,
            state_path: state_path.into(),
            workspace_dir: workspace_dir.into(),
            transport_name: transport_name.into(),
            period,
            min_interval: Duration::from_secs(MIN_INTERVAL_MINUTES * 60),
            in_flight: AtomicBool::new(false),
            delivery: OnceLock::new(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Late-bind delivery via the first available transport.
    pub fn set_delivery(&self, delivery: Arc<dyn Announcer>) {
        let _ = self.delivery.set(delivery);
    }

    pub fn session_key(&self) -> String {
        format!("heartbeat:{}:wakeup", self.transport_name)
    }

    /// Start the periodic driver.
    pub fn start(self: &Arc<Self>) {
        let heartbeat = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = interval(heartbeat.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick of a tokio interval fires immediately; the
            // min-interval floor decides whether it actually runs.
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        heartbeat.fire().await;
                    }
                }
            }
        });
        log::info!(
            "[HEARTBEAT] Started (period {:?}, floor {:?})",
            self.period,
            self.min_interval
        );
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run one wake-up, honoring the coalescing rule and the interval floor.
    /// Returns whether a turn actually ran.
    pub async fn fire(&self) -> bool {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            log::debug!("[HEARTBEAT] Previous fire still running, skipping tick");
            return false;
        }
        let ran = self.fire_inner().await;
        self.in_flight.store(false, Ordering::SeqCst);
        ran
    }

    async fn fire_inner(&self) -> bool {
        let mut state = self.load_state();
        let now_ms = chrono::Utc::now().timestamp_millis();
        if let Some(last) = state.last_run_at_ms {
            let elapsed = Duration::from_millis((now_ms - last).max(0) as u64);
            if elapsed < self.min_interval {
                log::debug!(
                    "[HEARTBEAT] Interval floor not reached ({:?} elapsed), skipping",
                    elapsed
                );
                return false;
            }
        }

        state.last_run_at_ms = Some(now_ms);
        state.run_count += 1;
        self.save_state(&state);

        let prompt = self.build_prompt();
        let inbound = InboundMessage {
            text: prompt,
            session_key: self.session_key(),
            channel_id: "heartbeat".to_string(),
            user_id: "system".to_string(),
            user_name: "system".to_string(),
            is_group: false,
            images: Vec::new(),
        };

        match self.orchestrator.handle_message_safe(inbound).await {
            Ok(Some(reply)) if !reply.is_no_reply() => {
                if let Some(delivery) = self.delivery.get() {
                    delivery.deliver("heartbeat", &reply).await;
                }
                state.last_error = None;
            }
            Ok(_) => {
                state.last_error = None;
            }
            Err(e) => {
                log::error!("[HEARTBEAT] Wake-up turn failed: {}", e);
                state.last_error = Some(e);
            }
        }
        self.save_state(&state);
        true
    }

    /// Workspace context folded into the wake-up prompt.
    fn build_prompt(&self) -> String {
        let memory = read_head(
            &self.workspace_dir.join("memory").join("MEMORY.md"),
            MEMORY_HEAD_LINES,
        );
        let history = read_tail(
            &self.workspace_dir.join("memory").join("HISTORY.md"),
            HISTORY_TAIL_LINES,
        );
        let todo = std::fs::read_to_string(self.workspace_dir.join("TODO.md")).ok();

        let mut prompt = String::from(
            "[heartbeat] This is a periodic proactive wake-up, not a user message. \
             Review the context below and decide whether anything needs doing or \
             saying. Reply NO_REPLY if not.",
        );
        if let Some(memory) = memory {
            prompt.push_str(&format!("\n\n## Long-term memory (head)\n{}", memory));
        }
        if let Some(history) = history {
            prompt.push_str(&format!("\n\n## Recent events\n{}", history));
        }
        if let Some(todo) = todo {
            if !todo.trim().is_empty() {
                prompt.push_str(&format!("\n\n## TODO.md\n{}", todo.trim()));
            }
        }
        prompt
    }

    fn load_state(&self) -> HeartbeatState {
        std::fs::read_to_string(&self.state_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn save_state(&self, state: &HeartbeatState) {
        if let Some(parent) = self.state_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(state) {
            Ok(json) => {
                if let Err(e) = crate::config::write_atomic(&self.state_path, &json) {
                    log::warn!("[HEARTBEAT] Failed to persist state: {}", e);
                }
            }
            Err(e) => log::warn!("[HEARTBEAT] Failed to serialize state: {}", e),
        }
    }
}

fn read_head(path: &std::path::Path, lines: usize) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let head: Vec<&str> = raw.lines().take(lines).collect();
    if head.is_empty() {
        return None;
    }
    Some(head.join("\n"))
}

fn read_tail(path: &std::path::Path, lines: usize) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let all: Vec<&str> = raw.lines().collect();
    if all.is_empty() {
        return None;
    }
    let skip = all.len().saturating_sub(lines);
    Some(all[skip..].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::{MockModelClient, ModelClient};
    use crate::tools::ToolRegistry;

    fn heartbeat_with_mock(
        dir: &tempfile::TempDir,
        responses: Vec<crate::model::ScriptedResponse>,
    ) -> Arc<Heartbeat> {
        let state_dir = dir.path().join("state");
        let workspace = dir.path().join("workspace");
        std::fs::create_dir_all(workspace.join("memory")).unwrap();
        let config = Config::for_dirs(
            state_dir.to_str().unwrap(),
            workspace.to_str().unwrap(),
        );
        let model = ModelClient::Mock(MockModelClient::new(responses));
        let orchestrator = Orchestrator::new(
            config.clone(),
            model,
            Arc::new(ToolRegistry::new()),
            None,
        );
        Heartbeat::new(
            orchestrator,
            config.heartbeat_state_path(),
            &config.workspace_dir,
            "main",
            Duration::from_secs(1800),
        )
    }

    #[tokio::test]
    async fn fire_runs_a_turn_and_persists_state() {
        let dir = tempfile::tempdir().unwrap();
        let heartbeat = heartbeat_with_mock(&dir, vec![]);
        assert!(heartbeat.fire().await);

        let state = heartbeat.load_state();
        assert_eq!(state.run_count, 1);
        assert!(state.last_run_at_ms.is_some());
    }

    #[tokio::test]
    async fn min_interval_floor_holds_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let heartbeat = heartbeat_with_mock(&dir, vec![]);
        assert!(heartbeat.fire().await);
        // A second fire inside the floor is skipped
        assert!(!heartbeat.fire().await);

        // A fresh instance (simulated restart) still honors the persisted floor
        let heartbeat2 = heartbeat_with_mock(&dir, vec![]);
        assert!(!heartbeat2.fire().await);
        assert_eq!(heartbeat2.load_state().run_count, 1);
    }

    #[tokio::test]
    async fn workspace_context_reaches_the_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        std::fs::create_dir_all(workspace.join("memory")).unwrap();
        std::fs::write(workspace.join("memory").join("MEMORY.md"), "remember the milk").unwrap();
        std::fs::write(workspace.join("TODO.md"), "- water the plants").unwrap();

        let heartbeat = heartbeat_with_mock(&dir, vec![]);
        let prompt = heartbeat.build_prompt();
        assert!(prompt.contains("proactive wake-up"));
        assert!(prompt.contains("remember the milk"));
        assert!(prompt.contains("water the plants"));
    }
}
