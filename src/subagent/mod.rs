pub mod manager;

pub use manager::{AgentEntry, Announcer, SpawnReceipt, SpawnRequest, SubagentManager};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubagentStatus {
    Running,
    Ok,
    Error,
    Killed,
}

impl SubagentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubagentStatus::Running => "running",
            SubagentStatus::Ok => "ok",
            SubagentStatus::Error => "error",
            SubagentStatus::Killed => "killed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubagentStatus::Running)
    }
}

/// Durable record of one background reasoning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentRun {
    pub run_id: String,
    pub child_session_key: String,
    pub parent_session_key: String,
    pub parent_channel_id: String,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub depth: u32,
    pub status: SubagentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

impl SubagentRun {
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.task)
    }
}

/// Fan-out limits.
#[derive(Debug, Clone)]
pub struct SubagentLimits {
    pub max_depth: u32,
    pub max_children_per_session: usize,
    pub max_concurrent_total: usize,
}

impl Default for SubagentLimits {
    fn default() -> Self {
        SubagentLimits {
            max_depth: 2,
            max_children_per_session: 5,
            max_concurrent_total: 10,
        }
    }
}
