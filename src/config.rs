use std::env;
use std::path::{Path, PathBuf};

/// Environment variable names - single source of truth
pub mod env_vars {
    pub const MODEL_ENDPOINT: &str = "VALET_MODEL_ENDPOINT";
    pub const MODEL_API_KEY: &str = "VALET_MODEL_API_KEY";
    pub const MODEL_NAME: &str = "VALET_MODEL_NAME";
    pub const STATE_DIR: &str = "VALET_STATE_DIR";
    pub const WORKSPACE_DIR: &str = "VALET_WORKSPACE_DIR";
    pub const TURN_TIMEOUT_SECS: &str = "VALET_TURN_TIMEOUT_SECS";
    pub const MAX_TOOL_ITERATIONS: &str = "VALET_MAX_TOOL_ITERATIONS";
    pub const HEARTBEAT_INTERVAL_MINUTES: &str = "VALET_HEARTBEAT_INTERVAL_MINUTES";
    pub const CONTEXT_WINDOW_TOKENS: &str = "VALET_CONTEXT_WINDOW_TOKENS";
}

/// Default values
pub mod defaults {
    pub const MODEL_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
    pub const MODEL_NAME: &str = "claude-sonnet-4-20250514";
    pub const STATE_DIR: &str = "state";
    pub const WORKSPACE_DIR: &str = "workspace";
    pub const TURN_TIMEOUT_SECS: u64 = 5 * 60;
    pub const MAX_TOOL_ITERATIONS: usize = 25;
    pub const HEARTBEAT_INTERVAL_MINUTES: u64 = 30;
    pub const CONTEXT_WINDOW_TOKENS: usize = 200_000;
    pub const MAX_OUTPUT_TOKENS: u32 = 8192;
    pub const COMPACTION_RESERVE_TOKENS: usize = 20_000;
    pub const FLUSH_SOFT_BUDGET_TOKENS: usize = 4_000;
}

fn resolve_dir(env_var: &str, default_name: &str) -> String {
    env::var(env_var).unwrap_or_else(|_| default_name.to_string())
}

/// Runtime configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub model_endpoint: String,
    pub model_api_key: String,
    pub model_name: String,
    /// Agent-state directory: session logs, cron store, subagent registry, heartbeat state
    pub state_dir: String,
    /// Workspace directory: memory docs, skills, bootstrap markdowns
    pub workspace_dir: String,
    pub turn_timeout_secs: u64,
    pub max_tool_iterations: usize,
    pub heartbeat_interval_minutes: u64,
    pub context_window_tokens: usize,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Fails fast on missing required values (model API key) so the process
    /// never starts half-configured.
    pub fn from_env() -> Result<Self, String> {
        let model_api_key = env::var(env_vars::MODEL_API_KEY)
            .map_err(|_| format!("{} is required", env_vars::MODEL_API_KEY))?;
        if model_api_key.trim().is_empty() {
            return Err(format!("{} must not be empty", env_vars::MODEL_API_KEY));
        }

        Ok(Self {
            model_endpoint: env::var(env_vars::MODEL_ENDPOINT)
                .unwrap_or_else(|_| defaults::MODEL_ENDPOINT.to_string()),
            model_api_key,
            model_name: env::var(env_vars::MODEL_NAME)
                .unwrap_or_else(|_| defaults::MODEL_NAME.to_string()),
            state_dir: resolve_dir(env_vars::STATE_DIR, defaults::STATE_DIR),
            workspace_dir: resolve_dir(env_vars::WORKSPACE_DIR, defaults::WORKSPACE_DIR),
            turn_timeout_secs: env::var(env_vars::TURN_TIMEOUT_SECS)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults::TURN_TIMEOUT_SECS),
            max_tool_iterations: env::var(env_vars::MAX_TOOL_ITERATIONS)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults::MAX_TOOL_ITERATIONS),
            heartbeat_interval_minutes: env::var(env_vars::HEARTBEAT_INTERVAL_MINUTES)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults::HEARTBEAT_INTERVAL_MINUTES),
            context_window_tokens: env::var(env_vars::CONTEXT_WINDOW_TOKENS)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults::CONTEXT_WINDOW_TOKENS),
        })
    }

    /// Build a config for tests rooted at the given directories.
    pub fn for_dirs(state_dir: &str, workspace_dir: &str) -> Self {
        Self {
            model_endpoint: defaults::MODEL_ENDPOINT.to_string(),
            model_api_key: "test-key".to_string(),
            model_name: defaults::MODEL_NAME.to_string(),
            state_dir: state_dir.to_string(),
            workspace_dir: workspace_dir.to_string(),
            turn_timeout_secs: defaults::TURN_TIMEOUT_SECS,
            max_tool_iterations: defaults::MAX_TOOL_ITERATIONS,
            heartbeat_interval_minutes: defaults::HEARTBEAT_INTERVAL_MINUTES,
            context_window_tokens: defaults::CONTEXT_WINDOW_TOKENS,
        }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        Path::new(&self.state_dir).join("sessions")
    }

    pub fn consolidation_dir(&self) -> PathBuf {
        Path::new(&self.state_dir).join("consolidation")
    }

    pub fn cron_store_path(&self) -> PathBuf {
        Path::new(&self.state_dir).join("cron-store.json")
    }

    pub fn subagent_registry_path(&self) -> PathBuf {
        Path::new(&self.state_dir).join("subagent-registry.json")
    }

    pub fn heartbeat_state_path(&self) -> PathBuf {
        Path::new(&self.state_dir).join("heartbeat-state.json")
    }

    pub fn debug_log_path(&self) -> PathBuf {
        Path::new(&self.state_dir).join("debug.json")
    }

    pub fn memory_dir(&self) -> PathBuf {
        Path::new(&self.workspace_dir).join("memory")
    }

    pub fn skills_dir(&self) -> PathBuf {
        Path::new(&self.workspace_dir).join("skills")
    }
}

/// Create the state and workspace directory trees.
///
/// Called at startup before any subsystem touches disk.
pub fn initialize_directories(config: &Config) -> std::io::Result<()> {
    std::fs::create_dir_all(config.sessions_dir())?;
    std::fs::create_dir_all(config.consolidation_dir())?;
    std::fs::create_dir_all(config.memory_dir())?;
    std::fs::create_dir_all(config.skills_dir())?;
    Ok(())
}

/// Write `contents` to `path` atomically: write to a `.tmp` sibling, then rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<(), String> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)
        .map_err(|e| format!("Failed to write {}: {}", tmp.display(), e))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| format!("Failed to rename {} into place: {}", tmp.display(), e))
}
