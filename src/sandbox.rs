//! Opaque command execution primitive.
//!
//! The runtime treats the sandbox as `exec(command) -> stdout/stderr/exit`;
//! container lifecycle is someone else's problem. A host-process
//! implementation is provided for local operation. Any implementation must
//! observe the abort signal so cancellation propagates into the subprocess.

use crate::agent::cancel::CancelToken;
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::time::{timeout, Duration};

/// Cap on captured stdout/stderr, each.
pub const MAX_STREAM_CHARS: usize = 50_000;

/// Default timeout for sandboxed execution.
pub const DEFAULT_EXEC_TIMEOUT_MS: u64 = 2 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub workdir: Option<String>,
    pub env: HashMap<String, String>,
    pub timeout_ms: u64,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        ExecRequest {
            command: command.into(),
            workdir: None,
            env: HashMap::new(),
            timeout_ms: DEFAULT_EXEC_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn exec(&self, request: ExecRequest, cancel: &CancelToken) -> Result<ExecOutcome, String>;
}

/// Runs commands as host subprocesses through `sh -c`.
pub struct HostSandbox;

impl HostSandbox {
    pub fn new() -> Self {
        HostSandbox
    }
}

impl Default for HostSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for HostSandbox {
    async fn exec(&self, request: ExecRequest, cancel: &CancelToken) -> Result<ExecOutcome, String> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&request.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = request.workdir {
            cmd.current_dir(dir);
        }
        for (k, v) in &request.env {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("Failed to spawn command: {}", e))?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let reader = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                let _ = pipe.read_to_end(&mut stdout).await;
            }
            if let Some(ref mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut stderr).await;
            }
            let status = child.wait().await;
            (stdout, stderr, status)
        };

        let duration = Duration::from_millis(request.timeout_ms.max(1));
        tokio::select! {
            result = timeout(duration, reader) => match result {
                Ok((stdout, stderr, status)) => {
                    let status = status.map_err(|e| format!("Failed to wait for command: {}", e))?;
                    Ok(ExecOutcome {
                        stdout: cap_stream(&stdout),
                        stderr: cap_stream(&stderr),
                        exit_code: status.code().unwrap_or(-1),
                        timed_out: false,
                    })
                }
                Err(_) => Ok(ExecOutcome {
                    stdout: String::new(),
                    stderr: format!("command timed out after {}ms", request.timeout_ms),
                    exit_code: -1,
                    timed_out: true,
                }),
            },
            _ = cancel.cancelled() => {
                Err("command aborted".to_string())
            }
        }
    }
}

fn cap_stream(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.chars().count() <= MAX_STREAM_CHARS {
        text.into_owned()
    } else {
        let kept: String = text.chars().take(MAX_STREAM_CHARS).collect();
        format!("{}\n[output capped at {} chars]", kept, MAX_STREAM_CHARS)
    }
}
