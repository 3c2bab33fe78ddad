//! Session orchestrator: drives one reasoning turn per inbound message with
//! per-session serialization, cancellation, history repair, overflow
//! recovery, and memory consolidation.

pub mod cancel;
pub mod flush;
pub mod lanes;
pub mod overflow;
pub mod prompt;


use crate::agent::cancel::{CancelRegistry, CancelToken};
use crate::agent::lanes::SessionLaneManager;
use crate::config::Config;
use crate::debug_log::{DebugLog, TurnDebugRecord};
use crate::memory::{Consolidator, MemoryStore};
use crate::model::{ModelClient, ModelRequest};
use crate::sandbox::Sandbox;
use crate::scheduler::Scheduler;
use crate::session::{
    sanitize_history, ContentBlock, Role, SessionMessage, SessionStore,
};
use crate::skills::WorkspaceContext;
use crate::subagent::manager::AgentEntry;
use crate::subagent::SubagentManager;
use crate::tools::{ToolBlock, ToolContext, ToolOutput, ToolRegistry};
use crate::transport::{InboundImage, InboundMessage, OutboundMessage, TransportCommand};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokio::time::{sleep, timeout, Duration};

/// Fixed response for cancelled runs.
pub const STOPPED_RESPONSE: &str = "Stopped.";
/// Placeholder text when a successful turn produced only images.
pub const NO_TEXT_RESPONSE: &str = "(no text response)";
/// User-facing message after a context-overflow session reset.
pub const RESET_RESPONSE: &str =
    "I hit my context limit and couldn't recover, so I had to reset this conversation. \
     Earlier messages are gone, but my long-term memory is intact.";

/// Hard cap on model-turn attempts per run.
const MAX_ATTEMPTS: u32 = 3;

enum TurnError {
    Cancelled,
    Failed(String),
}

struct TurnSuccess {
    text: String,
    images: Vec<InboundImage>,
}

pub struct Orchestrator {
    config: Config,
    store: SessionStore,
    model: ModelClient,
    tools: Arc<ToolRegistry>,
    lanes: Arc<SessionLaneManager>,
    cancels: CancelRegistry,
    consolidator: Arc<Consolidator>,
    memory: Arc<MemoryStore>,
    workspace: WorkspaceContext,
    debug: DebugLog,
    sandbox: Option<Arc<dyn Sandbox>>,
    subagents: OnceLock<Arc<SubagentManager>>,
    scheduler: OnceLock<Arc<Scheduler>>,
    /// Per-session compaction reserve override, never below the floor
    reserve_tokens: DashMap<String, usize>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        model: ModelClient,
        tools: Arc<ToolRegistry>,
        sandbox: Option<Arc<dyn Sandbox>>,
    ) -> Arc<Self> {
        let store = SessionStore::new(config.sessions_dir());
        let memory = Arc::new(MemoryStore::load(config.memory_dir().join("memory.json")));
        let consolidator = Arc::new(Consolidator::new(
            model.clone(),
            config.memory_dir(),
            config.consolidation_dir(),
        ));
        let workspace = WorkspaceContext::load(PathBuf::from(&config.workspace_dir).as_path());
        let debug = DebugLog::load(config.debug_log_path());

        Arc::new(Orchestrator {
            config,
            store,
            model,
            tools,
            lanes: SessionLaneManager::new(),
            cancels: CancelRegistry::new(),
            consolidator,
            memory,
            workspace,
            debug,
            sandbox,
            subagents: OnceLock::new(),
            scheduler: OnceLock::new(),
            reserve_tokens: DashMap::new(),
        })
    }

    /// Late-bind the subagent manager (set once at startup).
    pub fn set_subagents(&self, subagents: Arc<SubagentManager>) {
        let _ = self.subagents.set(subagents);
    }

    /// Late-bind the scheduler (set once at startup).
    pub fn set_scheduler(&self, scheduler: Arc<Scheduler>) {
        let _ = self.scheduler.set(scheduler);
    }

    pub fn memory_store(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn session_store(&self) -> &SessionStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Abort a session's in-flight run, if any.
    pub fn cancel(&self, session_key: &str) -> bool {
        self.cancels.cancel(session_key)
    }

    /// Panic-safe entry point. A panic anywhere in the turn becomes an error
    /// result instead of taking the caller down.
    pub async fn handle_message_safe(
        &self,
        inbound: InboundMessage,
    ) -> Result<Option<OutboundMessage>, String> {
        let session_key = inbound.session_key.clone();
        match AssertUnwindSafe(self.handle_message(inbound)).catch_unwind().await {
            Ok(result) => result,
            Err(panic_info) => {
                let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                log::error!("[AGENT] Panic during turn for '{}': {}", session_key, msg);
                self.cancels.deregister(&session_key);
                Err(format!("internal error: {}", msg))
            }
        }
    }

    /// Run one conversation turn. At most one run per session key executes at
    /// a time; later calls wait for the prior one to finish.
    pub async fn handle_message(
        &self,
        inbound: InboundMessage,
    ) -> Result<Option<OutboundMessage>, String> {
        let session_key = inbound.session_key.clone();
        let started = Utc::now();

        let _lane = self.lanes.acquire(&session_key).await;
        let cancel = self.cancels.register(&session_key);

        let (result, attempts) = self.run_turn(&inbound, &cancel).await;
        self.cancels.deregister(&session_key);

        let outcome = match &result {
            Ok(Some(out)) if out.text == STOPPED_RESPONSE => "cancelled".to_string(),
            Ok(_) => "ok".to_string(),
            Err(e) => format!("error: {}", e),
        };
        self.debug.record(TurnDebugRecord {
            session_key: session_key.clone(),
            started_at: started.to_rfc3339(),
            duration_ms: (Utc::now() - started).num_milliseconds(),
            outcome,
            attempts,
        });

        // Consolidation decision is fire-and-forget; it never delays or
        // fails the response.
        if let Ok(messages) = self.store.load(&session_key) {
            let consolidator = Arc::clone(&self.consolidator);
            let key = session_key.clone();
            tokio::spawn(async move {
                consolidator.maybe_consolidate(&key, &messages).await;
            });
        }

        result
    }

    async fn run_turn(
        &self,
        inbound: &InboundMessage,
        cancel: &CancelToken,
    ) -> (Result<Option<OutboundMessage>, String>, u32) {
        let session_key = &inbound.session_key;

        // Enforce the compaction reserve floor (write-through override)
        self.reserve_tokens
            .entry(session_key.clone())
            .and_modify(|r| *r = (*r).max(flush::RESERVE_TOKENS))
            .or_insert(flush::RESERVE_TOKENS);

        self.store.repair(session_key);
        let mut log = match self.store.load(session_key) {
            Ok(log) => log,
            Err(e) => return (Err(e), 0),
        };

        // Pre-compaction memory flush, best-effort
        if flush::should_flush(&log, self.config.context_window_tokens) {
            let msg = flush::flush_message();
            if let Err(e) = self.store.append(session_key, &msg) {
                log::warn!("[AGENT] Memory flush injection failed for '{}': {}", session_key, e);
            } else {
                log.push(msg);
            }
        }

        // History sanitation replaces the in-memory log only
        let sanitized = sanitize_history(&log, crate::session::sanitize::DEFAULT_RETAINED_USER_TURNS);
        if sanitized.len() < log.len() {
            log::debug!(
                "[AGENT] Sanitized history for '{}': {} -> {} messages",
                session_key,
                log.len(),
                sanitized.len()
            );
            log = sanitized;
        }

        // Inbound images pass the same normalization as tool results
        let user_message = self.build_user_message(inbound);
        if let Err(e) = self.store.append(session_key, &user_message) {
            return (Err(e), 0);
        }
        log.push(user_message);

        let system = self.assemble_prompt(inbound);
        let turn_timeout = Duration::from_secs(self.config.turn_timeout_secs);

        let mut attempts: u32 = 0;
        let mut transient_retries: u32 = 0;
        let mut compaction_tried = false;

        loop {
            attempts += 1;
            let turn = timeout(
                turn_timeout,
                self.run_model_turn(session_key, &inbound.channel_id, &mut log, &system, cancel),
            )
            .await;
            let outcome = match turn {
                Ok(outcome) => outcome,
                Err(_) => Err(TurnError::Failed(format!(
                    "turn timed out after {}s",
                    self.config.turn_timeout_secs
                ))),
            };

            match outcome {
                Ok(success) => {
                    let out = finish_success(success);
                    return (Ok(out), attempts);
                }
                Err(TurnError::Cancelled) => {
                    log::info!("[AGENT] Run for '{}' cancelled", session_key);
                    return (Ok(Some(OutboundMessage::text(STOPPED_RESPONSE))), attempts);
                }
                Err(TurnError::Failed(error)) => {
                    log::warn!(
                        "[AGENT] Turn attempt {} for '{}' failed: {}",
                        attempts,
                        session_key,
                        error
                    );
                    // Classify before any attempt-count shortcut: an overflow
                    // must always reach the reset path, or the oversized log
                    // would wedge the session permanently.
                    match overflow::classify(&error) {
                        overflow::FailureKind::ContextOverflow => {
                            if !compaction_tried && attempts < MAX_ATTEMPTS {
                                compaction_tried = true;
                                match self.compact(session_key, &mut log).await {
                                    Ok(()) => continue,
                                    Err(e) => {
                                        log::warn!(
                                            "[AGENT] Compaction for '{}' failed: {}",
                                            session_key,
                                            e
                                        );
                                    }
                                }
                            }
                            // Controlled reset with a user-visible message
                            if let Err(e) = self.store.truncate(session_key) {
                                log::error!(
                                    "[AGENT] Session reset for '{}' failed: {}",
                                    session_key,
                                    e
                                );
                            }
                            log.clear();
                            return (Ok(Some(OutboundMessage::text(RESET_RESPONSE))), attempts);
                        }
                        overflow::FailureKind::Transient => {
                            if attempts < MAX_ATTEMPTS
                                && transient_retries < overflow::MAX_TRANSIENT_RETRIES
                            {
                                let delay = overflow::transient_delay_ms(transient_retries);
                                transient_retries += 1;
                                sleep(Duration::from_millis(delay)).await;
                                continue;
                            }
                            return (Ok(Some(OutboundMessage::text(error))), attempts);
                        }
                        overflow::FailureKind::Unknown => {
                            return (Ok(Some(OutboundMessage::text(error))), attempts);
                        }
                    }
                }
            }
        }
    }

    /// One model turn: complete, dispatch tool calls, repeat until the model
    /// stops asking for tools.
    async fn run_model_turn(
        &self,
        session_key: &str,
        channel_id: &str,
        log: &mut Vec<SessionMessage>,
        system: &str,
        cancel: &CancelToken,
    ) -> Result<TurnSuccess, TurnError> {
        let mut tool_images: Vec<InboundImage> = Vec::new();
        let tool_context = self.build_tool_context(session_key, channel_id, cancel);

        for iteration in 0..self.config.max_tool_iterations {
            if cancel.is_cancelled() {
                return Err(TurnError::Cancelled);
            }

            let request = ModelRequest {
                system: system.to_string(),
                messages: log.clone(),
                tools: self.tools.definitions(),
                max_tokens: crate::config::defaults::MAX_OUTPUT_TOKENS,
            };
            let response = match self.model.complete(request, cancel).await {
                Ok(r) => r,
                Err(e) if e == "cancelled" || cancel.is_cancelled() => {
                    return Err(TurnError::Cancelled)
                }
                Err(e) => return Err(TurnError::Failed(e)),
            };

            // A message with an error stop reason is a failure outcome too
            if response.stop_reason.as_deref() == Some("error") {
                let error = response
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "model returned an error".to_string());
                return Err(TurnError::Failed(error));
            }

            if let Err(e) = self.store.append(session_key, &response) {
                log::warn!("[AGENT] Failed to persist assistant turn: {}", e);
            }
            log.push(response.clone());

            let tool_uses: Vec<(String, String, serde_json::Value)> = response
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse {
                        call_id,
                        name,
                        params,
                    } => Some((call_id.clone(), name.clone(), params.clone())),
                    _ => None,
                })
                .collect();

            if tool_uses.is_empty() {
                break;
            }
            if iteration + 1 == self.config.max_tool_iterations {
                log::warn!(
                    "[AGENT] Tool loop for '{}' hit the iteration cap",
                    session_key
                );
                break;
            }

            let mut result_blocks: Vec<ContentBlock> = Vec::new();
            for (call_id, name, params) in tool_uses {
                if cancel.is_cancelled() {
                    return Err(TurnError::Cancelled);
                }
                log::info!("[AGENT] '{}' -> tool {} ({})", session_key, name, call_id);
                let output = self
                    .tools
                    .execute(&name, &call_id, params, &tool_context)
                    .await;
                collect_images(&output, &mut tool_images);
                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: call_id,
                    content: tool_output_to_blocks(output),
                });
            }

            let carrier = SessionMessage::new(Role::ToolResultCarrier, result_blocks);
            if let Err(e) = self.store.append(session_key, &carrier) {
                log::warn!("[AGENT] Failed to persist tool results: {}", e);
            }
            log.push(carrier);
        }

        // Extract the response from the trailing assistant message
        let last_assistant = log.iter().rev().find(|m| m.role.is_assistant_side());
        let mut images = tool_images;
        let mut text = String::new();
        if let Some(msg) = last_assistant {
            text = msg.joined_text();
            for block in &msg.content {
                if let ContentBlock::Image { data, mime_type } = block {
                    images.push(InboundImage {
                        data: data.clone(),
                        mime_type: mime_type.clone(),
                    });
                }
            }
        }
        Ok(TurnSuccess { text, images })
    }

    /// In-place history compaction: summarize everything but the tail into a
    /// single system record.
    async fn compact(
        &self,
        session_key: &str,
        log: &mut Vec<SessionMessage>,
    ) -> Result<(), String> {
        const TAIL: usize = 4;
        if log.len() <= TAIL + 2 {
            return Err("history too short to compact".to_string());
        }

        let head = &log[..log.len() - TAIL];
        let mut transcript = String::new();
        for msg in head {
            let text = msg.joined_text();
            if !text.is_empty() {
                transcript.push_str(&format!("{:?}: {}\n", msg.role, text));
            }
        }

        let summary = self
            .model
            .generate_text(
                "You compact an assistant's conversation history. Produce a dense summary \
                 that preserves facts, decisions, open tasks, and tone. Output only the summary.",
                &transcript,
            )
            .await?;

        let mut compacted = vec![SessionMessage::system_text(format!(
            "[compacted history]\n{}",
            summary.trim()
        ))];
        compacted.extend_from_slice(&log[log.len() - TAIL..]);
        let compacted = sanitize_history(
            &compacted,
            crate::session::sanitize::DEFAULT_RETAINED_USER_TURNS,
        );

        self.store.rewrite(session_key, &compacted)?;
        log::info!(
            "[AGENT] Compacted '{}': {} -> {} messages",
            session_key,
            log.len(),
            compacted.len()
        );
        *log = compacted;
        Ok(())
    }

    fn build_user_message(&self, inbound: &InboundMessage) -> SessionMessage {
        let mut content = Vec::new();
        if !inbound.text.is_empty() {
            content.push(ContentBlock::text(inbound.text.clone()));
        }
        for image in &inbound.images {
            match normalize_inbound_image(image) {
                Some(block) => content.push(block),
                None => content.push(ContentBlock::text(
                    "[attached image omitted: could not be decoded]",
                )),
            }
        }
        if content.is_empty() {
            content.push(ContentBlock::text(String::new()));
        }
        SessionMessage::new(Role::User, content)
    }

    fn assemble_prompt(&self, inbound: &InboundMessage) -> String {
        let subagents = self.subagents.get();
        let depth = subagents
            .map(|m| m.depth_of(&inbound.session_key))
            .unwrap_or(0);
        let max_depth = subagents.map(|m| m.max_depth()).unwrap_or(0);
        let is_subagent = inbound.session_key.starts_with("subagent:");

        let long_term_memory =
            std::fs::read_to_string(self.consolidator.memory_doc_path()).ok();

        prompt::assemble_system_prompt(&prompt::PromptInputs {
            workspace: &self.workspace,
            workspace_dir: PathBuf::from(&self.config.workspace_dir).as_path(),
            long_term_memory,
            channel_id: &inbound.channel_id,
            is_group: inbound.is_group,
            sandbox_available: self.sandbox.is_some(),
            depth,
            max_subagent_depth: max_depth,
            subagent_suffix: is_subagent,
        })
    }

    fn build_tool_context(
        &self,
        session_key: &str,
        channel_id: &str,
        cancel: &CancelToken,
    ) -> ToolContext {
        let mut ctx = ToolContext::new(session_key, &self.config.workspace_dir)
            .with_channel(channel_id)
            .with_cancel(cancel.clone())
            .with_memory(Arc::clone(&self.memory));
        if let Some(ref sandbox) = self.sandbox {
            ctx = ctx.with_sandbox(Arc::clone(sandbox));
        }
        if let Some(scheduler) = self.scheduler.get() {
            ctx = ctx.with_scheduler(Arc::clone(scheduler));
        }
        if let Some(subagents) = self.subagents.get() {
            ctx = ctx.with_subagents(Arc::clone(subagents));
        }
        ctx
    }

    /// Handle one of the fixed transport commands. Unknown commands never
    /// reach this; transports fall through to `handle_message`.
    pub async fn handle_command(
        &self,
        command: TransportCommand,
        session_key: &str,
    ) -> OutboundMessage {
        match command {
            TransportCommand::Stop => {
                if self.cancels.cancel(session_key) {
                    OutboundMessage::text("Stopping the current run.")
                } else {
                    OutboundMessage::text("Nothing is running.")
                }
            }
            TransportCommand::Reset => match self.store.truncate(session_key) {
                Ok(()) => OutboundMessage::text("Conversation reset."),
                Err(e) => OutboundMessage::text(format!("Reset failed: {}", e)),
            },
            TransportCommand::Status => {
                let messages = self.store.load(session_key).map(|l| l.len()).unwrap_or(0);
                let subagents = self
                    .subagents
                    .get()
                    .map(|m| m.active_total())
                    .unwrap_or(0);
                let jobs = self
                    .scheduler
                    .get()
                    .map(|s| s.list_jobs().len())
                    .unwrap_or(0);
                OutboundMessage::text(format!(
                    "session messages: {} | runs in flight: {} | active subagents: {} | scheduled jobs: {}",
                    messages,
                    self.cancels.in_flight(),
                    subagents,
                    jobs
                ))
            }
            TransportCommand::Help => OutboundMessage::text(
                "/stop - abort the current run\n/reset - clear this conversation\n/status - runtime status\n/help - this message",
            ),
        }
    }
}

#[async_trait]
impl AgentEntry for Orchestrator {
    async fn handle(&self, inbound: InboundMessage) -> Result<Option<OutboundMessage>, String> {
        self.handle_message_safe(inbound).await
    }

    fn cancel_session(&self, session_key: &str) {
        self.cancels.cancel(session_key);
    }
}

fn finish_success(success: TurnSuccess) -> Option<OutboundMessage> {
    let TurnSuccess { text, images } = success;
    if text.is_empty() && images.is_empty() {
        return None;
    }
    let text = if text.is_empty() {
        NO_TEXT_RESPONSE.to_string()
    } else {
        text
    };
    Some(OutboundMessage { text, images })
}

fn tool_output_to_blocks(output: ToolOutput) -> Vec<ContentBlock> {
    output
        .content
        .into_iter()
        .map(|b| match b {
            ToolBlock::Text { text } => ContentBlock::Text { text },
            ToolBlock::Image { data, mime_type } => ContentBlock::Image { data, mime_type },
        })
        .collect()
}

fn collect_images(output: &ToolOutput, into: &mut Vec<InboundImage>) {
    for block in &output.content {
        if let ToolBlock::Image { data, mime_type } = block {
            into.push(InboundImage {
                data: data.clone(),
                mime_type: mime_type.clone(),
            });
        }
    }
}

/// Normalize an inbound user image through the shared media pipeline.
fn normalize_inbound_image(image: &InboundImage) -> Option<ContentBlock> {
    use base64::Engine;
    let engine = base64::engine::general_purpose::STANDARD;
    let bytes = engine.decode(image.data.as_bytes()).ok()?;
    let normalized = crate::tools::media::normalize_image(&bytes).ok()?;
    if let Some(ref warning) = normalized.warning {
        log::warn!("[AGENT] Inbound image: {}", warning);
    }
    Some(ContentBlock::Image {
        data: engine.encode(&normalized.bytes),
        mime_type: normalized.mime_type,
    })
}
