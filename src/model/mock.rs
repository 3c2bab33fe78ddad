//! Scripted model client for integration tests.
//!
//! Responses are served from a queue; when the queue runs dry the client
//! echoes the last user text. An optional per-call delay simulates model
//! latency for serialization tests.

use crate::agent::cancel::CancelToken;
use crate::model::ModelRequest;
use crate::session::{ContentBlock, Role, SessionMessage};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// Plain assistant text.
    Text(String),
    /// Assistant message with tool_use blocks: (call_id, tool_name, params).
    ToolUse(Vec<(String, String, serde_json::Value)>),
    /// The call fails with this error string.
    Error(String),
    /// Assistant message carrying an error stop reason.
    ErrorStop(String),
    /// A fully custom assistant message.
    Message(SessionMessage),
}

/// Trace of one mock call: the request that came in.
#[derive(Clone)]
pub struct MockCall {
    pub system: String,
    pub message_count: usize,
    pub tool_names: Vec<String>,
}

#[derive(Clone)]
pub struct MockModelClient {
    responses: Arc<Mutex<VecDeque<ScriptedResponse>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    delay_ms: u64,
}

impl MockModelClient {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        MockModelClient {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            calls: Arc::new(Mutex::new(Vec::new())),
            delay_ms: 0,
        }
    }

    /// Echo-only client: every call replies with the last user text.
    pub fn echo() -> Self {
        Self::new(Vec::new())
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Append more scripted responses after construction.
    pub fn push(&self, response: ScriptedResponse) {
        self.responses
            .lock()
            .expect("mock queue poisoned")
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().expect("mock trace poisoned").clone()
    }

    pub async fn complete(
        &self,
        request: ModelRequest,
        cancel: &CancelToken,
    ) -> Result<SessionMessage, String> {
        self.calls.lock().expect("mock trace poisoned").push(MockCall {
            system: request.system.clone(),
            message_count: request.messages.len(),
            tool_names: request.tools.iter().map(|t| t.name.clone()).collect(),
        });

        if self.delay_ms > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.delay_ms)) => {}
                _ = cancel.cancelled() => return Err("cancelled".to_string()),
            }
        }
        if cancel.is_cancelled() {
            return Err("cancelled".to_string());
        }

        let scripted = self.responses.lock().expect("mock queue poisoned").pop_front();
        match scripted {
            Some(ScriptedResponse::Text(text)) => Ok(SessionMessage::assistant_text(text)),
            Some(ScriptedResponse::ToolUse(calls)) => {
                let content = calls
                    .into_iter()
                    .map(|(call_id, name, params)| ContentBlock::ToolUse {
                        call_id,
                        name,
                        params,
                    })
                    .collect();
                let mut msg = SessionMessage::new(Role::Assistant, content);
                msg.stop_reason = Some("tool_use".to_string());
                Ok(msg)
            }
            Some(ScriptedResponse::Error(e)) => Err(e),
            Some(ScriptedResponse::Message(msg)) => Ok(msg),
            Some(ScriptedResponse::ErrorStop(e)) => {
                let mut msg = SessionMessage::new(Role::Assistant, vec![]);
                msg.stop_reason = Some("error".to_string());
                msg.error_message = Some(e);
                Ok(msg)
            }
            None => {
                let echo = request
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.joined_text())
                    .unwrap_or_else(|| "(no input)".to_string());
                Ok(SessionMessage::assistant_text(format!("echo: {}", echo)))
            }
        }
    }
}
