//! HTTP client for the model endpoint (messages-array protocol).

use crate::agent::cancel::CancelToken;
use crate::model::ModelRequest;
use crate::session::{ContentBlock, Role, SessionMessage};
use serde_json::{json, Value};
use std::time::Duration;

/// Hard ceiling on one HTTP completion; the orchestrator's turn timeout is
/// the real bound, this only protects against wedged connections.
const REQUEST_TIMEOUT_SECS: u64 = 10 * 60;

#[derive(Clone)]
pub struct HttpModelClient {
    endpoint: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl HttpModelClient {
    pub fn new(endpoint: &str, api_key: &str, model: &str) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;
        Ok(HttpModelClient {
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            client,
        })
    }

    pub async fn complete(
        &self,
        request: ModelRequest,
        cancel: &CancelToken,
    ) -> Result<SessionMessage, String> {
        let body = self.build_body(&request);

        let send = async {
            let response = self
                .client
                .post(&self.endpoint)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| format!("Model request failed: {}", e))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| format!("Failed to read model response: {}", e))?;

            if !status.is_success() {
                return Err(format!("Model endpoint returned {}: {}", status, text));
            }

            let parsed: Value = serde_json::from_str(&text)
                .map_err(|e| format!("Model response was not JSON: {}", e))?;
            parse_assistant_message(&parsed)
        };

        tokio::select! {
            result = send => result,
            _ = cancel.cancelled() => Err("cancelled".to_string()),
        }
    }

    fn build_body(&self, request: &ModelRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .filter_map(wire_message)
            .collect();

        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "system": request.system,
            "messages": messages,
        });

        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        body
    }
}

/// Convert a session record to the wire shape. System records ride along as
/// framed user turns; empty messages are dropped (some endpoints reject them).
fn wire_message(msg: &SessionMessage) -> Option<Value> {
    let role = match msg.role {
        Role::Assistant | Role::ToolUseOwner => "assistant",
        Role::User | Role::ToolResultCarrier | Role::System => "user",
    };

    let mut blocks: Vec<Value> = Vec::new();
    for block in &msg.content {
        match block {
            ContentBlock::Text { text } => {
                let text = if msg.role == Role::System {
                    format!("[system] {}", text)
                } else {
                    text.clone()
                };
                blocks.push(json!({"type": "text", "text": text}));
            }
            ContentBlock::Image { data, mime_type } => {
                blocks.push(json!({
                    "type": "image",
                    "source": {"type": "base64", "media_type": mime_type, "data": data},
                }));
            }
            ContentBlock::ToolUse {
                call_id,
                name,
                params,
            } => {
                blocks.push(json!({
                    "type": "tool_use",
                    "id": call_id,
                    "name": name,
                    "input": params,
                }));
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
            } => {
                let inner: Vec<Value> = content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => {
                            Some(json!({"type": "text", "text": text}))
                        }
                        ContentBlock::Image { data, mime_type } => Some(json!({
                            "type": "image",
                            "source": {"type": "base64", "media_type": mime_type, "data": data},
                        })),
                        _ => None,
                    })
                    .collect();
                blocks.push(json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": inner,
                }));
            }
        }
    }

    if blocks.is_empty() {
        return None;
    }
    Some(json!({"role": role, "content": blocks}))
}

fn parse_assistant_message(value: &Value) -> Result<SessionMessage, String> {
    let mut content = Vec::new();
    for block in value["content"].as_array().unwrap_or(&Vec::new()) {
        match block["type"].as_str() {
            Some("text") => {
                if let Some(text) = block["text"].as_str() {
                    content.push(ContentBlock::text(text));
                }
            }
            Some("tool_use") => {
                content.push(ContentBlock::ToolUse {
                    call_id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    params: block["input"].clone(),
                });
            }
            _ => {}
        }
    }

    let mut msg = SessionMessage::new(Role::Assistant, content);
    msg.stop_reason = value["stop_reason"].as_str().map(|s| s.to_string());
    Ok(msg)
}
