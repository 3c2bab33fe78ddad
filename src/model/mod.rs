pub mod http;
pub mod mock;

pub use http::HttpModelClient;
pub use mock::{MockModelClient, ScriptedResponse};

use crate::agent::cancel::CancelToken;
use crate::session::SessionMessage;
use crate::tools::ToolDefinition;

/// One request to the model endpoint: system prompt, conversation, tools.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system: String,
    pub messages: Vec<SessionMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
}

/// Unified model client over the configured provider.
#[derive(Clone)]
pub enum ModelClient {
    Http(HttpModelClient),
    Mock(MockModelClient),
}

impl ModelClient {
    /// Run one completion. Returns the assistant message (text blocks,
    /// tool_use blocks, stop reason) or an error string suitable for
    /// overflow classification.
    pub async fn complete(
        &self,
        request: ModelRequest,
        cancel: &CancelToken,
    ) -> Result<SessionMessage, String> {
        match self {
            ModelClient::Http(client) => client.complete(request, cancel).await,
            ModelClient::Mock(client) => client.complete(request, cancel).await,
        }
    }

    /// Single-shot text generation for secondary calls (consolidation,
    /// compaction summaries). No tools, no session history.
    pub async fn generate_text(&self, system: &str, prompt: &str) -> Result<String, String> {
        let request = ModelRequest {
            system: system.to_string(),
            messages: vec![SessionMessage::user_text(prompt)],
            tools: Vec::new(),
            max_tokens: 4096,
        };
        let response = self
            .complete(request, &CancelToken::unstoppable())
            .await?;
        Ok(response.joined_text())
    }
}
