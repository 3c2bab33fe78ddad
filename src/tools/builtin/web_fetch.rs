//! HTTP fetch tool.

use crate::tools::registry::Tool;
use crate::tools::types::{
    PropertySchema, ToolContext, ToolDefinition, ToolInputSchema, ToolOutput,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

const FETCH_TIMEOUT_SECS: u64 = 20;
const DEFAULT_MAX_CHARS: usize = 50_000;

pub struct WebFetchTool {
    client: reqwest::Client,
}

impl WebFetchTool {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        WebFetchTool { client }
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn definition(&self) -> ToolDefinition {
        let mut props = HashMap::new();
        props.insert(
            "url".to_string(),
            PropertySchema::string("The URL to fetch (HTTP/HTTPS only)"),
        );
        props.insert(
            "max_chars".to_string(),
            PropertySchema::integer("Maximum characters of body to return")
                .with_default(json!(DEFAULT_MAX_CHARS)),
        );
        ToolDefinition {
            name: "web_fetch".to_string(),
            label: "Web Fetch".to_string(),
            description: "Fetch a URL and return the response body as text".to_string(),
            input_schema: ToolInputSchema::new(props, &["url"]),
        }
    }

    async fn execute(&self, _call_id: &str, params: Value, ctx: &ToolContext) -> ToolOutput {
        let url = params["url"].as_str().unwrap_or_default();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return ToolOutput::error("only http:// and https:// URLs are supported");
        }
        let max_chars = params["max_chars"]
            .as_u64()
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_CHARS);

        let request = self.client.get(url).send();
        let response = tokio::select! {
            result = request => result,
            _ = ctx.cancel.cancelled() => return ToolOutput::error("fetch aborted"),
        };

        match response {
            Ok(response) => {
                let status = response.status();
                match response.text().await {
                    Ok(body) => {
                        let body: String = body.chars().take(max_chars).collect();
                        ToolOutput::text(format!("HTTP {}\n\n{}", status.as_u16(), body))
                    }
                    Err(e) => ToolOutput::error(format!("failed to read body: {}", e)),
                }
            }
            Err(e) => ToolOutput::error(format!("fetch failed: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new("t:dm:1", dir.path());
        let out = WebFetchTool::new()
            .execute("c1", json!({"url": "file:///etc/passwd"}), &ctx)
            .await;
        assert!(out.joined_text().starts_with("Error:"));
    }
}
