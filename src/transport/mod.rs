//! Transport seam: how chat platforms plug into the runtime.
//!
//! Concrete adapters live outside the core; the runtime only sees the
//! [`Transport`] trait and the normalized message shapes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Sentinel outbound text that suppresses delivery entirely.
pub const NO_REPLY: &str = "NO_REPLY";

/// Normalized inbound message from any transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub text: String,
    /// `<transport>:<scope>:<id>`
    pub session_key: String,
    pub channel_id: String,
    pub user_id: String,
    pub user_name: String,
    /// Carried explicitly through the pipeline rather than inferred from the
    /// session key
    #[serde(default)]
    pub is_group: bool,
    /// Base64 payloads with mime types
    #[serde(default)]
    pub images: Vec<InboundImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundImage {
    pub data: String,
    pub mime_type: String,
}

impl InboundMessage {
    pub fn text_only(
        text: impl Into<String>,
        session_key: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        InboundMessage {
            text: text.into(),
            session_key: session_key.into(),
            channel_id: channel_id.into(),
            user_id: "user".to_string(),
            user_name: "User".to_string(),
            is_group: false,
            images: Vec::new(),
        }
    }
}

/// Response returned to the transport for delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub text: String,
    #[serde(default)]
    pub images: Vec<InboundImage>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        OutboundMessage {
            text: text.into(),
            images: Vec::new(),
        }
    }

    /// Whether the transport should suppress delivery.
    pub fn is_no_reply(&self) -> bool {
        self.text.trim() == NO_REPLY || (self.text.trim().is_empty() && self.images.is_empty())
    }
}

/// The short command set recognized before the orchestrator is involved.
/// Anything else falls through as an ordinary message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    Stop,
    Reset,
    Status,
    Help,
}

impl TransportCommand {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_lowercase().as_str() {
            "/stop" => Some(TransportCommand::Stop),
            "/reset" | "/new" => Some(TransportCommand::Reset),
            "/status" => Some(TransportCommand::Status),
            "/help" => Some(TransportCommand::Help),
            _ => None,
        }
    }
}

/// A chat transport adapter.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<(), String>;

    async fn stop(&self) -> Result<(), String>;

    /// Out-of-band delivery used by the scheduler, heartbeat, and subagent
    /// announcements.
    async fn send_to_channel(
        &self,
        channel_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parsing_recognizes_the_fixed_set() {
        assert_eq!(TransportCommand::parse("/stop"), Some(TransportCommand::Stop));
        assert_eq!(TransportCommand::parse(" /Reset "), Some(TransportCommand::Reset));
        assert_eq!(TransportCommand::parse("/new"), Some(TransportCommand::Reset));
        assert_eq!(TransportCommand::parse("/status"), Some(TransportCommand::Status));
        assert_eq!(TransportCommand::parse("/help"), Some(TransportCommand::Help));
        assert_eq!(TransportCommand::parse("/unknown"), None);
        assert_eq!(TransportCommand::parse("hello"), None);
    }

    #[test]
    fn no_reply_sentinel_suppresses_delivery() {
        assert!(OutboundMessage::text(NO_REPLY).is_no_reply());
        assert!(OutboundMessage::text("  NO_REPLY  ").is_no_reply());
        assert!(OutboundMessage::default().is_no_reply());
        assert!(!OutboundMessage::text("hello").is_no_reply());
    }
}
