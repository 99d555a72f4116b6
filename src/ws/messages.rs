//! JSON envelope used by the demo chat endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sender name used for server-generated help lines.
pub const ADMIN_SENDER: &str = "admin";

/// Body substituted when a command carries no text.
pub const EMPTY_BODY: &str = "{{nothing}}";

/// One chat message as written to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Server-generated message id.
    pub id: Uuid,
    /// Message type discriminator.
    #[serde(rename = "type")]
    pub msg_type: ChatMessageType,
    /// Free-form text, used by welcome messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Sender id for chat lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Chat line body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// RFC 3339 timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Discriminator for [`ChatMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMessageType {
    /// Greeting sent once after connecting.
    Welcome,
    /// A chat line from a client or from the server.
    Message,
}

impl ChatMessage {
    /// Greeting naming the id the client is connected as.
    #[must_use]
    pub fn welcome(id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            msg_type: ChatMessageType::Welcome,
            message: Some(format!(
                "Welcome to the WebSocket server! You are connected as {id}"
            )),
            from: None,
            content: None,
            timestamp: Utc::now(),
        }
    }

    /// A chat line attributed to `from`.
    #[must_use]
    pub fn chat(from: &str, content: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            msg_type: ChatMessageType::Message,
            message: None,
            from: Some(from.to_string()),
            content: Some(content.to_string()),
            timestamp: Utc::now(),
        }
    }

    /// Renders the envelope as JSON text.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
