//! Envelopes exchanged over the realtime channel and with the presentation layer.

use serde::{Deserialize, Serialize};

/// Event name for user input sent to the agent.
pub const USER_ACTION_EVENT: &str = "oh_user_action";

/// Event name for agent events received from the service.
pub const AGENT_EVENT: &str = "oh_event";

/// Wire request: `{ "action": "message", "args": { "content", "image_urls" } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub action: String,
    pub args: MessageArgs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageArgs {
    pub content: String,
    /// Attachment placeholder; always serialized, empty when there are none.
    #[serde(default)]
    pub image_urls: Vec<String>,
}

impl OutboundEnvelope {
    pub fn message(content: impl Into<String>, image_urls: Vec<String>) -> Self {
        Self {
            action: "message".to_string(),
            args: MessageArgs {
                content: content.into(),
                image_urls,
            },
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "action": self.action,
            "args": {
                "content": self.args.content,
                "image_urls": self.args.image_urls,
            }
        })
    }
}

/// Controller → presentation message. Serializes to one of
/// `{ "type": "status", "message" }`, `{ "error": true, "message" }` or `{ "data": ... }`.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Status(String),
    Error(String),
    Data(serde_json::Value),
}

impl Notification {
    pub fn status(message: impl Into<String>) -> Self {
        Notification::Status(message.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Notification::Error(message.into())
    }

    /// Wire form for a message-passing bridge (e.g. a webview).
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Notification::Status(message) => {
                serde_json::json!({ "type": "status", "message": message })
            }
            Notification::Error(message) => serde_json::json!({ "error": true, "message": message }),
            Notification::Data(data) => serde_json::json!({ "data": data }),
        }
    }

    /// Single display line: the status/error prefix scheme shared with inbound translation.
    pub fn display_line(&self) -> String {
        match self {
            Notification::Status(message) => format!("STATUS: {}", message),
            Notification::Error(message) => format!("ERROR: {}", message),
            Notification::Data(data) => crate::translate::translate_inbound_envelope(data),
        }
    }
}

impl Serialize for Notification {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// Presentation → controller message: `{ "type": "userPrompt", "text" }` or `{ "type": "resetConversation" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PresentationMessage {
    UserPrompt {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<String>,
    },
    ResetConversation,
}
