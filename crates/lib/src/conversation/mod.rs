//! Conversation lifecycle: remote creation, pending prompts, and the session controller.
//!
//! The controller creates a conversation on the first prompt, binds one realtime
//! channel to it, and relays agent events back to the presentation layer.

mod client;
mod pending;
mod service;

pub use client::{
    ClientInput, ConversationClient, Phase, ERROR_NO_CONVERSATION, STATUS_CONNECTED,
    STATUS_CONNECTING, STATUS_INITIALIZING, STATUS_RESET, STATUS_RESET_WHILE_CREATING,
};
pub use pending::{PendingPrompt, PendingQueue};
pub use service::{
    parse_created_conversation, ConversationError, ConversationService, CreateConversationRequest,
    CreatedConversation, HttpConversationService,
};

use crate::channel::SocketIoTransport;
use crate::config::Config;
use crate::envelope::Notification;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Build a client wired to the HTTP conversation API and the Socket.IO channel at `base_url`,
/// with channel and queue settings from `config`.
pub fn client_from_config(
    config: &Config,
    base_url: impl Into<String>,
    notify: mpsc::UnboundedSender<Notification>,
) -> ConversationClient {
    let base_url = base_url.into();
    let service = Arc::new(HttpConversationService::new(base_url.clone()));
    let transport = Arc::new(SocketIoTransport::new(base_url, config.channel.clone()));
    ConversationClient::new(service, transport, notify, config.client.pending_capacity())
        .with_repository(config.server.repository.clone())
}
