//! Conversation client: owns at most one conversation and one realtime channel.
//!
//! All state changes happen in [`ConversationClient::dispatch`], one input at a
//! time: user prompts, creation results, and channel events all arrive through
//! the same inbox, so their order is the order they were delivered in.

use super::pending::{PendingPrompt, PendingQueue};
use super::service::{ConversationError, ConversationService, CreateConversationRequest, CreatedConversation};
use crate::channel::{
    ChannelEvent, ChannelEventSink, ChannelHandle, ChannelParams, RealtimeTransport, Subscription,
    TaggedChannelEvent,
};
use crate::envelope::{Notification, OutboundEnvelope, PresentationMessage, AGENT_EVENT, USER_ACTION_EVENT};
use serde_json::Value;
use crate::translate::translate_inbound_envelope;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const STATUS_INITIALIZING: &str = "Initializing conversation...";
pub const STATUS_CONNECTING: &str = "Connecting to agent...";
pub const STATUS_CONNECTED: &str = "Connected to agent.";
pub const STATUS_RESET: &str = "Conversation reset.";
pub const STATUS_RESET_WHILE_CREATING: &str =
    "Conversation is still being created; reset ignored.";
pub const ERROR_NO_CONVERSATION: &str = "Cannot open a channel without a conversation.";

/// Everything the client reacts to.
#[derive(Debug)]
pub enum ClientInput {
    Presentation(PresentationMessage),
    CreationCompleted {
        request_id: u64,
        result: Result<CreatedConversation, ConversationError>,
    },
    Channel(TaggedChannelEvent),
}

/// Observable lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    CreatingConversation,
    /// Conversation known, no channel opened yet.
    ConversationReady,
    Connecting,
    Connected,
    /// Channel dropped; the conversation is kept.
    Disconnected,
    /// Channel gave up connecting; the conversation is kept.
    ConnectFailed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::CreatingConversation => "creating-conversation",
            Phase::ConversationReady => "conversation-ready",
            Phase::Connecting => "connecting",
            Phase::Connected => "connected",
            Phase::Disconnected => "disconnected",
            Phase::ConnectFailed => "connect-failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkStatus {
    Connecting,
    Connected,
    /// Dropped; the transport is retrying on its own.
    Reconnecting,
    /// Dropped for good; a new channel is needed.
    Disconnected,
    Failed,
}

struct ActiveChannel {
    generation: u64,
    conversation_id: String,
    handle: Box<dyn ChannelHandle>,
    subscription: Subscription,
    status: LinkStatus,
}

struct Conversation {
    id: String,
    channel: Option<ActiveChannel>,
}

enum SessionState {
    Idle,
    Creating { request_id: u64 },
    Ready(Conversation),
}

/// The session controller. Construct with [`ConversationClient::new`], then either
/// call [`ConversationClient::run`] or drive it by hand with `dispatch`/`process_next`.
pub struct ConversationClient {
    service: Arc<dyn ConversationService>,
    transport: Arc<dyn RealtimeTransport>,
    notify: mpsc::UnboundedSender<Notification>,
    inbox_tx: mpsc::UnboundedSender<ClientInput>,
    inbox_rx: mpsc::UnboundedReceiver<ClientInput>,
    state: SessionState,
    pending: PendingQueue,
    repository: Option<String>,
    next_generation: u64,
    next_request_id: u64,
}

impl ActiveChannel {
    fn dispose(self) {
        self.subscription.cancel();
        let mut handle = self.handle;
        handle.close();
        log::debug!(
            "channel {}: disposed (conversation {})",
            self.generation,
            self.conversation_id
        );
    }
}

impl ConversationClient {
    pub fn new(
        service: Arc<dyn ConversationService>,
        transport: Arc<dyn RealtimeTransport>,
        notify: mpsc::UnboundedSender<Notification>,
        pending_capacity: usize,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            service,
            transport,
            notify,
            inbox_tx,
            inbox_rx,
            state: SessionState::Idle,
            pending: PendingQueue::new(pending_capacity),
            repository: None,
            next_generation: 0,
            next_request_id: 0,
        }
    }

    /// Repository sent with every creation request.
    pub fn with_repository(mut self, repository: Option<String>) -> Self {
        self.repository = repository;
        self
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match &self.state {
            SessionState::Ready(conv) => Some(&conv.id),
            _ => None,
        }
    }

    pub fn phase(&self) -> Phase {
        match &self.state {
            SessionState::Idle => Phase::Idle,
            SessionState::Creating { .. } => Phase::CreatingConversation,
            SessionState::Ready(conv) => match conv.channel.as_ref().map(|c| c.status) {
                None => Phase::ConversationReady,
                Some(LinkStatus::Connecting) => Phase::Connecting,
                Some(LinkStatus::Connected) => Phase::Connected,
                Some(LinkStatus::Reconnecting | LinkStatus::Disconnected) => Phase::Disconnected,
                Some(LinkStatus::Failed) => Phase::ConnectFailed,
            },
        }
    }

    /// Number of prompts waiting for a connection.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Process presentation messages and internal events until the presentation side hangs up.
    pub async fn run(mut self, mut messages: mpsc::UnboundedReceiver<PresentationMessage>) {
        log::debug!("client: running");
        loop {
            tokio::select! {
                msg = messages.recv() => match msg {
                    Some(msg) => self.dispatch(ClientInput::Presentation(msg)),
                    None => break,
                },
                Some(input) = self.inbox_rx.recv() => self.dispatch(input),
            }
        }
        self.shutdown();
    }

    /// Wait for the next internal input (creation result or channel event) and handle it.
    pub async fn process_next(&mut self) {
        if let Some(input) = self.inbox_rx.recv().await {
            self.dispatch(input);
        }
    }

    /// Handle every internal input already delivered; returns how many were handled.
    pub fn process_ready(&mut self) -> usize {
        let mut n = 0;
        while let Ok(input) = self.inbox_rx.try_recv() {
            self.dispatch(input);
            n += 1;
        }
        n
    }

    pub fn dispatch(&mut self, input: ClientInput) {
        let before = self.phase();
        match input {
            ClientInput::Presentation(PresentationMessage::UserPrompt { text, attachments }) => {
                self.submit_prompt(text, attachments)
            }
            ClientInput::Presentation(PresentationMessage::ResetConversation) => self.reset(),
            ClientInput::CreationCompleted { request_id, result } => {
                self.on_creation_completed(request_id, result)
            }
            ClientInput::Channel(tagged) => self.on_channel_event(tagged),
        }
        let after = self.phase();
        if before != after {
            log::debug!("client: {} -> {}", before, after);
        }
    }

    /// Send a prompt, creating the conversation and (re)connecting the channel as needed.
    pub fn submit_prompt(&mut self, text: String, attachments: Vec<String>) {
        let prompt = PendingPrompt { text, attachments };
        match self.phase() {
            Phase::Idle => self.start_creation(prompt),
            Phase::CreatingConversation => {
                log::debug!("client: conversation creation in flight, queueing prompt");
                self.enqueue(prompt);
            }
            Phase::Connected => {
                if let Err(prompt) = self.send_now(prompt) {
                    self.enqueue(prompt);
                    self.connect_channel();
                }
            }
            Phase::Connecting => self.enqueue(prompt),
            Phase::ConversationReady | Phase::Disconnected | Phase::ConnectFailed => {
                self.enqueue(prompt);
                self.connect_channel();
            }
        }
    }

    /// Drop the conversation and its channel. Ignored while a creation call is in flight.
    pub fn reset(&mut self) {
        match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Creating { request_id } => {
                self.state = SessionState::Creating { request_id };
                log::info!("client: reset ignored, creation {} in flight", request_id);
                self.emit(Notification::status(STATUS_RESET_WHILE_CREATING));
            }
            SessionState::Ready(conv) => {
                log::info!("client: resetting conversation {}", conv.id);
                if let Some(channel) = conv.channel {
                    channel.dispose();
                }
                self.abandon_pending("conversation reset");
                self.emit(Notification::status(STATUS_RESET));
            }
            SessionState::Idle => {
                self.abandon_pending("conversation reset");
                self.emit(Notification::status(STATUS_RESET));
            }
        }
    }

    /// Open the channel for the current conversation unless a usable one exists.
    ///
    /// No-op when the channel is connected, connecting, or being retried by the
    /// transport for the current conversation. A channel that dropped for good,
    /// failed, or is bound elsewhere is disposed before its replacement is opened.
    pub fn connect_channel(&mut self) {
        let SessionState::Ready(conv) = &mut self.state else {
            log::warn!("client: connect_channel called without a conversation");
            self.emit(Notification::error(ERROR_NO_CONVERSATION));
            return;
        };

        if let Some(channel) = &conv.channel {
            let bound = channel.conversation_id == conv.id;
            match channel.status {
                LinkStatus::Connected if bound => {
                    log::debug!("channel {}: already connected", channel.generation);
                    return;
                }
                LinkStatus::Connecting | LinkStatus::Reconnecting if bound => {
                    log::debug!("channel {}: connection in progress", channel.generation);
                    return;
                }
                _ => {}
            }
        }
        if let Some(old) = conv.channel.take() {
            old.dispose();
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let inbox = self.inbox_tx.clone();
        let (sink, subscription) = ChannelEventSink::new(generation, move |ev| {
            let _ = inbox.send(ClientInput::Channel(ev));
        });
        log::info!("channel {}: opening for conversation {}", generation, conv.id);
        let handle = self.transport.open(ChannelParams::live(conv.id.clone()), sink);
        conv.channel = Some(ActiveChannel {
            generation,
            conversation_id: conv.id.clone(),
            handle,
            subscription,
            status: LinkStatus::Connecting,
        });
    }

    fn start_creation(&mut self, prompt: PendingPrompt) {
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let request = CreateConversationRequest {
            initial_user_msg: prompt.text.clone(),
            repository: self.repository.clone(),
        };
        self.state = SessionState::Creating { request_id };
        self.enqueue(prompt);
        self.emit(Notification::status(STATUS_INITIALIZING));

        let service = self.service.clone();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let result = service.create_conversation(&request).await;
            let _ = inbox.send(ClientInput::CreationCompleted { request_id, result });
        });
    }

    fn on_creation_completed(
        &mut self,
        request_id: u64,
        result: Result<CreatedConversation, ConversationError>,
    ) {
        match self.state {
            SessionState::Creating { request_id: current } if current == request_id => {}
            _ => {
                log::debug!("client: ignoring stale creation result {}", request_id);
                return;
            }
        }
        match result {
            Ok(created) => {
                log::info!(
                    "client: conversation {} created (status {})",
                    created.conversation_id,
                    created.status.as_deref().unwrap_or("unknown")
                );
                self.state = SessionState::Ready(Conversation {
                    id: created.conversation_id,
                    channel: None,
                });
                self.emit(Notification::status(STATUS_CONNECTING));
                self.connect_channel();
            }
            Err(e) => {
                log::warn!("client: conversation creation failed: {}", e);
                self.state = SessionState::Idle;
                let dropped = self.pending.drain().len();
                let message = if dropped > 1 {
                    format!(
                        "Failed to create conversation: {} ({} prompts not sent)",
                        e, dropped
                    )
                } else {
                    format!("Failed to create conversation: {}", e)
                };
                self.emit(Notification::error(message));
            }
        }
    }

    fn on_channel_event(&mut self, tagged: TaggedChannelEvent) {
        let SessionState::Ready(conv) = &mut self.state else {
            log::debug!("channel {}: event without conversation dropped", tagged.generation);
            return;
        };
        let Some(channel) = conv.channel.as_mut().filter(|c| c.generation == tagged.generation)
        else {
            log::debug!("channel {}: stale event dropped: {:?}", tagged.generation, tagged.event);
            return;
        };

        match tagged.event {
            ChannelEvent::Connected => {
                if channel.status == LinkStatus::Connected {
                    log::debug!("channel {}: duplicate connected ignored", channel.generation);
                    return;
                }
                channel.status = LinkStatus::Connected;
                self.emit(Notification::status(STATUS_CONNECTED));
                self.flush_pending();
            }
            ChannelEvent::Disconnected {
                reason,
                reconnecting,
            } => {
                channel.status = if reconnecting {
                    LinkStatus::Reconnecting
                } else {
                    LinkStatus::Disconnected
                };
                self.emit(Notification::status(format!("Agent disconnected: {}.", reason)));
                if !reconnecting && !self.pending.is_empty() {
                    log::info!(
                        "client: reopening channel for {} unsent prompt(s)",
                        self.pending.len()
                    );
                    self.connect_channel();
                }
            }
            ChannelEvent::Undelivered { events } => {
                let prompts: Vec<PendingPrompt> = events
                    .into_iter()
                    .filter_map(|(name, payload)| prompt_from_user_action(&name, payload))
                    .collect();
                log::info!(
                    "channel {}: {} prompt(s) came back unsent",
                    channel.generation,
                    prompts.len()
                );
                self.pending.requeue_front(prompts);
            }
            ChannelEvent::ConnectFailed { message } => {
                channel.status = LinkStatus::Failed;
                self.emit(Notification::error(format!("Connection error: {}", message)));
                self.abandon_pending("the agent connection could not be established");
            }
            ChannelEvent::Error { message } => {
                self.emit(Notification::error(format!("Channel error: {}", message)));
            }
            ChannelEvent::Event { name, payload } => {
                if name != AGENT_EVENT {
                    log::debug!("channel {}: ignoring event {:?}", channel.generation, name);
                    return;
                }
                log::debug!("agent event: {}", translate_inbound_envelope(&payload));
                self.emit(Notification::Data(payload));
            }
        }
    }

    /// Emit on the connected channel. Hands the prompt back when the channel is unusable.
    fn send_now(&mut self, prompt: PendingPrompt) -> Result<(), PendingPrompt> {
        let SessionState::Ready(Conversation {
            channel: Some(channel),
            ..
        }) = &mut self.state
        else {
            return Err(prompt);
        };
        let envelope = OutboundEnvelope::message(prompt.text.clone(), prompt.attachments.clone());
        match channel.handle.emit(USER_ACTION_EVENT, envelope.to_value()) {
            Ok(()) => {
                log::debug!("channel {}: sent user message", channel.generation);
                Ok(())
            }
            Err(e) => {
                log::warn!("channel {}: send failed: {}", channel.generation, e);
                channel.status = LinkStatus::Failed;
                Err(prompt)
            }
        }
    }

    fn flush_pending(&mut self) {
        let mut queued = self.pending.drain().into_iter();
        while let Some(prompt) = queued.next() {
            if let Err(prompt) = self.send_now(prompt) {
                let mut rest = vec![prompt];
                rest.extend(queued);
                log::warn!("client: flush interrupted, {} prompt(s) requeued", rest.len());
                self.pending.requeue_front(rest);
                self.emit(Notification::error(
                    "Channel error: could not send to the agent; resubmit to reconnect",
                ));
                return;
            }
        }
    }

    fn enqueue(&mut self, prompt: PendingPrompt) {
        if self.pending.push(prompt).is_err() {
            let message = format!(
                "Prompt not sent: {} prompts already waiting for the agent connection.",
                self.pending.capacity()
            );
            log::warn!("client: {}", message);
            self.emit(Notification::error(message));
        }
    }

    fn abandon_pending(&mut self, reason: &str) {
        let dropped = self.pending.drain().len();
        if dropped > 0 {
            log::info!("client: {} pending prompt(s) abandoned: {}", dropped, reason);
            self.emit(Notification::error(format!(
                "{} prompt(s) not sent: {}.",
                dropped, reason
            )));
        }
    }

    fn emit(&self, notification: Notification) {
        if self.notify.send(notification).is_err() {
            log::debug!("client: presentation receiver dropped");
        }
    }

    fn shutdown(&mut self) {
        if let SessionState::Ready(conv) = &mut self.state {
            if let Some(channel) = conv.channel.take() {
                channel.dispose();
            }
        }
        log::debug!("client: stopped");
    }
}

/// Recover the prompt behind an outbound user action.
fn prompt_from_user_action(name: &str, payload: Value) -> Option<PendingPrompt> {
    if name != USER_ACTION_EVENT {
        return None;
    }
    match serde_json::from_value::<OutboundEnvelope>(payload) {
        Ok(envelope) => Some(PendingPrompt {
            text: envelope.args.content,
            attachments: envelope.args.image_urls,
        }),
        Err(e) => {
            log::warn!("client: unreadable unsent user action: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct MockService {
        requests: Mutex<Vec<CreateConversationRequest>>,
        responses: Mutex<VecDeque<Result<CreatedConversation, ConversationError>>>,
        gate: Option<Arc<Notify>>,
    }

    impl MockService {
        fn with(responses: Vec<Result<CreatedConversation, ConversationError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            })
        }

        fn gated(
            responses: Vec<Result<CreatedConversation, ConversationError>>,
            gate: Arc<Notify>,
        ) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                gate: Some(gate),
                ..Default::default()
            })
        }

        fn requests(&self) -> Vec<CreateConversationRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ConversationService for MockService {
        async fn create_conversation(
            &self,
            request: &CreateConversationRequest,
        ) -> Result<CreatedConversation, ConversationError> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ConversationError::MissingConversationId))
        }
    }

    fn created(id: &str) -> Result<CreatedConversation, ConversationError> {
        Ok(CreatedConversation {
            conversation_id: id.to_string(),
            status: Some("ok".to_string()),
        })
    }

    fn server_error() -> Result<CreatedConversation, ConversationError> {
        Err(ConversationError::Status {
            status: 500,
            body: "internal error".to_string(),
        })
    }

    struct OpenedChannel {
        params: ChannelParams,
        sink: ChannelEventSink,
        emitted: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
        closed: Arc<AtomicBool>,
    }

    #[derive(Default)]
    struct MockTransport {
        opened: Mutex<Vec<OpenedChannel>>,
    }

    struct MockHandle {
        emitted: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
        closed: Arc<AtomicBool>,
    }

    impl ChannelHandle for MockHandle {
        fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), ChannelError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ChannelError::Closed);
            }
            self.emitted.lock().unwrap().push((event.to_string(), payload));
            Ok(())
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    impl RealtimeTransport for MockTransport {
        fn open(&self, params: ChannelParams, sink: ChannelEventSink) -> Box<dyn ChannelHandle> {
            let emitted = Arc::new(Mutex::new(Vec::new()));
            let closed = Arc::new(AtomicBool::new(false));
            self.opened.lock().unwrap().push(OpenedChannel {
                params,
                sink,
                emitted: emitted.clone(),
                closed: closed.clone(),
            });
            Box::new(MockHandle { emitted, closed })
        }
    }

    impl MockTransport {
        fn count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }

        fn params(&self, i: usize) -> ChannelParams {
            self.opened.lock().unwrap()[i].params.clone()
        }

        fn fire(&self, i: usize, event: ChannelEvent) -> bool {
            let sink = self.opened.lock().unwrap()[i].sink.clone();
            sink.send(event)
        }

        fn emitted(&self, i: usize) -> Vec<(String, serde_json::Value)> {
            self.opened.lock().unwrap()[i].emitted.lock().unwrap().clone()
        }

        fn is_closed(&self, i: usize) -> bool {
            self.opened.lock().unwrap()[i].closed.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        client: ConversationClient,
        service: Arc<MockService>,
        transport: Arc<MockTransport>,
        notes: mpsc::UnboundedReceiver<Notification>,
    }

    impl Harness {
        fn new(service: Arc<MockService>) -> Self {
            Self::with_capacity(service, 8)
        }

        fn with_capacity(service: Arc<MockService>, capacity: usize) -> Self {
            let transport = Arc::new(MockTransport::default());
            let (tx, notes) = mpsc::unbounded_channel();
            let client = ConversationClient::new(service.clone(), transport.clone(), tx, capacity);
            Self {
                client,
                service,
                transport,
                notes,
            }
        }

        fn prompt(&mut self, text: &str) {
            self.client
                .dispatch(ClientInput::Presentation(PresentationMessage::UserPrompt {
                    text: text.to_string(),
                    attachments: vec![],
                }));
        }

        fn fire(&mut self, i: usize, event: ChannelEvent) {
            self.transport.fire(i, event);
            self.client.process_ready();
        }

        fn drain_notes(&mut self) -> Vec<Notification> {
            let mut out = Vec::new();
            while let Ok(n) = self.notes.try_recv() {
                out.push(n);
            }
            out
        }

        /// Submit the first prompt and complete creation + connection.
        async fn connected(service: Arc<MockService>, text: &str) -> Self {
            let mut h = Self::new(service);
            h.prompt(text);
            h.client.process_next().await;
            h.fire(0, ChannelEvent::Connected);
            assert_eq!(h.client.phase(), Phase::Connected);
            h.drain_notes();
            h
        }
    }

    fn user_action(text: &str) -> (String, serde_json::Value) {
        (
            "oh_user_action".to_string(),
            json!({ "action": "message", "args": { "content": text, "image_urls": [] } }),
        )
    }

    #[tokio::test]
    async fn first_prompt_creates_connects_and_sends_once() {
        let mut h = Harness::new(MockService::with(vec![created("c1")]));
        h.prompt("hello");
        assert_eq!(h.client.phase(), Phase::CreatingConversation);
        assert_eq!(
            h.drain_notes(),
            vec![Notification::status(STATUS_INITIALIZING)]
        );

        h.client.process_next().await;
        assert_eq!(
            h.service.requests(),
            vec![CreateConversationRequest {
                initial_user_msg: "hello".into(),
                repository: None
            }]
        );
        assert_eq!(h.client.conversation_id(), Some("c1"));
        assert_eq!(h.client.phase(), Phase::Connecting);
        assert_eq!(h.transport.count(), 1);
        assert_eq!(
            h.transport.params(0),
            ChannelParams {
                conversation_id: "c1".into(),
                latest_event_id: -1
            }
        );
        assert!(h.transport.emitted(0).is_empty());

        h.fire(0, ChannelEvent::Connected);
        assert_eq!(h.transport.emitted(0), vec![user_action("hello")]);
        assert_eq!(
            h.drain_notes(),
            vec![
                Notification::status(STATUS_CONNECTING),
                Notification::status(STATUS_CONNECTED)
            ]
        );

        h.fire(0, ChannelEvent::Connected);
        assert_eq!(h.transport.emitted(0).len(), 1);
        assert!(h.drain_notes().is_empty());
    }

    #[tokio::test]
    async fn creation_failure_reports_and_next_prompt_retries() {
        let mut h = Harness::new(MockService::with(vec![server_error(), created("c2")]));
        h.prompt("hello");
        h.client.process_next().await;
        assert_eq!(h.client.phase(), Phase::Idle);
        assert_eq!(h.client.conversation_id(), None);
        assert_eq!(h.client.pending_len(), 0);
        let notes = h.drain_notes();
        assert!(matches!(
            notes.last(),
            Some(Notification::Error(m)) if m.starts_with("Failed to create conversation")
        ));
        assert_eq!(h.transport.count(), 0);

        h.prompt("retry");
        h.client.process_next().await;
        let requests = h.service.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].initial_user_msg, "retry");
        assert_eq!(h.client.conversation_id(), Some("c2"));
    }

    #[tokio::test]
    async fn prompts_during_creation_do_not_create_twice() {
        let gate = Arc::new(Notify::new());
        let mut h = Harness::new(MockService::gated(vec![created("c1")], gate.clone()));
        h.prompt("one");
        h.prompt("two");
        h.prompt("three");
        tokio::task::yield_now().await;
        assert_eq!(h.client.phase(), Phase::CreatingConversation);
        assert_eq!(h.client.pending_len(), 3);

        gate.notify_one();
        h.client.process_next().await;
        assert_eq!(h.service.requests().len(), 1);

        h.fire(0, ChannelEvent::Connected);
        assert_eq!(
            h.transport.emitted(0),
            vec![user_action("one"), user_action("two"), user_action("three")]
        );
        assert_eq!(h.client.pending_len(), 0);
    }

    #[tokio::test]
    async fn connected_prompt_is_sent_immediately() {
        let mut h = Harness::connected(MockService::with(vec![created("c1")]), "hello").await;
        h.prompt("again");
        assert_eq!(
            h.transport.emitted(0),
            vec![user_action("hello"), user_action("again")]
        );
        assert_eq!(h.transport.count(), 1);
        assert!(h.drain_notes().is_empty());
    }

    #[tokio::test]
    async fn inbound_agent_event_is_forwarded_raw() {
        let mut h = Harness::connected(MockService::with(vec![created("c1")]), "hello").await;
        let payload = json!({ "action": "message", "args": { "content": "hi" } });
        h.fire(
            0,
            ChannelEvent::Event {
                name: "oh_event".into(),
                payload: payload.clone(),
            },
        );
        let notes = h.drain_notes();
        assert_eq!(notes, vec![Notification::Data(payload)]);
        assert_eq!(notes[0].display_line(), "hi");

        h.fire(
            0,
            ChannelEvent::Event {
                name: "something_else".into(),
                payload: json!({}),
            },
        );
        assert!(h.drain_notes().is_empty());
    }

    #[tokio::test]
    async fn disconnect_keeps_conversation_and_next_prompt_reconnects() {
        let mut h = Harness::connected(MockService::with(vec![created("c1")]), "hello").await;
        h.fire(
            0,
            ChannelEvent::Disconnected {
                reason: "io server disconnect".into(),
                reconnecting: false,
            },
        );
        assert_eq!(
            h.drain_notes(),
            vec![Notification::status("Agent disconnected: io server disconnect.")]
        );
        assert_eq!(h.client.phase(), Phase::Disconnected);
        assert_eq!(h.client.conversation_id(), Some("c1"));

        h.prompt("after drop");
        assert_eq!(h.service.requests().len(), 1);
        assert_eq!(h.transport.count(), 2);
        assert!(h.transport.is_closed(0));
        assert_eq!(h.transport.params(1).conversation_id, "c1");

        h.fire(1, ChannelEvent::Connected);
        assert_eq!(h.transport.emitted(1), vec![user_action("after drop")]);
        assert_eq!(h.client.conversation_id(), Some("c1"));
    }

    #[tokio::test]
    async fn transport_reconnect_restores_connected_phase() {
        let mut h = Harness::connected(MockService::with(vec![created("c1")]), "hello").await;
        h.fire(
            0,
            ChannelEvent::Disconnected {
                reason: "ping timeout".into(),
                reconnecting: true,
            },
        );
        h.fire(0, ChannelEvent::Connected);
        assert_eq!(
            h.drain_notes(),
            vec![
                Notification::status("Agent disconnected: ping timeout."),
                Notification::status(STATUS_CONNECTED)
            ]
        );
        assert_eq!(h.client.phase(), Phase::Connected);
        assert_eq!(h.transport.count(), 1);
        assert_eq!(h.client.conversation_id(), Some("c1"));
    }

    #[tokio::test]
    async fn replaced_channel_events_are_ignored() {
        let mut h = Harness::connected(MockService::with(vec![created("c1")]), "hello").await;
        h.fire(
            0,
            ChannelEvent::Disconnected {
                reason: "io server disconnect".into(),
                reconnecting: false,
            },
        );
        h.prompt("next");
        h.drain_notes();

        assert!(!h.transport.fire(
            0,
            ChannelEvent::Event {
                name: "oh_event".into(),
                payload: json!({ "content": "late" }),
            }
        ));
        h.client.process_ready();
        assert!(h.drain_notes().is_empty());
        assert_eq!(h.client.phase(), Phase::Connecting);
    }

    #[tokio::test]
    async fn prompt_while_transport_retries_keeps_the_channel() {
        let mut h = Harness::connected(MockService::with(vec![created("c1")]), "hello").await;
        h.fire(
            0,
            ChannelEvent::Disconnected {
                reason: "transport close".into(),
                reconnecting: true,
            },
        );
        assert_eq!(h.client.phase(), Phase::Disconnected);

        h.prompt("next");
        assert_eq!(h.transport.count(), 1);
        assert!(!h.transport.is_closed(0));
        assert_eq!(h.client.pending_len(), 1);

        h.fire(0, ChannelEvent::Connected);
        assert_eq!(
            h.transport.emitted(0),
            vec![user_action("hello"), user_action("next")]
        );
        assert_eq!(h.client.pending_len(), 0);
    }

    #[tokio::test]
    async fn unsent_prompts_are_reported_when_transport_gives_up() {
        let mut h = Harness::connected(MockService::with(vec![created("c1")]), "hello").await;
        h.fire(
            0,
            ChannelEvent::Disconnected {
                reason: "transport close".into(),
                reconnecting: true,
            },
        );
        let (name, payload) = user_action("important");
        h.fire(
            0,
            ChannelEvent::Undelivered {
                events: vec![(name, payload)],
            },
        );
        assert_eq!(h.client.pending_len(), 1);
        h.drain_notes();

        h.fire(
            0,
            ChannelEvent::ConnectFailed {
                message: "gave up after 6 attempt(s): transport close".into(),
            },
        );
        let notes = h.drain_notes();
        assert!(
            notes.iter().any(
                |n| matches!(n, Notification::Error(m) if m.starts_with("1 prompt(s) not sent"))
            ),
            "{:?}",
            notes
        );
        assert_eq!(h.client.pending_len(), 0);

        h.prompt("again");
        h.fire(1, ChannelEvent::Connected);
        assert_eq!(h.transport.emitted(1), vec![user_action("again")]);
    }

    #[tokio::test]
    async fn unsent_prompts_are_resent_after_server_disconnect() {
        let mut h = Harness::connected(MockService::with(vec![created("c1")]), "hello").await;
        h.fire(
            0,
            ChannelEvent::Undelivered {
                events: vec![
                    user_action("first"),
                    ("other_event".to_string(), json!({})),
                    user_action("second"),
                ],
            },
        );
        h.fire(
            0,
            ChannelEvent::Disconnected {
                reason: "io server disconnect".into(),
                reconnecting: false,
            },
        );
        assert_eq!(h.transport.count(), 2);
        assert!(h.transport.is_closed(0));
        assert_eq!(h.client.phase(), Phase::Connecting);

        h.fire(1, ChannelEvent::Connected);
        assert_eq!(
            h.transport.emitted(1),
            vec![user_action("first"), user_action("second")]
        );
    }

    #[tokio::test]
    async fn connect_channel_is_idempotent_when_connected() {
        let mut h = Harness::connected(MockService::with(vec![created("c1")]), "hello").await;
        h.client.connect_channel();
        h.client.connect_channel();
        assert_eq!(h.transport.count(), 1);
        assert!(!h.transport.is_closed(0));
        assert!(h.drain_notes().is_empty());
    }

    #[tokio::test]
    async fn connect_channel_without_conversation_fails_fast() {
        let mut h = Harness::new(MockService::with(vec![]));
        h.client.connect_channel();
        assert_eq!(h.transport.count(), 0);
        assert_eq!(
            h.drain_notes(),
            vec![Notification::error(ERROR_NO_CONVERSATION)]
        );
    }

    #[tokio::test]
    async fn connect_failure_abandons_pending_but_keeps_conversation() {
        let mut h = Harness::new(MockService::with(vec![created("c1")]));
        h.prompt("hello");
        h.client.process_next().await;
        h.drain_notes();
        h.fire(
            0,
            ChannelEvent::ConnectFailed {
                message: "gave up".into(),
            },
        );
        assert_eq!(h.client.phase(), Phase::ConnectFailed);
        assert_eq!(h.client.conversation_id(), Some("c1"));
        assert_eq!(h.client.pending_len(), 0);
        let notes = h.drain_notes();
        assert_eq!(notes[0], Notification::error("Connection error: gave up"));
        assert!(matches!(&notes[1], Notification::Error(m) if m.starts_with("1 prompt(s) not sent")));

        h.prompt("again");
        assert_eq!(h.transport.count(), 2);
        assert!(h.transport.is_closed(0));
        h.fire(1, ChannelEvent::Connected);
        assert_eq!(h.transport.emitted(1), vec![user_action("again")]);
    }

    #[tokio::test]
    async fn channel_error_keeps_state() {
        let mut h = Harness::connected(MockService::with(vec![created("c1")]), "hello").await;
        h.fire(
            0,
            ChannelEvent::Error {
                message: "bad frame".into(),
            },
        );
        assert_eq!(
            h.drain_notes(),
            vec![Notification::error("Channel error: bad frame")]
        );
        assert_eq!(h.client.phase(), Phase::Connected);
        assert_eq!(h.client.conversation_id(), Some("c1"));
    }

    #[tokio::test]
    async fn full_pending_queue_rejects_with_error() {
        let mut h = Harness::with_capacity(MockService::with(vec![created("c1")]), 2);
        h.prompt("a");
        h.prompt("b");
        h.prompt("c");
        let notes = h.drain_notes();
        assert!(matches!(notes.last(), Some(Notification::Error(m)) if m.starts_with("Prompt not sent")));
        assert_eq!(h.client.pending_len(), 2);
    }

    #[tokio::test]
    async fn send_failure_requeues_and_reopens() {
        let mut h = Harness::connected(MockService::with(vec![created("c1")]), "hello").await;
        h.transport.opened.lock().unwrap()[0]
            .closed
            .store(true, Ordering::SeqCst);
        h.prompt("lost?");
        assert_eq!(h.transport.count(), 2);
        h.fire(1, ChannelEvent::Connected);
        assert_eq!(h.transport.emitted(1), vec![user_action("lost?")]);
    }

    #[tokio::test]
    async fn reset_clears_conversation_and_next_prompt_creates_new() {
        let mut h =
            Harness::connected(MockService::with(vec![created("c1"), created("c2")]), "hello").await;
        h.client
            .dispatch(ClientInput::Presentation(PresentationMessage::ResetConversation));
        assert_eq!(h.client.phase(), Phase::Idle);
        assert_eq!(h.client.conversation_id(), None);
        assert!(h.transport.is_closed(0));
        assert_eq!(h.drain_notes(), vec![Notification::status(STATUS_RESET)]);

        h.prompt("fresh");
        h.client.process_next().await;
        assert_eq!(h.client.conversation_id(), Some("c2"));
        assert_eq!(h.service.requests().len(), 2);
    }

    #[tokio::test]
    async fn reset_during_creation_is_ignored() {
        let gate = Arc::new(Notify::new());
        let mut h = Harness::new(MockService::gated(vec![created("c1")], gate.clone()));
        h.prompt("hello");
        h.client.reset();
        assert_eq!(h.client.phase(), Phase::CreatingConversation);
        gate.notify_one();
        h.client.process_next().await;
        assert_eq!(h.client.conversation_id(), Some("c1"));
    }

    #[tokio::test]
    async fn run_loop_stops_when_presentation_hangs_up() {
        let service = MockService::with(vec![created("c1")]);
        let transport = Arc::new(MockTransport::default());
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let client = ConversationClient::new(service, transport.clone(), notify_tx, 4);
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(client.run(msg_rx));

        msg_tx
            .send(PresentationMessage::UserPrompt {
                text: "hello".into(),
                attachments: vec![],
            })
            .unwrap();
        assert_eq!(
            notify_rx.recv().await,
            Some(Notification::status(STATUS_INITIALIZING))
        );
        assert_eq!(
            notify_rx.recv().await,
            Some(Notification::status(STATUS_CONNECTING))
        );
        assert_eq!(transport.count(), 1);

        drop(msg_tx);
        task.await.unwrap();
        assert!(transport.is_closed(0));
    }
}
