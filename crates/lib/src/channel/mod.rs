//! Realtime channel contract.
//!
//! A transport opens a duplex channel bound to one conversation and reports
//! lifecycle and inbound events through a [`ChannelEventSink`]. The controller owns
//! the returned [`ChannelHandle`] and the sink's [`Subscription`]; cancelling the
//! subscription guarantees no further events from that channel are delivered.

mod protocol;
mod socket;

pub use protocol::{decode_frame, encode_event, Frame, OpenPayload, ProtocolError};
pub use socket::{SocketIoHandle, SocketIoTransport};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Cursor value meaning "replay nothing, stream new events only".
pub const LATEST_EVENT_ID_LIVE: i64 = -1;

/// Parameters fixed at open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelParams {
    pub conversation_id: String,
    pub latest_event_id: i64,
}

impl ChannelParams {
    /// Params for a live-only channel on the given conversation.
    pub fn live(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            latest_event_id: LATEST_EVENT_ID_LIVE,
        }
    }
}

/// Closed set of events a channel reports.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    /// Connection dropped. `reconnecting` is true while the transport is still
    /// retrying within its attempt budget.
    Disconnected { reason: String, reconnecting: bool },
    /// The attempt budget is exhausted; the channel will not connect again.
    ConnectFailed { message: String },
    /// Runtime error on a connecting or connected channel.
    Error { message: String },
    /// Events accepted by `emit` that never reached the server, oldest first.
    /// Sent before the transport stops for good.
    Undelivered {
        events: Vec<(String, serde_json::Value)>,
    },
    /// Named inbound event with its raw payload.
    Event {
        name: String,
        payload: serde_json::Value,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,
    #[error("could not encode outbound event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Handle to an open channel (emit events, close).
pub trait ChannelHandle: Send {
    /// Queue a named event for delivery. Fire-and-forget: success means queued, not delivered.
    fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), ChannelError>;
    /// Close the channel. Idempotent.
    fn close(&mut self);
}

/// Opens channels. Implementations must not emit events through the sink after `close`.
pub trait RealtimeTransport: Send + Sync {
    fn open(&self, params: ChannelParams, sink: ChannelEventSink) -> Box<dyn ChannelHandle>;
}

/// An event tagged with the generation of the channel that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedChannelEvent {
    pub generation: u64,
    pub event: ChannelEvent,
}

/// Where a channel delivers its events. Cloneable; all clones share one subscription.
#[derive(Clone)]
pub struct ChannelEventSink {
    generation: u64,
    attached: Arc<AtomicBool>,
    deliver: Arc<dyn Fn(TaggedChannelEvent) + Send + Sync>,
}

/// Controls delivery for one sink. Dropping it does not detach; call [`Subscription::cancel`].
#[derive(Debug)]
pub struct Subscription {
    attached: Arc<AtomicBool>,
}

impl ChannelEventSink {
    /// Create a sink for channel `generation` that forwards into `deliver`.
    pub fn new(
        generation: u64,
        deliver: impl Fn(TaggedChannelEvent) + Send + Sync + 'static,
    ) -> (Self, Subscription) {
        let attached = Arc::new(AtomicBool::new(true));
        let sink = Self {
            generation,
            attached: attached.clone(),
            deliver: Arc::new(deliver),
        };
        (sink, Subscription { attached })
    }

    /// Sink forwarding into an unbounded mpsc sender.
    pub fn to_sender(
        generation: u64,
        tx: mpsc::UnboundedSender<TaggedChannelEvent>,
    ) -> (Self, Subscription) {
        Self::new(generation, move |ev| {
            let _ = tx.send(ev);
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Deliver an event. Returns false (and drops the event) once the subscription is cancelled.
    pub fn send(&self, event: ChannelEvent) -> bool {
        if !self.is_attached() {
            log::debug!("channel {}: sink detached, dropping {:?}", self.generation, event);
            return false;
        }
        (self.deliver)(TaggedChannelEvent {
            generation: self.generation,
            event,
        });
        true
    }
}

impl Subscription {
    /// Stop delivery. Events sent afterwards are dropped.
    pub fn cancel(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }
}
