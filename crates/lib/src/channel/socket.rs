//! Socket.IO realtime channel over a websocket (tokio-tungstenite).
//!
//! One task per channel: connect (handshake bounded by the connect timeout), pump
//! frames, and reconnect with capped exponential backoff until the attempt budget
//! runs out. Events emitted while disconnected are buffered and flushed on the
//! next connect; whatever is still unsent when the task stops for good is
//! handed back as [`ChannelEvent::Undelivered`].

use super::protocol::{self, Frame, OpenPayload, CONNECT_FRAME, DISCONNECT_FRAME, PONG_FRAME};
use super::{ChannelError, ChannelEvent, ChannelEventSink, ChannelHandle, ChannelParams, RealtimeTransport};
use crate::config::ChannelConfig;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reason reported when the server sends a Socket.IO disconnect.
pub const REASON_SERVER_DISCONNECT: &str = "io server disconnect";
/// Reason reported when the websocket closes or ends.
pub const REASON_TRANSPORT_CLOSE: &str = "transport close";
/// Reason reported on websocket read/write errors.
pub const REASON_TRANSPORT_ERROR: &str = "transport error";
/// Reason reported when the server stops pinging.
pub const REASON_PING_TIMEOUT: &str = "ping timeout";

/// Opens Socket.IO channels against one service base URL.
#[derive(Debug, Clone)]
pub struct SocketIoTransport {
    base_url: String,
    config: ChannelConfig,
}

enum Outbound {
    Emit(QueuedEmit),
    Close,
}

/// An accepted emit: the encoded frame plus what it was built from.
struct QueuedEmit {
    text: String,
    event: String,
    payload: serde_json::Value,
}

/// Handle for a channel opened by [`SocketIoTransport`].
pub struct SocketIoHandle {
    out_tx: mpsc::UnboundedSender<Outbound>,
    closed: bool,
}

enum AttemptError {
    /// Network failure or timeout; another attempt may succeed.
    Retryable(String),
    /// The server refused the namespace connect.
    Refused(String),
}

enum SessionEnd {
    ClientClosed,
    ServerDisconnect,
    Lost(&'static str),
}

impl SocketIoTransport {
    pub fn new(base_url: impl Into<String>, config: ChannelConfig) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            config,
        }
    }

    /// Websocket URL for a channel: `ws(s)://host/<socketPath>/?EIO=4&transport=websocket&conversation_id=..&latest_event_id=..`.
    pub fn endpoint_url(&self, params: &ChannelParams) -> Result<String, String> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| format!("invalid base url {}: {}", self.base_url, e))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(format!("unsupported url scheme: {}", other)),
        };
        url.set_scheme(scheme)
            .map_err(|_| format!("cannot use scheme {} for {}", scheme, self.base_url))?;
        let path = format!(
            "{}/{}/",
            url.path().trim_end_matches('/'),
            self.config.socket_path.trim_matches('/')
        );
        url.set_path(&path);
        url.query_pairs_mut()
            .clear()
            .append_pair("EIO", "4")
            .append_pair("transport", "websocket")
            .append_pair("conversation_id", &params.conversation_id)
            .append_pair("latest_event_id", &params.latest_event_id.to_string());
        Ok(url.to_string())
    }
}

impl RealtimeTransport for SocketIoTransport {
    fn open(&self, params: ChannelParams, sink: ChannelEventSink) -> Box<dyn ChannelHandle> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let config = self.config.clone();
        match self.endpoint_url(&params) {
            Ok(url) => {
                log::debug!(
                    "channel {}: opening {} for conversation {}",
                    sink.generation(),
                    url,
                    params.conversation_id
                );
                tokio::spawn(run_channel(url, config, sink, out_rx));
            }
            Err(e) => {
                sink.send(ChannelEvent::ConnectFailed { message: e });
            }
        }
        Box::new(SocketIoHandle {
            out_tx,
            closed: false,
        })
    }
}

impl ChannelHandle for SocketIoHandle {
    fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        let text = protocol::encode_event(event, &payload)?;
        self.out_tx
            .send(Outbound::Emit(QueuedEmit {
                text,
                event: event.to_string(),
                payload,
            }))
            .map_err(|_| ChannelError::Closed)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.out_tx.send(Outbound::Close);
    }
}

impl Drop for SocketIoHandle {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_channel(
    url: String,
    config: ChannelConfig,
    sink: ChannelEventSink,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let generation = sink.generation();
    let mut buffer: VecDeque<QueuedEmit> = VecDeque::new();
    let mut failures: u32 = 0;
    let mut last_error = String::new();

    loop {
        if failures > 0 {
            if failures > config.reconnection_attempts {
                report_undelivered(&sink, &mut out_rx, &mut buffer);
                sink.send(ChannelEvent::ConnectFailed {
                    message: format!(
                        "gave up after {} attempt(s): {}",
                        failures, last_error
                    ),
                });
                return;
            }
            let delay = config.reconnection_delay(failures);
            log::debug!("channel {}: retrying in {:?}", generation, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_close(&mut out_rx, &mut buffer) => return,
            }
        }

        let attempt = tokio::select! {
            res = connect_once(&url, config.connect_timeout()) => res,
            _ = wait_for_close(&mut out_rx, &mut buffer) => return,
        };
        let (ws, open) = match attempt {
            Ok(pair) => pair,
            Err(AttemptError::Refused(message)) => {
                log::warn!("channel {}: connect refused: {}", generation, message);
                report_undelivered(&sink, &mut out_rx, &mut buffer);
                sink.send(ChannelEvent::ConnectFailed { message });
                return;
            }
            Err(AttemptError::Retryable(message)) => {
                failures += 1;
                log::warn!(
                    "channel {}: connect attempt {} failed: {}",
                    generation,
                    failures,
                    message
                );
                last_error = message;
                continue;
            }
        };

        log::info!("channel {}: connected (sid {})", generation, open.sid);
        sink.send(ChannelEvent::Connected);

        match pump(ws, &open, &sink, &mut out_rx, &mut buffer).await {
            SessionEnd::ClientClosed => {
                log::debug!("channel {}: closed by client", generation);
                return;
            }
            SessionEnd::ServerDisconnect => {
                log::info!("channel {}: server disconnected", generation);
                report_undelivered(&sink, &mut out_rx, &mut buffer);
                sink.send(ChannelEvent::Disconnected {
                    reason: REASON_SERVER_DISCONNECT.to_string(),
                    reconnecting: false,
                });
                return;
            }
            SessionEnd::Lost(reason) => {
                log::info!("channel {}: connection lost: {}", generation, reason);
                sink.send(ChannelEvent::Disconnected {
                    reason: reason.to_string(),
                    reconnecting: true,
                });
                failures = 1;
                last_error = reason.to_string();
            }
        }
    }
}

/// Resolve once the handle closes; buffers any emits seen meanwhile.
async fn wait_for_close(
    out_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    buffer: &mut VecDeque<QueuedEmit>,
) {
    loop {
        match out_rx.recv().await {
            Some(Outbound::Emit(item)) => buffer.push_back(item),
            Some(Outbound::Close) | None => return,
        }
    }
}

/// Stop accepting emits and hand everything not yet written back to the owner.
/// Later `emit` calls on the handle fail with [`ChannelError::Closed`].
fn report_undelivered(
    sink: &ChannelEventSink,
    out_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    buffer: &mut VecDeque<QueuedEmit>,
) {
    out_rx.close();
    while let Ok(cmd) = out_rx.try_recv() {
        if let Outbound::Emit(item) = cmd {
            buffer.push_back(item);
        }
    }
    if buffer.is_empty() {
        return;
    }
    log::warn!(
        "channel {}: {} event(s) not delivered",
        sink.generation(),
        buffer.len()
    );
    let events = buffer
        .drain(..)
        .map(|item| (item.event, item.payload))
        .collect();
    sink.send(ChannelEvent::Undelivered { events });
}

async fn connect_once(url: &str, timeout: Duration) -> Result<(WsStream, OpenPayload), AttemptError> {
    match tokio::time::timeout(timeout, handshake(url)).await {
        Ok(res) => res,
        Err(_) => Err(AttemptError::Retryable(format!(
            "connection timed out after {} ms",
            timeout.as_millis()
        ))),
    }
}

async fn handshake(url: &str) -> Result<(WsStream, OpenPayload), AttemptError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| AttemptError::Retryable(e.to_string()))?;

    let open = loop {
        match next_frame(&mut ws).await? {
            Frame::Open(open) => break open,
            Frame::Ignored | Frame::Ping | Frame::Pong => continue,
            other => {
                return Err(AttemptError::Retryable(format!(
                    "expected open packet, got {:?}",
                    other
                )))
            }
        }
    };

    ws.send(Message::Text(CONNECT_FRAME.to_string()))
        .await
        .map_err(|e| AttemptError::Retryable(e.to_string()))?;

    loop {
        match next_frame(&mut ws).await? {
            Frame::Connect => return Ok((ws, open)),
            Frame::ConnectError { message } => return Err(AttemptError::Refused(message)),
            Frame::Ping => {
                ws.send(Message::Text(PONG_FRAME.to_string()))
                    .await
                    .map_err(|e| AttemptError::Retryable(e.to_string()))?;
            }
            Frame::Close | Frame::Disconnect => {
                return Err(AttemptError::Retryable(
                    "server closed the connection during handshake".to_string(),
                ))
            }
            _ => continue,
        }
    }
}

/// Next decodable text frame during the handshake.
async fn next_frame(ws: &mut WsStream) -> Result<Frame, AttemptError> {
    loop {
        let msg = ws
            .next()
            .await
            .ok_or_else(|| AttemptError::Retryable("connection closed during handshake".to_string()))?
            .map_err(|e| AttemptError::Retryable(e.to_string()))?;
        match msg {
            Message::Text(text) => {
                return protocol::decode_frame(&text)
                    .map_err(|e| AttemptError::Retryable(e.to_string()))
            }
            Message::Close(_) => {
                return Err(AttemptError::Retryable(
                    "connection closed during handshake".to_string(),
                ))
            }
            _ => continue,
        }
    }
}

async fn pump(
    ws: WsStream,
    open: &OpenPayload,
    sink: &ChannelEventSink,
    out_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    buffer: &mut VecDeque<QueuedEmit>,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();
    let idle = Duration::from_millis(open.ping_interval.saturating_add(open.ping_timeout).max(1));

    while let Some(item) = buffer.pop_front() {
        if write.send(Message::Text(item.text.clone())).await.is_err() {
            buffer.push_front(item);
            return SessionEnd::Lost(REASON_TRANSPORT_ERROR);
        }
    }

    let mut deadline = tokio::time::Instant::now() + idle;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                return SessionEnd::Lost(REASON_PING_TIMEOUT);
            }
            cmd = out_rx.recv() => match cmd {
                Some(Outbound::Emit(item)) => {
                    if write.send(Message::Text(item.text.clone())).await.is_err() {
                        buffer.push_back(item);
                        return SessionEnd::Lost(REASON_TRANSPORT_ERROR);
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = write.send(Message::Text(DISCONNECT_FRAME.to_string())).await;
                    let _ = write.close().await;
                    return SessionEnd::ClientClosed;
                }
            },
            msg = read.next() => {
                deadline = tokio::time::Instant::now() + idle;
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(end) = handle_frame(&text, sink, &mut write).await {
                            return end;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Lost(REASON_TRANSPORT_CLOSE);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("channel {}: websocket error: {}", sink.generation(), e);
                        return SessionEnd::Lost(REASON_TRANSPORT_ERROR);
                    }
                }
            }
        }
    }
}

async fn handle_frame(
    text: &str,
    sink: &ChannelEventSink,
    write: &mut SplitSink<WsStream, Message>,
) -> Option<SessionEnd> {
    match protocol::decode_frame(text) {
        Ok(Frame::Ping) => {
            if write.send(Message::Text(PONG_FRAME.to_string())).await.is_err() {
                return Some(SessionEnd::Lost(REASON_TRANSPORT_ERROR));
            }
        }
        Ok(Frame::Event { name, payload }) => {
            sink.send(ChannelEvent::Event { name, payload });
        }
        Ok(Frame::Disconnect) => return Some(SessionEnd::ServerDisconnect),
        Ok(Frame::Close) => return Some(SessionEnd::Lost(REASON_TRANSPORT_CLOSE)),
        Ok(Frame::ConnectError { message }) => {
            sink.send(ChannelEvent::Error { message });
        }
        Ok(Frame::Open(_) | Frame::Connect | Frame::Pong | Frame::Ignored) => {}
        Err(e) => {
            log::warn!("channel {}: bad frame {:?}: {}", sink.generation(), text, e);
            sink.send(ChannelEvent::Error {
                message: e.to_string(),
            });
        }
    }
    None
}
