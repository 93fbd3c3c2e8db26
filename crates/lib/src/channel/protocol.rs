//! Socket.IO text framing over Engine.IO v4 (websocket transport only).
//!
//! Engine.IO packet type is the first character; Socket.IO packets ride inside
//! Engine.IO "message" (`4`) packets, so `42[...]` is a Socket.IO event.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Engine.IO open payload: `0{"sid", "pingInterval", "pingTimeout"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPayload {
    pub sid: String,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

/// One decoded text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `0{...}` Engine.IO handshake.
    Open(OpenPayload),
    /// `1` Engine.IO close.
    Close,
    /// `2` server ping.
    Ping,
    /// `3` pong.
    Pong,
    /// `40` / `40{...}` Socket.IO namespace connected.
    Connect,
    /// `41` Socket.IO disconnect from the server.
    Disconnect,
    /// `42["name", payload]` Socket.IO event.
    Event { name: String, payload: Value },
    /// `44{"message"}` Socket.IO connect refused.
    ConnectError { message: String },
    /// `6` noop and packets this client does not act on (acks, binary).
    Ignored,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("unknown packet type {0:?}")]
    UnknownPacket(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Decode one websocket text frame.
pub fn decode_frame(text: &str) -> Result<Frame, ProtocolError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or(ProtocolError::Empty)?;
    let rest = chars.as_str();
    match kind {
        '0' => serde_json::from_str(rest)
            .map(Frame::Open)
            .map_err(|e| ProtocolError::Malformed(format!("open payload: {}", e))),
        '1' => Ok(Frame::Close),
        '2' => Ok(Frame::Ping),
        '3' => Ok(Frame::Pong),
        '4' => decode_socket_packet(rest),
        '5' | '6' => Ok(Frame::Ignored),
        other => Err(ProtocolError::UnknownPacket(other.to_string())),
    }
}

fn decode_socket_packet(text: &str) -> Result<Frame, ProtocolError> {
    let mut chars = text.chars();
    let kind = chars
        .next()
        .ok_or_else(|| ProtocolError::Malformed("message packet without socket packet".into()))?;
    let body = strip_namespace(chars.as_str());
    match kind {
        '0' => Ok(Frame::Connect),
        '1' => Ok(Frame::Disconnect),
        '2' => decode_event(strip_ack_id(body)),
        '3' | '5' | '6' => Ok(Frame::Ignored),
        '4' => {
            let message = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| {
                    v.get("message")
                        .and_then(|m| m.as_str())
                        .map(|s| s.to_string())
                })
                .unwrap_or_else(|| "connection refused".to_string());
            Ok(Frame::ConnectError { message })
        }
        other => Err(ProtocolError::UnknownPacket(format!("4{}", other))),
    }
}

/// Drop a `/namespace,` prefix when present.
fn strip_namespace(body: &str) -> &str {
    if body.starts_with('/') {
        match body.find(',') {
            Some(i) => &body[i + 1..],
            None => "",
        }
    } else {
        body
    }
}

fn strip_ack_id(body: &str) -> &str {
    body.trim_start_matches(|c: char| c.is_ascii_digit())
}

fn decode_event(body: &str) -> Result<Frame, ProtocolError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ProtocolError::Malformed(format!("event body: {}", e)))?;
    let mut items = match value {
        Value::Array(items) => items.into_iter(),
        _ => return Err(ProtocolError::Malformed("event body is not an array".into())),
    };
    let name = match items.next() {
        Some(Value::String(name)) => name,
        _ => return Err(ProtocolError::Malformed("event without a name".into())),
    };
    let payload = items.next().unwrap_or(Value::Null);
    Ok(Frame::Event { name, payload })
}

/// Encode a Socket.IO event frame: `42["name",payload]`.
pub fn encode_event(name: &str, payload: &Value) -> Result<String, serde_json::Error> {
    let body = serde_json::to_string(&serde_json::json!([name, payload]))?;
    Ok(format!("42{}", body))
}

/// Socket.IO namespace connect request.
pub const CONNECT_FRAME: &str = "40";
/// Socket.IO disconnect from the client.
pub const DISCONNECT_FRAME: &str = "41";
/// Engine.IO pong.
pub const PONG_FRAME: &str = "3";
