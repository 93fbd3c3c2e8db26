//! Inbound event translation: one display line per agent event, whatever its shape.

use serde_json::Value;

/// Line shown for events that match no known shape.
pub const FALLBACK_LINE: &str = "Received an event with no displayable content.";

/// Translate an inbound envelope into a single human-readable line.
///
/// Shapes are tried in order, first match wins:
/// error marker, status marker, chat message action, think action, observation,
/// plain `message` string, plain `content` string. Anything else yields
/// [`FALLBACK_LINE`] and a warning in the log. Never panics and never returns an empty line.
pub fn translate_inbound_envelope(envelope: &Value) -> String {
    match known_shape(envelope) {
        Some(line) => line,
        None => {
            log::warn!("inbound event matched no known shape: {}", envelope);
            FALLBACK_LINE.to_string()
        }
    }
}

fn known_shape(envelope: &Value) -> Option<String> {
    let obj = envelope.as_object()?;
    let str_field = |key: &str| obj.get(key).and_then(|v| v.as_str());

    if obj.get("error").and_then(|v| v.as_bool()) == Some(true) {
        if let Some(message) = str_field("message") {
            return Some(format!("ERROR: {}", message));
        }
    }
    if str_field("type") == Some("status") {
        if let Some(message) = str_field("message") {
            return Some(format!("STATUS: {}", message));
        }
    }
    match str_field("action") {
        Some("message") => {
            if let Some(text) = nested_str(obj.get("args"), "content").filter(|s| !s.is_empty()) {
                return Some(text.to_string());
            }
        }
        Some("think") => {
            if let Some(thought) = nested_str(obj.get("args"), "thought") {
                return Some(format!("[Thinking] {}", thought));
            }
        }
        _ => {}
    }
    if let (Some(observation), Some(content)) = (obj.get("observation"), str_field("content")) {
        let observation = match observation {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Some(format!("[Observation] {}: {}", observation, content));
    }
    if let Some(message) = str_field("message").filter(|s| !s.is_empty()) {
        return Some(message.to_string());
    }
    str_field("content")
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn nested_str<'a>(parent: Option<&'a Value>, key: &str) -> Option<&'a str> {
    parent?.get(key)?.as_str()
}
