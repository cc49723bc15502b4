//! Relay wire protocol: JSON arrays over a persistent WebSocket.
//!
//! Client to relay: `["REQ", subId, filter]`, `["CLOSE", subId]`,
//! `["EVENT", event]`. Relay to client: `["EVENT", subId, event]`,
//! `["EOSE", subId]`, `["CLOSED", subId, reason]`,
//! `["OK", eventId, success, message]`, `["NOTICE", text]`.
//!
//! Decoding is tolerant: unknown or malformed frames return `None` and the
//! read loop skips them, they are never fatal.

use serde_json::{json, Value};

/// An inbound frame from a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { sub_id: String, event: Value },
    Eose { sub_id: String },
    Closed { sub_id: String, reason: String },
    Ok { event_id: String, accepted: bool, message: String },
    Notice { text: String },
}

/// Parse one inbound frame. Returns `None` for anything malformed or of an
/// unrecognized type.
pub fn parse_relay_message(text: &str) -> Option<RelayMessage> {
    let value: Value = serde_json::from_str(text).ok()?;
    let arr = value.as_array()?;
    let kind = arr.first()?.as_str()?;

    match kind {
        "EVENT" => Some(RelayMessage::Event {
            sub_id: arr.get(1)?.as_str()?.to_string(),
            event: arr.get(2)?.clone(),
        }),
        "EOSE" => Some(RelayMessage::Eose {
            sub_id: arr.get(1)?.as_str()?.to_string(),
        }),
        "CLOSED" => Some(RelayMessage::Closed {
            sub_id: arr.get(1)?.as_str()?.to_string(),
            reason: arr
                .get(2)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        "OK" => Some(RelayMessage::Ok {
            event_id: arr.get(1)?.as_str()?.to_string(),
            accepted: arr.get(2)?.as_bool()?,
            message: arr
                .get(3)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        "NOTICE" => Some(RelayMessage::Notice {
            text: arr.get(1)?.as_str()?.to_string(),
        }),
        _ => None,
    }
}

/// `["REQ", subId, filter]`
pub fn req_frame(sub_id: &str, filter: &Value) -> String {
    json!(["REQ", sub_id, filter]).to_string()
}

/// `["CLOSE", subId]`
pub fn close_frame(sub_id: &str) -> String {
    json!(["CLOSE", sub_id]).to_string()
}

/// `["EVENT", event]`
pub fn event_frame(event: &Value) -> String {
    json!(["EVENT", event]).to_string()
}
