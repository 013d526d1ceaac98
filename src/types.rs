//! Wire frames exchanged with the gateway over its WebSocket endpoint.
//!
//! Every frame is a JSON object with a `type` discriminator.  Outbound
//! traffic is always a request (`req`); inbound traffic is either a
//! response to one of our requests (`res`) or a server push (`event`,
//! some gateway builds spell it `evt`).  The discriminator is matched
//! case-insensitively.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event name the gateway uses to hand out a connect nonce.
pub const CHALLENGE_EVENT: &str = "connect.challenge";

/// A request frame sent to the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct RequestFrame<'a> {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub id: &'a str,
    pub method: &'a str,
    pub params: &'a Value,
}

impl<'a> RequestFrame<'a> {
    pub fn new(id: &'a str, method: &'a str, params: &'a Value) -> Self {
        Self {
            frame_type: "req",
            id,
            method,
            params,
        }
    }
}

/// Error object carried by a response with `ok: false`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default, deserialize_with = "lenient_string")]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// A response to a request we sent.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    pub payload: Value,
    pub error: Option<RemoteError>,
}

/// A server-pushed event, forwarded opaquely to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventFrame {
    pub event: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl EventFrame {
    /// Nonce carried by a `connect.challenge` event, if this is one.
    pub fn challenge_nonce(&self) -> Option<&str> {
        if self.event != CHALLENGE_EVENT {
            return None;
        }
        self.payload
            .get("nonce")
            .and_then(Value::as_str)
            .filter(|nonce| !nonce.is_empty())
    }
}

/// Any frame the gateway may send us.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response(ResponseFrame),
    Event(EventFrame),
    /// Well-formed JSON with a `type` we do not act on.
    Other,
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type", default)]
    frame_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    ok: Option<bool>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    error: Option<RemoteError>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    seq: Option<u64>,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawFrame = serde_json::from_str(text)?;
        let kind = raw.frame_type.to_ascii_lowercase();
        let frame = match kind.as_str() {
            "res" => match raw.id {
                Some(id) => InboundFrame::Response(ResponseFrame {
                    id,
                    ok: raw.ok.unwrap_or(false),
                    payload: raw.payload.unwrap_or(Value::Null),
                    error: raw.error,
                }),
                None => InboundFrame::Other,
            },
            "event" | "evt" => match raw.event {
                Some(event) => InboundFrame::Event(EventFrame {
                    event,
                    payload: raw.payload.unwrap_or(Value::Null),
                    seq: raw.seq,
                }),
                None => InboundFrame::Other,
            },
            _ => InboundFrame::Other,
        };
        Ok(frame)
    }
}

/// Some gateways send numeric error codes; keep them as strings.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}
