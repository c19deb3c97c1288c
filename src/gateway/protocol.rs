//! Gateway wire protocol.
//!
//! Every WebSocket text frame is one JSON envelope discriminated by `type`:
//!
//! - `{"type":"req","id","method","params"}` from client to gateway
//! - `{"type":"res","id","ok","payload"|"error"}` answering a request
//! - `{"type":"event","event","payload"}` pushed by the gateway

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method names used by the talk client.
pub mod method {
    pub const CONNECT: &str = "connect";
    pub const CHAT_SEND: &str = "chat.send";
    pub const CHAT_ABORT: &str = "chat.abort";
}

/// Event names the talk client reacts to.
pub mod event {
    pub const CONNECT_CHALLENGE: &str = "connect.challenge";
    pub const CHAT: &str = "chat";
    pub const TICK: &str = "tick";
}

/// One protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Res {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
    Event {
        event: String,
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

impl Frame {
    /// Build a request with a fresh unique id.
    pub fn request(method: &str, params: Value) -> (String, Self) {
        let id = uuid::Uuid::new_v4().to_string();
        let frame = Self::Req {
            id: id.clone(),
            method: method.to_owned(),
            params,
        };
        (id, frame)
    }

    /// Parse one text frame. Returns `None` for anything that is not a valid envelope.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// The `id` of a `res` envelope that did not parse as a [`Frame`].
    pub fn malformed_response_id(text: &str) -> Option<String> {
        let value: Value = serde_json::from_str(text).ok()?;
        if value.get("type").and_then(Value::as_str) != Some("res") {
            return None;
        }
        value.get("id").and_then(Value::as_str).map(str::to_owned)
    }

    pub fn to_json(&self) -> String {
        // An enum of strings, bools and `Value`s always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Human-readable message from a `res` error field.
///
/// The gateway sends either a bare string or `{code, message}`.
pub fn error_message(error: Option<&Value>) -> String {
    match error {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(map)) => {
            let message = map.get("message").and_then(Value::as_str);
            let code = map.get("code").and_then(Value::as_str);
            match (code, message) {
                (Some(c), Some(m)) => format!("{c}: {m}"),
                (None, Some(m)) => m.to_owned(),
                (Some(c), None) => c.to_owned(),
                (None, None) => Value::Object(map.clone()).to_string(),
            }
        }
        Some(other) => other.to_string(),
        None => "request failed".to_owned(),
    }
}

/// Client identity announced in the handshake.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthParams {
    pub token: String,
}

/// Params of the `connect` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Whether a `connect` response payload completes the handshake.
pub fn is_hello(payload: Option<&Value>) -> bool {
    payload.is_some_and(|p| p.get("snapshot").is_some())
}

/// Params of `chat.send`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendParams {
    pub session_key: String,
    pub message: String,
    pub deliver: bool,
    pub idempotency_key: String,
}

/// Params of `chat.abort`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAbortParams {
    pub session_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// Lifecycle state carried by a `chat` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatState {
    /// Full text accumulated so far.
    Delta,
    Final,
    Error,
    Aborted,
    #[serde(other)]
    Unknown,
}

/// Payload of a `chat` event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
    pub state: ChatState,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ChatEvent {
    /// Text of the attached message, if any.
    pub fn text(&self) -> Option<String> {
        self.message.as_ref().and_then(message_text)
    }
}

/// Acknowledgement payload of `chat.send`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendAck {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Extract plain text from a chat message value.
///
/// Accepts a bare string, `{"text": ...}`, or a message whose `content` is a
/// string or a list of parts, in which case the `text` parts are concatenated.
pub fn message_text(message: &Value) -> Option<String> {
    match message {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => {
            if let Some(content) = map.get("content") {
                return message_text(content);
            }
            map.get("text").and_then(Value::as_str).map(str::to_owned)
        }
        Value::Array(parts) => {
            let text: String = parts
                .iter()
                .filter(|p| {
                    p.get("type")
                        .and_then(Value::as_str)
                        .is_none_or(|t| t == "text")
                })
                .filter_map(|p| match p {
                    Value::String(s) => Some(s.as_str()),
                    _ => p.get("text").and_then(Value::as_str),
                })
                .collect();
            Some(text)
        }
        _ => None,
    }
}
