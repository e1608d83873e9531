//! The framed WebSocket protocol.
//!
//! Every frame is a JSON object with a `type` of "req", "res", or "event".
//! Requests correlate with responses by `id`; server pushes are event
//! frames with a sequence number.

use serde::{Deserialize, Serialize};

// Connection roles.
pub const ROLE_BRIDGE: &str = "bridge";
pub const ROLE_CLIENT: &str = "client";

// Error codes.
pub const CODE_HANDSHAKE_REQUIRED: &str = "HANDSHAKE_REQUIRED";
pub const CODE_INVALID_PARAMS: &str = "INVALID_PARAMS";
pub const CODE_AUTH_FAILED: &str = "AUTH_FAILED";
pub const CODE_UNKNOWN_METHOD: &str = "UNKNOWN_METHOD";
pub const CODE_ERROR: &str = "ERROR";

/// The universal WebSocket message format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,

    // req
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,

    // res
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,

    // event
    #[serde(skip_serializing_if = "String::is_empty")]
    pub event: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub seq: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Handshake parameters: the first frame must be a `connect` request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectParams {
    pub role: String,
    pub token: String,
    /// Required for bridges: the channel this bridge adapts.
    pub channel: String,
    pub capabilities: Vec<String>,
}

/// Parameters of `message.send`, used by bridges and clients alike.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessageSendParams {
    pub channel: String,
    #[serde(rename = "channelChatId")]
    pub channel_chat_id: String,
    pub text: String,
    #[serde(rename = "senderId")]
    pub sender_id: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub attachments: Vec<AttachmentParam>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentParam {
    /// "image" | "audio" | "video" | "file".
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub base64: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mime: String,
}

pub fn res_ok(id: &str, payload: serde_json::Value) -> Frame {
    Frame {
        kind: "res".into(),
        id: id.to_string(),
        ok: Some(true),
        payload: Some(payload),
        ..Default::default()
    }
}

pub fn res_err(id: &str, code: &str, message: &str) -> Frame {
    Frame {
        kind: "res".into(),
        id: id.to_string(),
        ok: Some(false),
        error: Some(ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
        }),
        ..Default::default()
    }
}

pub fn event_frame(event: &str, seq: u64, payload: serde_json::Value) -> Frame {
    Frame {
        kind: "event".into(),
        event: event.to_string(),
        seq,
        payload: Some(payload),
        ..Default::default()
    }
}
