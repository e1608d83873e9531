//! Protocol method implementations, shared by the WebSocket dispatcher
//! and the HTTP surface.

use std::sync::Arc;

use base64::Engine as _;
use tokio_util::sync::CancellationToken;

use aido_agent::{session_key, Attachment, Event, EventSink, InboundMessage, ToolStep};
use aido_core::message::Message;
use aido_session::{Compactor, SessionManager};

use crate::protocol::{AttachmentParam, MessageSendParams};
use crate::state::GatewayState;

pub const MAX_ATTACHMENTS_PER_MESSAGE: usize = 20;
pub const MAX_ATTACHMENT_BYTES: usize = 15 * 1024 * 1024;

const ALLOWED_ATTACHMENT_TYPES: &[&str] = &["image", "audio", "video", "file"];

/// Validate transport attachments and convert them for the agent loop.
pub fn validate_attachments(input: &[AttachmentParam]) -> Result<Vec<Attachment>, String> {
    if input.len() > MAX_ATTACHMENTS_PER_MESSAGE {
        return Err(format!(
            "too many attachments: max {MAX_ATTACHMENTS_PER_MESSAGE}"
        ));
    }
    let mut out = Vec::with_capacity(input.len());
    for (i, a) in input.iter().enumerate() {
        let n = i + 1;
        let kind = a.kind.trim().to_lowercase();
        if kind.is_empty() {
            return Err(format!("attachment {n}: type required"));
        }
        if !ALLOWED_ATTACHMENT_TYPES.contains(&kind.as_str()) {
            return Err(format!(
                "attachment {n}: invalid type {:?} (allowed: image, audio, video, file)",
                a.kind
            ));
        }
        let has_url = !a.url.trim().is_empty();
        let has_base64 = !a.base64.trim().is_empty();
        if !has_url && !has_base64 {
            return Err(format!("attachment {n}: url or base64 required"));
        }
        if has_url && has_base64 {
            return Err(format!("attachment {n}: provide url or base64, not both"));
        }
        if has_base64 {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(a.base64.trim())
                .map_err(|e| format!("attachment {n}: invalid base64: {e}"))?;
            if decoded.len() > MAX_ATTACHMENT_BYTES {
                return Err(format!(
                    "attachment {n}: base64 too large (max {MAX_ATTACHMENT_BYTES} bytes)"
                ));
            }
        }
        out.push(Attachment {
            kind,
            url: a.url.trim().to_string(),
            base64: a.base64.trim().to_string(),
            mime: a.mime.trim().to_string(),
        });
    }
    Ok(out)
}

/// Translate an agent event into the fan-out payload.
pub fn agent_event_payload(event: &Event, channel: &str, chat_id: &str) -> serde_json::Value {
    let mut payload = serde_json::to_value(event).unwrap_or_default();
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("channel".into(), serde_json::json!(channel));
        obj.insert("channelChatId".into(), serde_json::json!(chat_id));
    }
    payload
}

/// `message.send`: run one agent turn and fan events out to every client
/// plus the originating channel's bridges.
pub async fn handle_message_send(
    state: &Arc<GatewayState>,
    params: serde_json::Value,
    cancel: CancellationToken,
) -> Result<serde_json::Value, String> {
    let p: MessageSendParams =
        serde_json::from_value(params).map_err(|e| format!("invalid params: {e}"))?;
    if p.channel.is_empty() {
        return Err("channel required".into());
    }
    if p.text.is_empty() && p.attachments.is_empty() {
        return Err("text or at least one attachment required".into());
    }
    let chat_id = if p.channel_chat_id.is_empty() {
        "main".to_string()
    } else {
        p.channel_chat_id.clone()
    };

    let attachments = validate_attachments(&p.attachments)?;

    state.conns.broadcast_to_role(
        crate::protocol::ROLE_CLIENT,
        "user_message",
        serde_json::json!({
            "channel": p.channel,
            "channelChatId": chat_id,
            "text": p.text,
        }),
    );

    let sink: EventSink = {
        let conns = state.conns.clone();
        let channel = p.channel.clone();
        let chat_id = chat_id.clone();
        Arc::new(move |event: Event| {
            let payload = agent_event_payload(&event, &channel, &chat_id);
            conns.broadcast_to_role(crate::protocol::ROLE_CLIENT, "agent", payload.clone());
            conns.broadcast_to_channel(&channel, "agent", payload);
        })
    };

    let result = state
        .router
        .handle_message(
            InboundMessage {
                channel: p.channel.clone(),
                chat_id: chat_id.clone(),
                sender_id: p.sender_id,
                text: p.text,
                attachments,
                message_id: p.message_id,
                ..Default::default()
            },
            Some(sink),
            cancel,
        )
        .await
        .map_err(|e| e.to_string())?;

    state.conns.broadcast_to_channel(
        &p.channel,
        "outbound.message",
        serde_json::json!({
            "channel": p.channel,
            "channelChatId": chat_id,
            "text": result.text,
        }),
    );

    Ok(message_send_response(&result.text, &result.tool_steps))
}

pub fn message_send_response(text: &str, tool_steps: &[ToolStep]) -> serde_json::Value {
    let mut out = serde_json::json!({ "text": text });
    if !tool_steps.is_empty() {
        out["toolSteps"] = serde_json::to_value(tool_steps).unwrap_or_default();
    }
    out
}

/// `chat.history`: the simplified message list for one conversation.
pub fn handle_chat_history(
    state: &Arc<GatewayState>,
    channel: &str,
    chat_id: &str,
) -> Result<serde_json::Value, String> {
    let key = session_key(channel, chat_id);
    if state.router.store().get(&key).is_none() {
        return Ok(serde_json::json!({ "messages": [] }));
    }
    let session = SessionManager::new(state.router.store().clone(), Compactor::default(), &key);
    let messages = session.load_transcript().map_err(|e| e.to_string())?;
    Ok(serde_json::json!({
        "messages": messages.iter().map(simplify_message).collect::<Vec<_>>()
    }))
}

fn simplify_message(msg: &Message) -> serde_json::Value {
    let mut m = serde_json::json!({
        "role": msg.role,
        "content": msg.content,
    });
    if !msg.tool_calls.is_empty() {
        m["toolCalls"] = serde_json::to_value(&msg.tool_calls).unwrap_or_default();
    }
    m
}

/// `sessions.list`: metadata for every session.
pub fn handle_sessions_list(state: &Arc<GatewayState>) -> serde_json::Value {
    let sessions: Vec<serde_json::Value> = state
        .router
        .store()
        .list()
        .iter()
        .map(|e| {
            let (channel, chat_id) = aido_agent::router::parse_session_key(&e.session_key);
            serde_json::json!({
                "channel": channel,
                "channelChatId": chat_id,
                "createdAt": e.created_at,
                "updatedAt": e.updated_at,
                "inputTokens": e.input_tokens,
                "outputTokens": e.output_tokens,
                "compactions": e.compactions,
            })
        })
        .collect();
    serde_json::json!({ "sessions": sessions })
}

/// `health`: connection counts.
pub fn handle_health(state: &Arc<GatewayState>) -> serde_json::Value {
    serde_json::json!({
        "status": "ok",
        "bridges": state.conns.list_bridges(),
        "clients": state.conns.client_count(),
    })
}

/// `config.get`: the sanitized configuration view. Secrets never leave
/// through this path: provider API keys and the gateway token are
/// redacted the same way `ProviderConfig`'s Debug impl redacts them.
/// `PUT /api/config` is the only surface that carries full values.
pub fn config_for_ui(state: &Arc<GatewayState>) -> serde_json::Value {
    let cfg = state.config.get();
    let providers: serde_json::Map<String, serde_json::Value> = cfg
        .providers
        .iter()
        .map(|(name, p)| {
            (
                name.clone(),
                serde_json::json!({
                    "apiKey": redact(&p.api_key),
                    "baseURL": p.base_url,
                    "type": p.kind,
                }),
            )
        })
        .collect();

    serde_json::json!({
        "configPath": state.config.path().display().to_string(),
        "gateway": {
            "port": cfg.gateway.port,
            "currentAgent": cfg.gateway.current_agent,
            "locale": cfg.gateway.locale,
            "auth": { "token": redact(&cfg.gateway.auth.token) },
        },
        "agents": cfg.agents,
        "tools": cfg.tools,
        "bridges": cfg.bridges,
        "providers": providers,
    })
}

fn redact(secret: &str) -> &str {
    if secret.is_empty() {
        ""
    } else {
        "[REDACTED]"
    }
}
