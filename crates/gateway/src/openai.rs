//! OpenAI-compatible `/v1/chat/completions`.
//!
//! Lets any OpenAI client talk to Aido: the last user message of the
//! request becomes one agent turn. `stream: true` produces SSE chunks in
//! OpenAI's delta format with a `data: [DONE]` terminator.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine as _;
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::error;

use aido_agent::{Attachment, Event, EventKind, EventSink, InboundMessage};

use crate::methods::{MAX_ATTACHMENTS_PER_MESSAGE, MAX_ATTACHMENT_BYTES};
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct ChatCompletionsRequest {
    #[serde(default)]
    model: String,
    #[serde(default)]
    messages: Vec<RequestMessage>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    user: String,
}

#[derive(Debug, Deserialize)]
struct RequestMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    image_url: Option<ImageUrl>,
}

#[derive(Debug, Deserialize)]
struct ImageUrl {
    #[serde(default)]
    url: String,
}

/// Extract text and image attachments from a user message's `content`,
/// which may be a plain string or an array of typed parts.
pub fn parse_user_content(
    content: &serde_json::Value,
) -> Result<(String, Vec<Attachment>), String> {
    if content.is_null() {
        return Ok((String::new(), Vec::new()));
    }
    if let Some(s) = content.as_str() {
        return Ok((s.to_string(), Vec::new()));
    }

    let parts: Vec<ContentPart> = serde_json::from_value(content.clone())
        .map_err(|e| format!("content must be string or array: {e}"))?;

    let mut texts = Vec::new();
    let mut attachments = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        let n = i + 1;
        match part.kind.to_lowercase().as_str() {
            "text" => texts.push(part.text.clone()),
            "image_url" => {
                let url = part
                    .image_url
                    .as_ref()
                    .map(|u| u.url.trim().to_string())
                    .unwrap_or_default();
                if url.is_empty() {
                    return Err(format!("content part {n}: image_url missing url"));
                }
                if attachments.len() >= MAX_ATTACHMENTS_PER_MESSAGE {
                    return Err(format!(
                        "too many image parts: max {MAX_ATTACHMENTS_PER_MESSAGE}"
                    ));
                }
                if let Some(rest) = url.strip_prefix("data:") {
                    let (mime, b64) = parse_data_url(rest)
                        .map_err(|e| format!("content part {n}: {e}"))?;
                    let decoded = base64::engine::general_purpose::STANDARD
                        .decode(&b64)
                        .map_err(|e| format!("content part {n}: invalid base64 in data URL: {e}"))?;
                    if decoded.len() > MAX_ATTACHMENT_BYTES {
                        return Err(format!(
                            "content part {n}: image too large (max {MAX_ATTACHMENT_BYTES} bytes)"
                        ));
                    }
                    attachments.push(Attachment {
                        kind: "image".into(),
                        base64: b64,
                        mime,
                        ..Default::default()
                    });
                } else {
                    attachments.push(Attachment {
                        kind: "image".into(),
                        url,
                        ..Default::default()
                    });
                }
            }
            // Unknown part types are ignored.
            _ => {}
        }
    }
    Ok((texts.join("\n"), attachments))
}

/// Split the payload of a `data:` URL (after the prefix) into (mime, base64).
fn parse_data_url(rest: &str) -> Result<(String, String), String> {
    let Some(idx) = rest.find(";base64,") else {
        return Err("data URL must contain ;base64,".into());
    };
    let mime = rest[..idx].trim();
    let mime = if mime.is_empty() { "image/png" } else { mime };
    Ok((mime.to_string(), rest[idx + ";base64,".len()..].to_string()))
}

pub async fn chat_completions(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<ChatCompletionsRequest>,
) -> Response {
    let token = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    if !state.authenticate(token) {
        return openai_error(StatusCode::UNAUTHORIZED, "invalid token", "auth_error");
    }

    // The last user message is the turn's input.
    let mut user_text = String::new();
    let mut attachments = Vec::new();
    let mut found = false;
    for msg in req.messages.iter().rev() {
        if msg.role == "user" {
            match parse_user_content(&msg.content) {
                Ok((text, atts)) => {
                    user_text = text;
                    attachments = atts;
                    found = true;
                }
                Err(e) => {
                    return openai_error(StatusCode::BAD_REQUEST, &e, "invalid_request")
                }
            }
            break;
        }
    }
    if !found || (user_text.is_empty() && attachments.is_empty()) {
        return openai_error(
            StatusCode::BAD_REQUEST,
            "no user message found",
            "invalid_request",
        );
    }

    let cfg = state.config.get();
    let mut agent_id = cfg.gateway.current_agent.clone();
    if agent_id.is_empty() {
        agent_id = req.model.clone();
    }
    if agent_id.is_empty() || agent_id == "aido" {
        agent_id = "default".into();
    }

    // The `user` field pins the conversation; without it every request is
    // a fresh session.
    let chat_id = if req.user.is_empty() {
        format!(
            "openai:{agent_id}:{}",
            chrono::Utc::now().timestamp_millis()
        )
    } else {
        req.user.clone()
    };

    let inbound = InboundMessage {
        agent_id,
        channel: "openai".into(),
        chat_id,
        text: user_text,
        attachments,
        ..Default::default()
    };

    if req.stream {
        stream_completion(state, inbound).await
    } else {
        sync_completion(state, inbound).await
    }
}

/// One agent turn may not outlive this on the OpenAI surface.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5 * 60);

fn request_token(state: &SharedState) -> tokio_util::sync::CancellationToken {
    let token = state.shutdown.child_token();
    let timed = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(REQUEST_TIMEOUT).await;
        timed.cancel();
    });
    token
}

async fn sync_completion(state: SharedState, inbound: InboundMessage) -> Response {
    let model = inbound.agent_id.clone();
    let cancel = request_token(&state);
    let result = state.router.handle_message(inbound, None, cancel).await;

    match result {
        Ok(outcome) => Json(serde_json::json!({
            "id": completion_id(),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": outcome.text },
                "finish_reason": "stop",
            }],
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "openai compat error");
            openai_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string(), "server_error")
        }
    }
}

async fn stream_completion(state: SharedState, inbound: InboundMessage) -> Response {
    let model = inbound.agent_id.clone();
    let id = completion_id();

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<SseEvent, Infallible>>();

    let sink: EventSink = {
        let tx = tx.clone();
        let id = id.clone();
        let model = model.clone();
        Arc::new(move |event: Event| match event.kind {
            EventKind::TextDelta => {
                if let Some(text) = &event.text {
                    let chunk = delta_chunk(&id, &model, serde_json::json!({ "content": text }), None);
                    let _ = tx.send(Ok(SseEvent::default().data(chunk.to_string())));
                }
            }
            EventKind::Done => {
                let chunk = delta_chunk(&id, &model, serde_json::json!({}), Some("stop"));
                let _ = tx.send(Ok(SseEvent::default().data(chunk.to_string())));
                let _ = tx.send(Ok(SseEvent::default().data("[DONE]")));
            }
            _ => {}
        })
    };

    let run_state = state.clone();
    let cancel = request_token(&state);
    tokio::spawn(async move {
        let result = run_state
            .router
            .handle_message(inbound, Some(sink), cancel)
            .await;
        if let Err(e) = result {
            error!(error = %e, "openai stream error");
            let payload = serde_json::json!({
                "error": { "message": e.to_string(), "type": "server_error" }
            });
            let _ = tx.send(Ok(SseEvent::default().data(payload.to_string())));
        }
    });

    Sse::new(UnboundedReceiverStream::new(rx)).into_response()
}

fn delta_chunk(
    id: &str,
    model: &str,
    delta: serde_json::Value,
    finish_reason: Option<&str>,
) -> serde_json::Value {
    let mut choice = serde_json::json!({ "index": 0, "delta": delta });
    if let Some(reason) = finish_reason {
        choice["finish_reason"] = serde_json::json!(reason);
    }
    serde_json::json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [choice],
    })
}

fn completion_id() -> String {
    format!("chatcmpl-{}", chrono::Utc::now().timestamp_millis())
}

fn openai_error(status: StatusCode, message: &str, kind: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": { "message": message, "type": kind }
        })),
    )
        .into_response()
}
