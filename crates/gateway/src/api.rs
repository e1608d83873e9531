//! Native JSON-over-HTTP API under `/api`.

use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use aido_config::Config;

use crate::methods;
use crate::protocol::AttachmentParam;
use crate::state::SharedState;

pub fn api_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(api_health))
        .route("/config", get(api_config_get).put(api_config_put))
        .route("/sessions", get(api_sessions))
        .route("/chat/history", get(api_chat_history))
        .route("/chat/send", post(api_chat_send))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .with_state(state)
}

/// Bearer-token auth, also accepting `?token=` for browser clients.
async fn auth_middleware(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Response {
    let mut token = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string();
    if token.is_empty() {
        token = query_param(req.uri().query(), "token").unwrap_or_default();
    }

    if !state.authenticate(&token) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid token" })),
        )
            .into_response();
    }
    next.run(req).await
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
}

async fn api_health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(methods::handle_health(&state))
}

async fn api_config_get(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(methods::config_for_ui(&state))
}

/// Validate and atomically rewrite the YAML config file, then publish the
/// new snapshot.
async fn api_config_put(
    State(state): State<SharedState>,
    Json(cfg): Json<Config>,
) -> Response {
    if let Err(msg) = validate_config(&cfg) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": msg })),
        )
            .into_response();
    }
    if let Err(e) = aido_config::write(state.config.path(), &cfg) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response();
    }
    state.config.set(cfg);
    info!(path = %state.config.path().display(), "config updated via API");
    Json(serde_json::json!({ "ok": true })).into_response()
}

fn validate_config(cfg: &Config) -> Result<(), String> {
    if cfg.gateway.port == 0 {
        return Err("gateway.port required".into());
    }
    for (name, agent) in &cfg.agents {
        if agent.model.is_empty() {
            return Err(format!("agent {name:?}: model required"));
        }
    }
    for mcp in &cfg.tools.mcp {
        if mcp.name.is_empty() {
            return Err("tools.mcp[]: name required".into());
        }
        match mcp.transport.as_str() {
            "" | "stdio" => {
                if mcp.command.is_empty() {
                    return Err(format!("mcp server {:?}: command required", mcp.name));
                }
            }
            "http" => {
                if mcp.url.is_empty() {
                    return Err(format!("mcp server {:?}: url required", mcp.name));
                }
            }
            other => {
                return Err(format!(
                    "mcp server {:?}: unknown transport {other:?}",
                    mcp.name
                ))
            }
        }
    }
    Ok(())
}

async fn api_sessions(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(methods::handle_sessions_list(&state))
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    channel: String,
    #[serde(default, rename = "channelChatId")]
    channel_chat_id: String,
}

async fn api_chat_history(
    State(state): State<SharedState>,
    Query(q): Query<HistoryQuery>,
) -> Response {
    if q.channel.is_empty() || q.channel_chat_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "channel and channelChatId required" })),
        )
            .into_response();
    }
    match methods::handle_chat_history(&state, &q.channel, &q.channel_chat_id) {
        Ok(payload) => Json(payload).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct ChatSendBody {
    #[serde(default)]
    channel: String,
    #[serde(default, rename = "channelChatId")]
    channel_chat_id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    attachments: Vec<AttachmentParam>,
}

/// `POST /api/chat/send` mirrors `message.send` without streaming: only
/// the final text and tool steps come back.
async fn api_chat_send(
    State(state): State<SharedState>,
    Json(body): Json<ChatSendBody>,
) -> Response {
    if body.text.is_empty() && body.attachments.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "text required" })),
        )
            .into_response();
    }
    let channel = if body.channel.is_empty() {
        "webchat".to_string()
    } else {
        body.channel
    };

    let params = serde_json::json!({
        "channel": channel,
        "channelChatId": body.channel_chat_id,
        "text": body.text,
        "attachments": body.attachments,
    });
    match methods::handle_message_send(&state, params, state.shutdown.child_token()).await {
        Ok(payload) => Json(payload).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_extraction() {
        assert_eq!(
            query_param(Some("token=abc&x=1"), "token").as_deref(),
            Some("abc")
        );
        assert_eq!(query_param(Some("x=1"), "token"), None);
        assert_eq!(query_param(None, "token"), None);
    }

    #[test]
    fn config_validation() {
        let mut cfg = Config::default();
        assert!(validate_config(&cfg).is_ok());

        cfg.gateway.port = 0;
        assert!(validate_config(&cfg).is_err());
        cfg.gateway.port = 19800;

        cfg.agents
            .insert("bad".into(), aido_config::AgentConfig {
                model: String::new(),
                ..Default::default()
            });
        assert!(validate_config(&cfg).unwrap_err().contains("model"));
        cfg.agents.clear();

        cfg.tools.mcp.push(aido_config::McpServerConfig {
            name: "srv".into(),
            transport: "http".into(),
            ..Default::default()
        });
        assert!(validate_config(&cfg).unwrap_err().contains("url"));
    }
}
