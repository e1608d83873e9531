//! WebSocket endpoint: handshake, framed dispatch, per-connection writer.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connmgr::Conn;
use crate::methods;
use crate::protocol::{
    res_err, res_ok, ConnectParams, Frame, CODE_AUTH_FAILED, CODE_ERROR, CODE_HANDSHAKE_REQUIRED,
    CODE_INVALID_PARAMS, CODE_UNKNOWN_METHOD, ROLE_BRIDGE, ROLE_CLIENT,
};
use crate::state::SharedState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (mut sink, mut stream) = socket.split();

    // Single writer task per connection: every outbound frame, including
    // handshake responses, goes through this channel.
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(WsMessage::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let conn_id = format!("conn_{}", uuid::Uuid::new_v4().simple());

    // --- Handshake: the first frame must be connect. ---
    let conn = match read_frame(&mut stream).await {
        Some(frame) => match admit(&state, &conn_id, &tx, frame) {
            Some(conn) => conn,
            None => {
                drop(tx);
                let _ = writer.await;
                return;
            }
        },
        None => {
            drop(tx);
            let _ = writer.await;
            return;
        }
    };

    state.conns.add(conn.clone());
    info!(id = %conn_id, role = %conn.role, channel = %conn.channel, "connection established");

    // --- Dispatch loop. ---
    while let Some(frame) = read_frame(&mut stream).await {
        if frame.kind != "req" {
            continue;
        }
        dispatch(&state, &conn, frame).await;
    }

    state.conns.remove(&conn_id);
    debug!(id = %conn_id, "connection closed");
    drop(tx);
    let _ = writer.await;
}

/// Validate the connect frame, answer it, and build the connection.
fn admit(
    state: &SharedState,
    conn_id: &str,
    tx: &mpsc::UnboundedSender<Frame>,
    frame: Frame,
) -> Option<Arc<Conn>> {
    let send = |f: Frame| {
        let _ = tx.send(f);
    };

    if frame.method != "connect" {
        send(res_err(
            &frame.id,
            CODE_HANDSHAKE_REQUIRED,
            "first message must be a connect request",
        ));
        return None;
    }

    let params: ConnectParams =
        match serde_json::from_value(frame.params.unwrap_or(serde_json::Value::Null)) {
            Ok(p) => p,
            Err(_) => {
                send(res_err(&frame.id, CODE_INVALID_PARAMS, "invalid connect params"));
                return None;
            }
        };

    if !state.authenticate(&params.token) {
        send(res_err(&frame.id, CODE_AUTH_FAILED, "invalid token"));
        return None;
    }

    if params.role != ROLE_BRIDGE && params.role != ROLE_CLIENT {
        send(res_err(&frame.id, CODE_INVALID_PARAMS, "role must be bridge or client"));
        return None;
    }
    if params.role == ROLE_BRIDGE && params.channel.is_empty() {
        send(res_err(&frame.id, CODE_INVALID_PARAMS, "bridge must provide channel"));
        return None;
    }

    let channel = if params.role == ROLE_BRIDGE {
        params.channel.clone()
    } else {
        String::new()
    };
    let conn = Arc::new(Conn::new(
        conn_id,
        &params.role,
        &channel,
        params.capabilities,
        tx.clone(),
    ));

    send(res_ok(
        &frame.id,
        serde_json::json!({ "connId": conn_id, "protocol": 1 }),
    ));
    Some(conn)
}

async fn dispatch(state: &SharedState, conn: &Arc<Conn>, frame: Frame) {
    match frame.method.as_str() {
        // Long-running: each message.send gets its own task so a run does
        // not block other frames on this connection.
        "message.send" => {
            let state = state.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                let cancel = state.shutdown.child_token();
                let result = methods::handle_message_send(
                    &state,
                    frame.params.unwrap_or(serde_json::Value::Null),
                    cancel,
                )
                .await;
                match result {
                    Ok(payload) => conn.send(res_ok(&frame.id, payload)),
                    Err(e) => conn.send(res_err(&frame.id, CODE_ERROR, &e)),
                };
            });
        }

        "chat.history" | "sessions.list" | "health" | "config.get" => {
            if conn.role != ROLE_CLIENT {
                conn.send(res_err(
                    &frame.id,
                    CODE_UNKNOWN_METHOD,
                    "only client supports chat.history, sessions.list, health, config.get",
                ));
                return;
            }
            let result = match frame.method.as_str() {
                "chat.history" => {
                    let params = frame.params.unwrap_or(serde_json::Value::Null);
                    let channel = params["channel"].as_str().unwrap_or_default().to_string();
                    let chat_id = params["channelChatId"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    if channel.is_empty() || chat_id.is_empty() {
                        Err("channel and channelChatId required".to_string())
                    } else {
                        methods::handle_chat_history(state, &channel, &chat_id)
                    }
                }
                "sessions.list" => Ok(methods::handle_sessions_list(state)),
                "health" => Ok(methods::handle_health(state)),
                "config.get" => Ok(methods::config_for_ui(state)),
                _ => unreachable!(),
            };
            match result {
                Ok(payload) => conn.send(res_ok(&frame.id, payload)),
                Err(e) => conn.send(res_err(&frame.id, CODE_ERROR, &e)),
            };
        }

        other => {
            warn!(method = %other, "unknown ws method");
            conn.send(res_err(
                &frame.id,
                CODE_UNKNOWN_METHOD,
                "supported: message.send, chat.history, sessions.list, health, config.get",
            ));
        }
    }
}

async fn read_frame(
    stream: &mut futures::stream::SplitStream<WebSocket>,
) -> Option<Frame> {
    loop {
        let msg = stream.next().await?.ok()?;
        match msg {
            WsMessage::Text(text) => match serde_json::from_str::<Frame>(&text) {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    debug!(error = %e, "skipping unparseable frame");
                    continue;
                }
            },
            WsMessage::Close(_) => return None,
            // Binary, ping, and pong frames are ignored.
            _ => continue,
        }
    }
}
