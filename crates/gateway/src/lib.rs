//! The Aido gateway: one HTTP server multiplexing the WebSocket protocol,
//! the native JSON API, an OpenAI-compatible endpoint, and the embedded
//! web UI.
//!
//! Built on Axum. Agent events from in-flight runs fan out to every
//! connected client and to the originating channel's bridges.

pub mod api;
pub mod connmgr;
pub mod frontend;
pub mod methods;
pub mod openai;
pub mod protocol;
pub mod state;
pub mod ws;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::info;

pub use connmgr::{Conn, ConnManager};
pub use state::{GatewayState, SharedState};

/// Build the complete route tree.
pub fn build_router(state: SharedState) -> Router {
    let api = api::api_router(state.clone());

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws::ws_handler))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .with_state(state)
        .nest("/api", api)
        .merge(frontend::frontend_router())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health_handler(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let uptime = chrono::Utc::now() - state.start_at;
    Json(serde_json::json!({
        "status": "ok",
        "uptime": format!("{}s", uptime.num_seconds()),
        "bridges": state.conns.list_bridges().len(),
        "clients": state.conns.client_count(),
    }))
}

/// Bind and serve until the state's shutdown token fires.
pub async fn serve(state: SharedState) -> std::io::Result<()> {
    let port = state.config.get().gateway.port;
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(addr = %addr, "Aido gateway starting");
    let token = &state.config.get().gateway.auth.token;
    let mut ui_url = format!("http://localhost:{port}/");
    if !token.is_empty() {
        ui_url.push_str(&format!("#token={token}"));
    }
    info!(url = %ui_url, "management UI");

    let shutdown = state.shutdown.clone();
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use aido_agent::{Loop, Router as AgentRouter};
    use aido_bridge::BridgeManager;
    use aido_config::ConfigHandle;
    use aido_core::tool::ToolRegistry;
    use aido_session::Store;

    fn test_state(token: &str) -> (tempfile::TempDir, SharedState) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = aido_config::Config::default();
        cfg.gateway.auth.token = token.into();
        cfg.providers.insert(
            "mock".into(),
            aido_config::ProviderConfig {
                api_key: "sk-test-key".into(),
                ..Default::default()
            },
        );
        cfg.agents.insert(
            "default".into(),
            aido_config::AgentConfig {
                model: "mock/m".into(),
                ..Default::default()
            },
        );
        let handle = ConfigHandle::new(dir.path().join("config.yaml"), cfg);

        let tools = Arc::new(ToolRegistry::new());
        let agent_loop = Arc::new(Loop::new(handle.clone(), tools));
        let store = Arc::new(Store::new(dir.path()));
        let router = Arc::new(AgentRouter::new(handle.clone(), agent_loop, store));
        let bridges = Arc::new(BridgeManager::new("ws://localhost:19800/ws", token));
        (dir, GatewayState::new(handle, router, bridges))
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_endpoint_is_public() {
        let (_dir, state) = test_state("secret");
        let (status, body) = get_body(build_router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["clients"], 0);
    }

    #[tokio::test]
    async fn api_requires_token() {
        let (_dir, state) = test_state("secret");
        let app = build_router(state);

        let (status, _) = get_body(app.clone(), "/api/sessions").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // Query-parameter token also works.
        let (status, body) = get_body(app, "/api/sessions?token=secret").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["sessions"].is_array());
    }

    #[tokio::test]
    async fn empty_token_disables_auth() {
        let (_dir, state) = test_state("");
        let (status, _) = get_body(build_router(state), "/api/sessions").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn api_config_is_sanitized_view() {
        let (_dir, state) = test_state("gw-token");
        let (status, body) =
            get_body(build_router(state), "/api/config?token=gw-token").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["configPath"].as_str().unwrap().ends_with("config.yaml"));
        assert_eq!(body["gateway"]["port"], 19800);
        assert!(body["agents"]["default"].is_object());

        // Secrets are redacted, not echoed back.
        assert_eq!(body["providers"]["mock"]["apiKey"], "[REDACTED]");
        assert_eq!(body["gateway"]["auth"]["token"], "[REDACTED]");
        let raw = body.to_string();
        assert!(!raw.contains("sk-test-key"));
        assert!(!raw.contains("gw-token"));
    }

    #[tokio::test]
    async fn chat_history_requires_params() {
        let (_dir, state) = test_state("");
        let app = build_router(state);
        let (status, _) = get_body(app.clone(), "/api/chat/history").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) =
            get_body(app, "/api/chat/history?channel=tg&channelChatId=12").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["messages"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn openai_endpoint_rejects_empty_request() {
        let (_dir, state) = test_state("");
        let app = build_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"model":"aido","messages":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn openai_endpoint_checks_token() {
        let (_dir, state) = test_state("secret");
        let app = build_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"messages":[{"role":"user","content":"hi"}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn put_config_validates() {
        let (_dir, state) = test_state("");
        let app = build_router(state.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/config")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"gateway":{"port":0}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn put_config_rewrites_and_publishes() {
        let (_dir, state) = test_state("");
        let app = build_router(state.clone());
        let body = serde_json::json!({
            "gateway": { "port": 28999 },
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/config")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.config.get().gateway.port, 28999);
        assert!(state.config.path().exists());
    }
}
