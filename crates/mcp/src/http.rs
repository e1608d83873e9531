//! MCP transport over HTTP with Server-Sent Events.
//!
//! Per MCP 2024-11-05: the client GETs a long-lived SSE endpoint, the
//! server's first `endpoint` event names the POST URL, requests are POSTed
//! there, and responses come back as `message` SSE events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, trace};

use aido_core::error::McpError;
use aido_providers::sse::SseParser;

use crate::rpc::{next_request_id, JsonRpcRequest, JsonRpcResponse, PendingMap, Transport};

pub struct HttpSseTransport {
    sse_url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    post_url: Arc<RwLock<String>>,
    pending: Arc<PendingMap>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HttpSseTransport {
    pub fn new(sse_url: &str, headers: &HashMap<String, String>) -> Self {
        Self {
            sse_url: sse_url.to_string(),
            headers: headers.clone(),
            client: reqwest::Client::new(),
            post_url: Arc::new(RwLock::new(String::new())),
            pending: Arc::new(PendingMap::default()),
            reader: Mutex::new(None),
        }
    }

    async fn post_url(&self) -> Result<String, McpError> {
        let url = self.post_url.read().await.clone();
        if url.is_empty() {
            return Err(McpError::Transport(
                "message endpoint not yet received from server".into(),
            ));
        }
        Ok(url)
    }

    async fn post(&self, req: &JsonRpcRequest) -> Result<(), McpError> {
        let url = self.post_url().await?;
        let mut http_req = self.client.post(&url).json(req);
        for (k, v) in &self.headers {
            http_req = http_req.header(k, v);
        }
        let resp = http_req
            .send()
            .await
            .map_err(|e| McpError::Transport(format!("MCP POST: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(McpError::Transport(format!("MCP POST returned {status}")));
        }
        Ok(())
    }
}

/// Resolve the `endpoint` event's URL, which may be relative, against the
/// SSE endpoint it arrived on.
pub(crate) fn resolve_endpoint(sse_url: &str, endpoint: &str) -> Result<String, McpError> {
    let base = reqwest::Url::parse(sse_url)
        .map_err(|e| McpError::Transport(format!("invalid SSE URL {sse_url:?}: {e}")))?;
    let resolved = base
        .join(endpoint.trim())
        .map_err(|e| McpError::Transport(format!("invalid endpoint {endpoint:?}: {e}")))?;
    Ok(resolved.to_string())
}

#[async_trait]
impl Transport for HttpSseTransport {
    async fn start(&self) -> Result<(), McpError> {
        let mut req = self
            .client
            .get(&self.sse_url)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| McpError::Transport(format!("connect to MCP SSE: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(McpError::Transport(format!(
                "MCP SSE endpoint returned {status}"
            )));
        }
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.starts_with("text/event-stream") {
            return Err(McpError::Transport(format!(
                "MCP SSE endpoint Content-Type is {content_type:?}, expected text/event-stream"
            )));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let sse_url = self.sse_url.clone();
        let post_url = self.post_url.clone();
        let pending = self.pending.clone();

        let handle = tokio::spawn(async move {
            let mut parser = SseParser::new();
            let mut byte_stream = resp.bytes_stream();
            let mut endpoint_tx = Some(endpoint_tx);

            while let Some(Ok(bytes)) = byte_stream.next().await {
                for event in parser.push(&String::from_utf8_lossy(&bytes)) {
                    match event.event.as_str() {
                        "endpoint" => {
                            let resolved = match resolve_endpoint(&sse_url, &event.data) {
                                Ok(u) => u,
                                Err(e) => {
                                    debug!(error = %e, "bad MCP endpoint event");
                                    continue;
                                }
                            };
                            *post_url.write().await = resolved.clone();
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(resolved);
                            }
                        }
                        "message" => match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                            Ok(resp) if resp.id != 0 => pending.resolve(resp),
                            Ok(_) => {}
                            Err(e) => trace!(error = %e, "skipping unparseable MCP message"),
                        },
                        _ => {}
                    }
                }
            }
            debug!("MCP SSE stream ended");
        });
        *self.reader.lock().await = Some(handle);

        endpoint_rx.await.map_err(|_| {
            McpError::Transport("MCP SSE stream ended before endpoint event".into())
        })?;
        Ok(())
    }

    async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let id = next_request_id();
        let rx = self.pending.insert(id);
        let req = JsonRpcRequest::call(id, method, params);

        if let Err(e) = self.post(&req).await {
            self.pending.remove(id);
            return Err(e);
        }

        match rx.await {
            Ok(resp) => resp.into_result(),
            Err(_) => Err(McpError::Transport("MCP SSE stream closed".into())),
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.post(&JsonRpcRequest::notification(method, params)).await
    }

    async fn close(&self) {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
    }
}
