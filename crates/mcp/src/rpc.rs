//! JSON-RPC 2.0 framing and the transport abstraction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use aido_core::error::McpError;

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn call(id: i64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method: method.to_string(),
            params,
        }
    }

    /// A notification carries no id and expects no response.
    pub fn notification(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct RpcErrorBody {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl JsonRpcResponse {
    pub fn into_result(self) -> Result<serde_json::Value, McpError> {
        if let Some(err) = self.error {
            return Err(McpError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(self.result.unwrap_or(serde_json::Value::Null))
    }
}

static REQUEST_ID: AtomicI64 = AtomicI64::new(0);

/// Monotonically increasing request id, shared across transports.
pub fn next_request_id() -> i64 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst) + 1
}

/// Correlates request ids with their one-slot response channels.
#[derive(Default)]
pub struct PendingMap {
    inner: Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>,
}

impl PendingMap {
    pub fn insert(&self, id: i64) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().unwrap().insert(id, tx);
        rx
    }

    pub fn remove(&self, id: i64) {
        self.inner.lock().unwrap().remove(&id);
    }

    /// Deliver a response to its waiter, if any. Notifications (id 0) and
    /// unknown ids are dropped.
    pub fn resolve(&self, response: JsonRpcResponse) {
        let sender = self.inner.lock().unwrap().remove(&response.id);
        if let Some(tx) = sender {
            let _ = tx.send(response);
        }
    }
}

/// Interface for MCP server communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection (spawn the process, open the SSE stream).
    async fn start(&self) -> Result<(), McpError>;

    /// Send a request and wait for the matching response.
    async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError>;

    /// Send a notification; no response is expected.
    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError>;

    /// Tear the connection down.
    async fn close(&self);
}
