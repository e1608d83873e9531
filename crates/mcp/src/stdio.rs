//! MCP transport over a child process's stdin/stdout.
//!
//! Frames are newline-delimited JSON objects. A reader task parses
//! responses off stdout and resolves the pending-request map.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use aido_core::error::McpError;

use crate::rpc::{next_request_id, JsonRpcRequest, JsonRpcResponse, PendingMap, Transport};

pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: String,

    proc: Mutex<Option<(Child, ChildStdin)>>,
    pending: Arc<PendingMap>,
}

impl StdioTransport {
    pub fn new(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: &str,
    ) -> Self {
        Self {
            command: command.to_string(),
            args: args.to_vec(),
            env: env.clone(),
            cwd: cwd.to_string(),
            proc: Mutex::new(None),
            pending: Arc::new(PendingMap::default()),
        }
    }

    async fn write_line(&self, req: &JsonRpcRequest) -> Result<(), McpError> {
        let mut line = serde_json::to_vec(req)
            .map_err(|e| McpError::Transport(format!("marshal request: {e}")))?;
        line.push(b'\n');

        let mut guard = self.proc.lock().await;
        let Some((_, stdin)) = guard.as_mut() else {
            return Err(McpError::Transport("transport not started".into()));
        };
        stdin
            .write_all(&line)
            .await
            .map_err(|e| McpError::Transport(format!("write to MCP: {e}")))
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self) -> Result<(), McpError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if !self.cwd.is_empty() {
            cmd.current_dir(&self.cwd);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::Transport(format!("start MCP process {}: {e}", self.command)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("stdin pipe unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("stdout pipe unavailable".into()))?;

        let pending = self.pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(&line) {
                    Ok(resp) => pending.resolve(resp),
                    Err(e) => trace!(error = %e, "skipping non-response MCP line"),
                }
            }
            debug!("MCP stdio reader finished");
        });

        *self.proc.lock().await = Some((child, stdin));
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

        if let Err(e) = self.write_line(&req).await {
            self.pending.remove(id);
            return Err(e);
        }

        match rx.await {
            Ok(resp) => resp.into_result(),
            Err(_) => Err(McpError::Transport("MCP process closed the stream".into())),
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.write_line(&JsonRpcRequest::notification(method, params))
            .await
    }

    async fn close(&self) {
        if let Some((mut child, stdin)) = self.proc.lock().await.take() {
            drop(stdin);
            let _ = child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_before_start_fails() {
        let transport = StdioTransport::new("true", &[], &HashMap::new(), "");
        let err = transport.call("initialize", None).await.unwrap_err();
        assert!(err.to_string().contains("not started"));
    }

    #[tokio::test]
    async fn echo_server_roundtrip() {
        // `cat` echoes our request back; the response parser sees an object
        // with our id and no result, which resolves to Null.
        let transport = StdioTransport::new("cat", &[], &HashMap::new(), "");
        transport.start().await.unwrap();
        let result = transport.call("ping", None).await.unwrap();
        assert!(result.is_null());
        transport.close().await;
    }
}
