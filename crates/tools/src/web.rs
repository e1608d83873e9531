//! Web fetch tool.

use std::time::Duration;

use async_trait::async_trait;

use aido_core::error::ToolError;
use aido_core::tool::Tool;

const MAX_FETCH_BYTES: usize = 200_000;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Fetch a URL or send data to an endpoint.
pub struct WebFetchTool {
    client: reqwest::Client,
}

impl WebFetchTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch content from a URL or send data to an endpoint. Supports GET, POST, PUT, DELETE, PATCH with custom headers and body."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "URL to fetch or send to" },
                "method": { "type": "string", "description": "HTTP method (default: GET)", "enum": ["GET", "POST", "PUT", "DELETE", "PATCH"] },
                "headers": { "type": "object", "description": "Custom headers as key-value pairs" },
                "body": { "type": "string", "description": "Request body (for POST, PUT, PATCH)" },
                "timeout": { "type": "integer", "description": "Timeout in seconds (default: 30)" }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let url = args["url"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("missing 'url' argument".into()))?;
        let method = args["method"].as_str().unwrap_or("GET").to_uppercase();
        let timeout_secs = args["timeout"].as_u64().unwrap_or(DEFAULT_TIMEOUT_SECS);

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| ToolError::InvalidArguments(format!("invalid method {method:?}")))?;

        let mut req = self
            .client
            .request(method.clone(), url)
            .timeout(Duration::from_secs(timeout_secs))
            .header("User-Agent", "Aido/0.1");

        if let Some(headers) = args["headers"].as_object() {
            for (key, value) in headers {
                if let Some(v) = value.as_str() {
                    req = req.header(key, v);
                }
            }
        }

        if let Some(body) = args["body"].as_str() {
            if matches!(
                method,
                reqwest::Method::POST | reqwest::Method::PUT | reqwest::Method::PATCH
            ) {
                req = req.body(body.to_string());
                if args["headers"]
                    .as_object()
                    .map_or(true, |h| !h.contains_key("Content-Type"))
                {
                    req = req.header("Content-Type", "application/json");
                }
            }
        }

        let resp = req.send().await.map_err(|e| ToolError::ExecutionFailed {
            tool_name: "web_fetch".into(),
            reason: e.to_string(),
        })?;

        let status = resp.status();
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let bytes = resp.bytes().await.map_err(|e| ToolError::ExecutionFailed {
            tool_name: "web_fetch".into(),
            reason: e.to_string(),
        })?;

        let truncated = bytes.len() > MAX_FETCH_BYTES;
        let body = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_FETCH_BYTES)]);

        let mut out = format!("[{} {}]\n", status.as_u16(), status);
        out.push_str(&format!("Content-Length: {}\n", bytes.len()));
        if !content_type.is_empty() {
            out.push_str(&format!("Content-Type: {content_type}\n"));
        }
        out.push('\n');
        out.push_str(&body);
        if truncated {
            out.push_str("\n[...truncated, response too large]");
        }
        Ok(out)
    }
}
