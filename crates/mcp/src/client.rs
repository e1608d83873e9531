//! MCP server bookkeeping and tool registration.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use aido_core::error::{McpError, ToolError};
use aido_core::tool::{Tool, ToolRegistry};

use crate::rpc::Transport;
use crate::PROTOCOL_VERSION;

struct ServerEntry {
    transport: Arc<dyn Transport>,
    /// Fingerprint of the config that produced this server, for reload diffing.
    fingerprint: String,
}

/// Manages connections to MCP servers and their registry entries.
#[derive(Default)]
pub struct McpClient {
    servers: Mutex<HashMap<String, ServerEntry>>,
}

#[derive(Debug, Deserialize)]
struct ToolListing {
    #[serde(default)]
    tools: Vec<ToolInfo>,
}

#[derive(Debug, Deserialize)]
struct ToolInfo {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "inputSchema", default)]
    input_schema: serde_json::Value,
}

impl McpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to a server, run the initialize handshake, discover its
    /// tools, and register them as `"<name>:<tool>"`. Returns the number
    /// of tools registered.
    pub async fn add_server(
        &self,
        name: &str,
        transport: Arc<dyn Transport>,
        registry: &ToolRegistry,
        fingerprint: &str,
    ) -> Result<usize, McpError> {
        transport.start().await.map_err(|e| McpError::Server {
            server: name.to_string(),
            reason: format!("start: {e}"),
        })?;

        let init = transport
            .call(
                "initialize",
                Some(serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": { "name": "aido", "version": env!("CARGO_PKG_VERSION") },
                })),
            )
            .await;
        if let Err(e) = init {
            transport.close().await;
            return Err(McpError::Server {
                server: name.to_string(),
                reason: format!("initialize: {e}"),
            });
        }

        if let Err(e) = transport.notify("notifications/initialized", None).await {
            warn!(server = %name, error = %e, "initialized notification failed");
        }

        let listing = match transport.call("tools/list", None).await {
            Ok(v) => v,
            Err(e) => {
                transport.close().await;
                return Err(McpError::Server {
                    server: name.to_string(),
                    reason: format!("tools/list: {e}"),
                });
            }
        };
        let listing: ToolListing = match serde_json::from_value(listing) {
            Ok(l) => l,
            Err(e) => {
                transport.close().await;
                return Err(McpError::Server {
                    server: name.to_string(),
                    reason: format!("parse tools: {e}"),
                });
            }
        };

        let count = listing.tools.len();
        for tool in listing.tools {
            registry.register(Arc::new(McpTool {
                server_name: name.to_string(),
                tool_name: tool.name.clone(),
                full_name: format!("{name}:{}", tool.name),
                description: tool.description,
                parameters: tool.input_schema,
                transport: transport.clone(),
            }));
        }

        self.servers.lock().await.insert(
            name.to_string(),
            ServerEntry {
                transport,
                fingerprint: fingerprint.to_string(),
            },
        );

        info!(server = %name, tools = count, "MCP server connected");
        Ok(count)
    }

    /// Tear down one server: close its transport and drop its tools.
    pub async fn remove_server(&self, name: &str, registry: &ToolRegistry) {
        if let Some(entry) = self.servers.lock().await.remove(name) {
            entry.transport.close().await;
        }
        registry.unregister_by_prefix(name);
        info!(server = %name, "MCP server removed");
    }

    /// Fingerprint of a connected server's config, if connected.
    pub async fn fingerprint(&self, name: &str) -> Option<String> {
        self.servers
            .lock()
            .await
            .get(name)
            .map(|e| e.fingerprint.clone())
    }

    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of servers that are connected but absent from `desired`, plus
    /// servers whose fingerprint changed. Both need teardown before the
    /// new config is applied; unchanged servers are left alone.
    pub async fn stale_servers(&self, desired: &HashMap<String, String>) -> Vec<String> {
        let servers = self.servers.lock().await;
        let mut stale: Vec<String> = servers
            .iter()
            .filter(|(name, entry)| desired.get(*name) != Some(&entry.fingerprint))
            .map(|(name, _)| name.clone())
            .collect();
        stale.sort();
        stale
    }

    pub async fn close_all(&self, registry: &ToolRegistry) {
        let names = self.server_names().await;
        for name in names {
            self.remove_server(&name, registry).await;
        }
    }
}

/// Wraps one discovered MCP tool as a registry [`Tool`].
pub struct McpTool {
    server_name: String,
    tool_name: String,
    full_name: String,
    description: String,
    parameters: serde_json::Value,
    transport: Arc<dyn Transport>,
}

impl McpTool {
    pub fn server_name(&self) -> &str {
        &self.server_name
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.full_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.parameters.clone()
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let result = self
            .transport
            .call(
                "tools/call",
                Some(serde_json::json!({
                    "name": self.tool_name,
                    "arguments": arguments,
                })),
            )
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: self.full_name.clone(),
                reason: e.to_string(),
            })?;

        parse_tool_result(&self.full_name, result)
    }
}

#[derive(Debug, Deserialize)]
struct CallResult {
    #[serde(default)]
    content: Vec<ContentPart>,
    #[serde(rename = "isError", default)]
    is_error: bool,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
}

/// Concatenate the text parts of a `tools/call` result. A result flagged
/// `isError` surfaces as a tool error so the loop feeds it back to the
/// model as data.
fn parse_tool_result(
    tool_name: &str,
    result: serde_json::Value,
) -> Result<String, ToolError> {
    let parsed: CallResult = match serde_json::from_value(result.clone()) {
        Ok(p) => p,
        Err(_) => return Ok(result.to_string()),
    };

    let text = parsed
        .content
        .iter()
        .filter(|p| p.kind == "text")
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    if parsed.is_error {
        return Err(ToolError::ExecutionFailed {
            tool_name: tool_name.to_string(),
            reason: text,
        });
    }
    Ok(text)
}
