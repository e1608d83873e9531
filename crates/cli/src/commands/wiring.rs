//! Shared construction of the agent runtime from a loaded config.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use aido_agent::{Loop, Router};
use aido_config::{Config, ConfigHandle, McpServerConfig};
use aido_core::tool::ToolRegistry;
use aido_mcp::{HttpSseTransport, McpClient, StdioTransport, Transport};
use aido_session::Store;

pub struct Runtime {
    pub config: ConfigHandle,
    pub store: Arc<aido_session::Store>,
    pub registry: Arc<ToolRegistry>,
    pub mcp: Arc<McpClient>,
    pub router: Arc<Router>,
}

/// Build the store, tool registry, MCP client, loop, and router.
pub async fn build(config: ConfigHandle) -> Result<Runtime, Box<dyn std::error::Error>> {
    let home = aido_config::resolve_home();
    let store = Arc::new(Store::new(home.join("sessions")));
    store.load()?;

    let cfg = config.get();
    let workspace = cfg
        .agents
        .get("default")
        .filter(|a| !a.workspace.is_empty())
        .map(|a| a.workspace.clone())
        .unwrap_or_else(|| home.join("workspace").display().to_string());
    let registry = Arc::new(aido_tools::default_registry(&workspace));

    let mcp = Arc::new(McpClient::new());
    sync_mcp_servers(&mcp, &registry, &cfg.tools.mcp).await;

    // Reconcile MCP servers whenever the config is swapped.
    {
        let mcp = mcp.clone();
        let registry = registry.clone();
        config.on_reload(move |cfg: &Config| {
            let mcp = mcp.clone();
            let registry = registry.clone();
            let servers = cfg.tools.mcp.clone();
            tokio::spawn(async move {
                sync_mcp_servers(&mcp, &registry, &servers).await;
            });
        });
    }

    let agent_loop = Arc::new(Loop::new(config.clone(), registry.clone()));
    let router = Arc::new(Router::new(config.clone(), agent_loop, store.clone()));

    Ok(Runtime {
        config,
        store,
        registry,
        mcp,
        router,
    })
}

/// Bring the connected MCP servers in line with the configured set.
/// Unchanged servers are left untouched, so a reload is O(changed servers).
pub async fn sync_mcp_servers(
    mcp: &McpClient,
    registry: &ToolRegistry,
    servers: &[McpServerConfig],
) {
    let desired: HashMap<String, String> = servers
        .iter()
        .map(|s| {
            (
                s.name.clone(),
                serde_json::to_string(s).unwrap_or_default(),
            )
        })
        .collect();

    for name in mcp.stale_servers(&desired).await {
        mcp.remove_server(&name, registry).await;
    }

    for server in servers {
        if server.name.is_empty() || mcp.fingerprint(&server.name).await.is_some() {
            continue;
        }
        let transport: Arc<dyn Transport> = if server.transport == "http" {
            Arc::new(HttpSseTransport::new(&server.url, &server.env))
        } else {
            Arc::new(StdioTransport::new(
                &server.command,
                &server.args,
                &server.env,
                "",
            ))
        };
        if let Err(e) = mcp
            .add_server(&server.name, transport, registry, &desired[&server.name])
            .await
        {
            warn!(server = %server.name, error = %e, "MCP server failed to start");
        }
    }
}
