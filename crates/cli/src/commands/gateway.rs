//! `aido gateway` — run the server.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use aido_bridge::BridgeManager;
use aido_config::ConfigHandle;
use aido_gateway::GatewayState;

use super::wiring;

pub async fn run(
    config_path: &Path,
    port_override: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    if !config_path.exists() {
        super::init::run(config_path)?;
    }
    let config = ConfigHandle::load(config_path)?;

    if let Some(port) = port_override {
        let mut cfg = (*config.get()).clone();
        cfg.gateway.port = port;
        config.set(cfg);
    }

    let runtime = wiring::build(config.clone()).await?;

    let cfg = config.get();
    let ws_url = format!("ws://localhost:{}/ws", cfg.gateway.port);
    let bridges = Arc::new(BridgeManager::new(&ws_url, &cfg.gateway.auth.token));
    for instance in &cfg.bridges.instances {
        let extra: HashMap<String, String> = instance.env.clone();
        bridges
            .start(
                Path::new(&instance.path),
                &instance.id,
                instance.enabled,
                &extra,
            )
            .await;
    }

    config.watch();

    let state = GatewayState::new(config, runtime.router, bridges.clone());

    // Ctrl-C cancels in-flight runs and stops the listener.
    {
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            shutdown.cancel();
        });
    }

    let result = aido_gateway::serve(state).await;

    bridges.stop_all();
    runtime.mcp.close_all(&runtime.registry).await;
    runtime.store.save()?;

    result?;
    Ok(())
}
