//! `aido init` — write a starter config and create the workspace.

use std::path::Path;

use aido_config::{generate_token, resolve_home, AgentConfig, Config, ProviderConfig};

pub fn run(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if config_path.exists() {
        println!("Config already exists: {}", config_path.display());
        return Ok(());
    }

    let home = resolve_home();
    let workspace = home.join("workspace");
    std::fs::create_dir_all(&workspace)?;
    std::fs::create_dir_all(home.join("sessions"))?;
    std::fs::create_dir_all(workspace.join("skills"))?;

    let mut cfg = Config::default();
    cfg.gateway.auth.token = generate_token();
    cfg.providers.insert(
        "anthropic".into(),
        ProviderConfig {
            api_key: "${ANTHROPIC_API_KEY}".into(),
            ..Default::default()
        },
    );
    cfg.agents.insert(
        "default".into(),
        AgentConfig {
            model: "anthropic/claude-sonnet-4-20250514".into(),
            workspace: workspace.display().to_string(),
            ..Default::default()
        },
    );

    aido_config::write(config_path, &cfg)?;
    println!("Wrote {}", config_path.display());
    println!("Workspace: {}", workspace.display());
    println!("Set ANTHROPIC_API_KEY (or edit providers) and run: aido gateway");
    Ok(())
}
