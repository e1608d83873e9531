//! Aido CLI — the main entry point.
//!
//! Commands:
//! - `init`    — Write a starter config with a generated gateway token
//! - `gateway` — Run the gateway server
//! - `agent`   — One-shot or interactive chat against the local agent

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "aido", about = "Aido — personal AI agent gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file (default: $AIDO_HOME/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the config file and workspace
    Init,

    /// Start the gateway server
    Gateway {
        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Chat with the agent locally (no server)
    Agent {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config_path = cli
        .config
        .unwrap_or_else(aido_config::default_config_path);

    match cli.command {
        Commands::Init => commands::init::run(&config_path)?,
        Commands::Gateway { port } => commands::gateway::run(&config_path, port).await?,
        Commands::Agent { message } => commands::agent::run(&config_path, message).await?,
    }

    Ok(())
}
