//! `aido agent` — chat against the local agent without the server.

use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use aido_agent::{EventKind, EventSink, InboundMessage};
use aido_config::ConfigHandle;

use super::wiring;

pub async fn run(
    config_path: &Path,
    message: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    if !config_path.exists() {
        super::init::run(config_path)?;
    }
    let config = ConfigHandle::load(config_path)?;
    let runtime = wiring::build(config).await?;

    // Stream assistant text to stdout as it arrives.
    let sink: EventSink = Arc::new(|event| {
        if event.kind == EventKind::TextDelta {
            if let Some(text) = &event.text {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
        }
    });

    match message {
        Some(text) => {
            send(&runtime, text, sink).await?;
        }
        None => {
            let stdin = std::io::stdin();
            loop {
                print!("> ");
                std::io::stdout().flush()?;
                let mut line = String::new();
                if stdin.read_line(&mut line)? == 0 {
                    break;
                }
                let text = line.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                if text == "exit" || text == "quit" {
                    break;
                }
                if let Err(e) = send(&runtime, text, sink.clone()).await {
                    eprintln!("error: {e}");
                }
            }
        }
    }

    runtime.store.save()?;
    Ok(())
}

async fn send(
    runtime: &wiring::Runtime,
    text: String,
    sink: EventSink,
) -> Result<(), Box<dyn std::error::Error>> {
    runtime
        .router
        .handle_message(
            InboundMessage {
                channel: "cli".into(),
                chat_id: "main".into(),
                text,
                ..Default::default()
            },
            Some(sink),
            CancellationToken::new(),
        )
        .await?;
    println!();
    Ok(())
}
