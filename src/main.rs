// Headless console client for the support chat core.
// Lines typed on stdin are sent as messages; inbound events are printed as
// they arrive. Useful for manual testing against a real server.

use anyhow::{anyhow, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use supportline::chat::{ChatEvent, ChatSession, EventKind, WsTransport};
use supportline::config::{self, ChatConfig};
use supportline::models::ConnectionState;

#[derive(Parser)]
#[command(name = "supportline", about = "Support chat console client")]
struct Args {
    /// Path to the session config file (defaults to the platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the WebSocket endpoint from the config file
    #[arg(long)]
    server: Option<String>,

    /// Override the bearer token from the config file
    #[arg(long)]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut cfg = load_config(&args)?;
    if let Some(server) = args.server {
        cfg.server_url = server;
    }
    if let Some(token) = args.token {
        cfg.token = token;
    }

    let session = ChatSession::new(cfg, Arc::new(WsTransport));
    attach_printers(&session);

    info!("Starting support chat session");
    session.start().await?;

    for message in session.channel.messages() {
        println!("[{}] {}: {}", message.created_at, message.sender, message.content);
    }
    println!("Connected. Type a message and press enter; /quit to exit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed == "/quit" {
                    break;
                }
                if let Some(id) = trimmed.strip_prefix("/seen ") {
                    if let Err(e) = session.receipts.mark_seen(id.trim()) {
                        eprintln!("mark seen failed: {}", e);
                    }
                    continue;
                }
                match session.send_text(trimmed) {
                    Ok(message) => println!("(pending {})", message.id),
                    Err(e) => eprintln!("send failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down");
    session.shutdown();
    Ok(())
}

fn load_config(args: &Args) -> Result<ChatConfig> {
    let loaded = match &args.config {
        Some(path) => config::load_config_from(path)?,
        None => config::load_config()?,
    };
    loaded.ok_or_else(|| {
        anyhow!(
            "No session config found; create one at {}",
            config::default_config_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "the platform config dir".to_string())
        )
    })
}

fn attach_printers(session: &ChatSession) {
    session.connection.on(EventKind::ConnectionState, |event| {
        if let ChatEvent::ConnectionState(state) = event {
            match state {
                ConnectionState::Connected => println!("* online"),
                ConnectionState::Reconnecting => println!("* reconnecting..."),
                ConnectionState::Failed => println!("* connection failed"),
                _ => {}
            }
        }
    });
    session.connection.on(EventKind::Message, |event| {
        if let ChatEvent::Message(message) = event {
            println!("[{}] {}: {}", message.created_at, message.sender, message.content);
        }
    });
    session.connection.on(EventKind::Typing, |event| {
        if let ChatEvent::Typing { user_id, is_typing } = event {
            if *is_typing {
                println!("* {} is typing...", user_id);
            }
        }
    });
    session.connection.on(EventKind::Presence, |event| {
        if let ChatEvent::Presence { is_online } = event {
            println!("* support is {}", if *is_online { "online" } else { "offline" });
        }
    });
    session.connection.on(EventKind::Error, |event| {
        if let ChatEvent::Error { message } = event {
            eprintln!("server error: {}", message);
        }
    });
}
