//! Serve and join commands: run the service in one host role until Ctrl+C.

use std::collections::VecDeque;
use std::sync::Arc;

use clipbridge_core::clipboard::SystemClipboard;
use clipbridge_core::sync::HostRole;
use clipbridge_core::{ClipboardItem, ClipbridgeService, Config, ServiceEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

use crate::ui::{print_banner, print_identity};

/// Run as a server, asking on stdin whether to trust each unknown client.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let service = open(config)?;
    let mut events = service.start(HostRole::Server).await?;

    if let Some(addr) = service.sync().local_addr().await {
        println!("\x1b[1;32m✓\x1b[0m Listening on {}", addr);
    }
    println!("\x1b[2mPress Ctrl+C to stop.\x1b[0m\n");

    let mut shutdown = ctrl_c()?;
    let mut answers = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut waiting: VecDeque<String> = VecDeque::new();

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                if let ServiceEvent::AuthRequest { peer, fingerprint } = &event {
                    println!(
                        "\x1b[1;35m⚡\x1b[0m \x1b[1m{}\x1b[0m wants to connect\n    fingerprint {}",
                        peer, fingerprint
                    );
                    if waiting.is_empty() {
                        prompt(peer);
                    }
                    waiting.push_back(peer.clone());
                    continue;
                }
                handle_event(event);
            }
            line = answers.next_line(), if stdin_open && !waiting.is_empty() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => {
                        stdin_open = false;
                        continue;
                    }
                };
                let Some(peer) = waiting.pop_front() else { continue };
                let approved = matches!(line.trim(), "y" | "Y" | "yes");
                info!(peer = %peer, approved, "operator answered authentication request");
                let result = if approved {
                    service.approve(&peer).await
                } else {
                    service.reject(&peer).await
                };
                if let Err(e) = result {
                    eprintln!("\x1b[1;31m✗\x1b[0m {}: {}", peer, e);
                }
                if let Some(next) = waiting.front() {
                    prompt(next);
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    println!("\n\x1b[1;33mShutting down...\x1b[0m");
    service.stop().await;
    Ok(())
}

/// Run as a client. With `peer`, connect to it once it is discovered;
/// otherwise the connector dials the primary server on its own.
pub async fn join(config: Config, peer: Option<String>) -> anyhow::Result<()> {
    let service = open(config)?;
    let mut events = service.start(HostRole::Client).await?;

    match &peer {
        Some(name) => println!("\x1b[1;32m✓\x1b[0m Looking for {}...", name),
        None => println!("\x1b[1;32m✓\x1b[0m Waiting for the primary server..."),
    }
    println!("\x1b[2mPress Ctrl+C to stop.\x1b[0m\n");

    let mut shutdown = ctrl_c()?;
    let mut target = peer;

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                let discovered = match &event {
                    ServiceEvent::PeerDiscovered(found) => target.as_deref() == Some(found.name.as_str()),
                    _ => false,
                };
                handle_event(event);
                if discovered {
                    if let Some(name) = target.take() {
                        if let Err(e) = service.connect(&name).await {
                            eprintln!("\x1b[1;31m✗\x1b[0m Could not connect to {}: {}", name, e);
                            target = Some(name);
                        }
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    println!("\n\x1b[1;33mShutting down...\x1b[0m");
    service.stop().await;
    Ok(())
}

fn open(config: Config) -> anyhow::Result<ClipbridgeService> {
    print_banner();
    let service = ClipbridgeService::open(config)?.with_clipboard(Arc::new(SystemClipboard));
    print_identity(service.device_name(), &service.fingerprint());
    Ok(service)
}

fn ctrl_c() -> anyhow::Result<mpsc::Receiver<()>> {
    let (tx, rx) = mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = tx.blocking_send(());
    })?;
    Ok(rx)
}

fn prompt(peer: &str) {
    println!("Trust {}? [y/N]", peer);
}

/// Handle a service event and print appropriate output.
fn handle_event(event: ServiceEvent) {
    match event {
        ServiceEvent::PeerDiscovered(peer) => {
            println!("\x1b[1;32m⬤\x1b[0m Found: \x1b[1m{}\x1b[0m ({})", peer.name, peer.locator);
        }
        ServiceEvent::PeerLost(name) => {
            println!("\x1b[1;31m⬤\x1b[0m Lost: {}", name);
        }
        ServiceEvent::Connected(peer) => {
            println!("\x1b[1;32m⇄\x1b[0m Connected: \x1b[1m{}\x1b[0m", peer);
        }
        ServiceEvent::Disconnected { peer, reason } => {
            println!("\x1b[1;33m⇄\x1b[0m Disconnected: {} ({})", peer, reason);
        }
        ServiceEvent::AuthRequest { peer, .. } => {
            println!("\x1b[1;35m⚡\x1b[0m Authentication request from {}", peer);
        }
        ServiceEvent::ClipboardReceived { from, items } => {
            println!("\x1b[1;34m📋\x1b[0m Received from {}: \"{}\"", from, format_preview(&items));
        }
        ServiceEvent::HubConnected(device) => {
            println!("\x1b[1;32m☁\x1b[0m Hub connected as {}", device.name);
        }
        ServiceEvent::HubDisconnected => {
            println!("\x1b[1;33m☁\x1b[0m Hub disconnected");
        }
        ServiceEvent::Error(e) => {
            eprintln!("\x1b[1;31m✗\x1b[0m Error: {}", e);
        }
    }
}

/// Format clipboard items for preview display.
fn format_preview(items: &[ClipboardItem]) -> String {
    const MAX_PREVIEW_CHARS: usize = 50;

    let Some(text) = items.iter().find_map(|item| item.as_text()) else {
        return format!("{} item(s)", items.len());
    };

    if text.chars().count() > MAX_PREVIEW_CHARS {
        let cut: String = text.chars().take(MAX_PREVIEW_CHARS).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}
