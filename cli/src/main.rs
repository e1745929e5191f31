//! Clipbridge CLI - clipboard sync between your devices.

mod commands;
mod ui;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clipbridge_core::{Config, TrustScope};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clipbridge")]
#[command(about = "Clipboard sync over LAN, Bluetooth and a relay hub", long_about = None)]
struct Cli {
    /// Device name to advertise (defaults to the configured name or the hostname)
    #[arg(short, long)]
    name: Option<String>,

    /// Port to listen on in the server role
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory holding the identity, trust stores and preferences
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// WebSocket endpoint of the relay hub
    #[arg(long)]
    hub_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Act as a server: advertise and accept clients (default)
    Serve,
    /// Act as a client and connect to a server
    Join {
        /// Server name to connect to; omitted, the last primary server is used
        peer: Option<String>,
    },
    /// Show device info
    Info,
    /// Inspect or edit the trust stores
    Trust {
        #[command(subcommand)]
        action: TrustAction,
    },
}

#[derive(Subcommand)]
enum TrustAction {
    /// List trusted peers
    List {
        /// "servers" or "clients"
        scope: TrustScope,
    },
    /// Forget a trusted peer
    Remove { scope: TrustScope, name: String },
}

impl Cli {
    fn config(&self) -> anyhow::Result<Config> {
        let data_dir = self
            .data_dir
            .clone()
            .unwrap_or_else(|| Config::default().data_dir);
        let mut config = Config::load(&data_dir)?;
        if let Some(name) = &self.name {
            config.device_name = name.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(url) = &self.hub_url {
            config.hub_url = url.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("clipbridge=info".parse()?)
                .add_directive("clipbridge_core=info".parse()?)
                .add_directive("mdns_sd=warn".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => commands::serve(config).await?,
        Commands::Join { peer } => commands::join(config, peer).await?,
        Commands::Info => commands::show_info(config)?,
        Commands::Trust { action } => match action {
            TrustAction::List { scope } => commands::list_trusted(&config, scope)?,
            TrustAction::Remove { scope, name } => commands::remove_trusted(&config, scope, &name)?,
        },
    }

    Ok(())
}
