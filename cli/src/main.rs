// chatrelay: federated chat relay node
//
// Runs one relay node and manages its configuration.

mod config;

use anyhow::{Context, Result};
use chatrelay_core::{ClientKeys, RelayNode};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(about = "Federated chat relay node", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay node
    Start {
        #[arg(short, long)]
        port: Option<u16>,
        /// Extra neighbour to dial (repeatable)
        #[arg(long = "peer")]
        peers: Vec<String>,
        /// Address advertised to peers
        #[arg(long)]
        advertise: Option<String>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Generate a client identity
    Keygen,
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Set { key: String, value: String },
    AddPeer { address: String },
    RemovePeer { address: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config_path = match cli.config {
        Some(path) => path,
        None => config::Config::config_file()?,
    };

    match cli.command {
        Commands::Start {
            port,
            peers,
            advertise,
        } => cmd_start(&config_path, port, peers, advertise).await,
        Commands::Config { action } => cmd_config(&config_path, action),
        Commands::Keygen => cmd_keygen(),
    }
}

async fn cmd_start(
    config_path: &std::path::Path,
    port: Option<u16>,
    peers: Vec<String>,
    advertise: Option<String>,
) -> Result<()> {
    let mut config = config::Config::load_from(config_path)?;
    if let Some(port) = port {
        config.listen_port = port;
    }
    for peer in &peers {
        config.add_neighbour(peer);
    }
    if advertise.is_some() {
        config.advertised_address = advertise;
    }

    let node = RelayNode::bind(config.node_config())
        .await
        .context("Failed to bind relay node")?;
    node.start().await.context("Failed to start relay node")?;

    println!("{}", "Relay node running".bold());
    println!("  Node ID:   {}", node.node_id().bright_cyan());
    println!("  Listening: {}", node.local_addr().to_string().bright_yellow());
    println!("  Address:   {}", node.address().bright_yellow());
    println!("  Peers:     {}", node.stats().peers);
    println!();
    println!("Press {} to stop", "Ctrl+C".bright_green());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    node.shutdown();
    println!("{}", "Stopped".bold());
    Ok(())
}

fn cmd_config(config_path: &std::path::Path, action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load_from(config_path)?;

    match action {
        ConfigAction::Show => {
            println!("{} {}", "Configuration".bold(), config_path.display());
            for (key, value) in config.list() {
                println!("  {:<20} {}", key, value.bright_cyan());
            }
        }
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save_to(config_path)?;
            println!("  {} {} = {}", "✓".green(), key, value);
        }
        ConfigAction::AddPeer { address } => {
            if config.add_neighbour(&address) {
                config.save_to(config_path)?;
                println!("  {} Added neighbour {}", "✓".green(), address);
            } else {
                println!("  {} already listed", address);
            }
        }
        ConfigAction::RemovePeer { address } => {
            if config.remove_neighbour(&address) {
                config.save_to(config_path)?;
                println!("  {} Removed neighbour {}", "✓".green(), address);
            } else {
                println!("  {} not listed", address);
            }
        }
    }

    Ok(())
}

fn cmd_keygen() -> Result<()> {
    let keys = ClientKeys::generate();

    println!("{}", "Client Identity".bold());
    println!("  Client ID:      {}", keys.client_id().bright_cyan());
    println!("  Signing key:    {}", keys.public_key_b64().bright_yellow());
    println!("  Encryption key: {}", keys.encryption_key_b64().bright_yellow());
    println!();
    println!("{}", "⚠️  WARNING: Keep the secret below private!".bright_red().bold());
    println!("  Secret: {}", hex::encode(keys.to_bytes().as_slice()));

    Ok(())
}
