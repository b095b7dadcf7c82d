//! Shoal CLI - Command-line interface
//!
//! Provides command-line access to the Shoal peer roles.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use shoal_core::ShoalConfig;

#[derive(Parser)]
#[command(name = "shoal")]
#[command(about = "A peer-to-peer chunk distribution network")]
struct Cli {
    /// Path to the peer configuration file
    #[arg(long, default_value = "./peer_config.json")]
    config: PathBuf,

    /// Numeric peer id; offsets the well-known ports for multi-peer hosts
    #[arg(long)]
    peer_id: Option<u16>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = ShoalConfig::load(&cli.config)?;
    if let Some(peer_id) = cli.peer_id {
        config = config.for_peer(peer_id);
    }

    commands::handle_command(cli.command, config).await?;

    Ok(())
}
