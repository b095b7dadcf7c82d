//! CLI command implementations

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::Subcommand;
use shoal_core::config::ShoalConfig;
use shoal_core::discovery::{Announcer, Listener, PeerDirectory};
use shoal_core::download::DownloadCoordinator;
use shoal_core::pool::ConnectionPool;
use shoal_core::storage::{ChunkStore, FileSplitter};
use shoal_core::transfer::ChunkServer;
use shoal_core::Result;
use tracing::info;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Split a file into chunks in the chunk directory
    Split {
        /// Path of the file to split
        file: PathBuf,
    },
    /// Announce locally held chunks on the broadcast ports
    Announce,
    /// Listen for peer announcements and maintain the content directory
    Listen,
    /// Serve locally held chunks to downloading peers
    Serve,
    /// Download and reassemble a content item from the network
    Download {
        /// Content name, e.g. movie.mp4
        content: String,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands, config: ShoalConfig) -> Result<()> {
    config.storage.ensure_directories()?;

    match command {
        Commands::Split { file } => split_file(config, file).await,
        Commands::Announce => run_announcer(config).await,
        Commands::Listen => run_listener(config).await,
        Commands::Serve => run_server(config).await,
        Commands::Download { content } => run_download(config, content).await,
    }
}

/// Split a file into distributable chunks
async fn split_file(config: ShoalConfig, file: PathBuf) -> Result<()> {
    let store = ChunkStore::new(&config.storage.chunk_dir);
    let splitter = FileSplitter::new(store, config.storage.chunk_size);

    let count = splitter.split(&file).await?;
    println!("Split {} into {count} chunks", file.display());

    Ok(())
}

/// Run the announcer until interrupted
async fn run_announcer(config: ShoalConfig) -> Result<()> {
    let store = ChunkStore::new(&config.storage.chunk_dir);
    let announcer = Announcer::new(store, config.discovery);

    let task = announcer.start().await?;
    println!("Announcing chunks; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Announcer shutting down");
    task.stop().await;

    Ok(())
}

/// Run the announcement listener until interrupted
async fn run_listener(config: ShoalConfig) -> Result<()> {
    let directory = PeerDirectory::new();
    directory
        .load_content(&config.storage.content_dict_path)
        .await?;

    let reaper = directory.spawn_reaper(
        config.discovery.reap_interval,
        config.discovery.peer_timeout,
    );
    let listener = Listener::new(
        directory,
        config.storage.content_dict_path.clone(),
        config.discovery.broadcast_port,
    );

    let task = listener.start().await?;
    println!(
        "Listening for announcements on port {}; press Ctrl-C to stop",
        config.discovery.broadcast_port
    );

    tokio::signal::ctrl_c().await?;
    info!("Listener shutting down");
    task.stop().await;
    reaper.stop().await;

    Ok(())
}

/// Run the chunk server until interrupted
async fn run_server(config: ShoalConfig) -> Result<()> {
    let store = ChunkStore::new(&config.storage.chunk_dir);
    let server = ChunkServer::new(
        store,
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        config.network.peer_port,
        config.network.idle_client_timeout,
    );

    let running = server.start().await?;
    println!("Serving chunks on {}; press Ctrl-C to stop", running.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Chunk server shutting down");
    running.stop().await;

    Ok(())
}

/// Download and reassemble one content item
async fn run_download(config: ShoalConfig, content: String) -> Result<()> {
    let store = ChunkStore::new(&config.storage.chunk_dir);
    let pool = ConnectionPool::new(config.network.clone());
    let pool_reaper = pool.spawn_reaper(config.discovery.reap_interval);

    let coordinator = DownloadCoordinator::new(config, store, pool.clone());
    let outcome = coordinator.fetch(&content).await;

    pool_reaper.stop().await;
    pool.close_all();

    let output = outcome?;
    println!(
        "Successfully downloaded and reconstructed: {}",
        output.display()
    );

    Ok(())
}
