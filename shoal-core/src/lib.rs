//! Shoal Core - Peer-to-peer chunk distribution
//!
//! This crate provides the building blocks of the Shoal network: peers
//! split files into checksummed chunks, announce their holdings over UDP
//! broadcast, discover other peers' inventories, and fetch missing chunks
//! directly from whichever peers advertise them, verifying every chunk
//! before deterministic reassembly.

pub mod config;
pub mod discovery;
pub mod download;
pub mod pool;
pub mod storage;
pub mod task;
pub mod transfer;

// Re-export main types for convenient access
pub use config::ShoalConfig;
pub use discovery::{Announcer, DiscoveryError, Listener, PeerDirectory};
pub use download::{DownloadCoordinator, DownloadError};
pub use pool::{ConnectionPool, PoolError};
pub use storage::{ChunkStore, FileSplitter, StorageError};
pub use task::BackgroundTask;
pub use transfer::{ChunkServer, TransferError};

/// Core errors that can bubble up from any Shoal subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ShoalError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Connection pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ShoalError>;
