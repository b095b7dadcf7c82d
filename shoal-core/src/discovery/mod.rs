//! Peer discovery over periodic UDP broadcast
//!
//! Peers announce their chunk inventory on well-known ports; listeners fold
//! the announcements into a peer directory and persist the derived content
//! directory. The protocol is lossy and eventually consistent: datagrams
//! may be dropped, duplicated, or reordered, and the merge rule (wholesale
//! replacement of one peer's chunk map) keeps the directory convergent
//! regardless.

pub mod announcer;
pub mod directory;
pub mod listener;
pub mod message;

pub use announcer::Announcer;
pub use directory::{ContentEntry, PeerDirectory};
pub use listener::Listener;
pub use message::{Announcement, BatchInfo, ChunkEntry};

use std::path::PathBuf;

use crate::storage::StorageError;

/// Errors that can occur during announcement and directory operations.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Failed to bind UDP socket on port {port}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    #[error("Announcement of {size} bytes exceeds the datagram limit")]
    AnnouncementTooLarge { size: usize },

    #[error("Failed to persist content directory to {path}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Encoding error")]
    Encode(#[from] serde_json::Error),

    #[error("Storage error")]
    Storage(#[from] StorageError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}
