//! Parallel chunk download and file reassembly
//!
//! A download job resolves its chunks and candidate peers from the persisted
//! content directory, fans the work out over a bounded worker pool, verifies
//! every chunk before it enters the store, and stitches the verified chunks
//! into the output file in numeric ordinal order.

pub mod coordinator;

pub use coordinator::DownloadCoordinator;

use crate::storage::StorageError;

/// Errors that can end a download job.
///
/// Per-peer failures never surface here; they are retried against the next
/// candidate inside the worker loop. Only exhaustion and the overall
/// timeout reach the caller, naming the chunks still missing.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("No chunks available for {content}")]
    NoChunksAvailable { content: String },

    #[error("Download timed out; missing chunks: {missing:?}")]
    Timeout { missing: Vec<String> },

    #[error("No peer could provide chunks: {missing:?}")]
    ChunksExhausted { missing: Vec<String> },

    #[error("Content directory unreadable")]
    ContentDirectory(#[from] serde_json::Error),

    #[error("Storage error")]
    Storage(#[from] StorageError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}
