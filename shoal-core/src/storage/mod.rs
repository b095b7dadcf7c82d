//! Local chunk storage: scanning, checksumming, and file splitting
//!
//! A chunk is one numbered slice of a source file, named
//! `{base}_{ordinal}{extension}`. The store owns the chunk directory and is
//! the only component that writes into it.

pub mod chunk_store;
pub mod splitter;

pub use chunk_store::{ChunkStore, ScannedChunk};
pub use splitter::FileSplitter;

/// Errors that can occur during chunk storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Chunk {name} not found")]
    ChunkNotFound { name: String },

    #[error("Invalid chunk name: {name}")]
    InvalidChunkName { name: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Formats a chunk file name from its parts.
///
/// The extension, when present, must include the leading dot.
pub fn format_chunk_name(base_name: &str, ordinal: u64, extension: &str) -> String {
    format!("{base_name}_{ordinal}{extension}")
}

/// Extracts the numeric ordinal from a chunk file name.
///
/// Returns `None` for names that do not follow the
/// `{base}_{ordinal}{extension}` convention. The ordinal is the digits
/// between the last underscore and the first following dot, so `f_10.mp4`
/// yields 10.
pub fn parse_ordinal(chunk_name: &str) -> Option<u64> {
    let tail = chunk_name.rsplit('_').next()?;
    let digits = tail.split('.').next()?;
    digits.parse().ok()
}

/// Splits a content name into base name and extension.
///
/// The extension keeps its leading dot; a name without a dot has an empty
/// extension.
pub fn split_content_name(content_name: &str) -> (&str, &str) {
    match content_name.rfind('.') {
        Some(idx) if idx > 0 => content_name.split_at(idx),
        _ => (content_name, ""),
    }
}
