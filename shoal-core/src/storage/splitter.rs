//! Splits a source file into numbered chunk files for distribution

use std::path::Path;

use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::info;

use super::{StorageError, format_chunk_name, split_content_name};
use crate::storage::ChunkStore;

/// Splits files into `chunk_size`-byte pieces inside a chunk store.
///
/// Chunks are named `{base}_{ordinal}{extension}` with ordinals starting at
/// 1; every chunk except possibly the last has exactly `chunk_size` bytes.
pub struct FileSplitter {
    store: ChunkStore,
    chunk_size: usize,
}

impl FileSplitter {
    pub fn new(store: ChunkStore, chunk_size: usize) -> Self {
        Self { store, chunk_size }
    }

    /// Splits a file into chunks, returning the number written.
    ///
    /// # Errors
    /// - `StorageError::Io` - Source unreadable or a chunk write failed
    pub async fn split(&self, file_path: &Path) -> Result<usize, StorageError> {
        let file_name = file_path
            .file_name()
            .ok_or_else(|| StorageError::InvalidChunkName {
                name: file_path.display().to_string(),
            })?
            .to_string_lossy();
        let (base_name, extension) = split_content_name(&file_name);

        let mut source = fs::File::open(file_path).await?;
        let mut buffer = vec![0u8; self.chunk_size];
        let mut ordinal = 0u64;

        loop {
            let mut filled = 0;
            // A single read may return short; fill the buffer until EOF or
            // a full chunk is gathered.
            while filled < self.chunk_size {
                let read = source.read(&mut buffer[filled..]).await?;
                if read == 0 {
                    break;
                }
                filled += read;
            }
            if filled == 0 {
                break;
            }

            ordinal += 1;
            let chunk_name = format_chunk_name(base_name, ordinal, extension);
            fs::write(self.store.chunk_path(&chunk_name), &buffer[..filled]).await?;

            if filled < self.chunk_size {
                break;
            }
        }

        info!(
            "Split {} into {} chunks of up to {} bytes",
            file_path.display(),
            ordinal,
            self.chunk_size
        );
        Ok(ordinal as usize)
    }
}
