//! Chunk directory owner: inventory scans, checksums, and temp-file commits

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use super::{StorageError, parse_ordinal};

/// Read size for streaming checksum computation.
const HASH_READ_SIZE: usize = 65536; // 64 KiB

/// Prefix given to in-flight receive files until they verify.
const TEMP_PREFIX: &str = "temp_";

/// Metadata for one locally held chunk, produced by an inventory scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedChunk {
    /// Chunk file size in bytes
    pub size: u64,
    /// Hex-encoded SHA-256 of the chunk bytes
    pub checksum: String,
}

/// Owns the local chunk directory.
///
/// All reads and writes of chunk files go through this type; downloads land
/// as `temp_`-prefixed files and are renamed in only after verification, so
/// a scan never observes a partially received chunk as inventory.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    chunk_dir: PathBuf,
}

impl ChunkStore {
    /// Creates a store rooted at the given chunk directory.
    pub fn new(chunk_dir: impl Into<PathBuf>) -> Self {
        Self {
            chunk_dir: chunk_dir.into(),
        }
    }

    /// Returns the path a chunk file lives at.
    pub fn chunk_path(&self, chunk_name: &str) -> PathBuf {
        self.chunk_dir.join(chunk_name)
    }

    /// Returns the path in-flight bytes for a chunk are received into.
    pub fn temp_path(&self, chunk_name: &str) -> PathBuf {
        self.chunk_dir.join(format!("{TEMP_PREFIX}{chunk_name}"))
    }

    /// Checks whether a chunk file is present.
    pub async fn has_chunk(&self, chunk_name: &str) -> bool {
        fs::try_exists(self.chunk_path(chunk_name))
            .await
            .unwrap_or(false)
    }

    /// Scans the chunk directory and checksums every chunk file.
    ///
    /// Temp files are skipped. A file that disappears or fails to read
    /// mid-scan is logged and omitted rather than failing the scan.
    ///
    /// # Errors
    /// - `StorageError::Io` - The chunk directory itself cannot be listed
    pub async fn scan(&self) -> Result<BTreeMap<String, ScannedChunk>, StorageError> {
        let mut chunks = BTreeMap::new();
        let mut entries = fs::read_dir(&self.chunk_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }

            match self.checksum_file(&entry.path()).await {
                Ok((size, checksum)) => {
                    chunks.insert(name, ScannedChunk { size, checksum });
                }
                Err(e) => {
                    warn!("Skipping unreadable chunk {name}: {e}");
                }
            }
        }

        debug!("Scanned {} chunks from {:?}", chunks.len(), self.chunk_dir);
        Ok(chunks)
    }

    /// Lists held chunks of one content item, sorted by numeric ordinal.
    ///
    /// Numeric ordering is what makes stitching deterministic: `f_10` sorts
    /// after `f_9`, which lexical ordering would not give.
    ///
    /// # Errors
    /// - `StorageError::Io` - The chunk directory cannot be listed
    pub async fn chunks_of(&self, base_name: &str) -> Result<Vec<String>, StorageError> {
        let prefix = format!("{base_name}_");
        let mut found = Vec::new();
        let mut entries = fs::read_dir(&self.chunk_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) || name.starts_with(TEMP_PREFIX) {
                continue;
            }
            match parse_ordinal(&name) {
                Some(ordinal) => found.push((ordinal, name)),
                None => warn!("Ignoring chunk with non-numeric ordinal: {name}"),
            }
        }

        found.sort_by_key(|(ordinal, _)| *ordinal);
        Ok(found.into_iter().map(|(_, name)| name).collect())
    }

    /// Renames a verified temp file into its final chunk name.
    ///
    /// # Errors
    /// - `StorageError::Io` - Rename failed
    pub async fn commit_temp(&self, chunk_name: &str) -> Result<(), StorageError> {
        fs::rename(self.temp_path(chunk_name), self.chunk_path(chunk_name)).await?;
        Ok(())
    }

    /// Removes a temp file after a failed or rejected transfer.
    ///
    /// Missing files are fine; the attempt may have failed before any byte
    /// was written.
    pub async fn discard_temp(&self, chunk_name: &str) {
        let path = self.temp_path(chunk_name);
        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove temp file {path:?}: {e}");
            }
        }
    }

    /// Removes a committed chunk file.
    ///
    /// # Errors
    /// - `StorageError::Io` - Removal failed
    pub async fn remove(&self, chunk_name: &str) -> Result<(), StorageError> {
        fs::remove_file(self.chunk_path(chunk_name)).await?;
        Ok(())
    }

    /// Computes size and streaming SHA-256 of a file.
    async fn checksum_file(&self, path: &Path) -> Result<(u64, String), StorageError> {
        let mut file = fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; HASH_READ_SIZE];
        let mut size = 0u64;

        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            size += read as u64;
        }

        Ok((size, hex::encode(hasher.finalize())))
    }
}
