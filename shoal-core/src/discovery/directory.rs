//! Peer directory: who holds which chunk, with which checksum
//!
//! The directory is the single owner of discovered peer state. Every
//! mutation goes through a synchronized accessor covering the whole
//! read-modify-write, and the merge rule is a wholesale replacement of one
//! peer's chunk map, which makes announcement processing idempotent under
//! duplicate delivery and convergent under reordering.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::DiscoveryError;
use crate::task::{BackgroundTask, shutdown_channel};

/// One peer's reported holdings.
#[derive(Debug, Clone)]
struct PeerRecord {
    /// Chunk name to checksum, as last announced by this peer
    chunks: BTreeMap<String, String>,
    /// When the last announcement from this peer arrived
    last_seen: Instant,
}

/// Content directory entry: one chunk's checksum and hosting peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntry {
    /// Hex-encoded SHA-256 expected for this chunk
    pub checksum: String,
    /// Peers currently claiming to hold this chunk with this checksum
    pub peers: Vec<String>,
}

#[derive(Debug, Default)]
struct DirectoryState {
    peers: BTreeMap<String, PeerRecord>,
    dirty: bool,
}

/// Thread-safe directory of peers and their announced chunks.
///
/// Cheap to clone; clones share state. The internal lock is held only for
/// short read-modify-write sections, never across I/O.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one announcement: replaces the peer's chunk map wholesale.
    ///
    /// An unchanged map only refreshes `last_seen` and does not mark the
    /// directory dirty, so duplicate datagrams cause no disk writes
    /// downstream. An empty map for an already-known peer is ignored.
    pub fn apply(&self, peer_ip: &str, chunks: BTreeMap<String, String>) {
        let mut state = self.state.lock();

        if chunks.is_empty() && state.peers.contains_key(peer_ip) {
            return;
        }

        let changed = state
            .peers
            .get(peer_ip)
            .map(|record| record.chunks != chunks)
            .unwrap_or(true);

        if changed {
            debug!("Updating chunks for peer {peer_ip}");
            state.dirty = true;
        }

        state.peers.insert(
            peer_ip.to_string(),
            PeerRecord {
                chunks,
                last_seen: Instant::now(),
            },
        );
    }

    /// Removes peers not heard from within the timeout.
    ///
    /// Returns the removed peer addresses; the directory is marked dirty
    /// when any peer was dropped.
    pub fn remove_stale(&self, timeout: Duration) -> Vec<String> {
        let mut state = self.state.lock();
        let now = Instant::now();

        let stale: Vec<String> = state
            .peers
            .iter()
            .filter(|(_, record)| now.duration_since(record.last_seen) > timeout)
            .map(|(ip, _)| ip.clone())
            .collect();

        for ip in &stale {
            info!("Removing stale peer: {ip}");
            state.peers.remove(ip);
        }
        if !stale.is_empty() {
            state.dirty = true;
        }
        stale
    }

    /// Projects the peer table into the content directory.
    ///
    /// Peers are folded in sorted address order, so the projection is a pure
    /// function of directory state. On a checksum conflict the recorded
    /// checksum is retained and the disagreeing peer is left off that
    /// chunk's peer list.
    pub fn content_directory(&self) -> BTreeMap<String, ContentEntry> {
        let state = self.state.lock();
        let mut content: BTreeMap<String, ContentEntry> = BTreeMap::new();

        for (peer_ip, record) in &state.peers {
            for (chunk_name, checksum) in &record.chunks {
                match content.get_mut(chunk_name) {
                    None => {
                        content.insert(
                            chunk_name.clone(),
                            ContentEntry {
                                checksum: checksum.clone(),
                                peers: vec![peer_ip.clone()],
                            },
                        );
                    }
                    Some(entry) => {
                        if &entry.checksum != checksum {
                            warn!("Checksum mismatch for {chunk_name} from {peer_ip}");
                            continue;
                        }
                        if !entry.peers.contains(peer_ip) {
                            entry.peers.push(peer_ip.clone());
                        }
                    }
                }
            }
        }

        content
    }

    /// Reads and clears the dirty flag.
    ///
    /// Returns true when some mutation since the last call changed state.
    pub fn take_dirty(&self) -> bool {
        let mut state = self.state.lock();
        std::mem::replace(&mut state.dirty, false)
    }

    /// Returns the number of known peers.
    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// Persists the current content directory as JSON.
    ///
    /// # Errors
    /// - `DiscoveryError::Persist` - The file could not be written
    pub async fn save_content(&self, path: &Path) -> Result<(), DiscoveryError> {
        let content = self.content_directory();
        let json = serde_json::to_string_pretty(&content)?;

        tokio::fs::write(path, json)
            .await
            .map_err(|source| DiscoveryError::Persist {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Persisted content directory ({} chunks)", content.len());
        Ok(())
    }

    /// Seeds the peer table from a previously persisted content directory.
    ///
    /// A missing file is not an error; a malformed one is.
    ///
    /// # Errors
    /// - `DiscoveryError::Io` - The file exists but could not be read
    /// - `DiscoveryError::Encode` - The file is not a valid content directory
    pub async fn load_content(&self, path: &Path) -> Result<(), DiscoveryError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            info!("No existing content directory found");
            return Ok(());
        }

        let data = tokio::fs::read(path).await?;
        let content: BTreeMap<String, ContentEntry> = serde_json::from_slice(&data)?;

        let mut state = self.state.lock();
        let now = Instant::now();
        for (chunk_name, entry) in content {
            for peer_ip in entry.peers {
                state
                    .peers
                    .entry(peer_ip)
                    .or_insert_with(|| PeerRecord {
                        chunks: BTreeMap::new(),
                        last_seen: now,
                    })
                    .chunks
                    .insert(chunk_name.clone(), entry.checksum.clone());
            }
        }
        info!("Loaded existing content directory");
        Ok(())
    }

    /// Spawns the stale-peer reaper.
    ///
    /// Wakes every `interval`, drops peers older than `peer_timeout`, and
    /// stops when the returned handle is stopped. A failing iteration is
    /// logged and the loop continues.
    pub fn spawn_reaper(&self, interval: Duration, peer_timeout: Duration) -> BackgroundTask {
        let directory = self.clone();
        let (shutdown_tx, mut shutdown_rx) = shutdown_channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately; skip it

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let removed = directory.remove_stale(peer_timeout);
                        if !removed.is_empty() {
                            debug!("Reaper removed {} stale peers", removed.len());
                        }
                    }
                }
            }
        });

        BackgroundTask::new(shutdown_tx, handle)
    }
}
