//! UDP receive loop folding announcements into the peer directory

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use super::message::Announcement;
use super::{DiscoveryError, PeerDirectory};
use crate::task::{BackgroundTask, shutdown_channel};

/// Largest datagram the listener will accept.
const RECV_BUFFER_SIZE: usize = 65_535;

/// Receives peer announcements and maintains the content directory.
///
/// Malformed datagrams are dropped, empty announcements ignored, and the
/// content directory is re-persisted only after a mutating update. The
/// wholesale-replacement merge in [`PeerDirectory`] makes all of this safe
/// under duplicate, reordered, or lost datagrams.
pub struct Listener {
    directory: PeerDirectory,
    content_path: PathBuf,
    broadcast_port: u16,
}

impl Listener {
    pub fn new(directory: PeerDirectory, content_path: PathBuf, broadcast_port: u16) -> Self {
        Self {
            directory,
            content_path,
            broadcast_port,
        }
    }

    /// Binds the broadcast port and spawns the receive loop.
    ///
    /// # Errors
    /// - `DiscoveryError::Bind` - The UDP port is unavailable
    pub async fn start(self) -> Result<BackgroundTask, DiscoveryError> {
        let socket = UdpSocket::bind(("0.0.0.0", self.broadcast_port))
            .await
            .map_err(|source| DiscoveryError::Bind {
                port: self.broadcast_port,
                source,
            })?;
        info!("Listener started on port {}", self.broadcast_port);

        let listener = Arc::new(self);
        let (shutdown_tx, mut shutdown_rx) = shutdown_channel();
        let handle = tokio::spawn(async move {
            let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    received = socket.recv_from(&mut buffer) => {
                        match received {
                            Ok((len, addr)) => {
                                debug!("Received {len} bytes from {addr}");
                                listener.handle_datagram(&buffer[..len]).await;
                            }
                            Err(e) => {
                                error!("Error receiving announcement: {e}");
                            }
                        }
                    }
                }
            }
        });

        Ok(BackgroundTask::new(shutdown_tx, handle))
    }

    /// Processes one received datagram.
    async fn handle_datagram(&self, data: &[u8]) {
        let announcement = match Announcement::decode(data) {
            Ok(announcement) => announcement,
            Err(e) => {
                warn!("Discarding malformed announcement: {e}");
                return;
            }
        };

        if announcement.chunks.is_empty() {
            debug!(
                "Ignoring empty announcement from {}",
                announcement.peer_ip
            );
            return;
        }

        let chunks = announcement
            .chunks
            .into_iter()
            .map(|(name, entry)| (name, entry.checksum))
            .collect();
        self.directory.apply(&announcement.peer_ip, chunks);

        if self.directory.take_dirty() {
            if let Err(e) = self.directory.save_content(&self.content_path).await {
                error!("Error saving content directory: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::discovery::message::{BatchInfo, ChunkEntry};

    fn test_listener(dir: &tempfile::TempDir) -> (Listener, PeerDirectory, PathBuf) {
        let directory = PeerDirectory::new();
        let path = dir.path().join("content_dict.json");
        let listener = Listener::new(directory.clone(), path.clone(), 0);
        (listener, directory, path)
    }

    fn announcement(peer_ip: &str, names: &[&str]) -> Vec<u8> {
        let chunks: BTreeMap<String, ChunkEntry> = names
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    ChunkEntry {
                        size: 10,
                        checksum: format!("sum-{name}"),
                        timestamp: "2024-01-01 00:00:00".to_string(),
                    },
                )
            })
            .collect();
        serde_json::to_vec(&Announcement {
            peer_ip: peer_ip.to_string(),
            chunks,
            timestamp: "2024-01-01 00:00:00".to_string(),
            batch_info: BatchInfo {
                current: 1,
                total: 1,
            },
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_announcement_updates_directory_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (listener, directory, path) = test_listener(&dir);

        listener
            .handle_datagram(&announcement("10.0.0.1", &["f_1", "f_2"]))
            .await;

        assert_eq!(directory.peer_count(), 1);
        let persisted: BTreeMap<String, crate::discovery::ContentEntry> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted.get("f_1").unwrap().peers, vec!["10.0.0.1"]);
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (listener, directory, path) = test_listener(&dir);

        listener.handle_datagram(b"{definitely not json").await;

        assert_eq!(directory.peer_count(), 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_empty_announcement_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (listener, directory, path) = test_listener(&dir);

        listener.handle_datagram(&announcement("10.0.0.1", &[])).await;

        assert_eq!(directory.peer_count(), 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_duplicate_announcement_does_not_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let (listener, _directory, path) = test_listener(&dir);
        let datagram = announcement("10.0.0.1", &["f_1"]);

        listener.handle_datagram(&datagram).await;
        let first_write = std::fs::metadata(&path).unwrap().modified().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        listener.handle_datagram(&datagram).await;
        let second_write = std::fs::metadata(&path).unwrap().modified().unwrap();

        assert_eq!(first_write, second_write);
    }

    #[tokio::test]
    async fn test_receive_loop_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let directory = PeerDirectory::new();
        let path = dir.path().join("content_dict.json");

        // Bind an ephemeral port, then point a sender at it.
        let probe = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let task = Listener::new(directory.clone(), path, port)
            .start()
            .await
            .unwrap();

        let sender = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        sender
            .send_to(&announcement("10.0.0.9", &["f_1"]), ("127.0.0.1", port))
            .await
            .unwrap();

        // Give the loop a moment to process.
        for _ in 0..50 {
            if directory.peer_count() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(directory.peer_count(), 1);

        task.stop().await;
    }
}
